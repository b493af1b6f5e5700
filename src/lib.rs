//! Deproxy - HTTP/1.x test double for reverse proxies
//!
//! A client/server pair that sits on both sides of a proxy under test, emits
//! requests and responses with controlled fragmentation, and parses what the
//! proxy forwards strictly enough to tell well-formed traffic from
//! malformed, incomplete or trailing-garbage input.

pub mod config;
pub mod endpoint;
pub mod http;
