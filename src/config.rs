//! Endpoint configuration.
//!
//! Endpoints are normally configured from test code, but the same structures
//! deserialize from YAML so a set of backends can be described in a file:
//!
//! ```yaml
//! servers:
//!   - listen: "127.0.0.1:8000"
//!     keep_original_data: true
//!     response:
//!       type: static
//!       content: |
//!         HTTP/1.1 200 OK
//!         Content-Length: 0
//!
//! clients:
//!   - addr: "127.0.0.1:80"
//!     segment_size: 1
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use serde::Deserialize;

use crate::http::response::{ResponseBuilder, StatusCode};

/// Environment variable holding the path of the YAML config file.
pub const CONFIG_ENV: &str = "DEPROXY_CONFIG";

/// Bytes drained from a socket per readable event.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1000;
const DEFAULT_LISTEN: &str = "127.0.0.1:8000";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

/// What a server endpoint answers to every request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseSource {
    /// `HTTP/1.1 200 OK` with an empty body.
    #[default]
    Default,
    /// Raw response bytes. Line endings up to the first blank line are
    /// normalised to CRLF; the body is sent exactly as written.
    Static { content: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on; port 0 picks a free one.
    pub listen: String,
    #[serde(default)]
    pub response: ResponseSource,
    /// Close a connection after this many requests.
    #[serde(default)]
    pub keep_alive: Option<usize>,
    /// Keep the raw bytes of every received request.
    #[serde(default)]
    pub keep_original_data: bool,
    /// Bytes written per writable event; unset writes whole chunks.
    #[serde(default)]
    pub segment_size: Option<usize>,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientConfig {
    /// Address of the peer, usually the proxy under test.
    pub addr: String,
    /// Bytes written per writable event; unset writes whole chunks.
    #[serde(default)]
    pub segment_size: Option<usize>,
    /// Keep the raw bytes of every received response.
    #[serde(default)]
    pub keep_original_data: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
}

fn default_read_chunk_size() -> usize {
    DEFAULT_READ_CHUNK_SIZE
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

impl Config {
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml).context("Invalid deproxy config")
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&yaml)
    }

    /// Loads the file named by `DEPROXY_CONFIG`, or a single default server
    /// on 127.0.0.1:8000 when the variable is unset.
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(path),
            Err(_) => Ok(Self {
                servers: vec![ServerConfig::new(DEFAULT_LISTEN)],
                clients: Vec::new(),
            }),
        }
    }
}

impl ResponseSource {
    /// Static content whose head may use LF or CRLF line endings.
    pub fn static_content(content: impl Into<String>) -> Self {
        ResponseSource::Static {
            content: content.into(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            ResponseSource::Default => {
                Bytes::from(ResponseBuilder::new(StatusCode::OK).build().to_bytes())
            }
            ResponseSource::Static { content } => Bytes::from(normalize_head(content)),
        }
    }
}

/// Rewrites every line ending up to and including the blank line that ends
/// the head as CRLF. Whatever follows is copied untouched.
fn normalize_head(content: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 16);
    let mut rest = content;
    while let Some(lf) = rest.find('\n') {
        let line = &rest[..lf];
        let line = line.strip_suffix('\r').unwrap_or(line);
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
        rest = &rest[lf + 1..];
        if line.is_empty() {
            break;
        }
    }
    out.extend_from_slice(rest.as_bytes());
    out
}

impl ServerConfig {
    pub fn new(listen: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            response: ResponseSource::Default,
            keep_alive: None,
            keep_original_data: false,
            segment_size: None,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            segment_size: None,
            keep_original_data: false,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
