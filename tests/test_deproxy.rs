mod helpers;

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use deproxy::config::{ClientConfig, ResponseSource, ServerConfig};
use deproxy::endpoint::{Client, EndpointError, Manager, Phase, Server};
use deproxy::http::Framing;
use deproxy::http::parser::ParseError;
use deproxy::http::request::{Method, RequestBuilder};
use deproxy::http::response::StatusCode;
use helpers::{setup_tracing, wait_until};

const TIMEOUT: Duration = Duration::from_secs(5);
const GET_AAA: &[u8] = b"GET /aaa HTTP/1.1\r\nHost: localhost\r\n\r\n";
const GET_BBB: &[u8] = b"GET /bbb HTTP/1.1\r\nHost: localhost\r\n\r\n";

fn start_server(manager: &Manager, config: ServerConfig) -> Server {
    let mut server = Server::new(config);
    server.start(manager).unwrap();
    server
}

fn server_with(response: &str) -> ServerConfig {
    let mut config = ServerConfig::new("127.0.0.1:0");
    config.response = ResponseSource::static_content(response);
    config
}

fn client_config(server: &Server) -> ClientConfig {
    ClientConfig::new(server.local_addr().unwrap().to_string())
}

fn start_client(manager: &Manager, config: ClientConfig) -> Client {
    let mut client = Client::new(config);
    client.start(manager).unwrap();
    client
}

/// A backend that accepts one connection, optionally writes `answer` once
/// the request arrived, and holds the socket until told to let go.
struct RawBackend {
    addr: String,
    release: mpsc::Sender<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RawBackend {
    fn start(answer: Option<&'static [u8]>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (release, released) = mpsc::channel();

        let thread = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            if let Some(answer) = answer {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).unwrap();
                stream.write_all(answer).unwrap();
            }
            let _ = released.recv();
        });

        Self {
            addr,
            release,
            thread: Some(thread),
        }
    }
}

impl Drop for RawBackend {
    fn drop(&mut self) {
        let _ = self.release.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[test]
fn test_request_and_default_response() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let server = start_server(&manager, ServerConfig::new("127.0.0.1:0"));
    let client = start_client(&manager, client_config(&server));

    client.make_request(GET_AAA).unwrap();
    assert!(client.wait_for_response(TIMEOUT).unwrap());

    let response = client.last_response().unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.body.is_empty());

    let request = server.last_request().unwrap();
    assert_eq!(request.method, Method::GET);
    assert_eq!(request.uri, "/aaa");
    assert_eq!(request.header("host"), Some("localhost"));

    assert_eq!(client.sent_count(), 1);
    assert_eq!(client.received_count(), 1);
    assert_eq!(server.received_count(), 1);
    assert_eq!(server.sent_count(), 1);
    assert_eq!(server.connections(), 1);
}

#[test]
fn test_sequential_requests_share_the_connection() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let server = start_server(&manager, server_with("HTTP/1.1 200 OK\nContent-Length: 2\n\nok"));
    let client = start_client(&manager, client_config(&server));

    for wire in [GET_AAA, GET_BBB] {
        client.make_request(wire).unwrap();
        assert!(client.wait_for_response(TIMEOUT).unwrap());
    }

    let bodies: Vec<Vec<u8>> = client.responses().into_iter().map(|r| r.body).collect();
    assert_eq!(bodies, vec![b"ok".to_vec(), b"ok".to_vec()]);
    let uris: Vec<String> = server.requests().into_iter().map(|r| r.uri).collect();
    assert_eq!(uris, vec!["/aaa", "/bbb"]);
    assert_eq!(server.connections(), 1);
}

#[test]
fn test_byte_at_a_time_request_arrives_intact() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let mut server_config = ServerConfig::new("127.0.0.1:0");
    server_config.keep_original_data = true;
    let server = start_server(&manager, server_config);

    let mut config = client_config(&server);
    config.segment_size = Some(1);
    let client = start_client(&manager, config);

    let wire: &[u8] = b"POST /upload HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
    client.make_request(wire).unwrap();
    assert!(client.wait_for_response(TIMEOUT).unwrap());

    let request = server.last_request().unwrap();
    assert_eq!(request.body, b"hello");
    assert_eq!(request.framing, Framing::Chunked);
    assert_eq!(request.original, Some(Bytes::from_static(wire)));
}

#[test]
fn test_byte_at_a_time_response_arrives_intact() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let mut server_config = server_with("HTTP/1.1 201 Created\nContent-Length: 5\nX-Test: yes\n\nhello");
    server_config.segment_size = Some(1);
    let server = start_server(&manager, server_config);

    let mut config = client_config(&server);
    config.keep_original_data = true;
    let client = start_client(&manager, config);

    client.make_request(GET_AAA).unwrap();
    assert!(client.wait_for_response(TIMEOUT).unwrap());

    let response = client.last_response().unwrap();
    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.header("X-Test"), Some("yes"));
    assert_eq!(response.body, b"hello");
    assert_eq!(
        response.original,
        Some(Bytes::from_static(
            b"HTTP/1.1 201 Created\r\nContent-Length: 5\r\nX-Test: yes\r\n\r\nhello"
        ))
    );
}

#[test]
fn test_request_built_from_message() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let server = start_server(&manager, ServerConfig::new("127.0.0.1:0"));
    let client = start_client(&manager, client_config(&server));

    let request = RequestBuilder::new()
        .method(Method::PUT)
        .uri("/item/1")
        .header("Host", "localhost")
        .body(b"{\"id\":1}".to_vec())
        .build()
        .unwrap();
    client.make_request_message(&request).unwrap();
    assert!(client.wait_for_response(TIMEOUT).unwrap());

    assert_eq!(server.last_request(), Some(request));
}

#[test]
fn test_pipelined_requests_are_all_recorded() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let server = start_server(&manager, ServerConfig::new("127.0.0.1:0"));
    let client = start_client(&manager, client_config(&server));

    client.make_request([GET_AAA, GET_BBB].concat()).unwrap();

    assert!(server.wait_for_requests(2, TIMEOUT).unwrap());
    let uris: Vec<String> = server.requests().into_iter().map(|r| r.uri).collect();
    assert_eq!(uris, vec!["/aaa", "/bbb"]);
    assert!(wait_until(TIMEOUT, || server.sent_count() == 2));
}

#[test]
fn test_malformed_prefix_is_never_recorded() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let server = start_server(&manager, ServerConfig::new("127.0.0.1:0"));
    let client = start_client(&manager, client_config(&server));

    client.make_request([b"\n\n".as_slice(), GET_AAA].concat()).unwrap();

    let err = server.wait_for_requests(1, TIMEOUT).unwrap_err();
    assert!(matches!(err, EndpointError::Malformed(ParseError::BadStartLine)));
    assert!(server.requests().is_empty());
    // A bad connection does not take the server down.
    assert_eq!(server.phase(), Phase::Started);
    assert!(!matches!(client.wait_for_response(TIMEOUT), Ok(true)));
}

#[test]
fn test_malformed_second_pipelined_request() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let server = start_server(&manager, ServerConfig::new("127.0.0.1:0"));
    let client = start_client(&manager, client_config(&server));

    client
        .make_request([GET_AAA, b"\tGET /bbb HTTP/1.1\r\nHost: localhost\r\n\r\n".as_slice()].concat())
        .unwrap();

    let err = server.wait_for_requests(2, TIMEOUT).unwrap_err();
    assert!(err.is_malformed());
    let uris: Vec<String> = server.requests().into_iter().map(|r| r.uri).collect();
    assert_eq!(uris, vec!["/aaa"]);
}

#[test]
fn test_silent_backend_times_out() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let backend = RawBackend::start(None);
    let client = start_client(&manager, ClientConfig::new(backend.addr.clone()));

    client.make_request(GET_AAA).unwrap();

    let begin = Instant::now();
    assert!(!client.wait_for_response(Duration::from_secs(1)).unwrap());
    let elapsed = begin.elapsed();

    assert!(elapsed >= Duration::from_secs(1), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "returned after {elapsed:?}");
    assert_eq!(client.received_count(), 0);
    assert_eq!(client.sent_count(), 1);
    assert_eq!(client.phase(), Phase::Started);
}

#[test]
fn test_stop_releases_waits_and_refuses_requests() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let backend = RawBackend::start(None);
    let client = start_client(&manager, ClientConfig::new(backend.addr.clone()));

    client.make_request(GET_AAA).unwrap();
    client.stop();

    let begin = Instant::now();
    assert!(!client.wait_for_response(TIMEOUT).unwrap());
    assert!(begin.elapsed() < Duration::from_secs(1));
    assert!(matches!(
        client.make_request(GET_AAA),
        Err(EndpointError::InvalidPhase { actual: Phase::Stopped, .. })
    ));
}

#[test]
fn test_stop_from_another_thread_releases_a_blocked_wait() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let backend = RawBackend::start(None);
    let client = start_client(&manager, ClientConfig::new(backend.addr.clone()));
    client.make_request(GET_AAA).unwrap();

    let (result, elapsed) = thread::scope(|s| {
        let waiter = s.spawn(|| {
            let begin = Instant::now();
            (client.wait_for_response(TIMEOUT), begin.elapsed())
        });
        thread::sleep(Duration::from_millis(100));
        client.stop();
        waiter.join().unwrap()
    });

    assert!(!result.unwrap());
    assert!(elapsed < Duration::from_secs(2), "returned after {elapsed:?}");
    assert_eq!(client.phase(), Phase::Stopped);
}

#[test]
fn test_server_stop_from_another_thread_releases_a_blocked_wait() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let server = start_server(&manager, ServerConfig::new("127.0.0.1:0"));

    let (result, elapsed) = thread::scope(|s| {
        let waiter = s.spawn(|| {
            let begin = Instant::now();
            (server.wait_for_requests(1, TIMEOUT), begin.elapsed())
        });
        thread::sleep(Duration::from_millis(100));
        server.stop();
        waiter.join().unwrap()
    });

    assert!(!result.unwrap());
    assert!(elapsed < Duration::from_secs(2), "returned after {elapsed:?}");
}

#[test]
fn test_server_honours_connection_close() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let server = start_server(&manager, ServerConfig::new("127.0.0.1:0"));

    let closing: [&[u8]; 2] = [
        b"GET /close HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        b"GET /old HTTP/1.0\r\nHost: localhost\r\n\r\n",
    ];
    for wire in closing {
        let client = start_client(&manager, client_config(&server));
        client.make_request(wire).unwrap();
        assert!(client.wait_for_response(TIMEOUT).unwrap());
        assert!(wait_until(TIMEOUT, || client.phase() == Phase::Stopped));
        assert!(client.error().is_none());
    }

    let client = start_client(&manager, client_config(&server));
    client
        .make_request("GET /kept HTTP/1.0\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    assert!(client.wait_for_response(TIMEOUT).unwrap());
    client.make_request(GET_AAA).unwrap();
    assert!(client.wait_for_response(TIMEOUT).unwrap());
    assert_eq!(client.phase(), Phase::Started);
    assert_eq!(server.connections(), 3);
}

#[test]
fn test_close_delimited_response_after_keep_alive_limit() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let mut server_config = server_with("HTTP/1.1 200 OK\nConnection: close\n\nuntil close");
    server_config.keep_alive = Some(1);
    let server = start_server(&manager, server_config);
    let client = start_client(&manager, client_config(&server));

    client.make_request(GET_AAA).unwrap();
    assert!(client.wait_for_response(TIMEOUT).unwrap());

    let response = client.last_response().unwrap();
    assert_eq!(response.framing, Framing::CloseDelimited);
    assert_eq!(response.body, b"until close");
    assert!(wait_until(TIMEOUT, || client.phase() == Phase::Stopped));
    assert!(client.error().is_none());
}

#[test]
fn test_head_response_has_no_body() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let server = start_server(&manager, server_with("HTTP/1.1 200 OK\nContent-Length: 5\n\n"));
    let client = start_client(&manager, client_config(&server));

    client
        .make_request("HEAD / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    assert!(client.wait_for_response(TIMEOUT).unwrap());

    let response = client.last_response().unwrap();
    assert_eq!(response.framing, Framing::None);
    assert!(response.body.is_empty());
    assert!(client.error().is_none());
}

#[test]
fn test_trailing_garbage_fails_the_client() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let backend = RawBackend::start(Some(
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\nXYZ".as_slice(),
    ));
    let client = start_client(&manager, ClientConfig::new(backend.addr.clone()));

    client.make_request(GET_AAA).unwrap();

    let err = client.wait_for_response(TIMEOUT).unwrap_err();
    assert!(matches!(
        err,
        EndpointError::Malformed(ParseError::TrailingGarbage { len: 3 })
    ));
    assert_eq!(client.received_count(), 1);
    assert!(wait_until(TIMEOUT, || client.phase() == Phase::Stopped));
}

#[test]
fn test_trailing_garbage_fails_the_client_byte_at_a_time() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let backend = RawBackend::start(Some(
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\nXYZ".as_slice(),
    ));
    let mut config = ClientConfig::new(backend.addr.clone());
    config.read_chunk_size = 1;
    let client = start_client(&manager, config);

    client.make_request(GET_AAA).unwrap();

    assert!(wait_until(TIMEOUT, || client.error().is_some()));
    assert!(matches!(
        client.error(),
        Some(EndpointError::Malformed(ParseError::TrailingGarbage { .. }))
    ));
    assert!(client.wait_for_response(TIMEOUT).unwrap_err().is_malformed());
    assert_eq!(client.received_count(), 1);
    assert!(wait_until(TIMEOUT, || client.phase() == Phase::Stopped));
}

#[test]
fn test_interim_response_is_skipped() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let backend = RawBackend::start(Some(
        b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".as_slice(),
    ));
    let client = start_client(&manager, ClientConfig::new(backend.addr.clone()));

    client.make_request(GET_AAA).unwrap();
    assert!(client.wait_for_response(TIMEOUT).unwrap());

    assert_eq!(client.received_count(), 1);
    assert_eq!(client.last_response().unwrap().body, b"ok");
}

#[test]
fn test_unsolicited_response_fails_the_client() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = start_client(
        &manager,
        ClientConfig::new(listener.local_addr().unwrap().to_string()),
    );

    let (mut stream, _) = listener.accept().unwrap();
    stream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
        .unwrap();

    assert!(wait_until(TIMEOUT, || client.error().is_some()));
    assert!(matches!(client.error(), Some(EndpointError::UnsolicitedResponse)));
}

#[test]
fn test_connect_refused() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    };

    let mut client = Client::new(ClientConfig::new(addr));
    let err = client.start(&manager).unwrap_err();

    assert!(err.is_transport());
    assert_eq!(client.phase(), Phase::Stopped);
    assert!(client.error().is_some());
    assert!(client.make_request(GET_AAA).is_err());
}

#[test]
fn test_server_counts_connections_and_stops() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let server = start_server(&manager, ServerConfig::new("127.0.0.1:0"));
    let _first = start_client(&manager, client_config(&server));
    let _second = start_client(&manager, client_config(&server));

    assert!(server.wait_for_connections(2, TIMEOUT));
    assert_eq!(server.connections(), 2);

    let config = client_config(&server);
    server.stop();
    assert_eq!(server.phase(), Phase::Stopped);
    assert!(!server.wait_for_connections(3, TIMEOUT));
    assert!(Client::new(config).start(&manager).is_err());
}

#[test]
fn test_endpoints_start_once() {
    setup_tracing();
    let manager = Manager::start().unwrap();
    let mut server = start_server(&manager, ServerConfig::new("127.0.0.1:0"));

    assert!(matches!(
        server.start(&manager),
        Err(EndpointError::InvalidPhase { actual: Phase::Started, .. })
    ));
    let client = Client::new(client_config(&server));
    assert!(matches!(
        client.make_request(GET_AAA),
        Err(EndpointError::InvalidPhase { actual: Phase::Idle, .. })
    ));
    server.stop();
}
