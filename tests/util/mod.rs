// Not all helpers are used by all test binaries.
#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use ember::{Config, Server};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    });
}

/// A server running on its own thread against an ephemeral port, shut down
/// and joined on drop.
pub struct TestServer {
    pub port: u16,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<io::Result<()>>>,
}

impl TestServer {
    pub fn start(config: Config) -> TestServer {
        init();

        let config = Config { port: 0, ..config };
        let mut server = Server::new(config).expect("unable to start server");
        let port = server.local_port().expect("listener has no port");

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::spawn(move || server.run(&flag));

        TestServer {
            port,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn connect(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("127.0.0.1", self.port)).expect("unable to connect to server");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .expect("server thread panicked")
                .expect("server loop failed");
        }
    }
}

/// A parsed response: status line, headers, body.
#[derive(Debug)]
pub struct Response {
    pub status: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .expect("response has no Content-Length")
            .parse()
            .expect("Content-Length is not a number")
    }
}

/// Reads one response off the stream. `expect_body` is false for HEAD,
/// where `Content-Length` describes a body that is never sent.
pub fn read_response_with(stream: &mut TcpStream, expect_body: bool) -> io::Result<Response> {
    let mut raw = Vec::new();
    let mut chunk = [0; 1024];

    let header_end = loop {
        if let Some(pos) = find(&raw, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response headers completed",
            ));
        }
        raw.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&raw[..header_end]).expect("response headers are not UTF-8");
    let mut lines = head.split("\r\n");
    let status = lines.next().unwrap().to_string();
    let headers = lines
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (name, value) = line.split_once(':').expect("header line without colon");
            (name.trim().to_string(), value.trim().to_string())
        })
        .collect::<Vec<_>>();

    let mut response = Response {
        status,
        headers,
        body: raw[header_end..].to_vec(),
    };

    if expect_body {
        let want = response.content_length();
        while response.body.len() < want {
            let n = stream.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            response.body.extend_from_slice(&chunk[..n]);
        }
    }

    Ok(response)
}

pub fn read_response(stream: &mut TcpStream) -> io::Result<Response> {
    read_response_with(stream, true)
}

/// Sends raw bytes and reads the response.
pub fn roundtrip(stream: &mut TcpStream, request: &[u8]) -> io::Result<Response> {
    stream.write_all(request)?;
    read_response(stream)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
