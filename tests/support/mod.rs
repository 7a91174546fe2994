#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub close: bool,
    pub delay: Option<Duration>,
}

impl MockResponse {
    pub fn new(
        status: u16,
        headers: Vec<(impl Into<String>, impl Into<String>)>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
            body: body.into(),
            close: false,
            delay: None,
        }
    }

    pub fn with_close(mut self) -> Self {
        self.close = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Clone)]
pub enum Script {
    Respond(MockResponse),
    /// Close the connection after reading the request, without writing
    /// a single response byte.
    DropConnection,
    /// Write these bytes verbatim and close.
    Raw(Vec<u8>),
}

#[derive(Clone, Debug)]
pub struct CapturedRequest {
    pub method: String,
    pub target: String,
    /// Lowercased name -> value, for convenient assertions.
    pub headers: BTreeMap<String, String>,
    /// The raw head text, for case-sensitive header assertions.
    pub raw_head: String,
    pub body: Vec<u8>,
}

/// Concurrency gauges, shareable across servers to measure a combined
/// in-flight peak.
#[derive(Clone)]
pub struct Gauges {
    pub active: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

impl Gauges {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct ServerShared {
    script: Mutex<VecDeque<Script>>,
    accepted: AtomicUsize,
    served: AtomicUsize,
    captured: Mutex<Vec<CapturedRequest>>,
    gauges: Gauges,
    shutdown: AtomicBool,
}

pub struct MockServer {
    pub base_url: String,
    shared: Arc<ServerShared>,
    acceptor: Option<JoinHandle<()>>,
    handlers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MockServer {
    pub fn start(script: Vec<Script>) -> Self {
        Self::start_with_gauges(script, Gauges::new())
    }

    pub fn start_with_gauges(script: Vec<Script>, gauges: Gauges) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("read local address");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let shared = Arc::new(ServerShared {
            script: Mutex::new(script.into()),
            accepted: AtomicUsize::new(0),
            served: AtomicUsize::new(0),
            captured: Mutex::new(Vec::new()),
            gauges,
            shutdown: AtomicBool::new(false),
        });
        let handlers = Arc::new(Mutex::new(Vec::new()));

        let shared_clone = Arc::clone(&shared);
        let handlers_clone = Arc::clone(&handlers);
        let acceptor = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(10);
            while !shared_clone.shutdown.load(Ordering::SeqCst) && Instant::now() < deadline {
                match listener.accept() {
                    Ok((stream, _)) => {
                        shared_clone.accepted.fetch_add(1, Ordering::SeqCst);
                        let connection_shared = Arc::clone(&shared_clone);
                        let handle =
                            thread::spawn(move || handle_connection(stream, connection_shared));
                        handlers_clone
                            .lock()
                            .expect("lock handler registry")
                            .push(handle);
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            base_url: format!("http://{address}"),
            shared,
            acceptor: Some(acceptor),
            handlers,
        }
    }

    pub fn accepted_connections(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    pub fn served_count(&self) -> usize {
        self.shared.served.load(Ordering::SeqCst)
    }

    pub fn peak_active(&self) -> usize {
        self.shared.gauges.peak.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.shared
            .captured
            .lock()
            .expect("lock captured requests")
            .clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        let handles = std::mem::take(&mut *self.handlers.lock().expect("lock handler registry"));
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn handle_connection(mut stream: TcpStream, shared: Arc<ServerShared>) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));

    loop {
        let request = match read_request(&mut stream) {
            Ok(Some(request)) => request,
            _ => break,
        };
        shared
            .captured
            .lock()
            .expect("lock captured requests")
            .push(request);

        let action = shared
            .script
            .lock()
            .expect("lock script")
            .pop_front();
        let Some(action) = action else {
            let _ = write_response(
                &mut stream,
                &MockResponse::new(500, Vec::<(String, String)>::new(), b"script exhausted".to_vec())
                    .with_close(),
            );
            break;
        };

        match action {
            Script::Respond(response) => {
                let now_active = shared.gauges.active.fetch_add(1, Ordering::SeqCst) + 1;
                shared.gauges.peak.fetch_max(now_active, Ordering::SeqCst);
                if let Some(delay) = response.delay {
                    thread::sleep(delay);
                }
                let written = write_response(&mut stream, &response);
                shared.gauges.active.fetch_sub(1, Ordering::SeqCst);
                shared.served.fetch_add(1, Ordering::SeqCst);
                if written.is_err() || response.close {
                    break;
                }
            }
            Script::DropConnection => break,
            Script::Raw(bytes) => {
                let _ = stream.write_all(&bytes);
                let _ = stream.flush();
                shared.served.fetch_add(1, Ordering::SeqCst);
                break;
            }
        }
    }
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<CapturedRequest>> {
    let mut raw = Vec::new();
    loop {
        let mut chunk = [0_u8; 1024];
        let read = match stream.read(&mut chunk) {
            Ok(read) => read,
            Err(error)
                if matches!(
                    error.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) && raw.is_empty() =>
            {
                return Ok(None);
            }
            Err(error) => return Err(error),
        };
        if read == 0 {
            if raw.is_empty() {
                return Ok(None);
            }
            break;
        }
        raw.extend_from_slice(&chunk[..read]);
        if find_header_end(&raw).is_some() {
            break;
        }
    }

    let Some(header_end) = find_header_end(&raw) else {
        return Ok(None);
    };

    let raw_head = String::from_utf8_lossy(&raw[..header_end]).into_owned();
    let mut lines = raw_head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut request_line_parts = request_line.split_whitespace();
    let method = request_line_parts.next().unwrap_or_default().to_owned();
    let target = request_line_parts.next().unwrap_or_default().to_owned();

    let mut headers = BTreeMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }

    let content_length = headers
        .get("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = raw[header_end + 4..].to_vec();
    while body.len() < content_length {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(Some(CapturedRequest {
        method,
        target,
        headers,
        raw_head,
        body,
    }))
}

fn write_response(stream: &mut TcpStream, response: &MockResponse) -> std::io::Result<()> {
    let mut raw = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n",
        response.status,
        status_text(response.status),
        response.body.len()
    );
    if response.close {
        raw.push_str("Connection: close\r\n");
    }
    for (name, value) in &response.headers {
        raw.push_str(name);
        raw.push_str(": ");
        raw.push_str(value);
        raw.push_str("\r\n");
    }
    raw.push_str("\r\n");

    stream.write_all(raw.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
