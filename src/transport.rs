use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Method, StatusCode};
use native_tls::{HandshakeError, TlsConnector, TlsStream};

use crate::error::{Error, TimeoutPhase, TransportErrorKind};
use crate::pool::{Route, Scheme};
use crate::util::header_value;

const MAX_HEAD_BYTES: usize = 64 * 1024;
const READ_CHUNK_BYTES: usize = 8 * 1024;

pub(crate) enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Read for Stream {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buffer),
            Self::Tls(stream) => stream.read(buffer),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buffer: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.write(buffer),
            Self::Tls(stream) => stream.write(buffer),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush(),
            Self::Tls(stream) => stream.flush(),
        }
    }
}

/// One transport connection, leased exclusively to a single in-flight
/// call at a time.
pub(crate) struct Connection {
    pub(crate) stream: Stream,
    pub(crate) created_at: Instant,
    pub(crate) reused: bool,
}

pub(crate) struct ConnectOptions<'a> {
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) proxy: Option<&'a (String, u16)>,
}

fn transport_error(
    kind: TransportErrorKind,
    method: &Method,
    url: &str,
    source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> Error {
    Error::Transport {
        kind,
        method: method.clone(),
        url: url.to_owned(),
        partial_status: None,
        source: source.into(),
    }
}

fn is_timeout_kind(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// Establishes a connection for the route: DNS resolution, bounded TCP
/// connect, TCP_NODELAY, socket read/write timeouts, then the TLS
/// handshake for https routes. Plain-HTTP routes go through the proxy
/// when one is configured.
pub(crate) fn connect(
    route: &Route,
    connector: &TlsConnector,
    options: &ConnectOptions<'_>,
    method: &Method,
    url: &str,
) -> Result<Connection, Error> {
    let (target_host, target_port) = match (options.proxy, route.scheme) {
        (Some((proxy_host, proxy_port)), Scheme::Http) => (proxy_host.as_str(), *proxy_port),
        _ => (route.host.as_str(), route.port),
    };

    let addresses = (target_host, target_port)
        .to_socket_addrs()
        .map_err(|source| transport_error(TransportErrorKind::Dns, method, url, source))?
        .collect::<Vec<_>>();
    if addresses.is_empty() {
        return Err(transport_error(
            TransportErrorKind::Dns,
            method,
            url,
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses"),
        ));
    }

    let mut last_error = None;
    let mut tcp = None;
    for address in addresses {
        match TcpStream::connect_timeout(&address, options.connect_timeout) {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(error) => last_error = Some(error),
        }
    }
    let Some(tcp) = tcp else {
        let source = last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "connect failed"));
        if is_timeout_kind(source.kind()) {
            return Err(Error::Timeout {
                phase: TimeoutPhase::Connect,
                timeout_ms: options.connect_timeout.as_millis(),
                method: method.clone(),
                url: url.to_owned(),
            });
        }
        return Err(transport_error(
            TransportErrorKind::Connect,
            method,
            url,
            source,
        ));
    };

    // Small-request latency: never Nagle-buffer the request head.
    tcp.set_nodelay(true)
        .map_err(|source| transport_error(TransportErrorKind::Connect, method, url, source))?;
    tcp.set_read_timeout(Some(options.read_timeout))
        .map_err(|source| transport_error(TransportErrorKind::Connect, method, url, source))?;
    tcp.set_write_timeout(Some(options.read_timeout))
        .map_err(|source| transport_error(TransportErrorKind::Connect, method, url, source))?;

    let stream = if route.scheme.is_tls() {
        match connector.connect(&route.host, tcp) {
            Ok(tls) => Stream::Tls(Box::new(tls)),
            Err(HandshakeError::Failure(source)) => {
                return Err(transport_error(TransportErrorKind::Tls, method, url, source));
            }
            Err(HandshakeError::WouldBlock(_)) => {
                return Err(Error::Timeout {
                    phase: TimeoutPhase::Connect,
                    timeout_ms: options.read_timeout.as_millis(),
                    method: method.clone(),
                    url: url.to_owned(),
                });
            }
        }
    } else {
        Stream::Plain(tcp)
    };

    Ok(Connection {
        stream,
        created_at: Instant::now(),
        reused: false,
    })
}

pub(crate) struct Exchange<'a> {
    pub(crate) method: &'a Method,
    /// Redacted URL, used only for error context and log fields.
    pub(crate) url: &'a str,
    pub(crate) target: &'a str,
    pub(crate) headers: &'a [(String, String)],
    pub(crate) body: Option<&'a [u8]>,
    pub(crate) read_timeout: Duration,
    pub(crate) max_body_bytes: usize,
}

pub(crate) struct RawResponse {
    pub(crate) status: StatusCode,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Bytes,
    /// Whether the connection may be returned to the pool: the body was
    /// length-framed and the server did not request closure.
    pub(crate) reusable: bool,
}

/// Writes one request and reads one response over the leased
/// connection. All I/O failures come back as structured errors carrying
/// the retry classification.
pub(crate) fn exchange(
    connection: &mut Connection,
    exchange: &Exchange<'_>,
) -> Result<RawResponse, Error> {
    write_request(connection, exchange).map_err(|source| {
        transport_error(TransportErrorKind::NoResponse, exchange.method, exchange.url, source)
    })?;
    read_response(connection, exchange)
}

fn write_request(connection: &mut Connection, exchange: &Exchange<'_>) -> io::Result<()> {
    let mut head = String::with_capacity(256);
    head.push_str(exchange.method.as_str());
    head.push(' ');
    head.push_str(exchange.target);
    head.push_str(" HTTP/1.1\r\n");
    for (name, value) in exchange.headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    connection.stream.write_all(head.as_bytes())?;
    if let Some(body) = exchange.body {
        connection.stream.write_all(body)?;
    }
    connection.stream.flush()
}

struct WireReader<'a> {
    stream: &'a mut Stream,
    buffer: Vec<u8>,
    pos: usize,
    received: usize,
}

impl<'a> WireReader<'a> {
    fn new(stream: &'a mut Stream) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            pos: 0,
            received: 0,
        }
    }

    fn buffered(&self) -> &[u8] {
        &self.buffer[self.pos..]
    }

    fn consume(&mut self, count: usize) {
        self.pos = (self.pos + count).min(self.buffer.len());
    }

    fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        let read = self.stream.read(&mut chunk)?;
        self.buffer.extend_from_slice(&chunk[..read]);
        self.received += read;
        Ok(read)
    }

    /// Next CRLF-terminated line, without the terminator. `Ok(None)`
    /// means the peer closed the stream first.
    fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(newline) = self.buffered().iter().position(|&byte| byte == b'\n') {
                let line = &self.buffered()[..newline];
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                let text = String::from_utf8_lossy(line).into_owned();
                self.consume(newline + 1);
                return Ok(Some(text));
            }
            if self.fill()? == 0 {
                return Ok(None);
            }
        }
    }
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn read_response(connection: &mut Connection, exchange: &Exchange<'_>) -> Result<RawResponse, Error> {
    let mut reader = WireReader::new(&mut connection.stream);

    // Response head.
    let head_end = loop {
        if let Some(index) = find_header_end(reader.buffered()) {
            break index;
        }
        if reader.buffered().len() > MAX_HEAD_BYTES {
            return Err(protocol_error("response head too large", exchange));
        }
        let read = reader
            .fill()
            .map_err(|source| classify_read_failure(source, reader.received, None, exchange))?;
        if read == 0 {
            if reader.received == 0 {
                return Err(transport_error(
                    TransportErrorKind::NoResponse,
                    exchange.method,
                    exchange.url,
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before any response byte",
                    ),
                ));
            }
            return Err(interrupted_error(None, exchange));
        }
    };

    let head_text = String::from_utf8_lossy(&reader.buffered()[..head_end]).into_owned();
    reader.consume(head_end + 4);

    let mut lines = head_text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| protocol_error("missing status line", exchange))?;
    let (http10, status) = parse_status_line(status_line)
        .ok_or_else(|| protocol_error(format!("malformed status line {status_line:?}"), exchange))?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(protocol_error(format!("malformed header line {line:?}"), exchange));
        };
        headers.push((name.trim().to_owned(), value.trim().to_owned()));
    }

    let partial = Some(status.as_u16());

    // Response body framing.
    let body_forbidden = *exchange.method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;
    let chunked = header_value(&headers, "transfer-encoding")
        .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"));

    let (body, length_framed) = if body_forbidden {
        (Vec::new(), true)
    } else if chunked {
        (read_chunked_body(&mut reader, partial, exchange)?, true)
    } else if let Some(declared) = header_value(&headers, "content-length") {
        let length = declared
            .trim()
            .parse::<usize>()
            .map_err(|_| protocol_error(format!("invalid content-length {declared:?}"), exchange))?;
        (read_sized_body(&mut reader, length, partial, exchange)?, true)
    } else {
        (read_body_to_end(&mut reader, partial, exchange)?, false)
    };

    let keep_alive_allowed = match header_value(&headers, "connection") {
        Some(value) if connection_lists(value, "close") => false,
        Some(value) if http10 => connection_lists(value, "keep-alive"),
        Some(_) => true,
        None => !http10,
    };
    let reusable = keep_alive_allowed && length_framed;

    let (body, decoded) = decode_content_encoded_body(body, &headers, exchange)?;
    let mut headers = headers;
    if decoded {
        headers.retain(|(name, _)| {
            !name.eq_ignore_ascii_case("content-encoding")
                && !name.eq_ignore_ascii_case("content-length")
        });
    }

    Ok(RawResponse {
        status,
        headers,
        body: Bytes::from(body),
        reusable,
    })
}

fn parse_status_line(line: &str) -> Option<(bool, StatusCode)> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    let http10 = match version {
        "HTTP/1.1" => false,
        "HTTP/1.0" => true,
        _ => return None,
    };
    let code = parts.next()?.parse::<u16>().ok()?;
    let status = StatusCode::from_u16(code).ok()?;
    Some((http10, status))
}

fn connection_lists(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

fn read_sized_body(
    reader: &mut WireReader<'_>,
    length: usize,
    partial: Option<u16>,
    exchange: &Exchange<'_>,
) -> Result<Vec<u8>, Error> {
    if length > exchange.max_body_bytes {
        return Err(too_large_error(length, exchange));
    }
    let mut body = Vec::with_capacity(length.min(READ_CHUNK_BYTES));
    while body.len() < length {
        let available = reader.buffered().len().min(length - body.len());
        if available > 0 {
            body.extend_from_slice(&reader.buffered()[..available]);
            reader.consume(available);
            continue;
        }
        let read = reader
            .fill()
            .map_err(|source| classify_read_failure(source, reader.received, partial, exchange))?;
        if read == 0 {
            return Err(interrupted_error(partial, exchange));
        }
    }
    Ok(body)
}

fn read_body_to_end(
    reader: &mut WireReader<'_>,
    partial: Option<u16>,
    exchange: &Exchange<'_>,
) -> Result<Vec<u8>, Error> {
    let mut body = Vec::new();
    loop {
        let buffered = reader.buffered().len();
        if buffered > 0 {
            if body.len() + buffered > exchange.max_body_bytes {
                return Err(too_large_error(body.len() + buffered, exchange));
            }
            body.extend_from_slice(reader.buffered());
            reader.consume(buffered);
        }
        let read = reader
            .fill()
            .map_err(|source| classify_read_failure(source, reader.received, partial, exchange))?;
        if read == 0 {
            return Ok(body);
        }
    }
}

fn read_chunked_body(
    reader: &mut WireReader<'_>,
    partial: Option<u16>,
    exchange: &Exchange<'_>,
) -> Result<Vec<u8>, Error> {
    let mut body = Vec::new();
    loop {
        let size_line = reader
            .read_line()
            .map_err(|source| classify_read_failure(source, reader.received, partial, exchange))?
            .ok_or_else(|| interrupted_error(partial, exchange))?;
        let size_text = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| protocol_error(format!("invalid chunk size {size_text:?}"), exchange))?;

        if size == 0 {
            // Trailer section ends at the first empty line.
            loop {
                let trailer = reader
                    .read_line()
                    .map_err(|source| {
                        classify_read_failure(source, reader.received, partial, exchange)
                    })?
                    .ok_or_else(|| interrupted_error(partial, exchange))?;
                if trailer.is_empty() {
                    return Ok(body);
                }
            }
        }

        if body.len() + size > exchange.max_body_bytes {
            return Err(too_large_error(body.len() + size, exchange));
        }
        let mut remaining = size;
        while remaining > 0 {
            let available = reader.buffered().len().min(remaining);
            if available > 0 {
                body.extend_from_slice(&reader.buffered()[..available]);
                reader.consume(available);
                remaining -= available;
                continue;
            }
            let read = reader.fill().map_err(|source| {
                classify_read_failure(source, reader.received, partial, exchange)
            })?;
            if read == 0 {
                return Err(interrupted_error(partial, exchange));
            }
        }
        let terminator = reader
            .read_line()
            .map_err(|source| classify_read_failure(source, reader.received, partial, exchange))?
            .ok_or_else(|| interrupted_error(partial, exchange))?;
        if !terminator.is_empty() {
            return Err(protocol_error("missing chunk terminator", exchange));
        }
    }
}

fn decode_content_encoded_body(
    body: Vec<u8>,
    headers: &[(String, String)],
    exchange: &Exchange<'_>,
) -> Result<(Vec<u8>, bool), Error> {
    let Some(content_encoding) = header_value(headers, "content-encoding") else {
        return Ok((body, false));
    };
    if body.is_empty() {
        return Ok((body, false));
    }

    let mut encodings = content_encoding
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect::<Vec<_>>();

    let mut body = body;
    let mut decoded_any = false;
    while let Some(encoding) = encodings.pop() {
        body = match encoding.to_ascii_lowercase().as_str() {
            "identity" => body,
            "gzip" => {
                decoded_any = true;
                let mut decoder = flate2::read::GzDecoder::new(body.as_slice());
                read_decoder_limited(&mut decoder, encoding, exchange)?
            }
            "deflate" => {
                decoded_any = true;
                let mut decoder = flate2::read::ZlibDecoder::new(body.as_slice());
                read_decoder_limited(&mut decoder, encoding, exchange)?
            }
            other => {
                return Err(protocol_error(
                    format!("unsupported content-encoding {other:?}"),
                    exchange,
                ));
            }
        };
    }
    Ok((body, decoded_any))
}

fn read_decoder_limited<R: Read>(
    decoder: &mut R,
    encoding: &str,
    exchange: &Exchange<'_>,
) -> Result<Vec<u8>, Error> {
    let mut decoded = Vec::new();
    let mut chunk = [0_u8; READ_CHUNK_BYTES];
    loop {
        let read = decoder.read(&mut chunk).map_err(|source| {
            protocol_error(
                format!("failed to decode {encoding} response body: {source}"),
                exchange,
            )
        })?;
        if read == 0 {
            return Ok(decoded);
        }
        let next_size = decoded.len().saturating_add(read);
        if next_size > exchange.max_body_bytes {
            return Err(too_large_error(next_size, exchange));
        }
        decoded.extend_from_slice(&chunk[..read]);
    }
}

fn classify_read_failure(
    source: io::Error,
    received: usize,
    partial_status: Option<u16>,
    exchange: &Exchange<'_>,
) -> Error {
    if is_timeout_kind(source.kind()) {
        return Error::Timeout {
            phase: TimeoutPhase::Read,
            timeout_ms: exchange.read_timeout.as_millis(),
            method: exchange.method.clone(),
            url: exchange.url.to_owned(),
        };
    }
    if received == 0 {
        return transport_error(
            TransportErrorKind::NoResponse,
            exchange.method,
            exchange.url,
            source,
        );
    }
    Error::Transport {
        kind: TransportErrorKind::Interrupted,
        method: exchange.method.clone(),
        url: exchange.url.to_owned(),
        partial_status,
        source: Box::new(source),
    }
}

fn interrupted_error(partial_status: Option<u16>, exchange: &Exchange<'_>) -> Error {
    Error::Transport {
        kind: TransportErrorKind::Interrupted,
        method: exchange.method.clone(),
        url: exchange.url.to_owned(),
        partial_status,
        source: Box::new(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed inside response",
        )),
    }
}

fn protocol_error(message: impl Into<String>, exchange: &Exchange<'_>) -> Error {
    Error::Protocol {
        message: message.into(),
        method: exchange.method.clone(),
        url: exchange.url.to_owned(),
    }
}

fn too_large_error(actual_bytes: usize, exchange: &Exchange<'_>) -> Error {
    Error::ResponseBodyTooLarge {
        limit_bytes: exchange.max_body_bytes,
        actual_bytes,
        method: exchange.method.clone(),
        url: exchange.url.to_owned(),
    }
}
