//! Recording forward proxy.
//!
//! A minimal HTTP/1.1 forward proxy: `CONNECT host:port` requests are
//! tunnelled, absolute-URI requests are rewritten to origin form and relayed
//! one at a time, so keep-alive clients get every request recorded and routed
//! to its own host.
//! Every destination is recorded in arrival order so a scenario can assert
//! where staging went.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::traffic::Destination;

/// Request heads larger than this are rejected.
const MAX_HEAD_BYTES: usize = 64 * 1024;

type Recorded = Arc<Mutex<Vec<Destination>>>;

/// A running proxy. Stops accepting when closed or dropped.
pub struct RecordingProxy {
    addr: SocketAddr,
    advertised_host: String,
    recorded: Recorded,
    accept_task: JoinHandle<()>,
}

impl RecordingProxy {
    /// Listen on an ephemeral loopback port.
    pub async fn start() -> Result<Self> {
        Self::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0), None).await
    }

    /// Listen on `addr`. `advertised_host` is the host clients should use in
    /// the proxy URL (e.g. a container bridge gateway); defaults to the bound IP.
    pub async fn bind(addr: SocketAddr, advertised_host: Option<String>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
        let accept_task = tokio::spawn(accept_loop(listener, recorded.clone()));
        let advertised_host = advertised_host.unwrap_or_else(|| addr.ip().to_string());
        info!(%addr, advertised = %advertised_host, "recording proxy listening");
        Ok(Self {
            addr,
            advertised_host,
            recorded,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `http://<advertised host>:<port>`, for `HTTP_PROXY` / `HTTPS_PROXY`.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.advertised_host, self.addr.port())
    }

    /// The proxy itself as a packet-level destination.
    pub fn destination(&self) -> Destination {
        Destination::new(self.advertised_host.clone(), self.addr.port())
    }

    /// `HTTP_PROXY`/`HTTPS_PROXY` pairs pointing at this proxy.
    pub fn env(&self) -> Vec<(String, String)> {
        let url = self.url();
        vec![
            ("HTTP_PROXY".to_string(), url.clone()),
            ("HTTPS_PROXY".to_string(), url),
        ]
    }

    /// Upstream destinations requested so far, in arrival order.
    pub fn destinations(&self) -> Vec<Destination> {
        self.recorded.lock().clone()
    }

    /// Distinct upstream hosts, in first-seen order.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        for d in self.recorded.lock().iter() {
            if !hosts.contains(&d.host) {
                hosts.push(d.host.clone());
            }
        }
        hosts
    }

    pub fn close(self) {
        self.accept_task.abort();
    }
}

impl Drop for RecordingProxy {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, recorded: Recorded) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(socket, recorded).await {
                        debug!(%peer, error = %e, "proxy connection ended with error");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "proxy accept failed");
                return;
            }
        }
    }
}

/// Parsed proxy request line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ProxyRequest {
    Connect(Destination),
    Forward {
        destination: Destination,
        request_line: String,
    },
}

fn parse_request_line(line: &str) -> Option<ProxyRequest> {
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next().unwrap_or("HTTP/1.1");

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = target.rsplit_once(':')?;
        return Some(ProxyRequest::Connect(Destination::new(
            host.trim_matches(|c| c == '[' || c == ']'),
            port.parse().ok()?,
        )));
    }

    let rest = target.strip_prefix("http://")?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h, p.parse().ok()?),
        None => (authority, 80),
    };
    Some(ProxyRequest::Forward {
        destination: Destination::new(host, port),
        request_line: format!("{} {} {}", method, path, version),
    })
}

/// Result of reading one message head.
enum Head {
    Complete(String),
    Closed,
    TooLarge,
}

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

async fn read_head<R>(reader: &mut R) -> std::io::Result<Head>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::new();
    loop {
        let n = reader.read_until(b'\n', &mut head).await?;
        if n == 0 {
            return Ok(Head::Closed);
        }
        // Stray line breaks between pipelined requests.
        if head == b"\r\n" || head == b"\n" {
            head.clear();
            continue;
        }
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            return Ok(Head::Complete(String::from_utf8_lossy(&head).into_owned()));
        }
        if head.len() > MAX_HEAD_BYTES {
            return Ok(Head::TooLarge);
        }
    }
}

fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (key, value) = line.split_once(':')?;
    key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
}

fn find_header<'a>(lines: &[&'a str], name: &str) -> Option<&'a str> {
    lines.iter().find_map(|line| header_value(line, name))
}

fn is_chunked(lines: &[&str]) -> bool {
    find_header(lines, "transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
}

fn content_length(lines: &[&str]) -> Option<u64> {
    find_header(lines, "content-length").and_then(|v| v.parse().ok())
}

/// Requests without a length carry no body.
fn request_framing(headers: &[&str]) -> BodyFraming {
    if is_chunked(headers) {
        return BodyFraming::Chunked;
    }
    match content_length(headers) {
        Some(0) | None => BodyFraming::Empty,
        Some(n) => BodyFraming::Length(n),
    }
}

fn response_framing(status_line: &str, headers: &[&str], head_request: bool) -> BodyFraming {
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    if head_request || (100..200).contains(&status) || status == 204 || status == 304 {
        return BodyFraming::Empty;
    }
    if is_chunked(headers) {
        return BodyFraming::Chunked;
    }
    match content_length(headers) {
        Some(n) => BodyFraming::Length(n),
        None => BodyFraming::UntilClose,
    }
}

/// Hop-by-hop headers the proxy owns.
fn is_hop_header(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.starts_with("proxy-")
        || lower.starts_with("connection:")
        || lower.starts_with("keep-alive:")
        || lower.starts_with("expect:")
}

/// Copy one body from `reader` to `writer`.
async fn relay_body<R, W>(reader: &mut R, writer: &mut W, framing: BodyFraming) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::Empty => Ok(()),
        BodyFraming::Length(n) => copy_exact(reader, writer, n).await,
        BodyFraming::UntilClose => {
            tokio::io::copy(reader, writer).await?;
            Ok(())
        }
        BodyFraming::Chunked => loop {
            let mut size_line = Vec::new();
            if reader.read_until(b'\n', &mut size_line).await? == 0 {
                return Err(ErrorKind::UnexpectedEof.into());
            }
            writer.write_all(&size_line).await?;
            let text = String::from_utf8_lossy(&size_line);
            let size = text.split(';').next().unwrap_or_default().trim();
            let size = u64::from_str_radix(size, 16)
                .map_err(|_| std::io::Error::new(ErrorKind::InvalidData, "bad chunk size"))?;
            if size == 0 {
                // Trailers end with an empty line.
                loop {
                    let mut line = Vec::new();
                    if reader.read_until(b'\n', &mut line).await? == 0 {
                        return Ok(());
                    }
                    writer.write_all(&line).await?;
                    if line == b"\r\n" || line == b"\n" {
                        return Ok(());
                    }
                }
            }
            // Chunk data plus its CRLF.
            copy_exact(reader, writer, size + 2).await?;
        },
    }
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, n: u64) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut (&mut *reader).take(n), writer).await?;
    if copied < n {
        return Err(ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}

/// Serve one client connection. CONNECT turns it into a tunnel; absolute-URI
/// requests are handled one at a time, each recorded and sent to its own host.
async fn handle_client(socket: TcpStream, recorded: Recorded) -> std::io::Result<()> {
    let mut reader = BufReader::new(socket);
    loop {
        let head = match read_head(&mut reader).await? {
            Head::Complete(head) => head,
            Head::Closed => return Ok(()),
            Head::TooLarge => {
                reader
                    .get_mut()
                    .write_all(b"HTTP/1.1 431 Request Header Fields Too Large\r\n\r\n")
                    .await?;
                return Ok(());
            }
        };

        let mut lines = head.lines();
        let first = lines.next().unwrap_or_default();
        let headers: Vec<&str> = lines.filter(|l| !l.is_empty()).collect();
        let request = match parse_request_line(first) {
            Some(r) => r,
            None => {
                reader
                    .get_mut()
                    .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
                    .await?;
                return Ok(());
            }
        };

        let destination = match &request {
            ProxyRequest::Connect(d) => d.clone(),
            ProxyRequest::Forward { destination, .. } => destination.clone(),
        };
        debug!(%destination, "proxy request");
        recorded.lock().push(destination.clone());

        let upstream = match TcpStream::connect((destination.host.as_str(), destination.port)).await {
            Ok(s) => s,
            Err(e) => {
                debug!(%destination, error = %e, "upstream connect failed");
                reader
                    .get_mut()
                    .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await?;
                return Ok(());
            }
        };

        let request_line = match request {
            ProxyRequest::Connect(_) => return tunnel(reader, upstream).await,
            ProxyRequest::Forward { request_line, .. } => request_line,
        };

        let client_closes = find_header(&headers, "connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
            || request_line.ends_with("HTTP/1.0");
        let head_request = request_line.starts_with("HEAD ");

        let mut upstream = BufReader::new(upstream);
        let mut rewritten = request_line;
        rewritten.push_str("\r\n");
        for line in headers.iter().filter(|l| !is_hop_header(l)) {
            rewritten.push_str(line);
            rewritten.push_str("\r\n");
        }
        rewritten.push_str("Connection: close\r\n\r\n");
        upstream.get_mut().write_all(rewritten.as_bytes()).await?;
        relay_body(&mut reader, upstream.get_mut(), request_framing(&headers)).await?;

        let response = match read_head(&mut upstream).await? {
            Head::Complete(response) => response,
            Head::Closed | Head::TooLarge => {
                reader
                    .get_mut()
                    .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await?;
                return Ok(());
            }
        };
        let mut response_lines = response.lines();
        let status_line = response_lines.next().unwrap_or_default();
        let response_headers: Vec<&str> = response_lines.filter(|l| !l.is_empty()).collect();
        let framing = response_framing(status_line, &response_headers, head_request);

        let mut relayed = String::from(status_line);
        relayed.push_str("\r\n");
        for line in &response_headers {
            // The upstream hop always closes; the client hop stays open when framed.
            if framing != BodyFraming::UntilClose && is_hop_header(line) {
                continue;
            }
            relayed.push_str(line);
            relayed.push_str("\r\n");
        }
        relayed.push_str("\r\n");
        let client = reader.get_mut();
        client.write_all(relayed.as_bytes()).await?;
        relay_body(&mut upstream, client, framing).await?;

        if framing == BodyFraming::UntilClose || client_closes {
            client.shutdown().await?;
            return Ok(());
        }
    }
}

async fn tunnel(reader: BufReader<TcpStream>, mut upstream: TcpStream) -> std::io::Result<()> {
    // Bytes the client already sent past the head belong to the upstream.
    let pending = reader.buffer().to_vec();
    let mut client = reader.into_inner();
    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    if !pending.is_empty() {
        upstream.write_all(&pending).await?;
    }
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}
