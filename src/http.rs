//! Minimal HTTP/1.x plumbing over blocking sockets.
//!
//! Only what the challenge exchange needs: `GET` request lines in, `text/plain`
//! responses out, and a one-shot `GET` client.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::ServiceError;

/// Largest request head accepted by the server.
pub const MAX_REQUEST_SIZE: usize = 8 * 1024;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Find the end of HTTP headers (position after `\r\n\r\n` or `\n\n`).
pub fn find_header_end(data: &[u8]) -> Option<usize> {
    if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some(pos + 4);
    }
    data.windows(2).position(|w| w == b"\n\n").map(|pos| pos + 2)
}

/// Split a request head into `(path, query)`.
///
/// Returns `None` unless the first line is `GET <target> HTTP/x`.
pub fn parse_request_line(head: &str) -> Option<(String, String)> {
    let line = head.lines().next()?;
    let mut parts = line.split_whitespace();
    if parts.next()? != "GET" {
        return None;
    }
    let target = parts.next()?;
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    Some((path.to_string(), query.to_string()))
}

/// Render a complete `text/plain` response.
pub fn http_response(status: u16, reason: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    )
}

/// Read one request head from `stream`.
pub fn read_request(stream: &mut TcpStream) -> Result<(String, String), ServiceError> {
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    let mut buf = vec![0u8; MAX_REQUEST_SIZE];
    let mut total = 0;
    loop {
        let n = stream.read(&mut buf[total..])?;
        if n == 0 {
            return Err(ServiceError::Http("connection closed before headers".into()));
        }
        total += n;
        if let Some(end) = find_header_end(&buf[..total]) {
            let head = String::from_utf8_lossy(&buf[..end]);
            return parse_request_line(&head)
                .ok_or_else(|| ServiceError::Http("unsupported request".into()));
        }
        if total == buf.len() {
            return Err(ServiceError::Http("request too large".into()));
        }
    }
}

/// Issue `GET target` to `addr` and return the body of a 200 response.
pub fn get(addr: &str, target: &str) -> Result<String, ServiceError> {
    let socket = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ServiceError::Http(format!("cannot resolve {addr}")))?;
    let mut stream = TcpStream::connect_timeout(&socket, IO_TIMEOUT)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    write!(
        stream,
        "GET {target} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n"
    )?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;

    let end = find_header_end(&response)
        .ok_or_else(|| ServiceError::Http("truncated response".into()))?;
    let head = String::from_utf8_lossy(&response[..end]);
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| ServiceError::Http("malformed status line".into()))?;
    if status != 200 {
        return Err(ServiceError::Http(format!("status {status}")));
    }
    Ok(String::from_utf8_lossy(&response[end..]).into_owned())
}
