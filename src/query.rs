//! Confirmation query parsing.

use std::collections::HashMap;

use crate::error::ProtocolError;
use crate::key::{Port, Tuple};

/// Largest accepted process id.
pub const MAX_PID: u32 = 0xFF_FFFF;

/// Query parameters by name, in order of appearance.
pub type Query = HashMap<String, Vec<String>>;

/// Split a raw query string into parameters.
///
/// `+` and `%XX` escapes are decoded; malformed escapes are kept verbatim.
pub fn parse_query(raw: &str) -> Query {
    let mut query = Query::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        query
            .entry(percent_decode(name))
            .or_default()
            .push(percent_decode(value));
    }
    query
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let decoded = bytes
                    .get(i + 1..i + 3)
                    .filter(|hex| hex.iter().all(u8::is_ascii_hexdigit))
                    .and_then(|hex| std::str::from_utf8(hex).ok())
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match decoded {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                        continue;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn single(values: &[String]) -> Option<&str> {
    match values {
        [value] => Some(value.as_str()),
        _ => None,
    }
}

/// Parse one port, `0 <= port < 0xFFFF`.
pub fn parse_port(s: &str) -> Option<Port> {
    s.parse::<Port>().ok().filter(|&port| port < Port::MAX)
}

/// Parse the `ports` parameter into tuples of `tuple_size` ports.
///
/// The list is comma-terminated: whatever follows the last comma is ignored.
/// The final tuple may be shorter than `tuple_size`.
pub fn parse_ports(values: &[String], tuple_size: usize) -> Result<Vec<Tuple>, ProtocolError> {
    let raw = single(values).ok_or_else(|| ProtocolError::MalformedPorts(values.join("&")))?;
    let malformed = || ProtocolError::MalformedPorts(raw.to_string());

    let mut fields: Vec<&str> = raw.split(',').collect();
    fields.pop();
    if fields.is_empty() || tuple_size == 0 {
        return Err(malformed());
    }

    let ports = fields
        .into_iter()
        .map(parse_port)
        .collect::<Option<Vec<Port>>>()
        .ok_or_else(malformed)?;

    Ok(ports.chunks(tuple_size).map(|c| c.to_vec()).collect())
}

/// Parse the `pid` parameter, `0 < pid <= MAX_PID`.
pub fn parse_pid(values: &[String]) -> Result<u32, ProtocolError> {
    let raw = single(values).ok_or_else(|| ProtocolError::MalformedPid(values.join("&")))?;
    raw.parse::<u32>()
        .ok()
        .filter(|&pid| pid > 0 && pid <= MAX_PID)
        .ok_or_else(|| ProtocolError::MalformedPid(raw.to_string()))
}

/// Render ports as the comma-terminated list `parse_ports` expects.
pub fn format_ports(ports: &[Port]) -> String {
    ports.iter().map(|p| format!("{p},")).collect()
}

/// Extract the tuples and pid of a confirmation request.
pub fn parse_confirmation(
    query: &Query,
    tuple_size: usize,
) -> Result<(Vec<Tuple>, u32), ProtocolError> {
    let ports = query
        .get("ports")
        .ok_or(ProtocolError::MissingParameter("ports"))?;
    let pid = query
        .get("pid")
        .ok_or(ProtocolError::MissingParameter("pid"))?;
    Ok((parse_ports(ports, tuple_size)?, parse_pid(pid)?))
}
