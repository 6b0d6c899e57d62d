//! Client driver: fetches a challenge, knocks it and waits for confirmation.

use std::net::{IpAddr, SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::challenge::parse_tuples_text;
use crate::config::Config;
use crate::error::ServiceError;
use crate::http;
use crate::key::{Port, Tuple};
use crate::marker;

/// Per-port connect timeout.
pub const KNOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// Marker poll period while waiting for confirmation.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Request a challenge from the server at `addr`.
pub fn fetch_challenge(addr: &str) -> Result<Vec<Tuple>, ServiceError> {
    let text = http::get(addr, "/")?;
    let tuples = parse_tuples_text(&text);
    if tuples.is_empty() {
        return Err(ServiceError::Http(format!("empty challenge: {text:?}")));
    }
    Ok(tuples)
}

/// Connect to each port on `host` in order, pausing `interval` between knocks.
///
/// Returns the open streams; they must stay open until the knock is confirmed
/// so the service can resolve their owner. Ports that refuse are skipped.
pub fn knock(host: IpAddr, ports: &[Port], timeout: Duration, interval: Duration) -> Vec<TcpStream> {
    ports
        .iter()
        .enumerate()
        .filter_map(|(i, &port)| {
            if i > 0 && !interval.is_zero() {
                thread::sleep(interval);
            }
            match TcpStream::connect_timeout(&SocketAddr::new(host, port), timeout) {
                Ok(stream) => Some(stream),
                Err(e) => {
                    warn!(port, "knock failed: {}", e);
                    None
                }
            }
        })
        .collect()
}

/// Run one complete knock sequence for the current process.
///
/// Knocks are sent to the host of `config.http_addr`. On timeout the marker
/// is removed and `ServiceError::Unconfirmed` returned.
pub fn run(config: &Config) -> Result<(), ServiceError> {
    let host = config
        .http_addr
        .parse::<SocketAddr>()
        .map(|addr| addr.ip())
        .map_err(|e| ServiceError::Config(format!("http_addr {:?}: {e}", config.http_addr)))?;

    let tuples = fetch_challenge(&config.http_addr)?;
    let ports: Vec<Port> = tuples.into_iter().flatten().collect();
    let pid = std::process::id();

    let path = marker::create(&config.marker_dir, pid, &ports)?;
    debug!(?path, "marker created");
    info!(pid, "knocking {:?}", ports);

    let streams = knock(host, &ports, KNOCK_TIMEOUT, config.knock_interval());
    let confirmed = marker::wait_removed(&path, config.confirm_timeout(), POLL_INTERVAL);
    drop(streams);

    if confirmed {
        info!(pid, "knock confirmed");
        return Ok(());
    }
    if let Err(e) = marker::remove(&config.marker_dir, pid) {
        warn!(?path, "failed to remove marker: {}", e);
    }
    Err(ServiceError::Unconfirmed(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn knocks_in_order_and_skips_closed_ports() {
        let open = TcpListener::bind("127.0.0.1:0").unwrap();
        let closed = TcpListener::bind("127.0.0.1:0").unwrap();
        let open_port = open.local_addr().unwrap().port();
        let closed_port = closed.local_addr().unwrap().port();
        drop(closed);

        let host: IpAddr = "127.0.0.1".parse().unwrap();
        let streams = knock(
            host,
            &[open_port, closed_port, open_port],
            KNOCK_TIMEOUT,
            Duration::ZERO,
        );
        assert_eq!(streams.len(), 2);
        for stream in &streams {
            assert_eq!(stream.peer_addr().unwrap().port(), open_port);
        }
    }
}
