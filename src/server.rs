//! Challenge server: issues tuples and confirms completed knocks.
//!
//! `GET /` issues a challenge, `GET /session?ports=..&pid=..` confirms one and
//! `GET /metrics` exports counters. Every protocol failure is answered with a
//! text line; none of them stops the server.

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::challenge::{Challenge, Issuer};
use crate::combinations::Combinations;
use crate::config::Config;
use crate::error::{ProtocolError, ServiceError};
use crate::http;
use crate::key::Tuple;
use crate::marker;
use crate::metrics::{bump, ServerMetrics};
use crate::query::{parse_confirmation, parse_query};
use crate::session::{SessionId, SessionStore};

/// Result of a successful confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    /// Session that was removed
    pub session: SessionId,
    /// Confirming process
    pub pid: u32,
    /// Tuples the session owned
    pub tuples: Vec<Tuple>,
}

/// Challenge/confirmation state shared by all request handlers.
pub struct Server {
    issuer: Issuer,
    store: SessionStore,
    tuple_size: usize,
    marker_dir: Option<PathBuf>,
    /// Real-time operational metrics
    pub metrics: ServerMetrics,
}

impl Server {
    /// Build the generator, issuer and store described by `config`.
    pub fn new(config: &Config) -> Result<Self, ServiceError> {
        config.validate()?;
        let generator = Combinations::new(config.ports(), config.tuple_size());
        Ok(Self {
            issuer: Issuer::new(
                generator,
                config.tuples_per_challenge(),
                config.skip_probability,
            ),
            store: SessionStore::new(config.port_base, config.session_ttl()),
            tuple_size: config.tuple_size(),
            marker_dir: Some(config.marker_dir.clone()),
            metrics: ServerMetrics::new(),
        })
    }

    /// Disable marker removal on confirmation.
    pub fn without_markers(mut self) -> Self {
        self.marker_dir = None;
        self
    }

    /// Pending session store.
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Issue a new challenge.
    pub fn issue(&self) -> Challenge {
        let challenge = self.issuer.issue(&self.store);
        bump(&self.metrics.challenges_issued);
        info!(session = challenge.id, tuples = challenge.tuples.len(), "challenge issued");
        challenge
    }

    /// Confirm the knock described by `raw_query` and remove its session.
    pub fn confirm(&self, raw_query: &str) -> Result<Confirmation, ProtocolError> {
        let result = self.confirm_inner(raw_query);
        match &result {
            Ok(confirmation) => {
                bump(&self.metrics.confirmations_ok);
                info!(
                    session = confirmation.session,
                    pid = confirmation.pid,
                    "knock confirmed"
                );
            }
            Err(e) => {
                let counter = match e {
                    ProtocolError::NoSession => &self.metrics.confirmations_unmatched,
                    ProtocolError::AmbiguousSession { .. } => {
                        &self.metrics.confirmations_ambiguous
                    }
                    ProtocolError::IntegrityMismatch { .. } => &self.metrics.integrity_failures,
                    _ => &self.metrics.confirmations_malformed,
                };
                bump(counter);
                warn!("confirmation rejected: {}", e);
            }
        }
        result
    }

    fn confirm_inner(&self, raw_query: &str) -> Result<Confirmation, ProtocolError> {
        let (tuples, pid) = parse_confirmation(&parse_query(raw_query), self.tuple_size)?;
        let session = self.store.match_session(&tuples)?;
        let removal = self
            .store
            .remove_session(session.id)
            .ok_or(ProtocolError::SessionNotFound(session.id))?;
        if !removal.is_complete() {
            return Err(ProtocolError::IntegrityMismatch {
                session: session.id,
                expected: removal.tuples.len(),
                removed: removal.removed.len(),
            });
        }
        Ok(Confirmation {
            session: session.id,
            pid,
            tuples: removal.tuples,
        })
    }

    /// Remove sessions whose expiration has passed.
    pub fn sweep_expired(&self) -> usize {
        let expired = self.store.sweep_expired(Instant::now());
        for id in &expired {
            bump(&self.metrics.sessions_expired);
            debug!(session = id, "session expired");
        }
        expired.len()
    }

    /// Produce the response body for a request to `path` with `query`.
    pub fn handle(&self, path: &str, query: &str) -> String {
        match path {
            "/session" => match self.confirm(query) {
                Ok(confirmation) => {
                    let mut body = self.release_marker(confirmation.pid);
                    body.push_str(&format!(
                        "Removed tuples for session {}, pid {}\n",
                        confirmation.session, confirmation.pid
                    ));
                    body
                }
                Err(e) => format!("{e}\n"),
            },
            "/metrics" => self.metrics.export_metrics(self.store.len()),
            _ => self.issue().to_text(),
        }
    }

    fn release_marker(&self, pid: u32) -> String {
        let Some(dir) = &self.marker_dir else {
            return String::new();
        };
        match marker::remove(dir, pid) {
            Ok(path) => format!("File {} removed\n", path.display()),
            Err(e) => {
                warn!(pid, "failed to remove marker: {}", e);
                format!(
                    "Failed to remove file {} {}\n",
                    marker::marker_path(dir, pid).display(),
                    e
                )
            }
        }
    }

    fn serve_connection(&self, mut stream: TcpStream) -> Result<(), ServiceError> {
        let response = match http::read_request(&mut stream) {
            Ok((path, query)) => {
                debug!(%path, %query, "request");
                http::http_response(200, "OK", &self.handle(&path, &query))
            }
            Err(e) => {
                debug!("bad request: {}", e);
                http::http_response(400, "Bad Request", "bad request\n")
            }
        };
        stream.write_all(response.as_bytes())?;
        Ok(())
    }

    /// Serve on `listener` forever, one thread per connection.
    ///
    /// A sweeper thread removes expired sessions every `config.sweep_interval()`.
    pub fn run(self: Arc<Self>, listener: TcpListener, config: &Config) -> Result<(), ServiceError> {
        info!("Challenge server listening on {}", listener.local_addr()?);

        let sweeper = self.clone();
        let interval = config.sweep_interval();
        thread::spawn(move || loop {
            thread::sleep(interval);
            sweeper.sweep_expired();
        });

        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    error!("Accept error: {}", e);
                    continue;
                }
            };
            let server = self.clone();
            thread::spawn(move || {
                if let Err(e) = server.serve_connection(stream) {
                    debug!("connection error: {}", e);
                }
            });
        }
        Ok(())
    }
}
