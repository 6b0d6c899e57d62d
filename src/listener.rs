//! Knock service: observes connections on the knock ports and reports
//! completed knock batches to the challenge server.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ServiceError;
use crate::http;
use crate::key::Port;
use crate::knock::{FlushReason, KnockAccumulator, KnockBatch};
use crate::metrics::{bump, ServiceMetrics};
use crate::query::format_ports;
use crate::resolver::OwnerResolver;

/// Receiver of completed knock batches.
pub trait BatchSink: Send + Sync {
    /// Forward one batch upstream.
    fn submit(&self, batch: KnockBatch);
}

impl<F> BatchSink for F
where
    F: Fn(KnockBatch) + Send + Sync,
{
    fn submit(&self, batch: KnockBatch) {
        self(batch)
    }
}

/// Sink confirming batches with the challenge server over HTTP.
pub struct HttpReporter {
    addr: String,
}

impl HttpReporter {
    /// Report to the server at `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Request target confirming `batch`.
    pub fn target(batch: &KnockBatch) -> String {
        format!(
            "/session?ports={}&pid={}",
            format_ports(&batch.ports),
            batch.source
        )
    }
}

impl BatchSink for HttpReporter {
    fn submit(&self, batch: KnockBatch) {
        match http::get(&self.addr, &Self::target(&batch)) {
            Ok(reply) => info!(pid = batch.source, reply = reply.trim_end(), "batch reported"),
            Err(e) => error!(pid = batch.source, "failed to report batch: {}", e),
        }
    }
}

/// Bind every port in `ports`.
///
/// Ports that fail are logged and skipped; unless a strict majority binds the
/// service cannot serve the range and `ServiceError::Bind` is returned.
pub fn bind_ports(ports: &[Port]) -> Result<Vec<TcpListener>, ServiceError> {
    let mut listeners = Vec::with_capacity(ports.len());
    let mut failed = Vec::new();
    for &port in ports {
        match TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))) {
            Ok(listener) => listeners.push(listener),
            Err(e) => {
                debug!(port, "bind failed: {}", e);
                failed.push(port);
            }
        }
    }
    if !failed.is_empty() {
        warn!("Failed to bind ports {:?}", failed);
    }
    if listeners.len() * 2 <= ports.len() {
        return Err(ServiceError::Bind {
            bound: listeners.len(),
            total: ports.len(),
        });
    }
    info!("Bound {} of {} knock ports", listeners.len(), ports.len());
    Ok(listeners)
}

/// Knock observer shared by the accept threads and the sweeper.
pub struct KnockService {
    accumulator: KnockAccumulator,
    resolver: Box<dyn OwnerResolver>,
    sink: Box<dyn BatchSink>,
    /// Real-time operational metrics
    pub metrics: ServiceMetrics,
}

impl KnockService {
    /// Create a service feeding `sink` with batches from `accumulator`.
    pub fn new(
        accumulator: KnockAccumulator,
        resolver: impl OwnerResolver + 'static,
        sink: impl BatchSink + 'static,
    ) -> Self {
        Self {
            accumulator,
            resolver: Box::new(resolver),
            sink: Box::new(sink),
            metrics: ServiceMetrics::new(),
        }
    }

    /// Record a connection from `remote` on the knock port `local`.
    ///
    /// Knocks whose owner cannot be resolved are dropped.
    pub fn observe(&self, local: SocketAddr, remote: SocketAddr) {
        self.observe_at(local, remote, Instant::now())
    }

    /// Record a connection accepted at `arrived`.
    ///
    /// The owner lookup may block; the knock is still ordered by `arrived`.
    pub fn observe_at(&self, local: SocketAddr, remote: SocketAddr, arrived: Instant) {
        bump(&self.metrics.knocks_observed);
        let Some(pid) = self.resolver.resolve_owner(local, remote) else {
            bump(&self.metrics.knocks_unresolved);
            debug!(port = local.port(), %remote, "knock owner unresolved");
            return;
        };
        debug!(pid, port = local.port(), "knock");
        if let Some(batch) = self.accumulator.knock_at(pid, local.port(), arrived) {
            self.release(batch);
        }
    }

    /// Release expired entries; returns the number of batches submitted.
    pub fn sweep(&self) -> usize {
        let batches = self.accumulator.sweep(Instant::now());
        let count = batches.len();
        for batch in batches {
            self.release(batch);
        }
        count
    }

    /// Export the service counters plus the number of sources collecting.
    pub fn export_metrics(&self) -> String {
        self.metrics.export_metrics(self.accumulator.pending())
    }

    fn release(&self, batch: KnockBatch) {
        match batch.reason {
            FlushReason::Complete => bump(&self.metrics.batches_complete),
            FlushReason::Timeout => bump(&self.metrics.batches_timeout),
        }
        info!(
            pid = batch.source,
            knocks = batch.ports.len(),
            reason = ?batch.reason,
            "knock batch released"
        );
        self.sink.submit(batch);
    }

    /// Accept knocks on every listener and sweep every `config.sweep_interval()`.
    ///
    /// The sweeper also logs the counters every `config.metrics_interval()`,
    /// unless that interval is zero. Returns the handles of the spawned
    /// threads; they run until the process exits.
    pub fn run(self: Arc<Self>, listeners: Vec<TcpListener>, config: &Config) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = listeners
            .into_iter()
            .map(|listener| {
                let service = self.clone();
                thread::spawn(move || service.accept_loop(listener))
            })
            .collect();

        let sweeper = self.clone();
        let sweep_interval = config.sweep_interval();
        let metrics_interval = config.metrics_interval();
        handles.push(thread::spawn(move || {
            let mut exported = Instant::now();
            loop {
                thread::sleep(sweep_interval);
                sweeper.sweep();
                if !metrics_interval.is_zero() && exported.elapsed() >= metrics_interval {
                    info!("knock service metrics\n{}", sweeper.export_metrics());
                    exported = Instant::now();
                }
            }
        }));
        handles
    }

    fn accept_loop(&self, listener: TcpListener) {
        let local = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("listener without address: {}", e);
                return;
            }
        };
        for stream in listener.incoming() {
            let arrived = Instant::now();
            match stream {
                Ok(stream) => match stream.peer_addr() {
                    // The stream stays open until the owner is resolved.
                    Ok(remote) => self.observe_at(local, remote, arrived),
                    Err(e) => debug!(port = local.port(), "peer address unavailable: {}", e),
                },
                Err(e) => error!(port = local.port(), "Accept error: {}", e),
            }
        }
    }
}
