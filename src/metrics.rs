//! Operational counters for the server and the knock service.

use std::sync::Arc;

use parking_lot::Mutex;

/// Shared counter, cloned into every handler thread.
pub type Counter = Arc<Mutex<u64>>;

fn counter() -> Counter {
    Arc::new(Mutex::new(0))
}

/// Increment a counter by one.
pub fn bump(counter: &Counter) {
    *counter.lock() += 1;
}

/// Challenge server metrics.
///
/// Exported as text at `/metrics`, one `name {} value` line per counter.
#[derive(Clone, Debug)]
pub struct ServerMetrics {
    /// Challenges issued
    pub challenges_issued: Counter,
    /// Confirmations that removed a session cleanly
    pub confirmations_ok: Counter,
    /// Confirmation requests with unparsable parameters
    pub confirmations_malformed: Counter,
    /// Confirmations matching no session
    pub confirmations_unmatched: Counter,
    /// Confirmations matching several sessions
    pub confirmations_ambiguous: Counter,
    /// Removals that found fewer tuples than the session owned
    pub integrity_failures: Counter,
    /// Sessions removed by the expiry sweep
    pub sessions_expired: Counter,
}

impl ServerMetrics {
    /// Create a metrics container with all counters at zero.
    pub fn new() -> Self {
        Self {
            challenges_issued: counter(),
            confirmations_ok: counter(),
            confirmations_malformed: counter(),
            confirmations_unmatched: counter(),
            confirmations_ambiguous: counter(),
            integrity_failures: counter(),
            sessions_expired: counter(),
        }
    }

    /// Export counters plus the current store size.
    pub fn export_metrics(&self, sessions_pending: usize) -> String {
        format!(
            "portknock_challenges_issued {{}} {}\n\
             portknock_confirmations_ok {{}} {}\n\
             portknock_confirmations_malformed {{}} {}\n\
             portknock_confirmations_unmatched {{}} {}\n\
             portknock_confirmations_ambiguous {{}} {}\n\
             portknock_integrity_failures {{}} {}\n\
             portknock_sessions_expired {{}} {}\n\
             portknock_sessions_pending {{}} {}\n",
            self.challenges_issued.lock(),
            self.confirmations_ok.lock(),
            self.confirmations_malformed.lock(),
            self.confirmations_unmatched.lock(),
            self.confirmations_ambiguous.lock(),
            self.integrity_failures.lock(),
            self.sessions_expired.lock(),
            sessions_pending,
        )
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Knock service metrics.
#[derive(Clone, Debug)]
pub struct ServiceMetrics {
    /// Connections accepted on knock ports
    pub knocks_observed: Counter,
    /// Knocks dropped because the owner could not be resolved
    pub knocks_unresolved: Counter,
    /// Batches released on reaching the batch length
    pub batches_complete: Counter,
    /// Batches released on timeout
    pub batches_timeout: Counter,
}

impl ServiceMetrics {
    /// Create a metrics container with all counters at zero.
    pub fn new() -> Self {
        Self {
            knocks_observed: counter(),
            knocks_unresolved: counter(),
            batches_complete: counter(),
            batches_timeout: counter(),
        }
    }

    /// Export counters plus the number of sources still collecting, in the
    /// same text format as [`ServerMetrics`].
    pub fn export_metrics(&self, knocks_pending: usize) -> String {
        format!(
            "portknock_knocks_observed {{}} {}\n\
             portknock_knocks_unresolved {{}} {}\n\
             portknock_batches_complete {{}} {}\n\
             portknock_batches_timeout {{}} {}\n\
             portknock_knocks_pending {{}} {}\n",
            self.knocks_observed.lock(),
            self.knocks_unresolved.lock(),
            self.batches_complete.lock(),
            self.batches_timeout.lock(),
            knocks_pending,
        )
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}
