//! Per-source aggregation of observed knocks into batches.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::challenge::batch_tuple_count;
use crate::key::Port;

/// Observed process identity of a knocking source.
pub type SourceId = u32;

/// Why a batch left the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Knock count reached a multiple of the batch length
    Complete,
    /// No knock arrived within the knock TTL
    Timeout,
}

/// Port sequence collected from one source, ready for confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnockBatch {
    /// Source that knocked
    pub source: SourceId,
    /// Ports in the order they arrived
    pub ports: Vec<Port>,
    /// Completion path
    pub reason: FlushReason,
}

struct Entry {
    /// Knocks sorted by arrival time
    knocks: Vec<(Instant, Port)>,
    expiration: Instant,
}

impl Entry {
    fn into_ports(self) -> Vec<Port> {
        self.knocks.into_iter().map(|(_, port)| port).collect()
    }
}

/// Collects knocks per source and releases them as [`KnockBatch`]es.
///
/// An entry is released when its port count is a multiple of the batch length
/// (`batch_tuple_count * tuple_size`) or when it expires. Both checks share
/// [`KnockAccumulator::is_completed`] and run under the accumulator's lock, so
/// an entry is released exactly once.
///
/// Knocks are ordered by the instant they arrived, not by the order they are
/// recorded: observers may take different times to attribute a connection.
pub struct KnockAccumulator {
    ttl: Duration,
    batch_len: usize,
    entries: Mutex<HashMap<SourceId, Entry>>,
}

impl KnockAccumulator {
    /// Create an accumulator for challenges of `tuple_size` ports issued with
    /// `tolerance` percent over-provisioning.
    pub fn new(tuple_size: usize, tolerance: u32, ttl: Duration) -> Self {
        Self::with_batch_len(batch_tuple_count(tolerance, tuple_size) * tuple_size, ttl)
    }

    /// Create an accumulator releasing batches of exactly `batch_len` knocks.
    pub fn with_batch_len(batch_len: usize, ttl: Duration) -> Self {
        Self {
            ttl,
            batch_len: batch_len.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Knocks per complete batch.
    pub fn batch_len(&self) -> usize {
        self.batch_len
    }

    /// Record a knock on `port` by `source`.
    pub fn knock(&self, source: SourceId, port: Port) -> Option<KnockBatch> {
        self.knock_at(source, port, Instant::now())
    }

    /// Record a knock that arrived at `arrived`; returns the batch if it completed.
    ///
    /// The port is inserted after every knock of `source` that arrived no later.
    pub fn knock_at(&self, source: SourceId, port: Port, arrived: Instant) -> Option<KnockBatch> {
        let mut entries = self.entries.lock();

        // A stale entry is flushed by the sweep; a new knock starts over.
        if let Some(entry) = entries.get(&source) {
            if arrived >= entry.expiration {
                debug!(source, knocks = entry.knocks.len(), "superseding expired knocks");
                entries.remove(&source);
            }
        }

        let entry = entries.entry(source).or_insert_with(|| Entry {
            knocks: Vec::new(),
            expiration: arrived,
        });
        let at = entry.knocks.partition_point(|&(seen, _)| seen <= arrived);
        if at < entry.knocks.len() {
            debug!(source, port, "knock recorded out of arrival order");
        }
        entry.knocks.insert(at, (arrived, port));
        entry.expiration = entry.expiration.max(arrived + self.ttl);

        let reason = self.is_completed(entry, arrived)?;
        let entry = entries.remove(&source)?;
        Some(KnockBatch {
            source,
            ports: entry.into_ports(),
            reason,
        })
    }

    /// Release every entry that has completed or expired by `now`.
    pub fn sweep(&self, now: Instant) -> Vec<KnockBatch> {
        let mut entries = self.entries.lock();
        let done: Vec<(SourceId, FlushReason)> = entries
            .iter()
            .filter_map(|(&source, entry)| Some((source, self.is_completed(entry, now)?)))
            .collect();

        done.into_iter()
            .filter_map(|(source, reason)| {
                let entry = entries.remove(&source)?;
                Some(KnockBatch {
                    source,
                    ports: entry.into_ports(),
                    reason,
                })
            })
            .collect()
    }

    /// Number of sources currently collecting.
    pub fn pending(&self) -> usize {
        self.entries.lock().len()
    }

    fn is_completed(&self, entry: &Entry, now: Instant) -> Option<FlushReason> {
        if now >= entry.expiration {
            Some(FlushReason::Timeout)
        } else if !entry.knocks.is_empty() && entry.knocks.len() % self.batch_len == 0 {
            Some(FlushReason::Complete)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(1);

    #[test]
    fn zero_tolerance_completes_on_tuple_size() {
        let acc = KnockAccumulator::new(4, 0, TTL);
        let now = Instant::now();
        assert_eq!(acc.knock_at(7, 100, now), None);
        assert_eq!(acc.knock_at(7, 101, now), None);
        assert_eq!(acc.knock_at(7, 102, now), None);
        let batch = acc.knock_at(7, 103, now).unwrap();
        assert_eq!(batch.ports, vec![100, 101, 102, 103]);
        assert_eq!(batch.reason, FlushReason::Complete);
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn tolerance_widens_batch() {
        // (20 * 5) / 100 + 2 = 3 tuples
        let acc = KnockAccumulator::new(5, 20, TTL);
        assert_eq!(acc.batch_len(), 15);
    }

    #[test]
    fn sources_are_independent() {
        let acc = KnockAccumulator::new(2, 0, TTL);
        let now = Instant::now();
        assert_eq!(acc.knock_at(1, 10, now), None);
        assert_eq!(acc.knock_at(2, 20, now), None);
        assert_eq!(acc.knock_at(1, 11, now).unwrap().ports, vec![10, 11]);
        assert_eq!(acc.pending(), 1);
    }

    #[test]
    fn sweep_flushes_partial_batch_on_timeout() {
        let acc = KnockAccumulator::new(4, 0, TTL);
        let now = Instant::now();
        acc.knock_at(3, 100, now);
        acc.knock_at(3, 101, now);

        assert!(acc.sweep(now).is_empty());
        let batches = acc.sweep(now + TTL);
        assert_eq!(
            batches,
            vec![KnockBatch {
                source: 3,
                ports: vec![100, 101],
                reason: FlushReason::Timeout,
            }]
        );
        assert!(acc.sweep(now + TTL * 2).is_empty());
    }

    #[test]
    fn knock_refreshes_expiration() {
        let acc = KnockAccumulator::new(4, 0, TTL);
        let now = Instant::now();
        acc.knock_at(3, 100, now);
        acc.knock_at(3, 101, now + TTL / 2);
        assert!(acc.sweep(now + TTL).is_empty());
        assert_eq!(acc.pending(), 1);
    }

    #[test]
    fn late_knock_supersedes_expired_entry() {
        let acc = KnockAccumulator::new(2, 0, TTL);
        let now = Instant::now();
        acc.knock_at(9, 100, now);
        assert_eq!(acc.knock_at(9, 101, now + TTL), None);
        let batch = acc.knock_at(9, 102, now + TTL).unwrap();
        assert_eq!(batch.ports, vec![101, 102]);
    }

    #[test]
    fn late_recorded_knock_keeps_arrival_order() {
        let acc = KnockAccumulator::new(3, 0, TTL);
        let now = Instant::now();
        let step = Duration::from_millis(5);
        assert_eq!(acc.knock_at(4, 101, now + step), None);
        assert_eq!(acc.knock_at(4, 102, now + step * 2), None);
        let batch = acc.knock_at(4, 100, now).unwrap();
        assert_eq!(batch.ports, vec![100, 101, 102]);
        assert_eq!(batch.reason, FlushReason::Complete);
    }

    #[test]
    fn late_recorded_knock_does_not_shorten_expiration() {
        let acc = KnockAccumulator::new(4, 0, TTL);
        let now = Instant::now();
        acc.knock_at(5, 101, now + TTL / 2);
        acc.knock_at(5, 100, now);
        assert!(acc.sweep(now + TTL).is_empty());
        assert_eq!(acc.sweep(now + TTL * 2)[0].ports, vec![100, 101]);
    }
}
