//! Pending challenge sessions indexed by tuple key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::key::{self, Key, Port, Tuple};

/// Session identifier, allocated monotonically from 1.
pub type SessionId = u32;

/// One issued challenge awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Session identifier
    pub id: SessionId,
    /// Tuples handed to the client
    pub tuples: Vec<Tuple>,
    /// Time after which the session is stale
    pub expiration: Instant,
}

/// Outcome of removing a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    /// Tuples the session owned
    pub tuples: Vec<Tuple>,
    /// Tuples that were still present in the key index
    pub removed: Vec<Tuple>,
}

impl Removal {
    /// True when every owned tuple was unindexed.
    pub fn is_complete(&self) -> bool {
        self.tuples.len() == self.removed.len()
    }
}

#[derive(Default)]
struct Maps {
    sessions: HashMap<SessionId, Session>,
    keys: HashMap<Key, SessionId>,
}

/// Authoritative store of pending sessions.
///
/// Holds two maps, `id -> session` and `key -> id`, mutated together under a
/// single lock: every indexed key refers to a live session that owns the tuple.
/// Id allocation is a lock-free counter outside that lock.
pub struct SessionStore {
    base: Port,
    ttl: Duration,
    last_id: AtomicU32,
    maps: Mutex<Maps>,
}

impl SessionStore {
    /// Create an empty store for tuples relative to `base`.
    pub fn new(base: Port, ttl: Duration) -> Self {
        Self {
            base,
            ttl,
            last_id: AtomicU32::new(0),
            maps: Mutex::new(Maps::default()),
        }
    }

    /// Register a new session owning `tuples` and return its id.
    pub fn create_session(&self, tuples: Vec<Tuple>) -> SessionId {
        let id = self.last_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let expiration = Instant::now() + self.ttl;
        let keys: Vec<Key> = tuples.iter().map(|t| key::encode(self.base, t)).collect();

        let mut maps = self.maps.lock();
        for key in keys {
            if let Some(previous) = maps.keys.insert(key, id) {
                // The previous owner keeps its record but loses this key; its
                // removal will report the mismatch.
                warn!(session = id, previous, key, "tuple key reassigned");
            }
        }
        maps.sessions.insert(
            id,
            Session {
                id,
                tuples,
                expiration,
            },
        );
        drop(maps);

        debug!(session = id, "session created");
        id
    }

    /// Collect the distinct sessions owning any of `tuples`, in first-match order.
    pub fn find_sessions(&self, tuples: &[Tuple]) -> Vec<Session> {
        let maps = self.maps.lock();
        let mut found: Vec<Session> = Vec::new();
        for tuple in tuples {
            let key = key::encode(self.base, tuple);
            let Some(id) = maps.keys.get(&key) else {
                continue;
            };
            if found.iter().any(|s| s.id == *id) {
                continue;
            }
            if let Some(session) = maps.sessions.get(id) {
                found.push(session.clone());
            }
        }
        found
    }

    /// Resolve `tuples` to exactly one session.
    ///
    /// Zero matches and ambiguous matches are both errors; an ambiguous match is
    /// never narrowed down to one of the candidates.
    pub fn match_session(&self, tuples: &[Tuple]) -> Result<Session, ProtocolError> {
        let mut sessions = self.find_sessions(tuples);
        match sessions.len() {
            0 => Err(ProtocolError::NoSession),
            1 => Ok(sessions.remove(0)),
            count => Err(ProtocolError::AmbiguousSession { count }),
        }
    }

    /// Remove a session and unindex its tuples.
    ///
    /// Returns `None` when the session does not exist. The record is deleted
    /// even if some of its keys were already gone; compare with
    /// [`Removal::is_complete`].
    pub fn remove_session(&self, id: SessionId) -> Option<Removal> {
        let mut maps = self.maps.lock();
        let session = maps.sessions.remove(&id)?;
        let mut removed = Vec::with_capacity(session.tuples.len());
        for tuple in &session.tuples {
            let key = key::encode(self.base, tuple);
            if maps.keys.get(&key) == Some(&id) {
                maps.keys.remove(&key);
                removed.push(tuple.clone());
            }
        }
        Some(Removal {
            tuples: session.tuples,
            removed,
        })
    }

    /// Remove every session whose expiration is at or before `now`.
    ///
    /// Returns the ids removed.
    pub fn sweep_expired(&self, now: Instant) -> Vec<SessionId> {
        let expired: Vec<SessionId> = {
            let maps = self.maps.lock();
            maps.sessions
                .values()
                .filter(|s| s.expiration <= now)
                .map(|s| s.id)
                .collect()
        };

        expired
            .into_iter()
            .filter(|&id| match self.remove_session(id) {
                Some(removal) => {
                    if !removal.is_complete() {
                        warn!(
                            session = id,
                            expected = removal.tuples.len(),
                            removed = removal.removed.len(),
                            "expired session partially indexed"
                        );
                    }
                    true
                }
                None => false,
            })
            .collect()
    }

    /// Number of pending sessions.
    pub fn len(&self) -> usize {
        self.maps.lock().sessions.len()
    }

    /// True when no session is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of indexed tuple keys.
    pub fn key_count(&self) -> usize {
        self.maps.lock().keys.len()
    }
}
