/*! Common utility types and functions.
*/

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use crate::time::*;

/// Generate non-zero request id.
pub fn gen_request_id() -> u64 {
    let mut request_id = 0;
    while request_id == 0 {
        request_id = veil_crypto::random_u64();
    }
    request_id
}

/// Set whose entries vanish after a fixed timeout. Used to remember recently
/// seen client ids and recently gossiped contacts without unbounded growth.
#[derive(Clone, Debug)]
pub struct DecayingSet<T: Clone + Eq + Hash> {
    entries: HashMap<T, Instant>,
    timeout: Duration,
}

impl<T: Clone + Eq + Hash> DecayingSet<T> {
    /// Create new `DecayingSet` whose entries live for `timeout`.
    pub fn new(timeout: Duration) -> Self {
        DecayingSet {
            entries: HashMap::new(),
            timeout,
        }
    }

    /// Insert a value, refreshing its deadline. Returns `true` if the value
    /// was not already present.
    pub fn insert(&mut self, value: T) -> bool {
        self.entries.insert(value, clock_now()).is_none()
    }

    /// Check whether a value is present and not yet decayed.
    pub fn contains(&self, value: &T) -> bool {
        self.entries
            .get(value)
            .map_or(false, |time| clock_elapsed(*time) < self.timeout)
    }

    /// Remove decayed entries.
    pub fn decay(&mut self) {
        let timeout = self.timeout;
        self.entries.retain(|_, time| clock_elapsed(*time) < timeout);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
