/*! Registry of local paths and transit hops on this router.

Two maps live under one lock: local paths keyed by their upstream rx id,
and transit hops keyed by both of their ids so a lookup by either direction
succeeds. Inbound frames resolve here: a transit match relays, a path match
delivers, anything else is dropped.

The mutex exists for the narrow case of insertions and removals from
outside the dispatch loop; no dispatch-path caller holds it across an
await.
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use veil_packet::{HopId, RouterId};

use crate::path::errors::ContextError;
use crate::path::transit::TransitHop;
use crate::path::Path;
use crate::time::clock_now;

#[derive(Default)]
struct ContextInner {
    paths: HashMap<HopId, Path>,
    transit: HashMap<HopId, TransitHop>,
}

/// Process-wide registry of path state, keyed by hop id.
#[derive(Clone)]
pub struct PathContext {
    local_rid: RouterId,
    inner: Arc<Mutex<ContextInner>>,
    allow_transit: Arc<AtomicBool>,
}

impl PathContext {
    /// Create new `PathContext` for this router.
    pub fn new(local_rid: RouterId) -> PathContext {
        PathContext {
            local_rid,
            inner: Arc::new(Mutex::new(ContextInner::default())),
            allow_transit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Identity of the router this registry belongs to.
    pub fn local_rid(&self) -> RouterId {
        self.local_rid
    }

    /// Start accepting build requests as an intermediate hop.
    pub fn allow_transit(&self) {
        self.allow_transit.store(true, Ordering::Release);
    }

    /// Whether this node relays other people's paths.
    pub fn is_transit_allowed(&self) -> bool {
        self.allow_transit.load(Ordering::Acquire)
    }

    /// Register a local path under its upstream rx id.
    pub fn add_path(&self, path: Path) -> Result<(), ContextError> {
        let mut inner = self.inner.lock();
        let key = path.upstream_rxid();
        if inner.paths.contains_key(&key) {
            return Err(ContextError::DuplicatePath);
        }
        inner.paths.insert(key, path);
        Ok(())
    }

    /// Remove a path, cancelling its in-flight requests.
    pub fn drop_path(&self, path: &Path) {
        let removed = self.inner.lock().paths.remove(&path.upstream_rxid());
        if let Some(removed) = removed {
            removed.cancel_pending();
        }
        path.cancel_pending();
    }

    /// Remove several paths at once.
    pub fn drop_paths(&self, paths: Vec<Path>) {
        for path in paths {
            self.drop_path(&path);
        }
    }

    /// Look up a local path by its upstream rx id.
    pub fn get_path(&self, hop_id: HopId) -> Option<Path> {
        self.inner.lock().paths.get(&hop_id).cloned()
    }

    /// Look up the local path a transit record belongs to, trying both of
    /// its directions.
    pub fn get_path_for_transit(&self, hop: &TransitHop) -> Option<Path> {
        let inner = self.inner.lock();
        inner
            .paths
            .get(&hop.rx)
            .or_else(|| inner.paths.get(&hop.tx))
            .cloned()
    }

    /// Install a transit hop under both of its ids.
    pub fn put_transit(&self, hop: TransitHop) -> Result<(), ContextError> {
        let mut inner = self.inner.lock();
        if inner.transit.contains_key(&hop.rx) || inner.transit.contains_key(&hop.tx) {
            return Err(ContextError::DuplicateTransit);
        }
        inner.transit.insert(hop.rx, hop.clone());
        inner.transit.insert(hop.tx, hop);
        Ok(())
    }

    /// Check for a transit hop addressable by `hop_id`.
    pub fn has_transit(&self, hop_id: HopId) -> bool {
        self.inner.lock().transit.contains_key(&hop_id)
    }

    /// Look up a transit hop by either of its ids.
    pub fn get_transit(&self, hop_id: HopId) -> Option<TransitHop> {
        self.inner.lock().transit.get(&hop_id).cloned()
    }

    /// Numbers of local paths and transit records (counted once per hop).
    pub fn len(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let terminals = inner.transit.values().filter(|hop| hop.is_terminal()).count();
        ((inner.paths.len()), (inner.transit.len() + terminals) / 2)
    }

    /// Drop expired transit records and collect dead local paths. The dead
    /// paths are removed with their requests cancelled; live established
    /// paths are returned for upkeep.
    pub fn sweep(&self) -> Vec<Path> {
        let now = clock_now();
        let mut inner = self.inner.lock();
        inner.transit.retain(|_, hop| !hop.is_expired(now));

        let dead: Vec<HopId> = inner
            .paths
            .iter()
            .filter(|(_, path)| path.is_expired(now) || path.status() == crate::path::PathStatus::Failed)
            .map(|(id, _)| *id)
            .collect();
        let mut cancelled = Vec::new();
        for id in dead {
            if let Some(path) = inner.paths.remove(&id) {
                cancelled.push(path);
            }
        }
        let live: Vec<Path> = inner.paths.values().cloned().collect();
        drop(inner);

        for path in cancelled {
            path.set_expired();
            path.cancel_pending();
        }
        live
    }

    /// Periodic upkeep: sweep the registry, then drive the surviving paths;
    /// paths that report themselves dead are dropped.
    pub async fn tick(&self) {
        let live = self.sweep();
        for path in live {
            if !path.tick().await {
                debug!("Dropping dead path registered under {:?}", path.upstream_rxid());
                self.drop_path(&path);
            }
        }
    }
}
