/*! In-memory store of known router contacts.

Read-mostly: lookups dominate, writes happen when gossip or fetches deliver
fresh contacts. A stored contact is only replaced by a strictly newer valid
one for the same router.
*/

use std::collections::HashMap;
use std::sync::Arc;

use rand::prelude::SliceRandom;
use rand::thread_rng;
use tokio::sync::RwLock;

use veil_packet::contact::RouterContact;
use veil_packet::RouterId;

/// Shared contact store.
#[derive(Clone, Default)]
pub struct NodeDb {
    rcs: Arc<RwLock<HashMap<RouterId, RouterContact>>>,
}

impl NodeDb {
    /// Create new empty `NodeDb`.
    pub fn new() -> NodeDb {
        NodeDb::default()
    }

    /// Store a contact. Returns `true` if it was inserted or replaced a
    /// strictly older one; a same-age or newer stored contact wins.
    pub async fn put_rc(&self, rc: RouterContact) -> bool {
        let mut rcs = self.rcs.write().await;
        match rcs.get(&rc.rid) {
            Some(stored) if stored.timestamp >= rc.timestamp => false,
            _ => {
                rcs.insert(rc.rid, rc);
                true
            }
        }
    }

    /// Look up the contact of a router.
    pub async fn get_rc(&self, rid: &RouterId) -> Option<RouterContact> {
        self.rcs.read().await.get(rid).cloned()
    }

    /// Forget a router.
    pub async fn remove_rc(&self, rid: &RouterId) -> bool {
        self.rcs.write().await.remove(rid).is_some()
    }

    /// Up to `n` distinct random contacts matching `filter`.
    pub async fn random_rcs<F: Fn(&RouterContact) -> bool>(&self, n: usize, filter: F) -> Vec<RouterContact> {
        let mut rcs: Vec<_> = self
            .rcs
            .read()
            .await
            .values()
            .filter(|rc| filter(rc))
            .cloned()
            .collect();
        rcs.shuffle(&mut thread_rng());
        rcs.truncate(n);
        rcs
    }

    /// All known contacts.
    pub async fn rcs(&self) -> Vec<RouterContact> {
        self.rcs.read().await.values().cloned().collect()
    }

    /// All known router ids.
    pub async fn rids(&self) -> Vec<RouterId> {
        self.rcs.read().await.keys().cloned().collect()
    }

    /// Contacts stamped strictly after `since` among `explicit_ids` (or all
    /// known routers when the list is empty).
    pub async fn rcs_newer_than(&self, since: u64, explicit_ids: &[RouterId]) -> Vec<RouterContact> {
        let rcs = self.rcs.read().await;
        if explicit_ids.is_empty() {
            rcs.values().filter(|rc| rc.timestamp > since).cloned().collect()
        } else {
            explicit_ids
                .iter()
                .filter_map(|rid| rcs.get(rid))
                .filter(|rc| rc.timestamp > since)
                .cloned()
                .collect()
        }
    }

    pub async fn len(&self) -> usize {
        self.rcs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rcs.read().await.is_empty()
    }
}
