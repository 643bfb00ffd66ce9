/*! State a relay keeps for one hop of someone else's path.

A transit hop answers to two ids: `rx` on frames moving towards the pivot
and `tx` on frames moving back to the originator. The pivot's record is the
one whose ids coincide.
*/

use std::time::Instant;

use rand::thread_rng;

use veil_crypto::{onion_peel, onion_step, SharedSecret, SymmNonce};
use veil_packet::onion::OnionFrame;
use veil_packet::{HopId, RouterId};

/// One relay's view of one hop on someone else's path.
#[derive(Clone)]
pub struct TransitHop {
    /// Id the previous hop addresses us by on frames towards the pivot.
    pub rx: HopId,
    /// Id we forward under towards the pivot.
    pub tx: HopId,
    /// Session key shared with the path originator.
    pub shared: SharedSecret,
    /// Nonce mutator derived from the session key.
    pub nonce_xor: SymmNonce,
    /// Previous hop: where frames towards the originator go.
    pub downstream: RouterId,
    /// Next hop: where frames towards the pivot go.
    pub upstream: RouterId,
    /// When this record stops relaying.
    pub expires_at: Instant,
}

/// Which way a frame addressed to a transit hop is moving.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HopDirection {
    /// Addressed by `rx`: moving towards the pivot.
    ToPivot,
    /// Addressed by `tx`: moving back to the originator.
    ToOriginator,
}

impl TransitHop {
    /// Whether this record terminates its path.
    pub fn is_terminal(&self) -> bool {
        self.tx == self.rx
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    /// Resolve which way a frame addressed by `id` is moving. Terminal
    /// records always resolve towards the pivot.
    pub fn direction_of(&self, id: HopId) -> Option<HopDirection> {
        if id == self.rx {
            Some(HopDirection::ToPivot)
        } else if id == self.tx {
            Some(HopDirection::ToOriginator)
        } else {
            None
        }
    }

    /// Remove our layer from a frame moving towards the pivot and readdress
    /// it for the next hop.
    pub fn peel_forward(&self, frame: &OnionFrame) -> OnionFrame {
        let mut payload = frame.payload.clone();
        let nonce = onion_peel(&mut payload, &self.shared, &frame.nonce, &self.nonce_xor);
        OnionFrame {
            hop_id: self.tx,
            nonce,
            payload,
        }
    }

    /// Add our layer to a frame moving back to the originator and readdress
    /// it for the previous hop.
    pub fn wrap_backward(&self, frame: &OnionFrame) -> OnionFrame {
        let mut payload = frame.payload.clone();
        let nonce = onion_step(&mut payload, &self.shared, &frame.nonce, &self.nonce_xor);
        OnionFrame {
            hop_id: self.rx,
            nonce,
            payload,
        }
    }

    /// Start a reply at the pivot: one layer under a fresh nonce, addressed
    /// for the previous hop.
    pub fn wrap_reply(&self, mut payload: Vec<u8>) -> OnionFrame {
        let nonce = SymmNonce::random(&mut thread_rng());
        let nonce = onion_step(&mut payload, &self.shared, &nonce, &self.nonce_xor);
        OnionFrame {
            hop_id: self.rx,
            nonce,
            payload,
        }
    }
}
