/*!
Onion-routing core of the veil overlay network.

User traffic crosses a fixed-length chain of relays so that no single relay
knows both the originator and the destination; control messages travel the
same onion-encrypted channel as data. This crate holds the secure link
layer, the link manager, the path engine and the path-state registry, plus
the router type wiring them together.
*/

#![forbid(unsafe_code)]

pub mod error;
pub mod link;
pub mod node_db;
pub mod path;
pub mod router;
pub mod stats;
pub mod time;
pub mod utils;

use std::net::SocketAddr;

use veil_crypto::identity::SigningKey;
use veil_crypto::SecretKey;
use veil_packet::contact::RouterContact;
use veil_packet::RouterId;

/// Long-term keys of this node: the signing identity it is named by and the
/// static encryption key path build records are sealed to.
pub struct LocalIdentity {
    /// Ed25519 identity key.
    pub signing_key: SigningKey,
    /// Static X25519 encryption key.
    pub enc_sk: SecretKey,
}

impl LocalIdentity {
    /// Generate a fresh identity.
    pub fn new_random() -> LocalIdentity {
        LocalIdentity {
            signing_key: SigningKey::generate(),
            enc_sk: SecretKey::generate(&mut rand::thread_rng()),
        }
    }

    /// The router id this identity is known by.
    pub fn rid(&self) -> RouterId {
        self.signing_key.verifying_key().into()
    }

    /// Sign a contact for this identity at `addr`.
    pub fn make_rc(&self, addr: SocketAddr, timestamp: u64) -> RouterContact {
        RouterContact::new_signed(&self.signing_key, self.enc_sk.public_key(), addr, timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use veil_packet::contact::{unix_now, AddressPolicy};

    #[test]
    fn identity_signs_valid_contacts() {
        let identity = LocalIdentity::new_random();
        let rc = identity.make_rc("203.0.113.7:9000".parse().unwrap(), unix_now());

        assert_eq!(rc.rid, identity.rid());
        assert!(RouterContact::parse(&rc.serialize(), unix_now(), AddressPolicy::RejectBogons).is_ok());
    }
}
