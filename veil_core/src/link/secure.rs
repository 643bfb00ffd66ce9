/*! Secure channel of an established link.

Each side generates an ephemeral session keypair and a starting nonce during
the handshake. The channel holds the precomputed box of the two session keys
and a pair of incrementing nonces, one per direction.
*/

use std::sync::{Arc, Mutex};

use crypto_box::aead::Aead;
use crypto_box::SalsaBox;
use rand::{thread_rng, Rng};

use veil_crypto::*;

/// Ephemeral session state of one side of a handshake.
#[derive(Clone)]
pub struct Session {
    sk: SecretKey,
    pk: PublicKey,
    nonce: Nonce,
}

impl Session {
    /// Create new random `Session`.
    pub fn random() -> Session {
        let mut rng = thread_rng();
        let sk = SecretKey::generate(&mut rng);
        let pk = sk.public_key();
        let nonce = rng.gen();
        Session { sk, pk, nonce }
    }

    /// Session public key, sent to the peer.
    pub fn pk(&self) -> &PublicKey {
        &self.pk
    }

    /// Starting nonce for packets we send, sent to the peer.
    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }
}

/// Bidirectional encrypted channel over an established link.
#[derive(Clone)]
pub struct Channel {
    precomputed: Arc<SalsaBox>,
    sent_nonce: Arc<Mutex<Nonce>>,
    recv_nonce: Arc<Mutex<Nonce>>,
}

impl Channel {
    /// Combine our session with the peer's session key and starting nonce.
    pub fn new(session: &Session, their_pk: &PublicKey, their_nonce: &Nonce) -> Channel {
        Channel {
            precomputed: Arc::new(SalsaBox::new(their_pk, &session.sk)),
            sent_nonce: Arc::new(Mutex::new(session.nonce)),
            recv_nonce: Arc::new(Mutex::new(*their_nonce)),
        }
    }

    /// Encrypt a packet, advancing the send nonce.
    pub fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        let mut nonce = self.sent_nonce.lock().expect("sent nonce poisoned");
        // encryption with a fresh nonce cannot fail
        let encrypted = self.precomputed.encrypt((&*nonce).into(), plain).unwrap();
        increment_nonce(&mut nonce);
        encrypted
    }

    /// Decrypt a packet, advancing the receive nonce on success.
    pub fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, ()> {
        let mut nonce = self.recv_nonce.lock().expect("recv nonce poisoned");
        let plain = self.precomputed.decrypt((&*nonce).into(), cipher).map_err(|_| ())?;
        increment_nonce(&mut nonce);
        Ok(plain)
    }
}
