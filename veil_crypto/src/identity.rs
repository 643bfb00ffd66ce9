//! Ed25519 identity signatures.
//!
//! Every router is named by the 32 bytes of its Ed25519 verifying key.
//! Contacts and exit authorizations are signed with the matching signing key.

use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;
use zeroize::Zeroize;

pub use ed25519_dalek::{Signature, VerifyingKey, SIGNATURE_LENGTH};

/// Length in bytes of an identity public key.
pub const IDENTITY_KEY_SIZE: usize = 32;

/// An Ed25519 identity signing key.
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

impl SigningKey {
    /// Generate a new random signing key.
    pub fn generate() -> SigningKey {
        SigningKey {
            inner: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8; IDENTITY_KEY_SIZE]) -> SigningKey {
        SigningKey {
            inner: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; IDENTITY_KEY_SIZE] {
        self.inner.to_bytes()
    }

    /// The verifying key naming this identity.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.inner.verifying_key()
    }

    /// Sign `msg`, producing a 64-byte signature.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.inner.sign(msg)
    }
}

impl Clone for SigningKey {
    fn clone(&self) -> SigningKey {
        SigningKey::from_bytes(&self.inner.to_bytes())
    }
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        let mut bytes = self.inner.to_bytes();
        bytes.zeroize();
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "SigningKey(..)")
    }
}

/// Verify `sig` over `msg` under `pk`.
pub fn verify(pk: &VerifyingKey, msg: &[u8], sig: &Signature) -> bool {
    pk.verify(msg, sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify() {
        let sk = SigningKey::generate();
        let sig = sk.sign(b"attested bytes");

        assert!(verify(&sk.verifying_key(), b"attested bytes", &sig));
        assert!(!verify(&sk.verifying_key(), b"attested bytez", &sig));
    }

    #[test]
    fn verify_wrong_key() {
        let sk = SigningKey::generate();
        let other = SigningKey::generate();
        let sig = sk.sign(b"attested bytes");

        assert!(!verify(&other.verifying_key(), b"attested bytes", &sig));
    }

    #[test]
    fn keypair_roundtrip() {
        let sk = SigningKey::generate();
        let restored = SigningKey::from_bytes(&sk.to_bytes());

        assert_eq!(sk.verifying_key(), restored.verifying_key());
    }
}
