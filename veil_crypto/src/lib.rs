//! Functions for the core crypto.
//!
//! Four families of primitives live here:
//!
//! - Ed25519 identity signatures ([`identity`]) used to sign and verify
//!   router contacts and exit authorizations.
//! - X25519 key exchange ([`dh_client`]/[`dh_server`]) deriving the per-hop
//!   symmetric session keys during path build.
//! - The onion step ([`onion_step`]/[`onion_peel`]): an XChaCha20 keystream
//!   XOR with nonce threading, applied once per hop in each direction.
//! - BLAKE2b-256 [`short_hash`] for short tags and key derivation.

#![forbid(unsafe_code)]

pub mod identity;

use std::fmt;
use std::ops::BitXor;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::XChaCha20;
use cookie_factory::{do_gen, gen_slice};
use nom::combinator::map;
use nom::IResult;
use rand::{CryptoRng, Rng, RngCore};
use zeroize::Zeroize;

use veil_binary_io::*;

pub use crypto_box::{PublicKey, SecretKey, KEY_SIZE};

type Blake2b256 = Blake2b<U32>;

/// Nonce of the per-connection secure channel, treated as a BE number.
pub type Nonce = [u8; NONCEBYTES];
/// Length in bytes of a secure-channel nonce.
pub const NONCEBYTES: usize = 24;

/// Length in bytes of the onion-step nonce.
pub const SYMM_NONCE_SIZE: usize = 24;
/// Length in bytes of a derived session key.
pub const SESSION_KEY_SIZE: usize = 32;

/// Increment given nonce by 1.
///
/// Treats `Nonce` as BE number. If nonce can't be incremented (all bits are
/// `1`), nonce is zeroed.
#[inline]
pub fn increment_nonce(nonce: &mut Nonce) {
    increment_nonce_number(nonce, 1)
}

/// Increment given nonce by number `num`.
pub fn increment_nonce_number(nonce: &mut Nonce, num: u16) {
    let mut c = num as u32;
    for i in (0..NONCEBYTES).rev() {
        c += nonce[i] as u32;
        nonce[i] = c as u8;
        c >>= 8;
    }
}

/// Parse a curve public key from its 32 raw wire bytes. Secret keys never
/// appear on the wire, so only the public half has a parser.
pub fn public_key_from_bytes(input: &[u8]) -> IResult<&[u8], PublicKey> {
    map(<[u8; KEY_SIZE]>::from_bytes, PublicKey::from)(input)
}

/// Fill a buffer of the requested size from the CSPRNG.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut bytes = vec![0; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Generate a random `u64`.
pub fn random_u64() -> u64 {
    rand::thread_rng().gen()
}

/// BLAKE2b-256 over `data`. The workspace-wide short hash used for tags and
/// key derivation.
pub fn short_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Nonce for the onion step. Unlike the secure-channel [`Nonce`] it is
/// mutated by XOR as a frame moves along a path, never incremented.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct SymmNonce([u8; SYMM_NONCE_SIZE]);

impl SymmNonce {
    /// Create a fresh random nonce.
    pub fn random<R: Rng + CryptoRng>(rng: &mut R) -> SymmNonce {
        SymmNonce(rng.gen())
    }

    pub fn from_bytes_exact(bytes: [u8; SYMM_NONCE_SIZE]) -> SymmNonce {
        SymmNonce(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SYMM_NONCE_SIZE] {
        &self.0
    }
}

impl BitXor for &SymmNonce {
    type Output = SymmNonce;

    fn bitxor(self, other: &SymmNonce) -> SymmNonce {
        let mut out = [0; SYMM_NONCE_SIZE];
        for (o, (a, b)) in out.iter_mut().zip(self.0.iter().zip(other.0.iter())) {
            *o = a ^ b;
        }
        SymmNonce(out)
    }
}

impl fmt::Debug for SymmNonce {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SymmNonce({})", hex::encode(self.0))
    }
}

impl FromBytes for SymmNonce {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(<[u8; SYMM_NONCE_SIZE]>::from_bytes, SymmNonce)(input)
    }
}

impl ToBytes for SymmNonce {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf, gen_slice!(self.0.as_ref()))
    }
}

/// Symmetric session key shared between a path originator and one hop.
/// Zeroed on drop.
#[derive(Clone, Eq, PartialEq, Zeroize)]
#[zeroize(drop)]
pub struct SharedSecret([u8; SESSION_KEY_SIZE]);

impl SharedSecret {
    pub fn from_bytes_exact(bytes: [u8; SESSION_KEY_SIZE]) -> SharedSecret {
        SharedSecret(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }

    /// Derive the nonce-XOR mutator for this key: the truncated short hash of
    /// the key bytes.
    pub fn derive_nonce_xor(&self) -> SymmNonce {
        let digest = short_hash(&self.0);
        let mut xor = [0; SYMM_NONCE_SIZE];
        xor.copy_from_slice(&digest[..SYMM_NONCE_SIZE]);
        SymmNonce(xor)
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SharedSecret(..)")
    }
}

fn dh(client_pk: &PublicKey, server_pk: &PublicKey, our_sk: &SecretKey, their_pk: &PublicKey) -> [u8; 32] {
    let mut scalarmult = x25519_dalek::x25519(our_sk.to_bytes(), *their_pk.as_bytes());

    let mut hasher = Blake2b256::new();
    hasher.update(client_pk.as_bytes());
    hasher.update(server_pk.as_bytes());
    hasher.update(scalarmult);
    scalarmult.zeroize();

    hasher.finalize().into()
}

/// Derive the shared session key on the originator side of a path build.
///
/// Input ordering is symmetric with [`dh_server`]: the originator hashes
/// `(own_pk, their_pk, dh)`, the responder `(their_pk, own_pk, dh)`, so both
/// arrive at the same key for the same nonce.
pub fn dh_client(our_sk: &SecretKey, their_pk: &PublicKey, nonce: &SymmNonce) -> SharedSecret {
    let secret = dh(&our_sk.public_key(), their_pk, our_sk, their_pk);

    let mut hasher = Blake2b256::new();
    hasher.update(secret);
    hasher.update(nonce.as_bytes());
    SharedSecret(hasher.finalize().into())
}

/// Derive the shared session key on the responding hop of a path build.
pub fn dh_server(our_sk: &SecretKey, their_pk: &PublicKey, nonce: &SymmNonce) -> SharedSecret {
    let secret = dh(their_pk, &our_sk.public_key(), our_sk, their_pk);

    let mut hasher = Blake2b256::new();
    hasher.update(secret);
    hasher.update(nonce.as_bytes());
    SharedSecret(hasher.finalize().into())
}

fn keystream_xor(payload: &mut [u8], key: &SharedSecret, nonce: &SymmNonce) {
    let mut cipher = XChaCha20::new(key.as_bytes().into(), nonce.as_bytes().into());
    cipher.apply_keystream(payload);
}

/// Apply one onion layer in place: XOR `payload` with the XChaCha20
/// keystream for `key` and the given `nonce`, returning the nonce advanced
/// for the next hop (`nonce XOR xor`).
///
/// Applying `onion_step` twice with the same `(key, nonce, xor)` restores
/// the payload and yields the same advanced nonce.
pub fn onion_step(payload: &mut [u8], key: &SharedSecret, nonce: &SymmNonce, xor: &SymmNonce) -> SymmNonce {
    keystream_xor(payload, key, nonce);
    nonce ^ xor
}

/// Remove one onion layer in place. The received nonce is first un-advanced
/// (`nonce XOR xor`), then the keystream for the recovered nonce is applied;
/// the recovered nonce is returned and travels with the forwarded frame.
///
/// `onion_peel` inverts exactly one [`onion_step`] layer:
/// `onion_peel(onion_step(p))` restores both payload and nonce.
pub fn onion_peel(payload: &mut [u8], key: &SharedSecret, nonce: &SymmNonce, xor: &SymmNonce) -> SymmNonce {
    let nonce = nonce ^ xor;
    keystream_xor(payload, key, &nonce);
    nonce
}

#[cfg(test)]
pub mod tests {
    use super::*;

    use rand::thread_rng;

    #[test]
    fn increment_nonce_test_zero_plus_one() {
        let cmp_nonce = [0, 0, 0, 0, 0, 0, 0, 0,
                         0, 0, 0, 0, 0, 0, 0, 0,
                         0, 0, 0, 0, 0, 0, 0, 1];

        let mut nonce = [0; NONCEBYTES];
        increment_nonce(&mut nonce);
        assert_eq!(nonce, cmp_nonce);
    }

    #[test]
    fn increment_nonce_test_0xf_plus_one() {
        let cmp_nonce = [0, 0, 0, 0, 0, 0, 0, 0,
                         0, 0, 0, 0, 0, 0, 0, 0,
                         0, 0, 0, 0, 0, 0, 0, 0x10];

        let mut nonce = [0, 0, 0, 0, 0, 0, 0, 0,
                         0, 0, 0, 0, 0, 0, 0, 0,
                         0, 0, 0, 0, 0, 0, 0, 0xf];
        increment_nonce(&mut nonce);
        assert_eq!(nonce, cmp_nonce);
    }

    #[test]
    fn increment_nonce_test_0xff_max() {
        let cmp_nonce = [0; NONCEBYTES];
        let mut nonce = [0xff; NONCEBYTES];
        increment_nonce(&mut nonce);
        assert_eq!(cmp_nonce, nonce);
    }

    #[test]
    fn increment_nonce_number_test_zero_plus_0xff00() {
        let cmp_nonce = [0, 0, 0, 0, 0, 0, 0, 0,
                         0, 0, 0, 0, 0, 0, 0, 0,
                         0, 0, 0, 0, 0, 0, 0xff, 0];
        let mut nonce = [0; NONCEBYTES];

        increment_nonce_number(&mut nonce, 0xff00);
        assert_eq!(nonce, cmp_nonce);
    }

    #[test]
    fn public_key_parse_consumes_exactly_one_key() {
        let mut rng = thread_rng();
        let pk = SecretKey::generate(&mut rng).public_key();

        let mut bytes = pk.as_bytes().to_vec();
        bytes.extend_from_slice(&[7, 7]);

        let (rest, parsed) = public_key_from_bytes(&bytes).unwrap();
        assert_eq!(parsed, pk);
        assert_eq!(rest, [7, 7]);

        let short = &bytes[..KEY_SIZE - 1];
        assert!(matches!(public_key_from_bytes(short), Err(nom::Err::Incomplete(_))));
    }

    #[test]
    fn short_hash_deterministic() {
        let a = short_hash(b"payload");
        let b = short_hash(b"payload");
        let c = short_hash(b"payloae");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn dh_client_server_agree() {
        let mut rng = thread_rng();
        let client_sk = SecretKey::generate(&mut rng);
        let server_sk = SecretKey::generate(&mut rng);
        let nonce = SymmNonce::random(&mut rng);

        let client_key = dh_client(&client_sk, &server_sk.public_key(), &nonce);
        let server_key = dh_server(&server_sk, &client_sk.public_key(), &nonce);

        assert_eq!(client_key, server_key);
    }

    #[test]
    fn dh_nonce_separates_keys() {
        let mut rng = thread_rng();
        let client_sk = SecretKey::generate(&mut rng);
        let server_pk = SecretKey::generate(&mut rng).public_key();

        let key_1 = dh_client(&client_sk, &server_pk, &SymmNonce::random(&mut rng));
        let key_2 = dh_client(&client_sk, &server_pk, &SymmNonce::random(&mut rng));

        assert_ne!(key_1, key_2);
    }

    #[test]
    fn onion_step_involution() {
        let mut rng = thread_rng();
        for _ in 0..8 {
            let key = SharedSecret::from_bytes_exact(rng.gen());
            let xor = SymmNonce::random(&mut rng);
            let nonce = SymmNonce::random(&mut rng);
            let payload: Vec<u8> = (0..123).map(|_| rng.gen()).collect();

            let mut buf = payload.clone();
            let nonce_1 = onion_step(&mut buf, &key, &nonce, &xor);
            assert_ne!(buf, payload);
            let nonce_2 = onion_step(&mut buf, &key, &nonce, &xor);

            assert_eq!(buf, payload);
            assert_eq!(nonce_1, nonce_2);
        }
    }

    #[test]
    fn onion_peel_inverts_step() {
        let mut rng = thread_rng();
        let key = SharedSecret::from_bytes_exact(rng.gen());
        let xor = SymmNonce::random(&mut rng);
        let nonce = SymmNonce::random(&mut rng);
        let payload: Vec<u8> = (0..321).map(|_| rng.gen()).collect();

        let mut buf = payload.clone();
        let advanced = onion_step(&mut buf, &key, &nonce, &xor);
        let recovered = onion_peel(&mut buf, &key, &advanced, &xor);

        assert_eq!(buf, payload);
        assert_eq!(recovered, nonce);
    }

    #[test]
    fn nonce_xor_roundtrip() {
        let mut rng = thread_rng();
        let a = SymmNonce::random(&mut rng);
        let b = SymmNonce::random(&mut rng);
        assert_eq!(&(&a ^ &b) ^ &b, a);
    }

    encode_decode_test!(
        symm_nonce_encode_decode,
        SymmNonce::from_bytes_exact([42; SYMM_NONCE_SIZE])
    );
}
