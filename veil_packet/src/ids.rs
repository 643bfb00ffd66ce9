/*! Identifier tags used across the overlay: router identities, per-hop path
ids and hidden-service session tags.
*/

use std::fmt;

use cookie_factory::{do_gen, gen_slice};
use nom::combinator::map;
use nom::IResult;
use rand::{CryptoRng, Rng};

use veil_binary_io::*;
use veil_crypto::identity::VerifyingKey;

/// Length in bytes of a `RouterId`.
pub const ROUTER_ID_SIZE: usize = 32;
/// Length in bytes of a `HopId`.
pub const HOP_ID_SIZE: usize = 16;
/// Length in bytes of a `SessionTag`.
pub const SESSION_TAG_SIZE: usize = 16;

/// Identity of one router: the raw bytes of its Ed25519 verifying key.
/// Ordering and equality are bytewise.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RouterId([u8; ROUTER_ID_SIZE]);

impl RouterId {
    pub fn from_bytes_exact(bytes: [u8; ROUTER_ID_SIZE]) -> RouterId {
        RouterId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ROUTER_ID_SIZE] {
        &self.0
    }

    /// Recover the verifying key behind this identity. Fails if the bytes are
    /// not a valid Ed25519 point.
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0).ok()
    }
}

impl From<VerifyingKey> for RouterId {
    fn from(pk: VerifyingKey) -> RouterId {
        RouterId(pk.to_bytes())
    }
}

impl fmt::Debug for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RouterId({}..)", hex::encode(&self.0[..4]))
    }
}

impl FromBytes for RouterId {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(<[u8; ROUTER_ID_SIZE]>::from_bytes, RouterId)(input)
    }
}

impl ToBytes for RouterId {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf, gen_slice!(self.0.as_ref()))
    }
}

/// Random tag naming one direction of one hop of one path. Every hop owns an
/// rx/tx pair; frames carry the id the receiving router knows the hop by.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct HopId([u8; HOP_ID_SIZE]);

impl HopId {
    /// Create a fresh unpredictable id.
    pub fn random<R: Rng + CryptoRng>(rng: &mut R) -> HopId {
        HopId(rng.gen())
    }

    pub fn from_bytes_exact(bytes: [u8; HOP_ID_SIZE]) -> HopId {
        HopId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HOP_ID_SIZE] {
        &self.0
    }
}

impl fmt::Debug for HopId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HopId({})", hex::encode(self.0))
    }
}

impl FromBytes for HopId {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(<[u8; HOP_ID_SIZE]>::from_bytes, HopId)(input)
    }
}

impl ToBytes for HopId {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf, gen_slice!(self.0.as_ref()))
    }
}

/// Tag of one hidden-service conversation. Opaque to the path layer.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct SessionTag([u8; SESSION_TAG_SIZE]);

impl SessionTag {
    pub fn random<R: Rng + CryptoRng>(rng: &mut R) -> SessionTag {
        SessionTag(rng.gen())
    }

    pub fn from_bytes_exact(bytes: [u8; SESSION_TAG_SIZE]) -> SessionTag {
        SessionTag(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_TAG_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SessionTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SessionTag({})", hex::encode(self.0))
    }
}

impl FromBytes for SessionTag {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(<[u8; SESSION_TAG_SIZE]>::from_bytes, SessionTag)(input)
    }
}

impl ToBytes for SessionTag {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf, gen_slice!(self.0.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::thread_rng;

    encode_decode_test!(
        router_id_encode_decode,
        RouterId::from_bytes_exact([42; ROUTER_ID_SIZE])
    );

    encode_decode_test!(
        hop_id_encode_decode,
        HopId::from_bytes_exact([42; HOP_ID_SIZE])
    );

    #[test]
    fn router_id_ordering_is_bytewise() {
        let low = RouterId::from_bytes_exact([1; ROUTER_ID_SIZE]);
        let mut high_bytes = [1; ROUTER_ID_SIZE];
        high_bytes[0] = 2;
        let high = RouterId::from_bytes_exact(high_bytes);

        assert!(low < high);
    }

    #[test]
    fn hop_ids_are_distinct() {
        let mut rng = thread_rng();
        let a = HopId::random(&mut rng);
        let b = HopId::random(&mut rng);
        assert_ne!(a, b);
    }
}
