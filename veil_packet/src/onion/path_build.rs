/*! Path build frames.

A build request is an onion of `BuildRequestFrame`s: the outermost layer is
addressed to hop 0, and each hop finds the next hop's layer inside its own
sealed record. The rx id, the ephemeral key and the nonce stay in the clear
so the hop can derive its session key; everything else is sealed to the
hop's static encryption key.
*/

use crypto_box::aead::Aead;
use crypto_box::SalsaBox;
use cookie_factory::{do_gen, gen_be_u64, gen_be_u8, gen_call, gen_slice};
use nom::combinator::rest;
use nom::number::streaming::be_u64;
use nom::IResult;

use veil_binary_io::*;
use veil_crypto::{PublicKey, SecretKey, SymmNonce};

use crate::errors::GetPayloadError;
use crate::ids::{HopId, RouterId};
use crate::onion::ONION_MAX_PACKET_SIZE;

/// Endpoint name a build frame is submitted on, hop to hop.
pub const PATH_BUILD_ENDPOINT: &str = "path_build";

/** One layer of a path build request.

Serialized form:

Length   | Content
-------- | ------
`16`     | rx `HopId` the hop will answer to
`32`     | Ephemeral `PublicKey` for key derivation
`24`     | Nonce (key derivation and record sealing)
variable | Sealed [`BuildRecord`]

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildRequestFrame {
    /// Id the hop will be addressed by on packets travelling towards the
    /// pivot.
    pub rx: HopId,
    /// Ephemeral key the originator generated for this hop.
    pub ephemeral_pk: PublicKey,
    /// Nonce for session-key derivation and record sealing.
    pub nonce: SymmNonce,
    /// Sealed [`BuildRecord`].
    pub record: Vec<u8>,
}

impl FromBytes for BuildRequestFrame {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, rx) = HopId::from_bytes(input)?;
        let (input, ephemeral_pk) = veil_crypto::public_key_from_bytes(input)?;
        let (input, nonce) = SymmNonce::from_bytes(input)?;
        let (input, record) = rest(input)?;
        Ok((
            input,
            BuildRequestFrame {
                rx,
                ephemeral_pk,
                nonce,
                record: record.to_vec(),
            },
        ))
    }
}

impl ToBytes for BuildRequestFrame {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_call!(|buf, rx| HopId::to_bytes(rx, buf), &self.rx) >>
            gen_slice!(self.ephemeral_pk.as_bytes()) >>
            gen_call!(|buf, nonce| SymmNonce::to_bytes(nonce, buf), &self.nonce) >>
            gen_slice!(self.record.as_slice()) >>
            gen_len_limit(ONION_MAX_PACKET_SIZE)
        )
    }
}

impl BuildRequestFrame {
    /// Seal `record` to `hop_pk` under the ephemeral key.
    pub fn new(
        ephemeral_sk: &SecretKey,
        hop_pk: &PublicKey,
        rx: HopId,
        nonce: SymmNonce,
        record: &BuildRecord,
    ) -> Result<BuildRequestFrame, GenError> {
        let mut buf = [0; ONION_MAX_PACKET_SIZE];
        let (_, size) = record.to_bytes((&mut buf, 0))?;
        let sealed = SalsaBox::new(hop_pk, ephemeral_sk)
            .encrypt(nonce.as_bytes().into(), &buf[..size])
            .map_err(|_| GenError::CustomError(0))?;

        Ok(BuildRequestFrame {
            rx,
            ephemeral_pk: ephemeral_sk.public_key(),
            nonce,
            record: sealed,
        })
    }

    /// Open the sealed record with the hop's static encryption key.
    pub fn get_record(&self, static_sk: &SecretKey) -> Result<BuildRecord, GetPayloadError> {
        let opened = SalsaBox::new(&self.ephemeral_pk, static_sk)
            .decrypt(self.nonce.as_bytes().into(), self.record.as_slice())
            .map_err(|_| GetPayloadError::Decrypt)?;
        match BuildRecord::from_bytes(&opened) {
            Ok((_, record)) => Ok(record),
            Err(_) => Err(GetPayloadError::Deserialize),
        }
    }

    /// Serialize into a fresh buffer.
    pub fn serialize(&self) -> Result<Vec<u8>, GenError> {
        let mut buf = [0; ONION_MAX_PACKET_SIZE];
        let (_, size) = self.to_bytes((&mut buf, 0))?;
        Ok(buf[..size].to_vec())
    }
}

/** Plaintext of a sealed build record.

A hop recognises itself as the pivot when `tx == rx` of its frame; in that
case `inner` is empty and `upstream` names the hop itself.

Serialized form:

Length   | Content
-------- | ------
`16`     | tx `HopId` the hop will forward under
`32`     | `RouterId` of the next hop (or of this hop at the pivot)
`8`      | Path lifetime in seconds
variable | Next layer's serialized [`BuildRequestFrame`], empty at the pivot

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildRecord {
    /// Id the hop forwards under towards the pivot.
    pub tx: HopId,
    /// Next hop's router id; the hop's own id marks the path terminus.
    pub upstream: RouterId,
    /// Path lifetime in seconds.
    pub lifetime: u64,
    /// Next layer of the build onion.
    pub inner: Vec<u8>,
}

impl FromBytes for BuildRecord {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, tx) = HopId::from_bytes(input)?;
        let (input, upstream) = RouterId::from_bytes(input)?;
        let (input, lifetime) = be_u64(input)?;
        let (input, inner) = rest(input)?;
        Ok((
            input,
            BuildRecord {
                tx,
                upstream,
                lifetime,
                inner: inner.to_vec(),
            },
        ))
    }
}

impl ToBytes for BuildRecord {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_call!(|buf, tx| HopId::to_bytes(tx, buf), &self.tx) >>
            gen_call!(|buf, upstream| RouterId::to_bytes(upstream, buf), &self.upstream) >>
            gen_be_u64!(self.lifetime) >>
            gen_slice!(self.inner.as_slice())
        )
    }
}

/// Verdict a hop reports for a build request, relayed back to the
/// originator unchanged.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildStatus {
    /// Hop installed its transit state.
    Ok = 0,
    /// Hop refused or failed to process the request.
    Rejected = 1,
    /// Hop does not accept transit traffic.
    TransitNotAllowed = 2,
}

impl FromBytes for BuildStatus {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, status) = nom::number::streaming::be_u8(input)?;
        let status = match status {
            0 => BuildStatus::Ok,
            1 => BuildStatus::Rejected,
            2 => BuildStatus::TransitNotAllowed,
            _ => return Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Switch))),
        };
        Ok((input, status))
    }
}

impl ToBytes for BuildStatus {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        gen_be_u8!(buf, *self as u8)
    }
}

/// Body of a build response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BuildReply {
    pub status: BuildStatus,
}

impl FromBytes for BuildReply {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, status) = BuildStatus::from_bytes(input)?;
        Ok((input, BuildReply { status }))
    }
}

impl ToBytes for BuildReply {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_call!(|buf, status| BuildStatus::to_bytes(status, buf), &self.status)
        )
    }
}

impl BuildReply {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = [0; 1];
        // single status byte always fits
        let (_, size) = self.to_bytes((&mut buf, 0)).unwrap();
        buf[..size].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::thread_rng;

    fn sample_record(inner: Vec<u8>) -> BuildRecord {
        BuildRecord {
            tx: HopId::from_bytes_exact([7; 16]),
            upstream: RouterId::from_bytes_exact([8; 32]),
            lifetime: 1200,
            inner,
        }
    }

    encode_decode_test!(
        build_record_encode_decode,
        BuildRecord {
            tx: HopId::from_bytes_exact([7; 16]),
            upstream: RouterId::from_bytes_exact([8; 32]),
            lifetime: 1200,
            inner: vec![42; 64],
        }
    );

    encode_decode_test!(build_reply_encode_decode, BuildReply { status: BuildStatus::Ok });

    #[test]
    fn seal_open_record() {
        let mut rng = thread_rng();
        let hop_sk = SecretKey::generate(&mut rng);
        let ephemeral_sk = SecretKey::generate(&mut rng);
        let nonce = SymmNonce::random(&mut rng);
        let record = sample_record(vec![42; 32]);

        let frame = BuildRequestFrame::new(
            &ephemeral_sk,
            &hop_sk.public_key(),
            HopId::random(&mut rng),
            nonce,
            &record,
        )
        .unwrap();

        assert_eq!(frame.get_record(&hop_sk).unwrap(), record);
    }

    #[test]
    fn open_record_wrong_key() {
        let mut rng = thread_rng();
        let hop_sk = SecretKey::generate(&mut rng);
        let other_sk = SecretKey::generate(&mut rng);
        let ephemeral_sk = SecretKey::generate(&mut rng);
        let record = sample_record(Vec::new());

        let frame = BuildRequestFrame::new(
            &ephemeral_sk,
            &hop_sk.public_key(),
            HopId::random(&mut rng),
            SymmNonce::random(&mut rng),
            &record,
        )
        .unwrap();

        assert!(matches!(frame.get_record(&other_sk), Err(GetPayloadError::Decrypt)));
    }

    #[test]
    fn frame_roundtrip_preserves_sealed_record() {
        let mut rng = thread_rng();
        let hop_sk = SecretKey::generate(&mut rng);
        let ephemeral_sk = SecretKey::generate(&mut rng);
        let record = sample_record(vec![1, 2, 3]);

        let frame = BuildRequestFrame::new(
            &ephemeral_sk,
            &hop_sk.public_key(),
            HopId::random(&mut rng),
            SymmNonce::random(&mut rng),
            &record,
        )
        .unwrap();

        let bytes = frame.serialize().unwrap();
        let (rest, parsed) = BuildRequestFrame::from_bytes(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, frame);
        assert_eq!(parsed.get_record(&hop_sk).unwrap(), record);
    }
}
