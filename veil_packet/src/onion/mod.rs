/*! Onion frames: the outer hop-addressed envelope every path message and
path response travels in.
*/

mod inner;
mod path_build;
mod transfer;

pub use self::inner::*;
pub use self::path_build::*;
pub use self::transfer::*;

use cookie_factory::{do_gen, gen_call, gen_slice};
use nom::combinator::rest;
use nom::IResult;

use veil_binary_io::*;
use veil_crypto::SymmNonce;

use crate::ids::HopId;

/// Endpoint name onion-wrapped control requests travel on, hop to hop.
pub const PATH_CONTROL_ENDPOINT: &str = "path_control";

/// The maximum size of an onion frame including hop id, nonce and payload.
pub const ONION_MAX_PACKET_SIZE: usize = 1400;

/// Maximum payload an onion frame can carry.
pub const ONION_MAX_PAYLOAD_SIZE: usize = ONION_MAX_PACKET_SIZE - HOP_FRAME_OVERHEAD;

/// Bytes of header before the payload of an onion frame.
pub const HOP_FRAME_OVERHEAD: usize = 16 + 24;

/** Outer envelope of one onion-routed message.

The hop id addresses the frame at the next router: a transit hop matches it
against the rx/tx pair of its record, the originator against the upstream
rx id of a local path. The nonce threads through the hop chain, mutated by
each hop's XOR value, so every hop applies an independent keystream.

Serialized form:

Length   | Content
-------- | ------
`16`     | `HopId` the receiving router knows this hop by
`24`     | Onion-step nonce
variable | Payload (nested ciphertext)

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OnionFrame {
    /// Hop id the receiving router resolves.
    pub hop_id: HopId,
    /// Onion-step nonce as mutated so far.
    pub nonce: SymmNonce,
    /// Nested ciphertext.
    pub payload: Vec<u8>,
}

impl FromBytes for OnionFrame {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = nom::combinator::verify(nom::combinator::rest_len, |len| *len <= ONION_MAX_PACKET_SIZE)(input)?;
        let (input, hop_id) = HopId::from_bytes(input)?;
        let (input, nonce) = SymmNonce::from_bytes(input)?;
        let (input, payload) = rest(input)?;
        Ok((
            input,
            OnionFrame {
                hop_id,
                nonce,
                payload: payload.to_vec(),
            },
        ))
    }
}

impl ToBytes for OnionFrame {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_call!(|buf, hop_id| HopId::to_bytes(hop_id, buf), &self.hop_id) >>
            gen_call!(|buf, nonce| SymmNonce::to_bytes(nonce, buf), &self.nonce) >>
            gen_slice!(self.payload.as_slice()) >>
            gen_len_limit(ONION_MAX_PACKET_SIZE)
        )
    }
}

impl OnionFrame {
    /// Serialize into a fresh buffer.
    pub fn serialize(&self) -> Result<Vec<u8>, GenError> {
        let mut buf = [0; ONION_MAX_PACKET_SIZE];
        let (_, size) = self.to_bytes((&mut buf, 0))?;
        Ok(buf[..size].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    encode_decode_test!(
        onion_frame_encode_decode,
        OnionFrame {
            hop_id: HopId::from_bytes_exact([42; 16]),
            nonce: SymmNonce::from_bytes_exact([43; 24]),
            payload: vec![44; 123],
        }
    );

    #[test]
    fn oversized_frame_rejected() {
        let frame = OnionFrame {
            hop_id: HopId::from_bytes_exact([42; 16]),
            nonce: SymmNonce::from_bytes_exact([43; 24]),
            payload: vec![44; ONION_MAX_PACKET_SIZE],
        };
        let mut buf = [0; ONION_MAX_PACKET_SIZE * 2];
        assert!(frame.to_bytes((&mut buf, 0)).is_err());
    }
}
