/*! Packets of the secure link between two routers.

Every packet travels encrypted inside one frame of the per-connection
secure channel. The first byte is the packet kind.
*/

mod control;

pub use self::control::*;

use cookie_factory::{do_gen, gen_be_u64, gen_be_u8, gen_call};
use nom::number::streaming::{be_u64, be_u8};
use nom::IResult;

use veil_binary_io::*;

use crate::onion::OnionFrame;

/// Largest serialized link packet the codec will carry. Sized for a full
/// contact-fetch bundle, the biggest body a control stream moves.
pub const MAX_LINK_PACKET_SIZE: usize = 32 * 1024;

/** Ping sent over a link to keep it alive and detect dead peers.

Serialized form:

Length | Content
------ | ------
`1`    | `0x01`
`8`    | Ping id

*/
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PingRequest {
    /// Non-zero id echoed by the pong.
    pub ping_id: u64,
}

/** Reply to a [`PingRequest`] carrying the same id.

Serialized form:

Length | Content
------ | ------
`1`    | `0x02`
`8`    | Ping id

*/
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PongResponse {
    /// Id from the answered ping.
    pub ping_id: u64,
}

/// All packets that can travel on a secure link.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Packet {
    /// Keep-alive probe.
    PingRequest(PingRequest),
    /// Keep-alive reply.
    PongResponse(PongResponse),
    /// Best-effort onion datagram.
    Datagram(OnionFrame),
    /// Reliable key-addressed request on the control stream.
    ControlRequest(ControlRequest),
    /// Reply on the control stream.
    ControlResponse(ControlResponse),
}

impl FromBytes for PingRequest {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = nom::bytes::streaming::tag(&[0x01][..])(input)?;
        let (input, ping_id) = be_u64(input)?;
        Ok((input, PingRequest { ping_id }))
    }
}

impl ToBytes for PingRequest {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(0x01) >>
            gen_be_u64!(self.ping_id)
        )
    }
}

impl FromBytes for PongResponse {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = nom::bytes::streaming::tag(&[0x02][..])(input)?;
        let (input, ping_id) = be_u64(input)?;
        Ok((input, PongResponse { ping_id }))
    }
}

impl ToBytes for PongResponse {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(0x02) >>
            gen_be_u64!(self.ping_id)
        )
    }
}

impl FromBytes for Packet {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (_, kind) = be_u8(input)?;
        match kind {
            0x01 => nom::combinator::map(PingRequest::from_bytes, Packet::PingRequest)(input),
            0x02 => nom::combinator::map(PongResponse::from_bytes, Packet::PongResponse)(input),
            0x10 => {
                let (input, _) = be_u8(input)?;
                nom::combinator::map(OnionFrame::from_bytes, Packet::Datagram)(input)
            }
            0x20 => nom::combinator::map(ControlRequest::from_bytes, Packet::ControlRequest)(input),
            0x21 => nom::combinator::map(ControlResponse::from_bytes, Packet::ControlResponse)(input),
            _ => Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Switch))),
        }
    }
}

impl ToBytes for Packet {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        match self {
            Packet::PingRequest(packet) => packet.to_bytes(buf),
            Packet::PongResponse(packet) => packet.to_bytes(buf),
            Packet::Datagram(frame) => do_gen!(buf,
                gen_be_u8!(0x10) >>
                gen_call!(|buf, frame| OnionFrame::to_bytes(frame, buf), frame)
            ),
            Packet::ControlRequest(packet) => packet.to_bytes(buf),
            Packet::ControlResponse(packet) => packet.to_bytes(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use veil_crypto::SymmNonce;

    use crate::ids::HopId;

    encode_decode_test!(ping_request_encode_decode, Packet::PingRequest(PingRequest { ping_id: 42 }));

    encode_decode_test!(pong_response_encode_decode, Packet::PongResponse(PongResponse { ping_id: 42 }));

    encode_decode_test!(
        datagram_encode_decode,
        Packet::Datagram(OnionFrame {
            hop_id: HopId::from_bytes_exact([42; 16]),
            nonce: SymmNonce::from_bytes_exact([43; 24]),
            payload: vec![44; 100],
        })
    );

    #[test]
    fn unknown_kind_rejected() {
        let bytes = [0x7f, 0, 0, 0];
        assert!(Packet::from_bytes(&bytes).is_err());
    }
}
