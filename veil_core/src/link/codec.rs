/*! Codec for the secure link: length-prefixed encrypted frames, one link
packet per frame.

Wire form of one frame:

Length   | Content
-------- | ------
`2`      | Big-endian length of the encrypted payload
variable | Encrypted serialized [`Packet`]

*/

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use veil_binary_io::*;
use veil_packet::link::{Packet, MAX_LINK_PACKET_SIZE};

use crate::link::secure::Channel;
use crate::stats::Stats;

/// Authentication overhead of one encrypted frame.
const MAC_SIZE: usize = 16;

/// Largest encrypted payload a frame may carry.
pub const MAX_FRAME_SIZE: usize = MAX_LINK_PACKET_SIZE + MAC_SIZE;

/// Error that can happen when decoding a frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Frame announces a length above the cap.
    #[error("Frame announces a length above the cap: {len}")]
    FrameTooBig {
        len: usize,
    },
    /// Frame failed to decrypt.
    #[error("Frame failed to decrypt")]
    Decrypt,
    /// Decrypted frame failed to parse as a packet.
    #[error("Decrypted frame failed to parse as a packet")]
    Deserialize,
    /// Socket error.
    #[error("Socket error")]
    Io(std::io::Error),
}

impl From<std::io::Error> for DecodeError {
    fn from(e: std::io::Error) -> DecodeError {
        DecodeError::Io(e)
    }
}

/// Error that can happen when encoding a frame.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Packet does not fit a frame.
    #[error("Packet does not fit a frame")]
    Serialize,
    /// Socket error.
    #[error("Socket error")]
    Io(std::io::Error),
}

impl From<std::io::Error> for EncodeError {
    fn from(e: std::io::Error) -> EncodeError {
        EncodeError::Io(e)
    }
}

/// Encrypting codec turning a raw socket into a stream/sink of packets.
pub struct Codec {
    channel: Channel,
    stats: Stats,
}

impl Codec {
    /// Create new `Codec` over an established channel.
    pub fn new(channel: Channel, stats: Stats) -> Codec {
        Codec { channel, stats }
    }
}

impl Decoder for Codec {
    type Item = Packet;
    type Error = DecodeError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(DecodeError::FrameTooBig { len });
        }
        if buf.len() < 2 + len {
            return Ok(None);
        }
        buf.advance(2);
        let encrypted = buf.split_to(len);

        let decrypted = self.channel.decrypt(&encrypted).map_err(|()| DecodeError::Decrypt)?;
        match Packet::from_bytes(&decrypted) {
            Ok((_, packet)) => {
                self.stats.counter_incoming();
                Ok(Some(packet))
            }
            Err(_) => Err(DecodeError::Deserialize),
        }
    }
}

impl Encoder<Packet> for Codec {
    type Error = EncodeError;

    fn encode(&mut self, packet: Packet, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let mut packet_buf = [0; MAX_LINK_PACKET_SIZE];
        let (_, size) = packet
            .to_bytes((&mut packet_buf, 0))
            .map_err(|_| EncodeError::Serialize)?;

        let encrypted = self.channel.encrypt(&packet_buf[..size]);
        buf.reserve(2 + encrypted.len());
        buf.put_u16(encrypted.len() as u16);
        buf.put_slice(&encrypted);
        self.stats.counter_outgoing();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use veil_packet::link::PingRequest;

    use crate::link::secure::Session;

    fn paired_codecs() -> (Codec, Codec) {
        let alice = Session::random();
        let bob = Session::random();
        let alice_channel = Channel::new(&alice, bob.pk(), bob.nonce());
        let bob_channel = Channel::new(&bob, alice.pk(), alice.nonce());
        (
            Codec::new(alice_channel, Stats::new()),
            Codec::new(bob_channel, Stats::new()),
        )
    }

    #[test]
    fn encode_decode() {
        let (mut alice, mut bob) = paired_codecs();
        let packet = Packet::PingRequest(PingRequest { ping_id: 42 });

        let mut buf = BytesMut::new();
        alice.encode(packet.clone(), &mut buf).unwrap();
        let decoded = bob.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_incomplete() {
        let (mut alice, mut bob) = paired_codecs();

        let mut buf = BytesMut::new();
        alice.encode(Packet::PingRequest(PingRequest { ping_id: 42 }), &mut buf).unwrap();
        let full = buf.clone();

        let mut partial = BytesMut::from(&full[..1]);
        assert!(bob.decode(&mut partial).unwrap().is_none());

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(bob.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn decode_garbage() {
        let (_, mut bob) = paired_codecs();

        let mut buf = BytesMut::new();
        buf.put_u16(32);
        buf.put_slice(&[42; 32]);

        assert!(matches!(bob.decode(&mut buf), Err(DecodeError::Decrypt)));
    }

    #[test]
    fn decode_oversized_length() {
        let (_, mut bob) = paired_codecs();

        let mut buf = BytesMut::new();
        buf.put_u16(u16::MAX);
        buf.put_slice(&[0; 4]);

        assert!(matches!(bob.decode(&mut buf), Err(DecodeError::FrameTooBig { .. })));
    }

    #[test]
    fn several_packets_in_one_buffer() {
        let (mut alice, mut bob) = paired_codecs();

        let mut buf = BytesMut::new();
        for id in 0..3 {
            alice.encode(Packet::PingRequest(PingRequest { ping_id: id }), &mut buf).unwrap();
        }

        for id in 0..3 {
            let packet = bob.decode(&mut buf).unwrap().unwrap();
            assert_eq!(packet, Packet::PingRequest(PingRequest { ping_id: id }));
        }
        assert!(buf.is_empty());
    }
}
