/*! Handshake packets establishing a confirmed link between two routers.

Both hellos carry the sender's signed contact in the clear and a sealed
payload holding the ephemeral session key and starting nonce. The seal is a
box between the sender's static encryption key and the receiver's, so a
successful open proves possession of the key the contact advertises.
*/

use cookie_factory::{do_gen, gen_be_u8, gen_call, gen_cond, gen_slice};
use nom::bytes::streaming::take;
use nom::combinator::verify;
use nom::number::streaming::be_u8;
use nom::IResult;

use veil_binary_io::*;
use veil_crypto::{Nonce, PublicKey, NONCEBYTES};
use veil_packet::contact::{RouterContact, RC_SIZE};

/// Which kind of peer is introducing itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeerRole {
    /// A relay: long-lived link, contact published and gossiped.
    Relay = 0,
    /// A client: ephemeral link, contact never gossiped.
    Client = 1,
}

/// Size of the plaintext hello payload.
pub const PAYLOAD_SIZE: usize = 32 + NONCEBYTES;
/// Size of the sealed hello payload.
pub const ENC_PAYLOAD_SIZE: usize = PAYLOAD_SIZE + 16;
/// Exact size of a serialized `ClientHello`.
pub const CLIENT_HELLO_SIZE: usize = 1 + RC_SIZE + NONCEBYTES + ENC_PAYLOAD_SIZE;
/// Exact size of a serialized `ServerHello`.
pub const SERVER_HELLO_SIZE: usize = RC_SIZE + NONCEBYTES + ENC_PAYLOAD_SIZE;

/** Opening packet of a handshake, sent by the dialling side.

Serialized form:

Length | Content
------ | ------
`1`    | Role (`0x00` relay, `0x01` client)
`156`  | Sender's contact
`24`   | Box nonce
`72`   | Sealed [`HelloPayload`]

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientHello {
    /// Role the dialler claims; decides which connection table it lands in.
    pub role: PeerRole,
    /// Dialler's signed contact.
    pub rc: RouterContact,
    /// Nonce the payload is sealed with.
    pub nonce: Nonce,
    /// Sealed [`HelloPayload`].
    pub payload: Vec<u8>,
}

impl FromBytes for ClientHello {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, role) = verify(be_u8, |role| *role <= 1)(input)?;
        let role = if role == 0 { PeerRole::Relay } else { PeerRole::Client };
        let (input, rc) = RouterContact::from_bytes(input)?;
        let (input, nonce) = <[u8; NONCEBYTES]>::from_bytes(input)?;
        let (input, payload) = take(ENC_PAYLOAD_SIZE)(input)?;
        Ok((
            input,
            ClientHello {
                role,
                rc,
                nonce,
                payload: payload.to_vec(),
            },
        ))
    }
}

impl ToBytes for ClientHello {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_cond!(self.payload.len() != ENC_PAYLOAD_SIZE, |buf| gen_error(buf, 0)) >>
            gen_be_u8!(self.role as u8) >>
            gen_call!(|buf, rc| RouterContact::to_bytes(rc, buf), &self.rc) >>
            gen_slice!(self.nonce.as_ref()) >>
            gen_slice!(self.payload.as_slice())
        )
    }
}

/** Answering packet of a handshake.

Serialized form:

Length | Content
------ | ------
`156`  | Responder's contact
`24`   | Box nonce
`72`   | Sealed [`HelloPayload`]

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerHello {
    /// Responder's signed contact; the dialler pins its router id against
    /// the one it dialled.
    pub rc: RouterContact,
    /// Nonce the payload is sealed with.
    pub nonce: Nonce,
    /// Sealed [`HelloPayload`].
    pub payload: Vec<u8>,
}

impl FromBytes for ServerHello {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, rc) = RouterContact::from_bytes(input)?;
        let (input, nonce) = <[u8; NONCEBYTES]>::from_bytes(input)?;
        let (input, payload) = take(ENC_PAYLOAD_SIZE)(input)?;
        Ok((
            input,
            ServerHello {
                rc,
                nonce,
                payload: payload.to_vec(),
            },
        ))
    }
}

impl ToBytes for ServerHello {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_cond!(self.payload.len() != ENC_PAYLOAD_SIZE, |buf| gen_error(buf, 0)) >>
            gen_call!(|buf, rc| RouterContact::to_bytes(rc, buf), &self.rc) >>
            gen_slice!(self.nonce.as_ref()) >>
            gen_slice!(self.payload.as_slice())
        )
    }
}

/** Plaintext of the sealed hello payload.

Serialized form:

Length | Content
------ | ------
`32`   | Ephemeral session `PublicKey`
`24`   | Starting nonce for packets the sender will send

*/
#[derive(Clone, Debug)]
pub struct HelloPayload {
    /// Ephemeral session key.
    pub session_pk: PublicKey,
    /// Starting nonce of the sender's direction.
    pub session_nonce: Nonce,
}

impl FromBytes for HelloPayload {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, session_pk) = veil_crypto::public_key_from_bytes(input)?;
        let (input, session_nonce) = <[u8; NONCEBYTES]>::from_bytes(input)?;
        Ok((
            input,
            HelloPayload {
                session_pk,
                session_nonce,
            },
        ))
    }
}

impl ToBytes for HelloPayload {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(self.session_pk.as_bytes()) >>
            gen_slice!(self.session_nonce.as_ref())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::thread_rng;
    use veil_crypto::identity::SigningKey;
    use veil_crypto::SecretKey;

    fn sample_rc() -> RouterContact {
        let sk = SigningKey::generate();
        let enc_pk = SecretKey::generate(&mut thread_rng()).public_key();
        RouterContact::new_signed(&sk, enc_pk, "203.0.113.7:9000".parse().unwrap(), 1000)
    }

    encode_decode_test!(
        client_hello_encode_decode,
        ClientHello {
            role: PeerRole::Relay,
            rc: sample_rc(),
            nonce: [42; NONCEBYTES],
            payload: vec![42; ENC_PAYLOAD_SIZE],
        }
    );

    encode_decode_test!(
        server_hello_encode_decode,
        ServerHello {
            rc: sample_rc(),
            nonce: [42; NONCEBYTES],
            payload: vec![42; ENC_PAYLOAD_SIZE],
        }
    );

    #[test]
    fn wrong_payload_size_rejected() {
        let hello = ClientHello {
            role: PeerRole::Client,
            rc: sample_rc(),
            nonce: [42; NONCEBYTES],
            payload: vec![42; ENC_PAYLOAD_SIZE + 1],
        };
        let mut buf = [0; CLIENT_HELLO_SIZE * 2];
        assert!(hello.to_bytes((&mut buf, 0)).is_err());
    }
}
