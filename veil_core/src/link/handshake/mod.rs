/*! Link handshake: two messages that pin identities and set up the secure
channel before any user data flows.

The dialler seals its hello to the encryption key of the contact it dialled,
so only the holder of that key can answer. The responder's hello carries its
own signed contact; the dialler aborts when the certified identity differs
from the router it meant to reach.
*/

pub mod codec;
pub mod packet;

pub use self::codec::*;
pub use self::packet::*;

use std::io::Error as IoError;

use crypto_box::aead::Aead;
use crypto_box::SalsaBox;
use futures::{SinkExt, StreamExt};
use rand::{thread_rng, Rng};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use veil_binary_io::*;
use veil_crypto::{Nonce, SecretKey};
use veil_packet::contact::{is_bogon, unix_now, AddressPolicy, RouterContact, RC_MAX_CLOCK_SKEW};

use crate::error::ErrorKind;
use crate::link::secure::{Channel, Session};

/// Error that can happen during a handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Socket error before the handshake completed.
    #[error("Socket error before the handshake completed")]
    Io(IoError),
    /// Peer's contact failed verification.
    #[error("Peer's contact failed verification")]
    InvalidContact,
    /// Peer's contact is expired or stamped too far in the future.
    #[error("Peer's contact is expired or stamped too far in the future")]
    ExpiredContact,
    /// Peer's contact advertises a forbidden address.
    #[error("Peer's contact advertises a forbidden address")]
    BogonContact,
    /// Peer's certified identity differs from the dialled router.
    #[error("Peer's certified identity differs from the dialled router")]
    IdentityMismatch,
    /// Sealed handshake payload failed to open or parse.
    #[error("Sealed handshake payload failed to open or parse")]
    Payload,
}

impl HandshakeError {
    /// The taxonomy kind surfaced to close hooks.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandshakeError::Io(_) => ErrorKind::NoLink,
            HandshakeError::ExpiredContact => ErrorKind::Expired,
            HandshakeError::BogonContact => ErrorKind::BadAddress,
            HandshakeError::InvalidContact | HandshakeError::IdentityMismatch | HandshakeError::Payload => {
                ErrorKind::BadSignature
            }
        }
    }
}

fn seal_payload(session: &Session, common_key: &SalsaBox) -> (Nonce, Vec<u8>) {
    let payload = HelloPayload {
        session_pk: session.pk().clone(),
        session_nonce: *session.nonce(),
    };
    let mut buf = [0; PAYLOAD_SIZE];
    // fixed-size buffer always fits the payload
    let (_, size) = payload.to_bytes((&mut buf, 0)).unwrap();

    let nonce: Nonce = thread_rng().gen();
    // encryption with a fresh nonce cannot fail
    let sealed = common_key.encrypt((&nonce).into(), &buf[..size]).unwrap();
    (nonce, sealed)
}

fn open_payload(common_key: &SalsaBox, nonce: &Nonce, sealed: &[u8]) -> Result<HelloPayload, HandshakeError> {
    let opened = common_key
        .decrypt(nonce.into(), sealed)
        .map_err(|_| HandshakeError::Payload)?;
    match HelloPayload::from_bytes(&opened) {
        Ok((_, payload)) => Ok(payload),
        Err(_) => Err(HandshakeError::Payload),
    }
}

fn check_contact(rc: &RouterContact, role: PeerRole, policy: AddressPolicy) -> Result<(), HandshakeError> {
    rc.verify().map_err(|_| HandshakeError::InvalidContact)?;
    let now = unix_now();
    if rc.timestamp > now + RC_MAX_CLOCK_SKEW.as_secs() || rc.is_expired(now) {
        return Err(HandshakeError::ExpiredContact);
    }
    // clients dial from wherever they are; only relay contacts must be
    // routable
    if role == PeerRole::Relay && policy == AddressPolicy::RejectBogons && is_bogon(rc.addr.ip()) {
        return Err(HandshakeError::BogonContact);
    }
    Ok(())
}

/// Create the dialler's hello towards the router described by `expected`.
pub fn create_client_hello(
    local_rc: &RouterContact,
    local_enc_sk: &SecretKey,
    role: PeerRole,
    expected: &RouterContact,
) -> (Session, SalsaBox, ClientHello) {
    let session = Session::random();
    let common_key = SalsaBox::new(&expected.enc_pk, local_enc_sk);
    let (nonce, payload) = seal_payload(&session, &common_key);

    let hello = ClientHello {
        role,
        rc: local_rc.clone(),
        nonce,
        payload,
    };
    (session, common_key, hello)
}

/// Handle a received `ClientHello` on the accepting side. Returns the
/// established channel, the dialler's contact and role, and the reply to
/// send.
pub fn handle_client_hello(
    local_rc: &RouterContact,
    local_enc_sk: &SecretKey,
    hello: &ClientHello,
    policy: AddressPolicy,
) -> Result<(Channel, RouterContact, PeerRole, ServerHello), HandshakeError> {
    check_contact(&hello.rc, hello.role, policy)?;

    let common_key = SalsaBox::new(&hello.rc.enc_pk, local_enc_sk);
    let their_payload = open_payload(&common_key, &hello.nonce, &hello.payload)?;

    let session = Session::random();
    let channel = Channel::new(&session, &their_payload.session_pk, &their_payload.session_nonce);
    let (nonce, payload) = seal_payload(&session, &common_key);

    let reply = ServerHello {
        rc: local_rc.clone(),
        nonce,
        payload,
    };
    Ok((channel, hello.rc.clone(), hello.role, reply))
}

/// Handle the responder's hello on the dialling side, pinning the certified
/// identity against the router we dialled.
pub fn handle_server_hello(
    common_key: &SalsaBox,
    session: &Session,
    expected: &RouterContact,
    hello: &ServerHello,
) -> Result<Channel, HandshakeError> {
    hello.rc.verify().map_err(|_| HandshakeError::InvalidContact)?;
    if hello.rc.rid != expected.rid {
        return Err(HandshakeError::IdentityMismatch);
    }

    let payload = open_payload(common_key, &hello.nonce, &hello.payload)?;
    Ok(Channel::new(session, &payload.session_pk, &payload.session_nonce))
}

/// Run the dialling side of the handshake over a fresh socket.
pub async fn make_client_handshake(
    socket: TcpStream,
    local_rc: &RouterContact,
    local_enc_sk: &SecretKey,
    role: PeerRole,
    expected: &RouterContact,
) -> Result<(TcpStream, Channel, RouterContact), HandshakeError> {
    let (session, common_key, hello) = create_client_hello(local_rc, local_enc_sk, role, expected);

    let mut framed = Framed::new(socket, ClientHelloCodec);
    framed.send(hello).await.map_err(HandshakeError::Io)?;

    let socket = framed.into_inner();
    let mut framed = Framed::new(socket, ServerHelloCodec);
    let reply = match framed.next().await {
        None => return Err(HandshakeError::Io(IoError::new(std::io::ErrorKind::UnexpectedEof, "connection closed during handshake"))),
        Some(Err(e)) => return Err(HandshakeError::Io(e)),
        Some(Ok(reply)) => reply,
    };

    let channel = handle_server_hello(&common_key, &session, expected, &reply)?;
    Ok((framed.into_inner(), channel, reply.rc))
}

/// Run the accepting side of the handshake over a fresh socket.
pub async fn make_server_handshake(
    socket: TcpStream,
    local_rc: &RouterContact,
    local_enc_sk: &SecretKey,
    policy: AddressPolicy,
) -> Result<(TcpStream, Channel, RouterContact, PeerRole), HandshakeError> {
    let mut framed = Framed::new(socket, ClientHelloCodec);
    let hello = match framed.next().await {
        None => return Err(HandshakeError::Io(IoError::new(std::io::ErrorKind::UnexpectedEof, "connection closed during handshake"))),
        Some(Err(e)) => return Err(HandshakeError::Io(e)),
        Some(Ok(hello)) => hello,
    };

    let (channel, their_rc, role, reply) = handle_client_hello(local_rc, local_enc_sk, &hello, policy)?;

    let socket = framed.into_inner();
    let mut framed = Framed::new(socket, ServerHelloCodec);
    framed.send(reply).await.map_err(HandshakeError::Io)?;

    Ok((framed.into_inner(), channel, their_rc, role))
}
