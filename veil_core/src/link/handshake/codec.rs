/*! Codecs to deal with `ClientHello` and `ServerHello` in terms of tokio-io.
*/

use bytes::{Buf, BytesMut};
use nom::{Err, Offset};
use std::io::{Error, ErrorKind};
use tokio_util::codec::{Decoder, Encoder};

use veil_binary_io::*;

use crate::link::handshake::packet::*;

/// Implements tokio-io's Decoder and Encoder for the dialler's hello.
pub struct ClientHelloCodec;

impl Decoder for ClientHelloCodec {
    type Item = ClientHello;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (consumed, hello) = match ClientHello::from_bytes(buf) {
            Err(Err::Incomplete(_)) => return Ok(None),
            Err(_) => return Err(Error::new(ErrorKind::Other, "ClientHello deserialize error")),
            Ok((rest, hello)) => (buf.offset(rest), hello),
        };
        buf.advance(consumed);
        Ok(Some(hello))
    }
}

impl Encoder<ClientHello> for ClientHelloCodec {
    type Error = Error;

    fn encode(&mut self, hello: ClientHello, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let mut hello_buf = [0; CLIENT_HELLO_SIZE];
        hello
            .to_bytes((&mut hello_buf, 0))
            .map(|(hello_buf, size)| buf.extend_from_slice(&hello_buf[..size]))
            .map_err(|e| Error::new(ErrorKind::Other, format!("ClientHello serialize error: {:?}", e)))
    }
}

/// Implements tokio-io's Decoder and Encoder for the responder's hello.
pub struct ServerHelloCodec;

impl Decoder for ServerHelloCodec {
    type Item = ServerHello;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (consumed, hello) = match ServerHello::from_bytes(buf) {
            Err(Err::Incomplete(_)) => return Ok(None),
            Err(_) => return Err(Error::new(ErrorKind::Other, "ServerHello deserialize error")),
            Ok((rest, hello)) => (buf.offset(rest), hello),
        };
        buf.advance(consumed);
        Ok(Some(hello))
    }
}

impl Encoder<ServerHello> for ServerHelloCodec {
    type Error = Error;

    fn encode(&mut self, hello: ServerHello, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let mut hello_buf = [0; SERVER_HELLO_SIZE];
        hello
            .to_bytes((&mut hello_buf, 0))
            .map(|(hello_buf, size)| buf.extend_from_slice(&hello_buf[..size]))
            .map_err(|e| Error::new(ErrorKind::Other, format!("ServerHello serialize error: {:?}", e)))
    }
}
