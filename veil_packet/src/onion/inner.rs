/*! Inner payloads: what the pivot sees after the last onion layer is gone.

A tag byte distinguishes control requests, dispatched to a named handler at
the pivot, from data datagrams, delivered to the local endpoint owning the
conversation.
*/

use cookie_factory::{do_gen, gen_be_u8, gen_call, gen_cond, gen_slice};
use nom::bytes::streaming::take;
use nom::combinator::{map_res, rest, verify};
use nom::number::streaming::be_u8;
use nom::IResult;

use veil_binary_io::*;

use crate::ids::RouterId;

/// Longest allowed control endpoint name.
pub const MAX_ENDPOINT_SIZE: usize = 32;

const INNER_CONTROL_TAG: u8 = 0x43; // 'C'
const INNER_DATA_TAG: u8 = 0x44; // 'D'

/** Payload revealed at the pivot.

Serialized form:

Length   | Content
-------- | ------
`1`      | Tag: `0x43` control, `0x44` data

Control continues with:

Length   | Content
-------- | ------
`1`      | Endpoint name length
variable | Endpoint name (UTF-8)
variable | Request body

Data continues with:

Length   | Content
-------- | ------
`32`     | Sender's service `RouterId`
variable | Datagram body (opaque to the path layer)

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InnerMessage {
    /// Request for a named handler at the pivot.
    Control {
        /// Handler name.
        endpoint: String,
        /// Request body.
        body: Vec<u8>,
    },
    /// Datagram for the endpoint owning the conversation.
    Data {
        /// Identity of the sending service.
        sender: RouterId,
        /// Datagram body.
        body: Vec<u8>,
    },
}

impl FromBytes for InnerMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, tag) = be_u8(input)?;
        match tag {
            INNER_CONTROL_TAG => {
                let (input, len) = verify(be_u8, |len| *len as usize <= MAX_ENDPOINT_SIZE && *len > 0)(input)?;
                let (input, endpoint) =
                    map_res(take(len as usize), |name: &[u8]| String::from_utf8(name.to_vec()))(input)?;
                let (input, body) = rest(input)?;
                Ok((
                    input,
                    InnerMessage::Control {
                        endpoint,
                        body: body.to_vec(),
                    },
                ))
            }
            INNER_DATA_TAG => {
                let (input, sender) = RouterId::from_bytes(input)?;
                let (input, body) = rest(input)?;
                Ok((
                    input,
                    InnerMessage::Data {
                        sender,
                        body: body.to_vec(),
                    },
                ))
            }
            _ => Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Switch))),
        }
    }
}

impl ToBytes for InnerMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        match self {
            InnerMessage::Control { endpoint, body } => {
                do_gen!(buf,
                    gen_cond!(
                        endpoint.is_empty() || endpoint.len() > MAX_ENDPOINT_SIZE,
                        |buf| gen_error(buf, 0)
                    ) >>
                    gen_be_u8!(INNER_CONTROL_TAG) >>
                    gen_be_u8!(endpoint.len() as u8) >>
                    gen_slice!(endpoint.as_bytes()) >>
                    gen_slice!(body.as_slice())
                )
            }
            InnerMessage::Data { sender, body } => {
                do_gen!(buf,
                    gen_be_u8!(INNER_DATA_TAG) >>
                    gen_call!(|buf, sender| RouterId::to_bytes(sender, buf), sender) >>
                    gen_slice!(body.as_slice())
                )
            }
        }
    }
}

impl InnerMessage {
    /// Shorthand for a control message.
    pub fn control<S: Into<String>, B: Into<Vec<u8>>>(endpoint: S, body: B) -> InnerMessage {
        InnerMessage::Control {
            endpoint: endpoint.into(),
            body: body.into(),
        }
    }

    /// Shorthand for a data message.
    pub fn data<B: Into<Vec<u8>>>(sender: RouterId, body: B) -> InnerMessage {
        InnerMessage::Data {
            sender,
            body: body.into(),
        }
    }

    /// Serialize into a fresh buffer.
    pub fn serialize(&self) -> Result<Vec<u8>, GenError> {
        let mut buf = vec![0; super::ONION_MAX_PACKET_SIZE];
        let (_, size) = self.to_bytes((&mut buf, 0))?;
        buf.truncate(size);
        Ok(buf)
    }
}
