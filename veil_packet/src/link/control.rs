/*! Control stream records: length-prefixed key-addressed requests and their
replies, correlated by a per-connection request id.
*/

use cookie_factory::{do_gen, gen_be_u64, gen_be_u8, gen_call, gen_cond, gen_slice};
use nom::bytes::streaming::take;
use nom::combinator::{map_res, rest, verify};
use nom::number::streaming::{be_u64, be_u8};
use nom::IResult;

use veil_binary_io::*;

use crate::onion::MAX_ENDPOINT_SIZE;

/** Request on the control stream.

Serialized form:

Length   | Content
-------- | ------
`1`      | `0x20`
`8`      | Request id assigned by the sending transport
`1`      | Endpoint name length
variable | Endpoint name (UTF-8)
variable | Body

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ControlRequest {
    /// Correlates the reply; unique per connection and direction.
    pub request_id: u64,
    /// Name of the command handler at the peer.
    pub endpoint: String,
    /// Opaque request body.
    pub body: Vec<u8>,
}

impl FromBytes for ControlRequest {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = nom::bytes::streaming::tag(&[0x20][..])(input)?;
        let (input, request_id) = be_u64(input)?;
        let (input, len) = verify(be_u8, |len| *len as usize <= MAX_ENDPOINT_SIZE && *len > 0)(input)?;
        let (input, endpoint) = map_res(take(len as usize), |name: &[u8]| String::from_utf8(name.to_vec()))(input)?;
        let (input, body) = rest(input)?;
        Ok((
            input,
            ControlRequest {
                request_id,
                endpoint,
                body: body.to_vec(),
            },
        ))
    }
}

impl ToBytes for ControlRequest {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_cond!(
                self.endpoint.is_empty() || self.endpoint.len() > MAX_ENDPOINT_SIZE,
                |buf| gen_error(buf, 0)
            ) >>
            gen_be_u8!(0x20) >>
            gen_be_u64!(self.request_id) >>
            gen_be_u8!(self.endpoint.len() as u8) >>
            gen_slice!(self.endpoint.as_bytes()) >>
            gen_slice!(self.body.as_slice())
        )
    }
}

/** Reply on the control stream.

Serialized form:

Length   | Content
-------- | ------
`1`      | `0x21`
`8`      | Request id being answered
`1`      | Error flag (`0x00` success, `0x01` error)
variable | Body, or a taxonomised error string when the flag is set

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ControlResponse {
    /// Id of the answered request.
    pub request_id: u64,
    /// Whether the body is an error string.
    pub is_error: bool,
    /// Response body.
    pub body: Vec<u8>,
}

impl FromBytes for ControlResponse {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = nom::bytes::streaming::tag(&[0x21][..])(input)?;
        let (input, request_id) = be_u64(input)?;
        let (input, flag) = verify(be_u8, |flag| *flag <= 1)(input)?;
        let (input, body) = rest(input)?;
        Ok((
            input,
            ControlResponse {
                request_id,
                is_error: flag == 1,
                body: body.to_vec(),
            },
        ))
    }
}

impl ToBytes for ControlResponse {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(0x21) >>
            gen_be_u64!(self.request_id) >>
            gen_be_u8!(self.is_error as u8) >>
            gen_slice!(self.body.as_slice())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    encode_decode_test!(
        control_request_encode_decode,
        ControlRequest {
            request_id: 42,
            endpoint: "path_build".to_owned(),
            body: vec![1, 2, 3],
        }
    );

    encode_decode_test!(
        control_response_encode_decode,
        ControlResponse {
            request_id: 42,
            is_error: true,
            body: b"timeout".to_vec(),
        }
    );

    #[test]
    fn oversized_endpoint_rejected() {
        let request = ControlRequest {
            request_id: 1,
            endpoint: "x".repeat(MAX_ENDPOINT_SIZE + 1),
            body: Vec::new(),
        };
        let mut buf = [0; 256];
        assert!(request.to_bytes((&mut buf, 0)).is_err());
    }
}
