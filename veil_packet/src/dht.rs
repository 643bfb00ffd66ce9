/*! Lookup bodies travelling over paths: name resolution and introset
publish/find. The lookup store itself lives behind these frames.
*/

use cookie_factory::{do_gen, gen_be_u8, gen_call, gen_cond, gen_slice};
use nom::bytes::streaming::take;
use nom::combinator::{cond, map_res, rest, verify};
use nom::number::streaming::be_u8;
use nom::IResult;

use veil_binary_io::*;

use crate::ids::RouterId;

/// Endpoint name for name resolution.
pub const FIND_NAME_ENDPOINT: &str = "find_name";
/// Endpoint name for introset lookup.
pub const FIND_INTRO_ENDPOINT: &str = "find_intro";
/// Endpoint name for introset publication.
pub const PUBLISH_INTRO_ENDPOINT: &str = "publish_intro";

/// Longest accepted service name.
pub const MAX_NAME_SIZE: usize = 128;

/// Largest accepted introset blob.
pub const MAX_INTROSET_SIZE: usize = 1024;

/** Resolve a service name to a router id.

Serialized form:

Length   | Content
-------- | ------
`1`      | Name length
variable | Name (UTF-8)

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FindName {
    pub name: String,
}

impl FromBytes for FindName {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, len) = verify(be_u8, |len| *len as usize <= MAX_NAME_SIZE && *len > 0)(input)?;
        let (input, name) = map_res(take(len as usize), |name: &[u8]| String::from_utf8(name.to_vec()))(input)?;
        Ok((input, FindName { name }))
    }
}

impl ToBytes for FindName {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_cond!(
                self.name.is_empty() || self.name.len() > MAX_NAME_SIZE,
                |buf| gen_error(buf, 0)
            ) >>
            gen_be_u8!(self.name.len() as u8) >>
            gen_slice!(self.name.as_bytes())
        )
    }
}

/** Answer to [`FindName`].

Serialized form:

Length | Content
------ | ------
`1`    | `0x01` found, `0x00` not found
`32`   | Resolved `RouterId` (only when found)

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NameResponse {
    pub rid: Option<RouterId>,
}

impl FromBytes for NameResponse {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, flag) = verify(be_u8, |flag| *flag <= 1)(input)?;
        let (input, rid) = cond(flag == 1, RouterId::from_bytes)(input)?;
        Ok((input, NameResponse { rid }))
    }
}

impl ToBytes for NameResponse {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(self.rid.is_some() as u8) >>
            gen_call!(|buf, rid: &Option<RouterId>| match rid {
                Some(rid) => RouterId::to_bytes(rid, buf),
                None => Ok(buf),
            }, &self.rid)
        )
    }
}

/** Look up the introset published at a location key.

Serialized form:

Length | Content
------ | ------
`32`   | Location key

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FindIntro {
    pub location: [u8; 32],
}

impl FromBytes for FindIntro {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, location) = <[u8; 32]>::from_bytes(input)?;
        Ok((input, FindIntro { location }))
    }
}

impl ToBytes for FindIntro {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf, gen_slice!(self.location.as_ref()))
    }
}

/** Answer to [`FindIntro`].

Serialized form:

Length   | Content
-------- | ------
`1`      | `0x01` found, `0x00` not found
variable | Introset blob (only when found)

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IntroResponse {
    pub introset: Option<Vec<u8>>,
}

impl FromBytes for IntroResponse {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, flag) = verify(be_u8, |flag| *flag <= 1)(input)?;
        if flag == 1 {
            let (input, introset) = verify(rest, |set: &[u8]| set.len() <= MAX_INTROSET_SIZE)(input)?;
            Ok((input, IntroResponse { introset: Some(introset.to_vec()) }))
        } else {
            Ok((input, IntroResponse { introset: None }))
        }
    }
}

impl ToBytes for IntroResponse {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(self.introset.is_some() as u8) >>
            gen_call!(|buf: (&'a mut [u8], usize), set: &Option<Vec<u8>>| match set {
                Some(set) if set.len() <= MAX_INTROSET_SIZE => do_gen!(buf, gen_slice!(set.as_slice())),
                Some(_) => gen_error(buf, 0),
                None => Ok(buf),
            }, &self.introset)
        )
    }
}

/** Publish an introset blob at a location key.

Serialized form:

Length   | Content
-------- | ------
`32`     | Location key
variable | Introset blob

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublishIntro {
    pub location: [u8; 32],
    pub introset: Vec<u8>,
}

impl FromBytes for PublishIntro {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, location) = <[u8; 32]>::from_bytes(input)?;
        let (input, introset) = verify(rest, |set: &[u8]| set.len() <= MAX_INTROSET_SIZE)(input)?;
        Ok((
            input,
            PublishIntro {
                location,
                introset: introset.to_vec(),
            },
        ))
    }
}

impl ToBytes for PublishIntro {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_cond!(self.introset.len() > MAX_INTROSET_SIZE, |buf| gen_error(buf, 0)) >>
            gen_slice!(self.location.as_ref()) >>
            gen_slice!(self.introset.as_slice())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    encode_decode_test!(
        find_name_encode_decode,
        FindName { name: "mnemonic.veil".to_owned() }
    );

    encode_decode_test!(
        name_response_found_encode_decode,
        NameResponse { rid: Some(RouterId::from_bytes_exact([42; 32])) }
    );

    encode_decode_test!(name_response_missing_encode_decode, NameResponse { rid: None });

    encode_decode_test!(
        publish_intro_encode_decode,
        PublishIntro {
            location: [42; 32],
            introset: vec![1, 2, 3],
        }
    );

    encode_decode_test!(
        intro_response_encode_decode,
        IntroResponse { introset: Some(vec![1, 2, 3]) }
    );

    #[test]
    fn oversized_introset_rejected() {
        let publish = PublishIntro {
            location: [0; 32],
            introset: vec![0; MAX_INTROSET_SIZE + 1],
        };
        let mut buf = vec![0; MAX_INTROSET_SIZE * 2];
        assert!(publish.to_bytes((&mut buf, 0)).is_err());
    }
}
