/*! Gossip and fetch bodies: how routers spread and request contacts.

These are control-request bodies; the endpoint name routes them, so they
carry no kind tags of their own.
*/

use cookie_factory::{do_gen, gen_be_u16, gen_be_u64, gen_be_u8, gen_call, gen_cond, gen_many_ref, gen_slice};
use nom::combinator::cond;
use nom::multi::count;
use nom::number::streaming::{be_u16, be_u64, be_u8};
use nom::IResult;

use veil_binary_io::*;

use crate::contact::RouterContact;
use crate::ids::RouterId;

/// Endpoint name for RC gossip.
pub const GOSSIP_RC_ENDPOINT: &str = "gossip_rc";
/// Endpoint name for explicit RC fetches.
pub const FETCH_RCS_ENDPOINT: &str = "fetch_rcs";
/// Endpoint name for router-id fetches.
pub const FETCH_RIDS_ENDPOINT: &str = "fetch_rids";
/// Endpoint name for bootstrap RC fetches.
pub const FETCH_BOOTSTRAP_ENDPOINT: &str = "bfetch_rcs";

/// Most contacts a single fetch response will carry.
pub const MAX_FETCH_RCS: usize = 64;
/// Most router ids a single fetch response will carry.
pub const MAX_FETCH_RIDS: usize = 256;

/** Gossiped contact with the id of the router it was last relayed by, so
receivers do not echo it straight back.

Serialized form:

Length   | Content
-------- | ------
`32`     | `RouterId` of the last sender
`156`    | The gossiped contact

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GossipRc {
    /// Who relayed the contact to us.
    pub sender: RouterId,
    /// The gossiped contact.
    pub rc: RouterContact,
}

impl FromBytes for GossipRc {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, sender) = RouterId::from_bytes(input)?;
        let (input, rc) = RouterContact::from_bytes(input)?;
        Ok((input, GossipRc { sender, rc }))
    }
}

impl ToBytes for GossipRc {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_call!(|buf, sender| RouterId::to_bytes(sender, buf), &self.sender) >>
            gen_call!(|buf, rc| RouterContact::to_bytes(rc, buf), &self.rc)
        )
    }
}

/** Request for the contacts of explicitly named routers, filtered to those
newer than `since`.

Serialized form:

Length   | Content
-------- | ------
`8`      | Unix second; only strictly newer contacts are returned
`2`      | Number of requested ids
variable | Requested `RouterId`s

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FetchRcs {
    /// Only contacts stamped strictly after this unix second are wanted.
    pub since: u64,
    /// Routers whose contacts are requested.
    pub explicit_ids: Vec<RouterId>,
}

impl FromBytes for FetchRcs {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, since) = be_u64(input)?;
        let (input, n) = be_u16(input)?;
        let (input, explicit_ids) = count(RouterId::from_bytes, n as usize)(input)?;
        Ok((input, FetchRcs { since, explicit_ids }))
    }
}

impl ToBytes for FetchRcs {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u64!(self.since) >>
            gen_be_u16!(self.explicit_ids.len() as u16) >>
            gen_many_ref!(&self.explicit_ids, |buf, id| RouterId::to_bytes(id, buf))
        )
    }
}

/** Bundle of contacts answering a fetch.

Serialized form:

Length   | Content
-------- | ------
`2`      | Number of contacts
variable | Serialized contacts

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RcBundle {
    pub rcs: Vec<RouterContact>,
}

impl FromBytes for RcBundle {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, n) = nom::combinator::verify(be_u16, |n| *n as usize <= MAX_FETCH_RCS)(input)?;
        let (input, rcs) = count(RouterContact::from_bytes, n as usize)(input)?;
        Ok((input, RcBundle { rcs }))
    }
}

impl ToBytes for RcBundle {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_cond!(self.rcs.len() > MAX_FETCH_RCS, |buf| gen_error(buf, 0)) >>
            gen_be_u16!(self.rcs.len() as u16) >>
            gen_many_ref!(&self.rcs, |buf, rc| RouterContact::to_bytes(rc, buf))
        )
    }
}

/** Bundle of router ids answering a `fetch_rids` request.

Serialized form:

Length   | Content
-------- | ------
`2`      | Number of ids
variable | `RouterId`s

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RidBundle {
    pub rids: Vec<RouterId>,
}

impl FromBytes for RidBundle {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, n) = nom::combinator::verify(be_u16, |n| *n as usize <= MAX_FETCH_RIDS)(input)?;
        let (input, rids) = count(RouterId::from_bytes, n as usize)(input)?;
        Ok((input, RidBundle { rids }))
    }
}

impl ToBytes for RidBundle {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_cond!(self.rids.len() > MAX_FETCH_RIDS, |buf| gen_error(buf, 0)) >>
            gen_be_u16!(self.rids.len() as u16) >>
            gen_many_ref!(&self.rids, |buf, rid| RouterId::to_bytes(rid, buf))
        )
    }
}

/** Bootstrap fetch: ask a seed router for up to `quantity` contacts,
optionally introducing our own.

Serialized form:

Length   | Content
-------- | ------
`1`      | `0x01` if a local contact follows, `0x00` otherwise
`156`    | Local contact (only when the flag is set)
`2`      | Requested quantity

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootstrapFetch {
    /// Our own contact, offered to the seed.
    pub local: Option<RouterContact>,
    /// How many contacts we want back.
    pub quantity: u16,
}

impl FromBytes for BootstrapFetch {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, flag) = nom::combinator::verify(be_u8, |flag| *flag <= 1)(input)?;
        let (input, local) = cond(flag == 1, RouterContact::from_bytes)(input)?;
        let (input, quantity) = be_u16(input)?;
        Ok((input, BootstrapFetch { local, quantity }))
    }
}

impl ToBytes for BootstrapFetch {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(self.local.is_some() as u8) >>
            gen_call!(|buf, local: &Option<RouterContact>| match local {
                Some(rc) => RouterContact::to_bytes(rc, buf),
                None => Ok(buf),
            }, &self.local) >>
            gen_be_u16!(self.quantity)
        )
    }
}

/// Serialize any body type into a fresh buffer sized for fetch traffic.
pub fn serialize_body<T: ToBytes>(body: &T) -> Result<Vec<u8>, GenError> {
    let mut buf = vec![0; 1024 * 16];
    let (_, size) = body.to_bytes((&mut buf, 0))?;
    buf.truncate(size);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    use veil_crypto::identity::SigningKey;
    use veil_crypto::SecretKey;

    fn sample_rc() -> RouterContact {
        let sk = SigningKey::generate();
        let enc_pk = SecretKey::generate(&mut rand::thread_rng()).public_key();
        RouterContact::new_signed(&sk, enc_pk, "203.0.113.7:9000".parse().unwrap(), 1000)
    }

    encode_decode_test!(
        fetch_rcs_encode_decode,
        FetchRcs {
            since: 42,
            explicit_ids: vec![RouterId::from_bytes_exact([1; 32]), RouterId::from_bytes_exact([2; 32])],
        }
    );

    encode_decode_test!(
        rid_bundle_encode_decode,
        RidBundle {
            rids: vec![RouterId::from_bytes_exact([1; 32])],
        }
    );

    #[test]
    fn gossip_rc_roundtrip() {
        let gossip = GossipRc {
            sender: RouterId::from_bytes_exact([9; 32]),
            rc: sample_rc(),
        };
        let bytes = serialize_body(&gossip).unwrap();
        let (rest, parsed) = GossipRc::from_bytes(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, gossip);
    }

    #[test]
    fn rc_bundle_roundtrip() {
        let bundle = RcBundle {
            rcs: vec![sample_rc(), sample_rc()],
        };
        let bytes = serialize_body(&bundle).unwrap();
        let (rest, parsed) = RcBundle::from_bytes(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, bundle);
    }

    #[test]
    fn bootstrap_fetch_roundtrip() {
        for local in [None, Some(sample_rc())] {
            let fetch = BootstrapFetch { local, quantity: 8 };
            let bytes = serialize_body(&fetch).unwrap();
            let (rest, parsed) = BootstrapFetch::from_bytes(&bytes).unwrap();
            assert!(rest.is_empty());
            assert_eq!(parsed, fetch);
        }
    }

    #[test]
    fn oversized_bundle_rejected() {
        let bundle = RcBundle {
            rcs: (0..MAX_FETCH_RCS + 1).map(|_| sample_rc()).collect(),
        };
        assert!(serialize_body(&bundle).is_err());
    }
}
