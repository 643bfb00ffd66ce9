/*! Exit negotiation bodies. Each request is signed by the client identity
that wants the flow, so the serving router can hold it to its grants.
*/

use cookie_factory::{do_gen, gen_be_u64, gen_be_u8, gen_call, gen_slice};
use nom::number::streaming::{be_u64, be_u8};
use nom::IResult;

use veil_binary_io::*;
use veil_crypto::identity::{self, Signature, SigningKey};

use crate::ids::{RouterId, SessionTag};

/// Endpoint name for requesting an exit flow.
pub const OBTAIN_EXIT_ENDPOINT: &str = "obtain_exit";
/// Endpoint name for refreshing an exit flow.
pub const UPDATE_EXIT_ENDPOINT: &str = "update_exit";
/// Endpoint name for closing an exit flow.
pub const CLOSE_EXIT_ENDPOINT: &str = "close_exit";

/** Request to open an exit flow.

Serialized form:

Length | Content
------ | ------
`32`   | Client `RouterId` the grant is held for
`8`    | Flag bits (reserved, `0` today)
`16`   | Flow tag
`64`   | Signature over everything above

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObtainExit {
    /// Identity requesting the flow.
    pub pubkey: RouterId,
    /// Reserved flag bits.
    pub flag: u64,
    /// Tag naming the flow in follow-up requests.
    pub tx_id: SessionTag,
    /// Signature under `pubkey`.
    pub signature: Signature,
}

impl FromBytes for ObtainExit {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, pubkey) = RouterId::from_bytes(input)?;
        let (input, flag) = be_u64(input)?;
        let (input, tx_id) = SessionTag::from_bytes(input)?;
        let (input, sig) = <[u8; 64]>::from_bytes(input)?;
        Ok((
            input,
            ObtainExit {
                pubkey,
                flag,
                tx_id,
                signature: Signature::from_bytes(&sig),
            },
        ))
    }
}

impl ToBytes for ObtainExit {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_call!(|buf, obtain| ObtainExit::signable_to_bytes(obtain, buf), self) >>
            gen_slice!(self.signature.to_bytes().as_ref())
        )
    }
}

impl ObtainExit {
    fn signable_to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_call!(|buf, pubkey| RouterId::to_bytes(pubkey, buf), &self.pubkey) >>
            gen_be_u64!(self.flag) >>
            gen_call!(|buf, tx_id| SessionTag::to_bytes(tx_id, buf), &self.tx_id)
        )
    }

    fn signable_bytes(&self) -> Vec<u8> {
        let mut buf = [0; 64];
        // fixed-size fields always fit
        let (_, size) = self.signable_to_bytes((&mut buf, 0)).unwrap();
        buf[..size].to_vec()
    }

    /// Build and sign a request with `sk`.
    pub fn new_signed(sk: &SigningKey, flag: u64, tx_id: SessionTag) -> ObtainExit {
        let mut msg = ObtainExit {
            pubkey: sk.verifying_key().into(),
            flag,
            tx_id,
            signature: Signature::from_bytes(&[0; 64]),
        };
        msg.signature = sk.sign(&msg.signable_bytes());
        msg
    }

    /// Check the signature under the embedded identity.
    pub fn verify(&self) -> bool {
        match self.pubkey.verifying_key() {
            Some(pk) => identity::verify(&pk, &self.signable_bytes(), &self.signature),
            None => false,
        }
    }
}

/** Request to refresh or close an existing flow, signed by the identity
that obtained it.

Serialized form:

Length | Content
------ | ------
`16`   | Flow tag
`64`   | Signature over the tag

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExitFlowRequest {
    /// Tag of the flow being refreshed or closed.
    pub tx_id: SessionTag,
    /// Signature under the identity the flow was granted to.
    pub signature: Signature,
}

impl FromBytes for ExitFlowRequest {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, tx_id) = SessionTag::from_bytes(input)?;
        let (input, sig) = <[u8; 64]>::from_bytes(input)?;
        Ok((
            input,
            ExitFlowRequest {
                tx_id,
                signature: Signature::from_bytes(&sig),
            },
        ))
    }
}

impl ToBytes for ExitFlowRequest {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_call!(|buf, tx_id| SessionTag::to_bytes(tx_id, buf), &self.tx_id) >>
            gen_slice!(self.signature.to_bytes().as_ref())
        )
    }
}

impl ExitFlowRequest {
    /// Build and sign a refresh/close request with `sk`.
    pub fn new_signed(sk: &SigningKey, tx_id: SessionTag) -> ExitFlowRequest {
        ExitFlowRequest {
            tx_id,
            signature: sk.sign(tx_id.as_bytes()),
        }
    }

    /// Check the signature under the identity the flow belongs to.
    pub fn verify(&self, owner: &RouterId) -> bool {
        match owner.verifying_key() {
            Some(pk) => identity::verify(&pk, self.tx_id.as_bytes(), &self.signature),
            None => false,
        }
    }
}

/// Verdict of an exit request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitStatus {
    /// Flow granted.
    Granted = 0,
    /// Flow refreshed.
    Updated = 1,
    /// Flow closed.
    Closed = 2,
    /// Request refused (bad signature, unknown flow, policy).
    Rejected = 3,
}

impl FromBytes for ExitStatus {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, status) = be_u8(input)?;
        let status = match status {
            0 => ExitStatus::Granted,
            1 => ExitStatus::Updated,
            2 => ExitStatus::Closed,
            3 => ExitStatus::Rejected,
            _ => return Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Switch))),
        };
        Ok((input, status))
    }
}

impl ToBytes for ExitStatus {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf, gen_be_u8!(*self as u8))
    }
}

impl ExitStatus {
    pub fn serialize(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::thread_rng;

    encode_decode_test!(exit_status_encode_decode, ExitStatus::Granted);

    #[test]
    fn obtain_exit_sign_verify() {
        let sk = SigningKey::generate();
        let msg = ObtainExit::new_signed(&sk, 0, SessionTag::random(&mut thread_rng()));

        assert!(msg.verify());
    }

    #[test]
    fn obtain_exit_tamper_detected() {
        let sk = SigningKey::generate();
        let mut msg = ObtainExit::new_signed(&sk, 0, SessionTag::random(&mut thread_rng()));
        msg.flag = 1;

        assert!(!msg.verify());
    }

    #[test]
    fn obtain_exit_roundtrip() {
        let sk = SigningKey::generate();
        let msg = ObtainExit::new_signed(&sk, 7, SessionTag::random(&mut thread_rng()));

        let mut buf = [0; 256];
        let (_, size) = msg.to_bytes((&mut buf, 0)).unwrap();
        let (rest, parsed) = ObtainExit::from_bytes(&buf[..size]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, msg);
        assert!(parsed.verify());
    }

    #[test]
    fn flow_request_verify_owner() {
        let owner = SigningKey::generate();
        let other = SigningKey::generate();
        let tag = SessionTag::random(&mut thread_rng());
        let msg = ExitFlowRequest::new_signed(&owner, tag);

        assert!(msg.verify(&owner.verifying_key().into()));
        assert!(!msg.verify(&other.verifying_key().into()));
    }
}
