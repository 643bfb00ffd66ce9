/*! Router contact: the signed, versioned descriptor of one relay.

Serialized form (canonical, 156 bytes):

Length | Content
------ | ------
`1`    | Format version (`0x00`)
`32`   | `RouterId` (Ed25519 verifying key)
`32`   | Encryption `PublicKey` (X25519)
`1`    | Address family (`0x04` or `0x06`)
`16`   | IP address bytes (IPv4 in the first 4 bytes, rest zero)
`2`    | Port
`8`    | Unix timestamp in seconds
`64`   | Ed25519 signature over everything above

A contact is content-addressed by its `RouterId`; a stored contact is only
replaced by a strictly newer valid one.
*/

use std::fs;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cookie_factory::{do_gen, gen_be_u16, gen_be_u64, gen_be_u8, gen_call, gen_slice};
use nom::number::streaming::{be_u16, be_u64, be_u8};
use nom::IResult;
use thiserror::Error;

use veil_binary_io::*;
use veil_crypto::identity::{self, Signature, SigningKey};
use veil_crypto::PublicKey;

use crate::ids::RouterId;

/// Current contact format version.
pub const RC_VERSION: u8 = 0;

/// Length in bytes of a serialized contact.
pub const RC_SIZE: usize = 1 + 32 + 32 + 1 + 16 + 2 + 8 + 64;

/// Hard upper bound when reading a contact from disk.
pub const MAX_RC_SIZE: usize = 1024;

/// How long a contact stays valid after its timestamp.
pub const RC_LIFETIME: Duration = Duration::from_secs(3600);

/// Tolerated clock skew for contacts stamped in the future.
pub const RC_MAX_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Whether to accept contacts advertising non-routable addresses. Relays
/// reject them; tests and client-role descriptors allow them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressPolicy {
    RejectBogons,
    AllowBogons,
}

/// Error that can happen when parsing or verifying a contact.
#[derive(Debug, Error)]
pub enum RcError {
    /// Bytes fail structural parsing or carry an unknown version.
    #[error("Bytes fail structural parsing or carry an unknown version")]
    Malformed,
    /// Signature does not verify under the advertised router id.
    #[error("Signature does not verify under the advertised router id")]
    BadSignature,
    /// Contact is past its expiry or stamped too far in the future.
    #[error("Contact is past its expiry or stamped too far in the future")]
    Expired,
    /// Contact advertises a non-routable address and policy forbids it.
    #[error("Contact advertises a non-routable address and policy forbids it")]
    Bogon,
    /// Disk read failed or exceeded the size cap.
    #[error("Disk read failed or exceeded the size cap")]
    Io(io::Error),
}

/// Check if an address belongs to a non-routable range.
pub fn is_bogon(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => {
            ip.is_unspecified()
                || ip.is_loopback()
                || ip.is_private()
                || ip.is_link_local()
                || ip.is_multicast()
                || ip.is_broadcast()
        }
        IpAddr::V6(ip) => ip.is_unspecified() || ip.is_loopback() || ip.is_multicast(),
    }
}

/// Signed descriptor of one relay.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouterContact {
    /// Identity the contact is signed under.
    pub rid: RouterId,
    /// Static key path build records are sealed to.
    pub enc_pk: PublicKey,
    /// Advertised network address.
    pub addr: SocketAddr,
    /// Unix timestamp in seconds. Monotonic per router.
    pub timestamp: u64,
    /// Signature over the canonical serialization minus this field.
    pub signature: Signature,
}

fn ip_to_bytes(addr: &SocketAddr) -> (u8, [u8; 16]) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            let mut bytes = [0; 16];
            bytes[..4].copy_from_slice(&ip.octets());
            (4, bytes)
        }
        IpAddr::V6(ip) => (6, ip.octets()),
    }
}

fn ip_from_bytes(family: u8, bytes: [u8; 16], port: u16) -> Option<SocketAddr> {
    match family {
        4 => {
            let mut octets = [0; 4];
            octets.copy_from_slice(&bytes[..4]);
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        6 => Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(bytes)), port)),
        _ => None,
    }
}

impl FromBytes for RouterContact {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = nom::bytes::streaming::tag(&[RC_VERSION][..])(input)?;
        let (input, rid) = RouterId::from_bytes(input)?;
        let (input, enc_pk) = veil_crypto::public_key_from_bytes(input)?;
        let (input, family) = be_u8(input)?;
        let (input, ip) = <[u8; 16]>::from_bytes(input)?;
        let (input, port) = be_u16(input)?;
        let addr = match ip_from_bytes(family, ip, port) {
            Some(addr) => addr,
            None => return Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify))),
        };
        let (input, timestamp) = be_u64(input)?;
        let (input, sig) = <[u8; 64]>::from_bytes(input)?;
        Ok((
            input,
            RouterContact {
                rid,
                enc_pk,
                addr,
                timestamp,
                signature: Signature::from_bytes(&sig),
            },
        ))
    }
}

impl ToBytes for RouterContact {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_call!(|buf, rc| RouterContact::signable_to_bytes(rc, buf), self) >>
            gen_slice!(self.signature.to_bytes().as_ref())
        )
    }
}

impl RouterContact {
    fn signable_to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        let (family, ip) = ip_to_bytes(&self.addr);
        do_gen!(buf,
            gen_be_u8!(RC_VERSION) >>
            gen_slice!(self.rid.as_bytes().as_ref()) >>
            gen_slice!(self.enc_pk.as_bytes()) >>
            gen_be_u8!(family) >>
            gen_slice!(ip.as_ref()) >>
            gen_be_u16!(self.addr.port()) >>
            gen_be_u64!(self.timestamp)
        )
    }

    fn signable_bytes(&self) -> Vec<u8> {
        let mut buf = [0; RC_SIZE];
        // fixed-size buffer always fits the signable region
        let (_, size) = self.signable_to_bytes((&mut buf, 0)).unwrap();
        buf[..size].to_vec()
    }

    /// Create a contact for `addr` signed with `sk`, stamped `timestamp`
    /// (unix seconds).
    pub fn new_signed(sk: &SigningKey, enc_pk: PublicKey, addr: SocketAddr, timestamp: u64) -> RouterContact {
        let mut rc = RouterContact {
            rid: sk.verifying_key().into(),
            enc_pk,
            addr,
            timestamp,
            signature: Signature::from_bytes(&[0; 64]),
        };
        rc.signature = sk.sign(&rc.signable_bytes());
        rc
    }

    /// Canonical serialized bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = [0; RC_SIZE];
        // fixed-size buffer always fits
        let (_, size) = self.to_bytes((&mut buf, 0)).unwrap();
        buf[..size].to_vec()
    }

    /// Parse and fully validate a contact against `now` (unix seconds) and
    /// the address policy.
    pub fn parse(bytes: &[u8], now: u64, policy: AddressPolicy) -> Result<RouterContact, RcError> {
        let (rest, rc) = RouterContact::from_bytes(bytes).map_err(|_| RcError::Malformed)?;
        if !rest.is_empty() {
            return Err(RcError::Malformed);
        }
        rc.verify()?;
        if rc.timestamp > now + RC_MAX_CLOCK_SKEW.as_secs() || rc.is_expired(now) {
            return Err(RcError::Expired);
        }
        if policy == AddressPolicy::RejectBogons && is_bogon(rc.addr.ip()) {
            return Err(RcError::Bogon);
        }
        Ok(rc)
    }

    /// Check the signature under the advertised router id.
    pub fn verify(&self) -> Result<(), RcError> {
        let pk = self.rid.verifying_key().ok_or(RcError::BadSignature)?;
        if identity::verify(&pk, &self.signable_bytes(), &self.signature) {
            Ok(())
        } else {
            Err(RcError::BadSignature)
        }
    }

    /// Unix second at which the contact stops being valid.
    pub fn expires_at(&self) -> u64 {
        self.timestamp + RC_LIFETIME.as_secs()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at() < now
    }

    /// Read canonical bytes from disk, capped at [`MAX_RC_SIZE`].
    pub fn read_file<P: AsRef<Path>>(path: P, policy: AddressPolicy) -> Result<RouterContact, RcError> {
        let file = fs::File::open(path).map_err(RcError::Io)?;
        let mut bytes = Vec::with_capacity(RC_SIZE);
        file.take(MAX_RC_SIZE as u64 + 1)
            .read_to_end(&mut bytes)
            .map_err(RcError::Io)?;
        if bytes.len() > MAX_RC_SIZE {
            return Err(RcError::Malformed);
        }
        RouterContact::parse(&bytes, unix_now(), policy)
    }

    /// Write exactly the canonical bytes.
    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<(), RcError> {
        fs::write(path, self.serialize()).map_err(RcError::Io)
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Current time is earlier than unix epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    use veil_crypto::SecretKey;

    fn sample_rc(addr: &str, timestamp: u64) -> RouterContact {
        let sk = SigningKey::generate();
        let enc_pk = SecretKey::generate(&mut rand::thread_rng()).public_key();
        RouterContact::new_signed(&sk, enc_pk, addr.parse().unwrap(), timestamp)
    }

    #[test]
    fn serialize_parse_roundtrip() {
        let rc = sample_rc("203.0.113.7:9000", 1000);
        let bytes = rc.serialize();

        assert_eq!(bytes.len(), RC_SIZE);
        let parsed = RouterContact::parse(&bytes, 1010, AddressPolicy::RejectBogons).unwrap();
        assert_eq!(parsed, rc);
        assert_eq!(parsed.serialize(), bytes);
    }

    #[test]
    fn any_mutation_fails_verification() {
        let rc = sample_rc("203.0.113.7:9000", 1000);
        let bytes = rc.serialize();

        for i in 0..bytes.len() {
            let mut mutated = bytes.clone();
            mutated[i] ^= 0x01;
            assert!(
                RouterContact::parse(&mutated, 1010, AddressPolicy::AllowBogons).is_err(),
                "mutation at byte {} was accepted",
                i
            );
        }
    }

    #[test]
    fn expired_rejected() {
        let rc = sample_rc("203.0.113.7:9000", 1000);
        let now = 1000 + RC_LIFETIME.as_secs() + 1;

        assert!(matches!(
            RouterContact::parse(&rc.serialize(), now, AddressPolicy::RejectBogons),
            Err(RcError::Expired)
        ));
    }

    #[test]
    fn future_stamp_rejected() {
        let rc = sample_rc("203.0.113.7:9000", 10_000);
        let now = 10_000 - RC_MAX_CLOCK_SKEW.as_secs() - 10;

        assert!(matches!(
            RouterContact::parse(&rc.serialize(), now, AddressPolicy::RejectBogons),
            Err(RcError::Expired)
        ));
    }

    #[test]
    fn bogon_policy() {
        let rc = sample_rc("127.0.0.1:9000", 1000);
        let bytes = rc.serialize();

        assert!(matches!(
            RouterContact::parse(&bytes, 1010, AddressPolicy::RejectBogons),
            Err(RcError::Bogon)
        ));
        assert!(RouterContact::parse(&bytes, 1010, AddressPolicy::AllowBogons).is_ok());
    }

    #[test]
    fn ipv6_roundtrip() {
        let rc = sample_rc("[2001:db8::7]:9000", 1000);
        let parsed = RouterContact::parse(&rc.serialize(), 1010, AddressPolicy::AllowBogons).unwrap();
        assert_eq!(parsed.addr, rc.addr);
    }

    #[test]
    fn bogon_ranges() {
        assert!(is_bogon("127.0.0.1".parse().unwrap()));
        assert!(is_bogon("10.1.2.3".parse().unwrap()));
        assert!(is_bogon("192.168.0.1".parse().unwrap()));
        assert!(is_bogon("0.0.0.0".parse().unwrap()));
        assert!(is_bogon("::1".parse().unwrap()));
        assert!(!is_bogon("203.0.113.7".parse().unwrap()));
    }
}
