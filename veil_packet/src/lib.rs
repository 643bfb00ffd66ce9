//! Wire packets of the veil overlay.
//!
//! Every struct here documents its canonical serialized form and implements
//! `FromBytes`/`ToBytes`. Serialization is deterministic: fixed field order,
//! fixed-width integers in big-endian, length-prefixed variable fields.

#![forbid(unsafe_code)]

pub mod contact;
pub mod dht;
pub mod errors;
pub mod exit;
pub mod gossip;
pub mod ids;
pub mod link;
pub mod onion;

pub use crate::ids::*;
