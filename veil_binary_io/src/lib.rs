//! Traits and helpers for binary (de)serialization of wire structs.
//!
//! Parsing is done with `nom`, serialization with `cookie_factory`. Every
//! wire struct in the workspace implements [`FromBytes`] and [`ToBytes`] so
//! codecs and tests can treat them uniformly.

#![forbid(unsafe_code)]

use std::convert::TryInto;

use nom::bytes::streaming::take;
use nom::combinator::map_opt;
use nom::IResult;

pub use cookie_factory::GenError;

/// The trait provides method to deserialize struct from raw bytes.
pub trait FromBytes: Sized {
    /// Deserialize struct using `nom` from raw bytes.
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self>;
}

/// The trait provides method to serialize struct into raw bytes.
pub trait ToBytes: Sized {
    /// Serialize struct into raw bytes using `cookie_factory`.
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError>;
}

/// Fail serialization with a custom error code. Used inside `do_gen!` chains
/// to reject structurally invalid values before any bytes are written.
pub fn gen_error(_buf: (&mut [u8], usize), error: u32) -> Result<(&mut [u8], usize), GenError> {
    Err(GenError::CustomError(error))
}

/// Fail serialization when the written size exceeds `limit`. Used as the last
/// step of `do_gen!` chains for size-capped packets.
pub fn gen_len_limit(buf: (&mut [u8], usize), limit: usize) -> Result<(&mut [u8], usize), GenError> {
    if buf.1 <= limit {
        Ok(buf)
    } else {
        Err(GenError::BufferTooBig(limit))
    }
}

// small sizes used by wire tags, nonces and keys
macro_rules! array_from_bytes (
    ($($len:expr),+ $(,)?) => (
        $(
            impl FromBytes for [u8; $len] {
                fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
                    map_opt(take($len as usize), |bytes: &[u8]| bytes.try_into().ok())(input)
                }
            }
        )+
    );
);

array_from_bytes!(8, 16, 24, 32, 64);

/// Decode helper that infers the target type from a sample reference instead
/// of requiring a turbofish on the trait's associated function.
pub fn decode_like<T: FromBytes>(_sample: &T, input: &[u8]) -> IResult<&[u8], T> {
    T::from_bytes(input)
}

/// Test that a value round-trips through `ToBytes` and `FromBytes` unchanged.
#[macro_export]
macro_rules! encode_decode_test (
    ($test:ident, $value:expr) => (
        #[test]
        fn $test() {
            let value = $value;
            let mut buf = [0; 1024 * 4];
            let (_, size) = value.to_bytes((&mut buf, 0)).unwrap();
            let (rest, decoded) = $crate::decode_from(&buf[..size]).unwrap();
            assert!(rest.is_empty());
            assert_eq!(decoded, value);
        }
    );
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_parse() {
        let bytes = [42; 32];
        let (rest, parsed) = <[u8; 32]>::from_bytes(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, bytes);
    }

    #[test]
    fn array_parse_incomplete() {
        let bytes = [42; 15];
        assert!(matches!(<[u8; 16]>::from_bytes(&bytes), Err(nom::Err::Incomplete(_))));
    }

    #[test]
    fn len_limit() {
        let mut buf = [0; 8];
        assert!(gen_len_limit((&mut buf, 4), 8).is_ok());
        let mut buf = [0; 8];
        assert!(gen_len_limit((&mut buf, 9), 8).is_err());
    }

    #[test]
    fn error_code() {
        let mut buf = [0; 8];
        assert!(matches!(gen_error((&mut buf, 0), 7), Err(GenError::CustomError(7))));
    }
}
