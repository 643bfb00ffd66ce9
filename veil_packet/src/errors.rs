//! Errors shared by packets with encrypted payloads.

use thiserror::Error;

/// Error that can happen when opening an encrypted payload.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum GetPayloadError {
    /// Failed to decrypt payload.
    #[error("Failed to decrypt payload")]
    Decrypt,
    /// Failed to parse decrypted payload.
    #[error("Failed to parse decrypted payload")]
    Deserialize,
}
