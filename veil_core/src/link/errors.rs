//! Errors of the link layer.

use thiserror::Error;

/// Error that can happen when sending a packet on a connection.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum SendPacketError {
    /// Connection is closed.
    #[error("Connection is closed")]
    Closed,
    /// Best-effort send queue is full.
    #[error("Best-effort send queue is full")]
    QueueFull,
    /// Packet failed to serialize.
    #[error("Packet failed to serialize")]
    Serialize,
}

/// Error a command handler reports. Sent back to the requester as an error
/// response on the same stream.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum HandlerError {
    /// Request body failed to parse.
    #[error("malformed request")]
    Malformed,
    /// No handler registered under the requested endpoint name.
    #[error("unknown endpoint")]
    UnknownEndpoint,
    /// Handler refused the request.
    #[error("{0}")]
    Refused(String),
}

/// Error that can happen when submitting a control request or datagram via
/// the link manager.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum SendError {
    /// Refusing to address ourselves.
    #[error("Refusing to address ourselves")]
    SelfSend,
    /// Body failed to serialize.
    #[error("Body failed to serialize")]
    Serialize,
}
