//! Errors of the path layer.

use thiserror::Error;

/// Error that can happen when using a path.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum PathError {
    /// Path is not established yet or failed to build.
    #[error("Path is not established yet or failed to build")]
    NotReady,
    /// Path is past its deadline.
    #[error("Path is past its deadline")]
    Expired,
    /// Frame could not be handed to the link layer.
    #[error("Frame could not be handed to the link layer")]
    LinkFailed,
    /// Payload failed to serialize.
    #[error("Payload failed to serialize")]
    Serialize,
}

/// Error that can happen when mutating the path registry.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ContextError {
    /// A path with the same upstream rx id is already registered.
    #[error("A path with the same upstream rx id is already registered")]
    DuplicatePath,
    /// A transit hop owning one of the two ids is already registered.
    #[error("A transit hop owning one of the two ids is already registered")]
    DuplicateTransit,
}
