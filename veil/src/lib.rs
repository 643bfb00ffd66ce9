//! This crate re-exports all veil crates.

pub use veil_binary_io as binary_io;
pub use veil_core as core;
pub use veil_crypto as crypto;
pub use veil_packet as packet;

pub fn crate_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
