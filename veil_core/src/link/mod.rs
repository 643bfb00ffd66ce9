/*! The secure link layer: handshake, per-connection channel and codec, and
the manager owning every open connection.
*/

pub mod codec;
pub mod connection;
pub mod errors;
pub mod handshake;
pub mod manager;
pub mod secure;

pub use self::connection::Connection;
pub use self::handshake::PeerRole;
pub use self::manager::{IncomingPacket, LinkManager, Responder};
