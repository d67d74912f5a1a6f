//! SOCKS4/4a/5 protocol engine
//!
//! Server- and client-role handshakes plus the UDP relay codec. The engine
//! operates on any async byte stream; it owns no sockets and performs no
//! dialing of its own.

pub mod addr;
pub mod client;
pub mod consts;
pub mod server;
pub mod udp;

pub use client::client_handshake;
pub use server::ServerSession;
pub use udp::{decode_udp_packet, encode_udp_packet, UdpReader, UdpWriter};
