//! relay-router: outbound traffic dispatch and SOCKS protocol engine
//!
//! Given an already-accepted inbound connection and a resolved target
//! destination, this crate decides how to reach that destination: directly,
//! through a chained upstream handler, through a multiplexing session pool,
//! or via policy-driven source-address selection. It also implements the
//! byte-exact SOCKS4/4a/5 handshakes (server and client roles) and the
//! SOCKS UDP relay framing that let SOCKS clients originate such flows.
//!
//! # Architecture
//!
//! - [`socks`] — the handshake engine and UDP codec, operating on any async
//!   byte stream; produces a normalized [`session::RequestHeader`].
//! - [`outbound`] — per-route [`outbound::OutboundHandler`]s registered in a
//!   [`outbound::HandlerManager`]; each owns its mux pools, egress policy,
//!   and traffic counters.
//! - [`link`] — the chunk-stream flow abstraction shared by both: pipes,
//!   adapters, and the close/interrupt termination protocol.
//!
//! External concerns (transport dialing, stats, system policy, mux framing)
//! are consumed as constructor-injected capability traits in [`transport`],
//! [`stats`], and [`mux`].

#![warn(clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

pub mod config;
pub mod error;
pub mod link;
pub mod mux;
pub mod net;
pub mod outbound;
pub mod session;
pub mod socks;
pub mod stats;
pub mod transport;

pub use error::{Result, RouterError};
pub use net::{Address, Destination, Network};
pub use outbound::{HandlerCapabilities, HandlerManager, OutboundHandler, ProxyOutbound};
pub use session::{RequestHeader, SessionContext};
pub use socks::ServerSession;
