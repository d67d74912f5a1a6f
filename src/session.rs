//! Session context and normalized request descriptors
//!
//! A `SessionContext` carries what the dispatch layer needs to know about one
//! flow: the inbound record (authenticated user, connection addresses), an
//! ordered stack of outbound records (one per chained hop), a cancellation
//! token, and a channel for reporting outbound errors back to the flow's
//! originator.
//!
//! Identity flows one direction only: handshake -> session -> egress policy.
//! An authenticated username attached to a `RequestHeader` is never
//! overwritten lower in the stack.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::OutboundError;
use crate::net::{Address, Destination, Network};

/// An authenticated user identity attached to a flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Identity string (username or email); may be empty for key auth
    pub email: String,
}

impl User {
    /// Create a user record from an identity string
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
        }
    }
}

/// Request command produced by the handshake engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCommand {
    /// TCP CONNECT
    Tcp,
    /// UDP ASSOCIATE
    Udp,
}

impl RequestCommand {
    /// The network a request of this command targets
    #[must_use]
    pub const fn network(self) -> Network {
        match self {
            Self::Tcp => Network::Tcp,
            Self::Udp => Network::Udp,
        }
    }
}

/// Normalized handshake result
#[derive(Debug, Clone)]
pub struct RequestHeader {
    /// Protocol version that produced this request (4 or 5 for SOCKS)
    pub version: u8,
    /// CONNECT or UDP ASSOCIATE
    pub command: RequestCommand,
    /// Target address
    pub address: Address,
    /// Target port
    pub port: u16,
    /// Authenticated identity, if the handshake performed authentication
    pub user: Option<User>,
}

impl RequestHeader {
    /// Build the destination this request targets
    #[must_use]
    pub fn destination(&self) -> Destination {
        Destination {
            network: self.command.network(),
            address: self.address.clone(),
            port: self.port,
        }
    }
}

/// Observability info about a live outbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnInfo {
    /// Local (source) address of the dialed connection
    pub local: Option<SocketAddr>,
    /// Remote (peer) address of the dialed connection
    pub peer: Option<SocketAddr>,
}

/// Inbound side of a session
#[derive(Debug, Clone, Default)]
pub struct InboundRecord {
    /// Authenticated user, if any
    pub user: Option<User>,
    /// Local address of the inbound connection
    pub local_addr: Option<SocketAddr>,
    /// Remote (client) address of the inbound connection
    pub peer_addr: Option<SocketAddr>,
}

/// One outbound hop of a session
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    /// Resolved target destination
    pub target: Destination,
    /// Pre-NAT destination when address translation occurred upstream
    pub original_target: Option<Destination>,
    /// Egress/source address hint for the transport dialer
    pub gateway: Option<Address>,
    /// Handler tag that serves this hop (set when chaining)
    pub tag: Option<String>,
    /// Live connection info, recorded after a successful direct dial
    pub conn: Option<ConnInfo>,
}

impl OutboundRecord {
    /// Create a record for a target with no overrides
    #[must_use]
    pub fn new(target: Destination) -> Self {
        Self {
            target,
            original_target: None,
            gateway: None,
            tag: None,
            conn: None,
        }
    }

    /// Create a record for a chained hop
    #[must_use]
    pub fn chained(target: Destination, tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            ..Self::new(target)
        }
    }
}

struct Inner {
    inbound: Option<InboundRecord>,
    outbounds: Vec<OutboundRecord>,
}

/// Per-flow session context shared between the inbound edge and the
/// outbound dispatch layer.
pub struct SessionContext {
    inner: Mutex<Inner>,
    cancel: CancellationToken,
    error_tx: Mutex<Option<mpsc::UnboundedSender<OutboundError>>>,
}

impl SessionContext {
    /// Create an empty session context
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                inbound: None,
                outbounds: Vec::new(),
            }),
            cancel: CancellationToken::new(),
            error_tx: Mutex::new(None),
        })
    }

    /// Attach the inbound record
    pub fn set_inbound(&self, inbound: InboundRecord) {
        self.inner.lock().inbound = Some(inbound);
    }

    /// Get a copy of the inbound record
    #[must_use]
    pub fn inbound(&self) -> Option<InboundRecord> {
        self.inner.lock().inbound.clone()
    }

    /// Append an outbound record
    pub fn push_outbound(&self, record: OutboundRecord) {
        self.inner.lock().outbounds.push(record);
    }

    /// Get a copy of the last (innermost) outbound record
    #[must_use]
    pub fn last_outbound(&self) -> Option<OutboundRecord> {
        self.inner.lock().outbounds.last().cloned()
    }

    /// Set the egress gateway hint on the last outbound record
    pub fn set_gateway(&self, gateway: Address) {
        if let Some(ob) = self.inner.lock().outbounds.last_mut() {
            ob.gateway = Some(gateway);
        }
    }

    /// Get the gateway hint of the last outbound record
    #[must_use]
    pub fn gateway(&self) -> Option<Address> {
        self.inner
            .lock()
            .outbounds
            .last()
            .and_then(|ob| ob.gateway.clone())
    }

    /// Record connection info on the last outbound record
    pub fn set_conn_info(&self, info: ConnInfo) {
        if let Some(ob) = self.inner.lock().outbounds.last_mut() {
            ob.conn = Some(info);
        }
    }

    /// Create a child context for a chained dispatch: the outbound record
    /// stack is copied and extended so the caller's view is unchanged, while
    /// the inbound record, cancellation token, and error channel are shared.
    #[must_use]
    pub fn child_with_outbound(&self, record: OutboundRecord) -> Arc<Self> {
        let inner = self.inner.lock();
        let mut outbounds = inner.outbounds.clone();
        outbounds.push(record);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                inbound: inner.inbound.clone(),
                outbounds,
            }),
            cancel: self.cancel.clone(),
            error_tx: Mutex::new(self.error_tx.lock().clone()),
        })
    }

    /// Install the originator's error channel
    pub fn set_error_reporter(&self, tx: mpsc::UnboundedSender<OutboundError>) {
        *self.error_tx.lock() = Some(tx);
    }

    /// Report an outbound error to the flow's originator, if one listens.
    /// Best-effort: a closed channel is ignored.
    pub fn submit_outbound_error(&self, err: OutboundError) {
        if let Some(tx) = self.error_tx.lock().as_ref() {
            let _ = tx.send(err);
        }
    }

    /// The flow's cancellation token
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the flow
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the flow has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SessionContext")
            .field("inbound", &inner.inbound)
            .field("outbounds", &inner.outbounds.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_destination() {
        let header = RequestHeader {
            version: 5,
            command: RequestCommand::Udp,
            address: Address::parse("8.8.8.8"),
            port: 53,
            user: None,
        };
        let dest = header.destination();
        assert_eq!(dest.network, Network::Udp);
        assert_eq!(dest.port, 53);
    }

    #[test]
    fn test_outbound_record_stack() {
        let ctx = SessionContext::new();
        assert!(ctx.last_outbound().is_none());

        ctx.push_outbound(OutboundRecord::new(Destination::tcp(
            Address::parse("1.1.1.1"),
            443,
        )));
        ctx.set_gateway(Address::parse("10.0.0.2"));

        let ob = ctx.last_outbound().unwrap();
        assert_eq!(ob.gateway, Some(Address::parse("10.0.0.2")));
    }

    #[test]
    fn test_child_context_isolation() {
        let ctx = SessionContext::new();
        ctx.push_outbound(OutboundRecord::new(Destination::tcp(
            Address::parse("1.1.1.1"),
            443,
        )));

        let child = ctx.child_with_outbound(OutboundRecord::chained(
            Destination::tcp(Address::parse("1.1.1.1"), 443),
            "upstream",
        ));

        // The child sees the appended record, the parent does not.
        assert_eq!(child.last_outbound().unwrap().tag.as_deref(), Some("upstream"));
        assert!(ctx.last_outbound().unwrap().tag.is_none());

        // Cancellation is shared.
        ctx.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_error_reporting() {
        let ctx = SessionContext::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        ctx.set_error_reporter(tx);

        ctx.submit_outbound_error(OutboundError::PolicyRejected);
        assert!(matches!(
            rx.try_recv(),
            Ok(OutboundError::PolicyRejected)
        ));

        // Shared with child contexts.
        ctx.push_outbound(OutboundRecord::new(Destination::udp(
            Address::parse("1.1.1.1"),
            443,
        )));
        let child = ctx.child_with_outbound(OutboundRecord::new(Destination::udp(
            Address::parse("1.1.1.1"),
            443,
        )));
        child.submit_outbound_error(OutboundError::PolicyRejected);
        assert!(rx.try_recv().is_ok());
    }
}
