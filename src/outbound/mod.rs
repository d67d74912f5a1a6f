//! Outbound dispatch layer
//!
//! An [`OutboundHandler`] owns one named outbound route's dial and dispatch
//! policy. The [`HandlerManager`] registers handlers by tag; chained dials
//! look their upstream up through it.

pub mod egress;
pub mod handler;
pub mod manager;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::OutboundError;
use crate::link::Link;
use crate::session::SessionContext;
use crate::transport::Dialer;

pub use egress::EgressPolicy;
pub use handler::{HandlerCapabilities, OutboundHandler};
pub use manager::HandlerManager;

/// A wrapped outbound proxy protocol.
///
/// `process` drives one flow: it dials through the handed-in dialer, speaks
/// its protocol, and pumps the link until the flow ends. Termination of the
/// link itself is the dispatcher's job, not the protocol's.
#[async_trait]
pub trait ProxyOutbound: Send + Sync {
    /// Process one flow
    async fn process(
        &self,
        ctx: &Arc<SessionContext>,
        link: &mut Link,
        dialer: &dyn Dialer,
    ) -> Result<(), OutboundError>;

    /// Release protocol-held resources, best-effort
    async fn close(&self) {}
}
