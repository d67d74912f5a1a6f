//! Multiplex pool capability and client-manager construction
//!
//! The handler does not implement mux framing; it owns per-handler pool
//! managers built from a [`MuxPoolFactory`] capability. A manager can exist
//! in a disabled state, which is distinct from not existing at all: the UDP
//! pool selection treats "disabled manager" and "no manager" differently.
//!
//! Pool concurrency is tri-state, see [`MultiplexConfig`] for the exact
//! meaning of negative, zero, and positive values.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::MultiplexConfig;
use crate::error::OutboundError;
use crate::link::Link;
use crate::outbound::ProxyOutbound;
use crate::session::SessionContext;
use crate::transport::Dialer;

/// Default per-pool concurrency when the configured value is zero
pub const DEFAULT_CONCURRENCY: u32 = 8;

/// Hard cap on flows multiplexed over one carrier connection
pub const MAX_CONNECTION: u32 = 128;

/// Sizing of one mux worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStrategy {
    /// Concurrent flows per worker
    pub max_concurrency: u32,
    /// Total flows a carrier connection may serve over its lifetime
    pub max_connection: u32,
}

/// A running mux worker pool.
///
/// `dispatch` hands the flow's link to the pool. On failure the link is
/// returned with the error so the caller can terminate it; the pool never
/// keeps a link it failed to take.
#[async_trait]
pub trait MuxPool: Send + Sync {
    /// Submit a flow to the pool
    async fn dispatch(
        &self,
        ctx: &Arc<SessionContext>,
        link: Link,
    ) -> Result<(), (OutboundError, Link)>;

    /// Shut the pool down, terminating carried flows
    async fn close(&self);
}

/// Builds mux pools; injected at handler construction.
///
/// A pool speaks the wrapped proxy protocol over carrier connections it
/// originates through the handed-in dialer, so chaining, egress, and
/// accounting apply to the carriers.
pub trait MuxPoolFactory: Send + Sync {
    /// Create a pool with the given sizing
    fn create(
        &self,
        proxy: Arc<dyn ProxyOutbound>,
        dialer: Arc<dyn Dialer>,
        strategy: ClientStrategy,
    ) -> Arc<dyn MuxPool>;
}

/// A per-handler mux pool manager: an enabled flag plus an optional pool.
pub struct MuxClientManager {
    enabled: bool,
    pool: Option<Arc<dyn MuxPool>>,
}

impl MuxClientManager {
    /// A manager that exists but carries nothing
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            pool: None,
        }
    }

    /// A manager backed by a pool
    #[must_use]
    pub fn new(pool: Arc<dyn MuxPool>) -> Self {
        Self {
            enabled: true,
            pool: Some(pool),
        }
    }

    /// Whether this manager accepts flows
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Dispatch a flow to the pool. A disabled manager rejects the flow and
    /// hands the link back.
    pub async fn dispatch(
        &self,
        ctx: &Arc<SessionContext>,
        link: Link,
    ) -> Result<(), (OutboundError, Link)> {
        match &self.pool {
            Some(pool) => pool.dispatch(ctx, link).await,
            None => Err((
                OutboundError::MuxDispatch("pool is disabled".into()),
                link,
            )),
        }
    }

    /// Shut down the pool, if any
    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }
}

/// Build the TCP mux manager from config. Returns `None` when multiplexing
/// is off entirely; a disabled manager when concurrency is negative.
pub fn build_tcp_manager(
    config: &MultiplexConfig,
    factory: &dyn MuxPoolFactory,
    proxy: &Arc<dyn ProxyOutbound>,
    dialer: &Arc<dyn Dialer>,
) -> Option<MuxClientManager> {
    if !config.enabled {
        return None;
    }
    if config.concurrency < 0 {
        return Some(MuxClientManager::disabled());
    }
    let max_concurrency = if config.concurrency == 0 {
        DEFAULT_CONCURRENCY
    } else {
        config.concurrency as u32
    };
    Some(MuxClientManager::new(factory.create(
        Arc::clone(proxy),
        Arc::clone(dialer),
        ClientStrategy {
            max_concurrency,
            max_connection: MAX_CONNECTION,
        },
    )))
}

/// Build the UDP (xudp) mux manager from config. The zero case differs from
/// the TCP pool: zero means no manager at all, not a defaulted one.
pub fn build_udp_manager(
    config: &MultiplexConfig,
    factory: &dyn MuxPoolFactory,
    proxy: &Arc<dyn ProxyOutbound>,
    dialer: &Arc<dyn Dialer>,
) -> Option<MuxClientManager> {
    if !config.enabled {
        return None;
    }
    if config.xudp_concurrency < 0 {
        return Some(MuxClientManager::disabled());
    }
    if config.xudp_concurrency == 0 {
        return None;
    }
    Some(MuxClientManager::new(factory.create(
        Arc::clone(proxy),
        Arc::clone(dialer),
        ClientStrategy {
            max_concurrency: config.xudp_concurrency as u32,
            max_connection: MAX_CONNECTION,
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{Address, Destination};
    use crate::transport::BoxedStream;
    use parking_lot::Mutex;

    struct RecordingFactory {
        strategies: Mutex<Vec<ClientStrategy>>,
    }

    impl RecordingFactory {
        fn new() -> Self {
            Self {
                strategies: Mutex::new(Vec::new()),
            }
        }
    }

    struct IdleProxy;

    #[async_trait]
    impl ProxyOutbound for IdleProxy {
        async fn process(
            &self,
            _ctx: &Arc<SessionContext>,
            _link: &mut Link,
            _dialer: &dyn Dialer,
        ) -> Result<(), OutboundError> {
            Ok(())
        }
    }

    struct NoDialer;

    #[async_trait]
    impl Dialer for NoDialer {
        async fn dial(
            &self,
            _ctx: &Arc<SessionContext>,
            _dest: Destination,
        ) -> Result<BoxedStream, OutboundError> {
            Err(OutboundError::Process("no transport".into()))
        }

        fn address(&self) -> Option<Address> {
            None
        }
    }

    fn deps() -> (Arc<dyn ProxyOutbound>, Arc<dyn Dialer>) {
        (Arc::new(IdleProxy), Arc::new(NoDialer))
    }

    struct NullPool;

    #[async_trait]
    impl MuxPool for NullPool {
        async fn dispatch(
            &self,
            _ctx: &Arc<SessionContext>,
            _link: Link,
        ) -> Result<(), (OutboundError, Link)> {
            Ok(())
        }

        async fn close(&self) {}
    }

    impl MuxPoolFactory for RecordingFactory {
        fn create(
            &self,
            _proxy: Arc<dyn ProxyOutbound>,
            _dialer: Arc<dyn Dialer>,
            strategy: ClientStrategy,
        ) -> Arc<dyn MuxPool> {
            self.strategies.lock().push(strategy);
            Arc::new(NullPool)
        }
    }

    fn config(enabled: bool, concurrency: i32, xudp: i32) -> MultiplexConfig {
        MultiplexConfig {
            enabled,
            concurrency,
            xudp_concurrency: xudp,
            xudp_udp443: crate::config::Udp443Policy::Allow,
        }
    }

    #[test]
    fn test_tcp_manager_tri_state() {
        let factory = RecordingFactory::new();
        let (proxy, dialer) = deps();

        assert!(build_tcp_manager(&config(false, 4, 0), &factory, &proxy, &dialer).is_none());

        let mgr = build_tcp_manager(&config(true, -1, 0), &factory, &proxy, &dialer).unwrap();
        assert!(!mgr.is_enabled());

        // Zero defaults the concurrency.
        let mgr = build_tcp_manager(&config(true, 0, 0), &factory, &proxy, &dialer).unwrap();
        assert!(mgr.is_enabled());
        assert_eq!(
            factory.strategies.lock().last().unwrap().max_concurrency,
            DEFAULT_CONCURRENCY
        );

        let _ = build_tcp_manager(&config(true, 16, 0), &factory, &proxy, &dialer).unwrap();
        let last = *factory.strategies.lock().last().unwrap();
        assert_eq!(last.max_concurrency, 16);
        assert_eq!(last.max_connection, MAX_CONNECTION);
    }

    #[test]
    fn test_udp_manager_zero_means_absent() {
        let factory = RecordingFactory::new();
        let (proxy, dialer) = deps();

        assert!(build_udp_manager(&config(true, 4, 0), &factory, &proxy, &dialer).is_none());

        let mgr = build_udp_manager(&config(true, 4, -1), &factory, &proxy, &dialer).unwrap();
        assert!(!mgr.is_enabled());

        let mgr = build_udp_manager(&config(true, 4, 8), &factory, &proxy, &dialer).unwrap();
        assert!(mgr.is_enabled());
        assert_eq!(factory.strategies.lock()[0].max_concurrency, 8);
    }

    #[tokio::test]
    async fn test_disabled_manager_returns_link() {
        let mgr = MuxClientManager::disabled();
        let ctx = SessionContext::new();
        let (rx, tx) = crate::link::pipe(1);
        let link = Link {
            reader: Box::new(rx),
            writer: Box::new(tx),
        };
        let (err, _link) = mgr.dispatch(&ctx, link).await.unwrap_err();
        assert!(matches!(err, OutboundError::MuxDispatch(_)));
    }
}
