//! Outbound handler: per-route dial and dispatch
//!
//! One handler owns one named outbound route. `dispatch` decides whether a
//! flow rides a mux pool or the direct path; `dial` (through the [`Dialer`]
//! trait) resolves the actual connection for a destination, honoring
//! chain-by-tag routing and the egress policy.
//!
//! Link termination is strictly ordered: the writer is closed on success and
//! interrupted on failure, and the reader is always interrupted last. A flow
//! therefore terminates in both directions exactly once on every exit path.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{HandlerConfig, SenderConfig, Udp443Policy};
use crate::error::{OutboundError, RouterError};
use crate::link::{
    pipe, EndpointOverrideReader, EndpointOverrideWriter, Link, PipeConnection,
    DEFAULT_PIPE_CAPACITY,
};
use crate::mux::{build_tcp_manager, build_udp_manager, MuxClientManager, MuxPoolFactory};
use crate::net::{Address, Destination, Network};
use crate::outbound::egress::EgressPolicy;
use crate::outbound::manager::HandlerManager;
use crate::outbound::ProxyOutbound;
use crate::session::{ConnInfo, OutboundRecord, SessionContext};
use crate::stats::{
    downlink_counter_name, uplink_counter_name, StatsRegistry, SystemPolicy, TrafficCounter,
};
use crate::transport::{
    with_counters, BoxedStream, Dialer, StreamSettings, TcpTransportDialer, TransportDialer,
    UotDialer,
};

/// Capabilities injected into a handler at construction
pub struct HandlerCapabilities {
    /// Registry used for chain-by-tag lookups
    pub manager: Weak<HandlerManager>,
    /// Transport dialing capability
    pub transport: Arc<dyn TransportDialer>,
    /// UDP-over-TCP transport, if available
    pub uot: Option<Arc<dyn UotDialer>>,
    /// Stats registry; `None` disables accounting entirely
    pub stats: Option<Arc<dyn StatsRegistry>>,
    /// System policy controlling per-direction accounting
    pub policy: Arc<dyn SystemPolicy>,
    /// Mux pool factory; `None` leaves configured pools unbuilt
    pub mux_factory: Option<Arc<dyn MuxPoolFactory>>,
}

impl HandlerCapabilities {
    /// Capabilities with the default TCP transport and accounting enabled
    #[must_use]
    pub fn new(manager: &Arc<HandlerManager>) -> Self {
        Self {
            manager: Arc::downgrade(manager),
            transport: Arc::new(TcpTransportDialer::default()),
            uot: None,
            stats: None,
            policy: Arc::new(crate::stats::StaticPolicy::enabled()),
            mux_factory: None,
        }
    }

    /// Replace the transport dialer
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn TransportDialer>) -> Self {
        self.transport = transport;
        self
    }

    /// Attach a stats registry
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<dyn StatsRegistry>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Replace the system policy
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn SystemPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Attach a UDP-over-TCP transport
    #[must_use]
    pub fn with_uot(mut self, uot: Arc<dyn UotDialer>) -> Self {
        self.uot = Some(uot);
        self
    }

    /// Attach a mux pool factory
    #[must_use]
    pub fn with_mux_factory(mut self, factory: Arc<dyn MuxPoolFactory>) -> Self {
        self.mux_factory = Some(factory);
        self
    }
}

/// One named outbound route
pub struct OutboundHandler {
    tag: String,
    chain_tag: Option<String>,
    egress: Option<EgressPolicy>,
    via_address: Option<Address>,
    stream_settings: StreamSettings,
    proxy: Arc<dyn ProxyOutbound>,
    manager: Weak<HandlerManager>,
    transport: Arc<dyn TransportDialer>,
    uot: Option<Arc<dyn UotDialer>>,
    mux: Option<MuxClientManager>,
    xudp: Option<MuxClientManager>,
    udp443: Udp443Policy,
    uplink_counter: Option<Arc<TrafficCounter>>,
    downlink_counter: Option<Arc<TrafficCounter>>,
    sender_config: Option<SenderConfig>,
    proxy_settings: serde_json::Value,
}

impl OutboundHandler {
    /// Build a handler from its configuration, wrapped proxy protocol, and
    /// injected capabilities. Unparseable stream settings are fatal.
    pub fn new(
        config: &HandlerConfig,
        proxy: Arc<dyn ProxyOutbound>,
        caps: HandlerCapabilities,
    ) -> Result<Arc<Self>, RouterError> {
        config.validate()?;
        let sender = config.sender.as_ref();

        let stream_settings = StreamSettings::from_config(sender.and_then(|s| s.stream.as_ref()))
            .map_err(|e| OutboundError::InvalidStreamSettings(e.to_string()))?;

        let egress = match sender.and_then(|s| s.via.as_ref()) {
            Some(via) => Some(EgressPolicy::from_config(via)?),
            None => None,
        };
        let via_address = sender
            .and_then(|s| s.via.as_ref())
            .map(|v| Address::parse(&v.address));
        let chain_tag = sender.and_then(|s| s.chain_tag.clone());

        let mux_cfg = sender
            .and_then(|s| s.multiplex.as_ref())
            .filter(|m| m.enabled)
            .cloned();

        let (uplink_counter, downlink_counter) = match (&caps.stats, config.tag.is_empty()) {
            (Some(stats), false) => {
                let up = caps
                    .policy
                    .outbound_uplink_stats()
                    .then(|| stats.get_or_register_counter(&uplink_counter_name(&config.tag)))
                    .flatten();
                let down = caps
                    .policy
                    .outbound_downlink_stats()
                    .then(|| stats.get_or_register_counter(&downlink_counter_name(&config.tag)))
                    .flatten();
                (up, down)
            }
            _ => (None, None),
        };

        // Pools dial their carrier connections back through the handler, so
        // they are built against a weak handle to the handler under
        // construction.
        Ok(Arc::new_cyclic(|weak: &Weak<Self>| {
            let (mux, xudp, udp443) = match &mux_cfg {
                Some(mux_cfg) => match &caps.mux_factory {
                    Some(factory) => {
                        let dialer: Arc<dyn Dialer> = Arc::new(PoolDialer {
                            handler: weak.clone(),
                        });
                        (
                            build_tcp_manager(mux_cfg, factory.as_ref(), &proxy, &dialer),
                            build_udp_manager(mux_cfg, factory.as_ref(), &proxy, &dialer),
                            mux_cfg.xudp_udp443,
                        )
                    }
                    None => {
                        warn!(
                            tag = %config.tag,
                            "multiplex configured without a pool factory; flows take the direct path"
                        );
                        (None, None, mux_cfg.xudp_udp443)
                    }
                },
                None => (None, None, Udp443Policy::default()),
            };

            Self {
                tag: config.tag.clone(),
                chain_tag,
                egress,
                via_address,
                stream_settings,
                proxy,
                manager: caps.manager,
                transport: caps.transport,
                uot: caps.uot,
                mux,
                xudp,
                udp443,
                uplink_counter,
                downlink_counter,
                sender_config: config.sender.clone(),
                proxy_settings: config.proxy_settings.clone(),
            }
        }))
    }

    /// Handler tag
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The sender configuration this handler was built from
    #[must_use]
    pub fn sender_settings(&self) -> Option<&SenderConfig> {
        self.sender_config.as_ref()
    }

    /// Opaque settings of the wrapped proxy protocol
    #[must_use]
    pub fn proxy_settings(&self) -> &serde_json::Value {
        &self.proxy_settings
    }

    /// Start the handler. Pools and counters are live from construction, so
    /// this is a lifecycle hook only.
    pub fn start(&self) -> Result<(), OutboundError> {
        Ok(())
    }

    /// Shut down: mux pools first, then the wrapped proxy. Best-effort.
    pub async fn close(&self) {
        if let Some(mux) = &self.mux {
            mux.close().await;
        }
        if let Some(xudp) = &self.xudp {
            xudp.close().await;
        }
        self.proxy.close().await;
    }

    /// Dispatch one established flow.
    pub async fn dispatch(self: Arc<Self>, ctx: Arc<SessionContext>, mut link: Link) {
        let target = ctx.last_outbound();

        // Restore the pre-NAT destination in UDP packet metadata when the
        // target was rewritten upstream.
        if let Some(ob) = &target {
            if ob.target.network == Network::Udp {
                if let Some(orig) = &ob.original_target {
                    if orig.address != ob.target.address {
                        link = Link {
                            reader: Box::new(EndpointOverrideReader::new(
                                link.reader,
                                ob.target.address.clone(),
                                orig.address.clone(),
                            )),
                            writer: Box::new(EndpointOverrideWriter::new(
                                link.writer,
                                ob.target.address.clone(),
                                orig.address.clone(),
                            )),
                        };
                    }
                }
            }
        }

        if self.mux.is_some() || self.xudp.is_some() {
            let dest = target.as_ref().map(|ob| &ob.target);
            let is_udp = dest.is_some_and(|d| d.network == Network::Udp);

            if is_udp && dest.is_some_and(|d| d.port == 443) {
                match self.udp443 {
                    Udp443Policy::Reject => {
                        info!(handler = %self.tag, "rejected UDP/443 traffic by policy");
                        ctx.submit_outbound_error(OutboundError::PolicyRejected);
                        link.writer.interrupt();
                        link.reader.interrupt();
                        return;
                    }
                    Udp443Policy::Skip => {
                        self.direct(&ctx, link).await;
                        return;
                    }
                    Udp443Policy::Allow => {}
                }
            }

            if is_udp {
                if let Some(xudp) = &self.xudp {
                    // A disabled UDP pool is distinct from no pool: the flow
                    // goes direct rather than into the TCP mux pool.
                    if !xudp.is_enabled() {
                        self.direct(&ctx, link).await;
                        return;
                    }
                    if let Err((err, link)) = xudp.dispatch(&ctx, link).await {
                        Self::fail_link(&ctx, link, err);
                    }
                    return;
                }
            }
            if let Some(mux) = &self.mux {
                if mux.is_enabled() {
                    if let Err((err, link)) = mux.dispatch(&ctx, link).await {
                        Self::fail_link(&ctx, link, err);
                    }
                    return;
                }
            }
        }

        self.direct(&ctx, link).await;
    }

    async fn direct(&self, ctx: &Arc<SessionContext>, mut link: Link) {
        let result = self.proxy.process(ctx, &mut link, self as &dyn Dialer).await;
        let result = match result {
            Err(err) if err.is_benign() || ctx.is_cancelled() => Ok(()),
            other => other,
        };
        match result {
            Ok(()) => {
                let _ = link.writer.close().await;
            }
            Err(err) => {
                info!(handler = %self.tag, error = %err, "failed to process outbound traffic");
                ctx.submit_outbound_error(err);
                link.writer.interrupt();
            }
        }
        link.reader.interrupt();
    }

    fn fail_link(ctx: &SessionContext, mut link: Link, err: OutboundError) {
        info!(error = %err, "failed to dispatch to mux pool");
        ctx.submit_outbound_error(err);
        link.writer.interrupt();
        link.reader.interrupt();
    }

    async fn dial_chained(
        &self,
        ctx: &Arc<SessionContext>,
        dest: &Destination,
        tag: &str,
        upstream: Arc<OutboundHandler>,
    ) -> Result<BoxedStream, OutboundError> {
        debug!(handler = %self.tag, upstream = %tag, %dest, "proxying through chained outbound");
        let child = ctx.child_with_outbound(OutboundRecord::chained(dest.clone(), tag));

        let (uplink_rx, uplink_tx) = pipe(DEFAULT_PIPE_CAPACITY);
        let (downlink_rx, downlink_tx) = pipe(DEFAULT_PIPE_CAPACITY);
        let nested = Link {
            reader: Box::new(uplink_rx),
            writer: Box::new(downlink_tx),
        };
        // The nested dispatch runs concurrently; data moves through the
        // pipes as both sides progress.
        tokio::spawn(upstream.dispatch(child, nested));

        let mut conn: BoxedStream = Box::new(PipeConnection::new(uplink_tx, downlink_rx));
        if let Some(tls) = &self.stream_settings.tls {
            conn = tls.wrap(conn, dest).await?;
        }
        Ok(with_counters(
            conn,
            self.uplink_counter.clone(),
            self.downlink_counter.clone(),
        ))
    }
}

#[async_trait]
impl Dialer for OutboundHandler {
    async fn dial(
        &self,
        ctx: &Arc<SessionContext>,
        dest: Destination,
    ) -> Result<BoxedStream, OutboundError> {
        if let Some(tag) = &self.chain_tag {
            match self.manager.upgrade().and_then(|m| m.get(tag)) {
                Some(upstream) => return self.dial_chained(ctx, &dest, tag, upstream).await,
                None => {
                    // Missing chain target degrades to a direct dial
                    warn!(handler = %self.tag, upstream = %tag, "chained outbound handler not found");
                }
            }
        }

        if let Some(policy) = &self.egress {
            if let Some(gateway) = policy.resolve(ctx) {
                debug!(handler = %self.tag, %gateway, "resolved egress address");
                ctx.set_gateway(gateway);
            }
        }

        if let Some(uot) = &self.uot {
            if let Some(result) = uot.dial(ctx, &dest).await {
                return result;
            }
        }

        let gateway = ctx.gateway();
        let dialed = self
            .transport
            .dial(&dest, &self.stream_settings, gateway.as_ref())
            .await?;
        ctx.set_conn_info(ConnInfo {
            local: dialed.local,
            peer: dialed.peer,
        });
        Ok(with_counters(
            dialed.stream,
            self.uplink_counter.clone(),
            self.downlink_counter.clone(),
        ))
    }

    fn address(&self) -> Option<Address> {
        self.via_address.clone()
    }
}

/// Dialer handle handed to mux pools so carrier connections originate
/// through the owning handler's chaining, egress, and accounting.
struct PoolDialer {
    handler: Weak<OutboundHandler>,
}

#[async_trait]
impl Dialer for PoolDialer {
    async fn dial(
        &self,
        ctx: &Arc<SessionContext>,
        dest: Destination,
    ) -> Result<BoxedStream, OutboundError> {
        match self.handler.upgrade() {
            Some(handler) => handler.dial(ctx, dest).await,
            None => Err(OutboundError::Process("outbound handler dropped".into())),
        }
    }

    fn address(&self) -> Option<Address> {
        self.handler.upgrade().and_then(|h| h.address())
    }
}

#[cfg(test)]
impl HandlerCapabilities {
    pub(crate) fn for_manager(manager: &Arc<HandlerManager>) -> Self {
        Self::new(manager).with_policy(Arc::new(crate::stats::StaticPolicy::disabled()))
    }
}
