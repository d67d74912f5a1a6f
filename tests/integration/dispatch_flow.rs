//! End-to-end dispatch tests
//!
//! A forwarding proxy protocol is wired through a real handler: flows enter
//! as links, the handler dials through its configured policy, and bytes are
//! pumped both ways. Covers the direct path against a loopback TCP echo
//! server and the chained path through a second handler.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use relay_router::config::{HandlerConfig, MultiplexConfig, SenderConfig, Udp443Policy};
use relay_router::error::OutboundError;
use relay_router::link::{Chunk, Link};
use relay_router::mux::{ClientStrategy, MuxPool, MuxPoolFactory};
use relay_router::session::OutboundRecord;
use relay_router::stats::{MemoryStatsRegistry, StatsRegistry};
use relay_router::transport::Dialer;
use relay_router::{
    Address, Destination, HandlerCapabilities, HandlerManager, Network, OutboundHandler,
    ProxyOutbound, SessionContext,
};

/// Dials the flow's target and pumps bytes between the link and the
/// connection until the inbound side closes.
struct ForwardProxy;

#[async_trait]
impl ProxyOutbound for ForwardProxy {
    async fn process(
        &self,
        ctx: &Arc<SessionContext>,
        link: &mut Link,
        dialer: &dyn Dialer,
    ) -> Result<(), OutboundError> {
        let dest = ctx
            .last_outbound()
            .map(|ob| ob.target)
            .ok_or_else(|| OutboundError::Process("no target".into()))?;
        let mut conn = dialer.dial(ctx, dest).await?;

        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                chunk = link.reader.read_chunk() => match chunk? {
                    Some(chunk) => conn.write_all(&chunk.data).await?,
                    None => {
                        conn.shutdown().await?;
                        break;
                    }
                },
                n = conn.read(&mut buf) => {
                    let n = n?;
                    if n == 0 {
                        break;
                    }
                    link.writer
                        .write_chunk(Chunk::new(Bytes::copy_from_slice(&buf[..n])))
                        .await?;
                }
            }
        }
        Ok(())
    }
}

/// Echoes link chunks straight back; stands in for an exit protocol when
/// testing the chained path.
struct EchoProxy;

#[async_trait]
impl ProxyOutbound for EchoProxy {
    async fn process(
        &self,
        _ctx: &Arc<SessionContext>,
        link: &mut Link,
        _dialer: &dyn Dialer,
    ) -> Result<(), OutboundError> {
        while let Some(chunk) = link.reader.read_chunk().await? {
            link.writer.write_chunk(chunk).await?;
        }
        Ok(())
    }
}

/// Pool that relays each flow over its own carrier connection, dialed
/// through the handler so the handler's counters apply.
struct CarrierPool {
    dialer: Arc<dyn Dialer>,
}

#[async_trait]
impl MuxPool for CarrierPool {
    async fn dispatch(
        &self,
        ctx: &Arc<SessionContext>,
        mut link: Link,
    ) -> Result<(), (OutboundError, Link)> {
        let Some(dest) = ctx.last_outbound().map(|ob| ob.target) else {
            return Err((OutboundError::Process("no target".into()), link));
        };
        let mut conn = match self.dialer.dial(ctx, dest).await {
            Ok(conn) => conn,
            Err(err) => return Err((err, link)),
        };

        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                chunk = link.reader.read_chunk() => match chunk {
                    Ok(Some(chunk)) => {
                        if conn.write_all(&chunk.data).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = conn.shutdown().await;
                        break;
                    }
                    Err(_) => break,
                },
                n = conn.read(&mut buf) => match n {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let chunk = Chunk::new(Bytes::copy_from_slice(&buf[..n]));
                        if link.writer.write_chunk(chunk).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        let _ = link.writer.close().await;
        link.reader.interrupt();
        Ok(())
    }

    async fn close(&self) {}
}

struct CarrierFactory;

impl MuxPoolFactory for CarrierFactory {
    fn create(
        &self,
        _proxy: Arc<dyn ProxyOutbound>,
        dialer: Arc<dyn Dialer>,
        _strategy: ClientStrategy,
    ) -> Arc<dyn MuxPool> {
        Arc::new(CarrierPool { dialer })
    }
}

async fn spawn_echo_listener() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn flow(dest: Destination) -> Arc<SessionContext> {
    let ctx = SessionContext::new();
    ctx.push_outbound(OutboundRecord::new(dest));
    ctx
}

#[tokio::test]
async fn direct_flow_through_loopback_with_counters() {
    let echo_addr = spawn_echo_listener().await;
    let manager = HandlerManager::new();
    let stats = Arc::new(MemoryStatsRegistry::new());

    let handler = OutboundHandler::new(
        &HandlerConfig::with_tag("direct"),
        Arc::new(ForwardProxy),
        HandlerCapabilities::new(&manager).with_stats(stats.clone() as Arc<dyn StatsRegistry>),
    )
    .unwrap();
    manager.add(Arc::clone(&handler)).unwrap();

    let dest = Destination::from_socket_addr(Network::Tcp, echo_addr);
    let ctx = flow(dest);

    let (inbound, stream) = tokio::io::duplex(4096);
    let link = Link::from_stream(stream);
    let dispatch = tokio::spawn(handler.dispatch(ctx, link));

    let mut inbound = inbound;
    inbound.write_all(b"round and round").await.unwrap();
    let mut buf = [0u8; 15];
    inbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"round and round");

    inbound.shutdown().await.unwrap();
    dispatch.await.unwrap();

    let uplink = stats.get("outbound>>>direct>>>traffic>>>uplink").unwrap();
    let downlink = stats.get("outbound>>>direct>>>traffic>>>downlink").unwrap();
    assert_eq!(uplink.value(), 15);
    assert_eq!(downlink.value(), 15);
}

#[tokio::test]
async fn concurrent_mux_dispatch_sums_counters_exactly() {
    let echo_addr = spawn_echo_listener().await;
    let manager = HandlerManager::new();
    let stats = Arc::new(MemoryStatsRegistry::new());

    let handler = OutboundHandler::new(
        &HandlerConfig {
            tag: "muxed".into(),
            sender: Some(SenderConfig {
                multiplex: Some(MultiplexConfig {
                    enabled: true,
                    concurrency: 4,
                    xudp_concurrency: 0,
                    xudp_udp443: Udp443Policy::Allow,
                }),
                ..Default::default()
            }),
            proxy_settings: serde_json::Value::Null,
        },
        Arc::new(ForwardProxy),
        HandlerCapabilities::new(&manager)
            .with_stats(stats.clone() as Arc<dyn StatsRegistry>)
            .with_mux_factory(Arc::new(CarrierFactory)),
    )
    .unwrap();
    manager.add(Arc::clone(&handler)).unwrap();

    let mut flows = Vec::new();
    let mut total = 0u64;
    for i in 0..8usize {
        let payload = vec![b'a' + i as u8; (i + 1) * 64];
        total += payload.len() as u64;
        let handler = Arc::clone(&handler);
        let dest = Destination::from_socket_addr(Network::Tcp, echo_addr);
        flows.push(tokio::spawn(async move {
            let ctx = flow(dest);
            let (mut inbound, stream) = tokio::io::duplex(4096);
            let link = Link::from_stream(stream);
            let dispatch = tokio::spawn(handler.dispatch(ctx, link));

            inbound.write_all(&payload).await.unwrap();
            let mut buf = vec![0u8; payload.len()];
            inbound.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, payload);

            inbound.shutdown().await.unwrap();
            dispatch.await.unwrap();
        }));
    }
    for task in flows {
        task.await.unwrap();
    }

    let uplink = stats.get("outbound>>>muxed>>>traffic>>>uplink").unwrap();
    let downlink = stats.get("outbound>>>muxed>>>traffic>>>downlink").unwrap();
    assert_eq!(uplink.value(), total);
    assert_eq!(downlink.value(), total);
}

#[tokio::test]
async fn chained_flow_reaches_upstream_handler() {
    let manager = HandlerManager::new();

    let exit = OutboundHandler::new(
        &HandlerConfig::with_tag("exit"),
        Arc::new(EchoProxy),
        HandlerCapabilities::new(&manager),
    )
    .unwrap();
    manager.add(exit).unwrap();

    let front = OutboundHandler::new(
        &HandlerConfig {
            tag: "front".into(),
            sender: Some(SenderConfig {
                chain_tag: Some("exit".into()),
                ..Default::default()
            }),
            proxy_settings: serde_json::Value::Null,
        },
        Arc::new(ForwardProxy),
        HandlerCapabilities::new(&manager),
    )
    .unwrap();
    manager.add(Arc::clone(&front)).unwrap();

    let dest = Destination::tcp(Address::parse("example.net"), 9999);
    let ctx = flow(dest);

    let (inbound, stream) = tokio::io::duplex(4096);
    let link = Link::from_stream(stream);
    let dispatch = tokio::spawn(front.dispatch(ctx, link));

    let mut inbound = inbound;
    inbound.write_all(b"via the chain").await.unwrap();
    let mut buf = [0u8; 13];
    inbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"via the chain");

    inbound.shutdown().await.unwrap();
    dispatch.await.unwrap();
    manager.close_all().await;
}
