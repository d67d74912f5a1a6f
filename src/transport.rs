//! Transport capabilities: dialing, stream settings, TLS, counters
//!
//! The dispatch layer never touches sockets directly. It consumes a
//! [`TransportDialer`] for direct dials and an optional [`UotDialer`] for
//! UDP-over-TCP transports, both injected at handler construction. The
//! [`Dialer`] trait is the narrow interface a wrapped proxy protocol sees.
//!
//! TLS settings are parsed once into a ready [`TlsClientSettings`] holding a
//! built rustls client config; per-dial work is only the handshake.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpSocket};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::config::StreamConfig;
use crate::error::OutboundError;
use crate::net::{Address, Destination};
use crate::session::SessionContext;
use crate::stats::TrafficCounter;

/// Marker trait for boxable duplex byte streams
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A type-erased duplex byte stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// Result of a successful direct dial
pub struct Dialed {
    /// The established stream
    pub stream: BoxedStream,
    /// Local address of the connection, when known
    pub local: Option<SocketAddr>,
    /// Peer address of the connection, when known
    pub peer: Option<SocketAddr>,
}

/// The dial interface a wrapped proxy protocol is handed during processing.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial the destination, applying the dialer's chaining, egress, and
    /// accounting rules.
    async fn dial(
        &self,
        ctx: &Arc<SessionContext>,
        dest: Destination,
    ) -> Result<BoxedStream, OutboundError>;

    /// The egress address this dialer is configured with, if any
    fn address(&self) -> Option<Address>;
}

/// Low-level transport dialing capability
#[async_trait]
pub trait TransportDialer: Send + Sync {
    /// Open a transport connection to `dest`, optionally binding the local
    /// side near `gateway`, then apply `settings` (TLS and the like).
    async fn dial(
        &self,
        dest: &Destination,
        settings: &StreamSettings,
        gateway: Option<&Address>,
    ) -> Result<Dialed, OutboundError>;
}

/// UDP-over-TCP transport capability. `dial` returns `None` when the
/// transport does not apply to the given destination, in which case the
/// caller falls through to a plain transport dial.
#[async_trait]
pub trait UotDialer: Send + Sync {
    /// Attempt a UDP-over-TCP dial
    async fn dial(
        &self,
        ctx: &Arc<SessionContext>,
        dest: &Destination,
    ) -> Option<Result<BoxedStream, OutboundError>>;
}

// ============================================================================
// Stream settings
// ============================================================================

/// Parsed, ready-to-use stream settings
#[derive(Default)]
pub struct StreamSettings {
    /// TLS client layer; `None` is plaintext
    pub tls: Option<TlsClientSettings>,
}

impl StreamSettings {
    /// Parse stream settings from the on-disk form. Fails handler
    /// construction on an unbuildable TLS config.
    pub fn from_config(config: Option<&StreamConfig>) -> Result<Self, OutboundError> {
        let tls = match config.and_then(|c| c.tls.as_ref()) {
            Some(tls) => Some(TlsClientSettings::from_config(tls)?),
            None => None,
        };
        Ok(Self { tls })
    }
}

/// Built TLS client settings
pub struct TlsClientSettings {
    config: Arc<rustls::ClientConfig>,
    server_name: Option<String>,
}

impl TlsClientSettings {
    /// Build a rustls client config from the on-disk TLS settings
    pub fn from_config(config: &crate::config::TlsConfig) -> Result<Self, OutboundError> {
        let mut client_config = if config.allow_insecure {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureVerifier(
                    rustls::crypto::ring::default_provider(),
                )))
                .with_no_client_auth()
        } else {
            let roots = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect(),
            };
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };
        client_config.alpn_protocols = config
            .alpn
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect();
        Ok(Self {
            config: Arc::new(client_config),
            server_name: config.server_name.clone(),
        })
    }

    /// Wrap a stream in the TLS client layer, using the configured server
    /// name or falling back to the destination address.
    pub async fn wrap(
        &self,
        stream: BoxedStream,
        dest: &Destination,
    ) -> Result<BoxedStream, OutboundError> {
        let name = self
            .server_name
            .clone()
            .unwrap_or_else(|| dest.address.to_string());
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| OutboundError::Tls(format!("invalid server name '{name}'")))?;
        trace!(server_name = %name, "starting TLS handshake");
        let connector = TlsConnector::from(Arc::clone(&self.config));
        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| OutboundError::Tls(e.to_string()))?;
        Ok(Box::new(tls))
    }
}

#[derive(Debug)]
struct InsecureVerifier(rustls::crypto::CryptoProvider);

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

// ============================================================================
// TCP transport dialer
// ============================================================================

/// Default TCP transport dialer
#[derive(Debug, Clone)]
pub struct TcpTransportDialer {
    keepalive: Duration,
}

impl Default for TcpTransportDialer {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(30),
        }
    }
}

impl TcpTransportDialer {
    /// Resolve the destination to a socket address, preferring the family of
    /// the gateway when one is set.
    async fn resolve(
        dest: &Destination,
        gateway: Option<SocketAddr>,
    ) -> Result<SocketAddr, OutboundError> {
        if let Some(sa) = dest.socket_addr() {
            return Ok(sa);
        }
        let host = format!("{}:{}", dest.address, dest.port);
        let addrs: Vec<SocketAddr> = lookup_host(&host)
            .await
            .map_err(|e| OutboundError::dial(dest, e.to_string()))?
            .collect();
        let picked = match gateway {
            Some(gw) => addrs
                .iter()
                .find(|a| a.is_ipv4() == gw.is_ipv4())
                .or_else(|| addrs.first()),
            None => addrs.first(),
        };
        picked
            .copied()
            .ok_or_else(|| OutboundError::dial(dest, "no resolved address"))
    }
}

#[async_trait]
impl TransportDialer for TcpTransportDialer {
    async fn dial(
        &self,
        dest: &Destination,
        settings: &StreamSettings,
        gateway: Option<&Address>,
    ) -> Result<Dialed, OutboundError> {
        let bind = gateway
            .and_then(Address::ip)
            .map(|ip| SocketAddr::new(ip, 0));
        let remote = Self::resolve(dest, bind).await?;

        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| OutboundError::dial(dest, e.to_string()))?;

        let sock_ref = SockRef::from(&socket);
        let _ = sock_ref.set_tcp_keepalive(&TcpKeepalive::new().with_time(self.keepalive));
        drop(sock_ref);

        if let Some(bind) = bind {
            if bind.is_ipv4() == remote.is_ipv4() {
                socket
                    .bind(bind)
                    .map_err(|e| OutboundError::dial(dest, format!("bind {bind}: {e}")))?;
                debug!(%bind, %dest, "bound egress address");
            }
        }

        let stream = socket
            .connect(remote)
            .await
            .map_err(|e| OutboundError::dial(dest, e.to_string()))?;
        let _ = stream.set_nodelay(true);
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();

        let mut stream: BoxedStream = Box::new(stream);
        if let Some(tls) = &settings.tls {
            stream = tls.wrap(stream, dest).await?;
        }
        Ok(Dialed {
            stream,
            local,
            peer,
        })
    }
}

// ============================================================================
// Counter stream
// ============================================================================

/// Wraps a stream and accumulates byte counters: writes feed the uplink
/// counter, reads feed the downlink counter.
pub struct CounterStream<S> {
    inner: S,
    uplink: Option<Arc<TrafficCounter>>,
    downlink: Option<Arc<TrafficCounter>>,
}

impl<S> CounterStream<S> {
    /// Wrap a stream with optional per-direction counters
    pub fn new(
        inner: S,
        uplink: Option<Arc<TrafficCounter>>,
        downlink: Option<Arc<TrafficCounter>>,
    ) -> Self {
        Self {
            inner,
            uplink,
            downlink,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CounterStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            if let Some(counter) = &self.downlink {
                counter.add((buf.filled().len() - before) as u64);
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CounterStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if let Some(counter) = &self.uplink {
                counter.add(*n as u64);
            }
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Wrap a stream with counters unless both are absent.
#[must_use]
pub fn with_counters(
    stream: BoxedStream,
    uplink: Option<Arc<TrafficCounter>>,
    downlink: Option<Arc<TrafficCounter>>,
) -> BoxedStream {
    if uplink.is_none() && downlink.is_none() {
        return stream;
    }
    Box::new(CounterStream::new(stream, uplink, downlink))
}
