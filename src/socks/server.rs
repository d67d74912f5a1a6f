//! SOCKS server handshake engine
//!
//! One [`ServerSession`] serves the handshake of a single inbound TCP
//! connection and yields a normalized [`RequestHeader`]. Every rejection
//! path writes the protocol-correct failure frame before returning the
//! error, so a peer always observes a well-formed response.
//!
//! SOCKS4 requests carry no credentials, so they are refused outright
//! whenever the engine is configured for password or key authentication.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::config::{AuthType, SocksServerConfig};
use crate::error::SocksError;
use crate::net::Address;
use crate::session::{RequestCommand, RequestHeader, User};
use crate::socks::addr::{read_address_port, write_address_port};
use crate::socks::consts::{
    AUTH_NOT_REQUIRED, AUTH_NO_MATCHING_METHOD, AUTH_PASSWORD, AUTH_SUBNEGOTIATION_VERSION,
    CMD_TCP_BIND, CMD_TCP_CONNECT, CMD_TOR_RESOLVE, CMD_TOR_RESOLVE_PTR, CMD_UDP_ASSOCIATE,
    MAX_NULL_TERMINATED, SOCKS4_REQUEST_GRANTED, SOCKS4_REQUEST_REJECTED, SOCKS4_VERSION,
    SOCKS5_VERSION, STATUS_CMD_NOT_SUPPORT, STATUS_SUCCESS,
};

/// Server-side handshake state for one inbound connection
pub struct ServerSession {
    config: Arc<SocksServerConfig>,
    local_addr: Option<SocketAddr>,
}

impl ServerSession {
    /// Create a session. `local_addr` is the inbound connection's local
    /// address, echoed to UDP clients as the relay endpoint.
    #[must_use]
    pub fn new(config: Arc<SocksServerConfig>, local_addr: Option<SocketAddr>) -> Self {
        Self { config, local_addr }
    }

    /// Run the handshake to completion.
    pub async fn handshake<S>(&self, stream: &mut S) -> Result<RequestHeader, SocksError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        match head[0] {
            SOCKS4_VERSION => self.handshake4(head[1], stream).await,
            SOCKS5_VERSION => self.handshake5(head[1], stream).await,
            other => Err(SocksError::UnsupportedVersion(other)),
        }
    }

    async fn handshake4<S>(&self, cmd: u8, stream: &mut S) -> Result<RequestHeader, SocksError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if self.config.auth != AuthType::NoAuth {
            write_socks4_reply(stream, SOCKS4_REQUEST_REJECTED).await?;
            return Err(SocksError::Socks4AuthRequired);
        }

        let mut body = [0u8; 6];
        stream.read_exact(&mut body).await?;
        let port = u16::from_be_bytes([body[0], body[1]]);
        let octets = [body[2], body[3], body[4], body[5]];

        // User id, unused
        read_until_null(stream).await?;

        // SOCKS4a marker: a leading zero octet means a domain follows
        let address = if octets[0] == 0 {
            let domain = read_until_null(stream).await?;
            trace!(domain = %domain, "SOCKS4a domain request");
            Address::Domain(domain)
        } else {
            Address::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
        };

        match cmd {
            CMD_TCP_CONNECT => {
                write_socks4_reply(stream, SOCKS4_REQUEST_GRANTED).await?;
                Ok(RequestHeader {
                    version: SOCKS4_VERSION,
                    command: RequestCommand::Tcp,
                    address,
                    port,
                    user: None,
                })
            }
            other => {
                write_socks4_reply(stream, SOCKS4_REQUEST_REJECTED).await?;
                Err(SocksError::UnsupportedCommand(other))
            }
        }
    }

    async fn auth5<S>(&self, n_methods: u8, stream: &mut S) -> Result<Option<User>, SocksError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut methods = vec![0u8; n_methods as usize];
        stream.read_exact(&mut methods).await?;

        // Key auth rides the username/password subnegotiation
        let expected = match self.config.auth {
            AuthType::NoAuth => AUTH_NOT_REQUIRED,
            AuthType::Password | AuthType::Key => AUTH_PASSWORD,
        };

        if !methods.contains(&expected) {
            stream
                .write_all(&[SOCKS5_VERSION, AUTH_NO_MATCHING_METHOD])
                .await?;
            return Err(SocksError::NoAcceptableMethod);
        }
        stream.write_all(&[SOCKS5_VERSION, expected]).await?;

        if expected != AUTH_PASSWORD {
            return Ok(None);
        }

        let (username, password) = read_username_password(stream).await?;
        let accepted = match self.config.auth {
            AuthType::Password => self.config.has_account(&username, &password),
            AuthType::Key => self.config.validate_key(&password),
            AuthType::NoAuth => unreachable!(),
        };
        if !accepted {
            debug!(username = %username, "authentication failed");
            stream
                .write_all(&[AUTH_SUBNEGOTIATION_VERSION, 0xFF])
                .await?;
            return Err(SocksError::AuthFailed);
        }
        stream
            .write_all(&[AUTH_SUBNEGOTIATION_VERSION, 0x00])
            .await?;
        Ok(Some(User::new(username)))
    }

    async fn handshake5<S>(&self, n_methods: u8, stream: &mut S) -> Result<RequestHeader, SocksError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let user = self.auth5(n_methods, stream).await?;

        let mut head = [0u8; 3];
        stream.read_exact(&mut head).await?;
        let cmd = head[1];

        let command = match cmd {
            // Tor resolve extensions behave as CONNECT
            CMD_TCP_CONNECT | CMD_TOR_RESOLVE | CMD_TOR_RESOLVE_PTR => RequestCommand::Tcp,
            CMD_UDP_ASSOCIATE if self.config.udp_enabled => RequestCommand::Udp,
            CMD_UDP_ASSOCIATE | CMD_TCP_BIND => {
                self.write_reply(stream, STATUS_CMD_NOT_SUPPORT, None).await?;
                return Err(SocksError::UnsupportedCommand(cmd));
            }
            other => {
                self.write_reply(stream, STATUS_CMD_NOT_SUPPORT, None).await?;
                return Err(SocksError::UnsupportedCommand(other));
            }
        };

        let (address, port) = read_address_port(stream).await?;

        // UDP clients get the relay endpoint in the reply; TCP clients get
        // the bound local address.
        let bind = match command {
            RequestCommand::Udp => {
                let ip = self
                    .config
                    .relay_address
                    .or_else(|| self.local_addr.map(|a| a.ip()));
                ip.map(|ip| SocketAddr::new(ip, self.local_addr.map_or(0, |a| a.port())))
            }
            RequestCommand::Tcp => self.local_addr,
        };
        self.write_reply(stream, STATUS_SUCCESS, bind).await?;

        Ok(RequestHeader {
            version: SOCKS5_VERSION,
            command,
            address,
            port,
            user,
        })
    }

    async fn write_reply<S>(
        &self,
        stream: &mut S,
        status: u8,
        bind: Option<SocketAddr>,
    ) -> Result<(), SocksError>
    where
        S: AsyncWrite + Unpin + Send,
    {
        let bind = bind.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        let mut buf = BytesMut::with_capacity(22);
        buf.extend_from_slice(&[SOCKS5_VERSION, status, 0x00]);
        write_address_port(&mut buf, &Address::Ip(bind.ip()), bind.port())?;
        stream.write_all(&buf).await?;
        Ok(())
    }
}

async fn write_socks4_reply<S>(stream: &mut S, code: u8) -> Result<(), SocksError>
where
    S: AsyncWrite + Unpin + Send,
{
    // VN=0, CD, then an unused port and address
    stream
        .write_all(&[0x00, code, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

/// Read a null-terminated string, bounded to keep a hostile peer from
/// streaming bytes forever.
async fn read_until_null<R>(reader: &mut R) -> Result<String, SocksError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut out = Vec::new();
    loop {
        let b = reader.read_u8().await?;
        if b == 0 {
            break;
        }
        if out.len() >= MAX_NULL_TERMINATED {
            return Err(SocksError::BufferOverrun);
        }
        out.push(b);
    }
    String::from_utf8(out).map_err(|_| SocksError::Protocol("string is not valid UTF-8".into()))
}

/// Read an RFC 1929 username/password subnegotiation request.
async fn read_username_password<R>(reader: &mut R) -> Result<(String, String), SocksError>
where
    R: AsyncRead + Unpin + Send,
{
    // Leading version byte is accepted as-is
    let _ver = reader.read_u8().await?;
    let ulen = reader.read_u8().await? as usize;
    let mut username = vec![0u8; ulen];
    reader.read_exact(&mut username).await?;
    let plen = reader.read_u8().await? as usize;
    let mut password = vec![0u8; plen];
    reader.read_exact(&mut password).await?;
    let username = String::from_utf8(username)
        .map_err(|_| SocksError::Protocol("username is not valid UTF-8".into()))?;
    let password = String::from_utf8(password)
        .map_err(|_| SocksError::Protocol("password is not valid UTF-8".into()))?;
    Ok((username, password))
}
