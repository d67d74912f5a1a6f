//! SOCKS5 client-role handshake
//!
//! Used when chaining through an upstream SOCKS server. The method offer is
//! sent first; credentials go on the wire only after the server selects
//! password auth. For UDP associations the request carries the RFC 1928
//! all-zero bind address and the server's bound relay endpoint is returned
//! as a synthetic request header.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::config::Account;
use crate::error::SocksError;
use crate::session::{RequestCommand, RequestHeader};
use crate::socks::addr::{read_address_port, write_address_port};
use crate::socks::consts::{
    ATYP_IPV4, AUTH_NOT_REQUIRED, AUTH_PASSWORD, AUTH_SUBNEGOTIATION_VERSION, CMD_TCP_CONNECT,
    CMD_UDP_ASSOCIATE, SOCKS5_VERSION, STATUS_SUCCESS,
};

/// Perform the SOCKS5 client handshake for `request` over `stream`.
///
/// Returns `Ok(Some(header))` for UDP associations, carrying the server's
/// bound relay endpoint; `Ok(None)` for TCP connects.
pub async fn client_handshake<S>(
    request: &RequestHeader,
    account: Option<&Account>,
    stream: &mut S,
) -> Result<Option<RequestHeader>, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let auth_byte = if account.is_some() {
        AUTH_PASSWORD
    } else {
        AUTH_NOT_REQUIRED
    };
    if let Some(account) = account {
        if account.username.len() > 255 || account.password.len() > 255 {
            return Err(SocksError::Protocol("credentials too long".into()));
        }
    }

    stream
        .write_all(&[SOCKS5_VERSION, 0x01, auth_byte])
        .await?;

    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method[0] != SOCKS5_VERSION {
        return Err(SocksError::UnsupportedVersion(method[0]));
    }
    if method[1] != auth_byte {
        return Err(SocksError::AuthMethodNotSupported(method[1]));
    }

    // Credentials are only written once the server has selected the
    // password method.
    if let Some(account) = account {
        let mut buf = BytesMut::with_capacity(64);
        buf.extend_from_slice(&[AUTH_SUBNEGOTIATION_VERSION, account.username.len() as u8]);
        buf.extend_from_slice(account.username.as_bytes());
        buf.extend_from_slice(&[account.password.len() as u8]);
        buf.extend_from_slice(account.password.as_bytes());
        stream.write_all(&buf).await?;

        let mut status = [0u8; 2];
        stream.read_exact(&mut status).await?;
        if status[1] != 0x00 {
            return Err(SocksError::AuthFailed);
        }
    }

    let command = match request.command {
        RequestCommand::Tcp => CMD_TCP_CONNECT,
        RequestCommand::Udp => CMD_UDP_ASSOCIATE,
    };
    let mut buf = BytesMut::with_capacity(32);
    buf.extend_from_slice(&[SOCKS5_VERSION, command, 0x00]);
    if request.command == RequestCommand::Udp {
        // Relay endpoint is unknown yet; bind address is all zeros
        buf.extend_from_slice(&[ATYP_IPV4, 0, 0, 0, 0, 0, 0]);
    } else {
        write_address_port(&mut buf, &request.address, request.port)?;
    }
    stream.write_all(&buf).await?;

    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await?;
    if head[1] != STATUS_SUCCESS {
        return Err(SocksError::Rejected(head[1]));
    }

    let (address, port) = read_address_port(stream).await?;
    trace!(bound = %address, port, "upstream handshake complete");

    if request.command == RequestCommand::Udp {
        return Ok(Some(RequestHeader {
            version: SOCKS5_VERSION,
            command: RequestCommand::Udp,
            address,
            port,
            user: request.user.clone(),
        }));
    }
    Ok(None)
}
