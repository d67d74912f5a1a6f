//! SOCKS wire address codec
//!
//! Addresses on the wire are `ATYP` followed by the address body and a
//! big-endian port: `0x01` four IPv4 octets, `0x03` a length-prefixed
//! domain, `0x04` sixteen IPv6 octets. The same layout appears in the
//! SOCKS5 request, the reply, and every UDP relay datagram, so the codec
//! exists in both an async stream form and a slice form.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::SocksError;
use crate::net::Address;
use crate::socks::consts::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};

/// Read an address and port from a stream.
pub async fn read_address_port<R>(reader: &mut R) -> Result<(Address, u16), SocksError>
where
    R: AsyncRead + Unpin + Send,
{
    let atyp = reader.read_u8().await?;
    let address = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            Address::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        ATYP_DOMAIN => {
            let len = reader.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            reader.read_exact(&mut name).await?;
            let name = String::from_utf8(name)
                .map_err(|_| SocksError::Protocol("domain is not valid UTF-8".into()))?;
            Address::Domain(name)
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            Address::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        other => return Err(SocksError::InvalidAddressType(other)),
    };
    let port = reader.read_u16().await?;
    Ok((address, port))
}

/// Append an address and port to a buffer.
pub fn write_address_port(
    buf: &mut BytesMut,
    address: &Address,
    port: u16,
) -> Result<(), SocksError> {
    match address {
        Address::Ip(IpAddr::V4(ip)) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&ip.octets());
        }
        Address::Ip(IpAddr::V6(ip)) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&ip.octets());
        }
        Address::Domain(name) => {
            if name.len() > 255 {
                return Err(SocksError::DomainTooLong(name.len()));
            }
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(name.len() as u8);
            buf.put_slice(name.as_bytes());
        }
    }
    buf.put_u16(port);
    Ok(())
}

/// Decode an address and port from a slice, returning the consumed length.
pub fn decode_address_port(data: &[u8]) -> Result<(Address, u16, usize), SocksError> {
    let atyp = *data.first().ok_or(SocksError::InsufficientHeader)?;
    let (address, body_len) = match atyp {
        ATYP_IPV4 => {
            let octets: [u8; 4] = data
                .get(1..5)
                .ok_or(SocksError::InsufficientHeader)?
                .try_into()
                .unwrap();
            (Address::Ip(IpAddr::V4(Ipv4Addr::from(octets))), 4)
        }
        ATYP_DOMAIN => {
            let len = *data.get(1).ok_or(SocksError::InsufficientHeader)? as usize;
            let name = data
                .get(2..2 + len)
                .ok_or(SocksError::InsufficientHeader)?;
            let name = String::from_utf8(name.to_vec())
                .map_err(|_| SocksError::Protocol("domain is not valid UTF-8".into()))?;
            (Address::Domain(name), 1 + len)
        }
        ATYP_IPV6 => {
            let octets: [u8; 16] = data
                .get(1..17)
                .ok_or(SocksError::InsufficientHeader)?
                .try_into()
                .unwrap();
            (Address::Ip(IpAddr::V6(Ipv6Addr::from(octets))), 16)
        }
        other => return Err(SocksError::InvalidAddressType(other)),
    };
    let port_at = 1 + body_len;
    let port_bytes: [u8; 2] = data
        .get(port_at..port_at + 2)
        .ok_or(SocksError::InsufficientHeader)?
        .try_into()
        .unwrap();
    Ok((address, u16::from_be_bytes(port_bytes), port_at + 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_ipv4() {
        let wire = [0x01, 8, 8, 4, 4, 0x00, 0x35];
        let mut reader = &wire[..];
        let (addr, port) = read_address_port(&mut reader).await.unwrap();
        assert_eq!(addr, Address::parse("8.8.4.4"));
        assert_eq!(port, 53);
    }

    #[tokio::test]
    async fn test_read_domain() {
        let mut wire = vec![0x03, 11];
        wire.extend_from_slice(b"example.com");
        wire.extend_from_slice(&443u16.to_be_bytes());
        let mut reader = &wire[..];
        let (addr, port) = read_address_port(&mut reader).await.unwrap();
        assert_eq!(addr, Address::Domain("example.com".into()));
        assert_eq!(port, 443);
    }

    #[tokio::test]
    async fn test_unknown_atyp() {
        let wire = [0x02, 0, 0];
        let mut reader = &wire[..];
        let err = read_address_port(&mut reader).await.unwrap_err();
        assert!(matches!(err, SocksError::InvalidAddressType(0x02)));
    }

    #[test]
    fn test_write_then_decode() {
        let mut buf = BytesMut::new();
        write_address_port(&mut buf, &Address::parse("2001:db8::1"), 8443).unwrap();
        let (addr, port, consumed) = decode_address_port(&buf).unwrap();
        assert_eq!(addr, Address::parse("2001:db8::1"));
        assert_eq!(port, 8443);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_domain_too_long() {
        let mut buf = BytesMut::new();
        let long = "a".repeat(256);
        let err = write_address_port(&mut buf, &Address::Domain(long), 80).unwrap_err();
        assert!(matches!(err, SocksError::DomainTooLong(256)));
    }

    #[test]
    fn test_decode_truncated() {
        // Domain length claims more bytes than remain.
        let wire = [0x03, 10, b'a', b'b'];
        assert!(matches!(
            decode_address_port(&wire),
            Err(SocksError::InsufficientHeader)
        ));
    }
}
