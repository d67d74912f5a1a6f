//! SOCKS wire constants

/// SOCKS protocol version 5
pub const SOCKS5_VERSION: u8 = 0x05;
/// SOCKS protocol version 4
pub const SOCKS4_VERSION: u8 = 0x04;

/// TCP CONNECT
pub const CMD_TCP_CONNECT: u8 = 0x01;
/// TCP BIND (not supported)
pub const CMD_TCP_BIND: u8 = 0x02;
/// UDP ASSOCIATE
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;
/// Tor extension: resolve a hostname over the proxy
pub const CMD_TOR_RESOLVE: u8 = 0xF0;
/// Tor extension: reverse-resolve an address over the proxy
pub const CMD_TOR_RESOLVE_PTR: u8 = 0xF1;

/// SOCKS4 result code: request granted
pub const SOCKS4_REQUEST_GRANTED: u8 = 90;
/// SOCKS4 result code: request rejected or failed
pub const SOCKS4_REQUEST_REJECTED: u8 = 91;

/// No authentication required
pub const AUTH_NOT_REQUIRED: u8 = 0x00;
/// RFC 1929 username/password
pub const AUTH_PASSWORD: u8 = 0x02;
/// No acceptable method offered
pub const AUTH_NO_MATCHING_METHOD: u8 = 0xFF;

/// Subnegotiation version for username/password auth
pub const AUTH_SUBNEGOTIATION_VERSION: u8 = 0x01;

/// SOCKS5 reply: succeeded
pub const STATUS_SUCCESS: u8 = 0x00;
/// SOCKS5 reply: command not supported
pub const STATUS_CMD_NOT_SUPPORT: u8 = 0x07;

/// Address type: IPv4
pub const ATYP_IPV4: u8 = 0x01;
/// Address type: domain name
pub const ATYP_DOMAIN: u8 = 0x03;
/// Address type: IPv6
pub const ATYP_IPV6: u8 = 0x04;

/// Bound on null-terminated handshake strings (user-id, SOCKS4a domain)
pub const MAX_NULL_TERMINATED: usize = 256;
