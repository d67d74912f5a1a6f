//! Error types for relay-router
//!
//! This module defines the error hierarchy for the outbound dispatch layer
//! and the SOCKS protocol engine. All errors are categorized by subsystem
//! and include recovery hints.

use std::io;

use thiserror::Error;

/// Top-level error type for relay-router
#[derive(Debug, Error)]
pub enum RouterError {
    /// Configuration errors (parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// SOCKS protocol errors
    #[error("SOCKS error: {0}")]
    Socks(#[from] SocksError),

    /// Outbound dispatch errors
    #[error("Outbound error: {0}")]
    Outbound(#[from] OutboundError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RouterError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Socks(e) => e.is_recoverable(),
            Self::Outbound(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// SOCKS protocol errors
///
/// Every rejection path in the handshake engine writes the protocol-correct
/// failure reply before one of these errors is returned, so the peer always
/// observes a well-formed response frame.
#[derive(Debug, Error)]
pub enum SocksError {
    /// Malformed or short handshake header
    #[error("insufficient header")]
    InsufficientHeader,

    /// A null-delimited string exceeded the scratch buffer
    #[error("buffer overrun reading null-terminated string")]
    BufferOverrun,

    /// Unknown SOCKS version byte
    #[error("unknown SOCKS version: {0:#04x}")]
    UnsupportedVersion(u8),

    /// Command not supported (BIND, unknown)
    #[error("unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    /// SOCKS4 request received while authentication is required
    #[error("SOCKS4 is not allowed when authentication is required")]
    Socks4AuthRequired,

    /// None of the client's offered auth methods is acceptable
    #[error("no matching auth method")]
    NoAcceptableMethod,

    /// Server selected an auth method the client did not offer
    #[error("auth method not supported: {0:#04x}")]
    AuthMethodNotSupported(u8),

    /// Invalid credentials or key
    #[error("authentication failed")]
    AuthFailed,

    /// Unknown address type byte on the wire
    #[error("unknown address type: {0:#04x}")]
    InvalidAddressType(u8),

    /// Domain name exceeds the 255-byte wire limit
    #[error("domain name too long: {0} bytes")]
    DomainTooLong(usize),

    /// Fragmented UDP packet (unsupported)
    #[error("fragmented UDP payload not supported (FRAG={0})")]
    FragmentedPacket(u8),

    /// Peer rejected the request with a non-zero status
    #[error("server rejected request: {0:#04x}")]
    Rejected(u8),

    /// Other protocol violation
    #[error("SOCKS protocol error: {0}")]
    Protocol(String),

    /// I/O error on the handshake stream
    #[error("SOCKS I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SocksError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ),
            // Protocol violations on an established stream are final
            _ => false,
        }
    }
}

/// Outbound dispatch errors
#[derive(Debug, Error)]
pub enum OutboundError {
    /// Stream settings failed to parse; fatal to handler construction
    #[error("invalid stream settings: {0}")]
    InvalidStreamSettings(String),

    /// Flow rejected by the UDP/443 policy
    #[error("rejected UDP/443 traffic by policy")]
    PolicyRejected,

    /// The mux pool failed to take the flow
    #[error("failed to process mux outbound traffic: {0}")]
    MuxDispatch(String),

    /// Chain-by-tag target is not registered (falls back to direct dial)
    #[error("outbound handler not found: {tag}")]
    ChainNotFound { tag: String },

    /// Transport dial failure
    #[error("failed to dial {dest}: {reason}")]
    Dial { dest: String, reason: String },

    /// TLS client layer failure on a chained connection
    #[error("TLS error: {0}")]
    Tls(String),

    /// The stream processing of the wrapped proxy failed
    #[error("failed to process outbound traffic: {0}")]
    Process(String),

    /// I/O error
    #[error("outbound I/O error: {0}")]
    Io(#[from] io::Error),
}

impl OutboundError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::InvalidStreamSettings(_) => false,
            Self::PolicyRejected => false,
            Self::MuxDispatch(_) => true,
            Self::ChainNotFound { .. } => false,
            Self::Dial { .. } => true,
            Self::Tls(_) => false,
            Self::Process(_) => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a dial error
    pub fn dial(dest: impl ToString, reason: impl Into<String>) -> Self {
        Self::Dial {
            dest: dest.to_string(),
            reason: reason.into(),
        }
    }

    /// Benign termination: EOF, closed pipe, and cancellation are clean
    /// shutdown, never reportable failures.
    #[must_use]
    pub fn is_benign(&self) -> bool {
        match self {
            Self::Io(e) => is_benign_io(e),
            _ => false,
        }
    }
}

/// Classify an I/O error as benign flow termination (EOF, closed pipe,
/// cancellation).
#[must_use]
pub fn is_benign_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe | io::ErrorKind::Interrupted
    )
}

/// Type alias for Result with RouterError
pub type Result<T> = std::result::Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recovery_classification() {
        let config_err = ConfigError::validation("test");
        assert!(!config_err.is_recoverable());

        let dial_err = OutboundError::dial("1.2.3.4:80", "connection refused");
        assert!(dial_err.is_recoverable());

        let policy_err = OutboundError::PolicyRejected;
        assert!(!policy_err.is_recoverable());

        let auth_err = SocksError::AuthFailed;
        assert!(!auth_err.is_recoverable());
    }

    #[test]
    fn test_benign_io_classification() {
        assert!(is_benign_io(&io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "eof"
        )));
        assert!(is_benign_io(&io::Error::new(
            io::ErrorKind::BrokenPipe,
            "closed pipe"
        )));
        assert!(!is_benign_io(&io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "refused"
        )));
    }

    #[test]
    fn test_error_display() {
        let err = SocksError::Rejected(0x5b);
        assert!(err.to_string().contains("0x5b"));

        let err = OutboundError::ChainNotFound {
            tag: "upstream".into(),
        };
        assert!(err.to_string().contains("upstream"));
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        let router_err: RouterError = io_err.into();
        assert!(router_err.is_recoverable());

        let config_err = ConfigError::validation("invalid");
        let router_err: RouterError = config_err.into();
        assert!(!router_err.is_recoverable());
    }
}
