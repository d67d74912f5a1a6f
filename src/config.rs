//! Configuration types for relay-router
//!
//! Configuration is loaded from JSON and validated at startup. String-typed
//! policy fields in the on-disk form are parsed once into tagged enums here
//! so the hot path never compares strings.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Value a key-table entry must hold for the key to be accepted
pub const VALID_KEY: i32 = 1;

/// Top-level configuration of one outbound handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Unique tag for this handler; empty disables per-handler stats
    #[serde(default)]
    pub tag: String,

    /// Sender settings (via/chain/multiplex/stream)
    #[serde(default)]
    pub sender: Option<SenderConfig>,

    /// Opaque settings of the wrapped proxy protocol
    #[serde(default)]
    pub proxy_settings: serde_json::Value,
}

impl HandlerConfig {
    /// Create a minimal config with only a tag
    pub fn with_tag(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            sender: None,
            proxy_settings: serde_json::Value::Null,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(sender) = &self.sender {
            sender.validate()?;
        }
        Ok(())
    }
}

/// Per-handler static sender configuration. Owned exclusively by the handler
/// that loaded it; immutable after construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Optional egress "via" address: IP, CIDR base, or a domain alias
    /// (`origin`, `srcip`)
    #[serde(default)]
    pub via: Option<ViaConfig>,

    /// Route flows through another handler instead of dialing directly
    #[serde(default)]
    pub chain_tag: Option<String>,

    /// Multiplex settings
    #[serde(default)]
    pub multiplex: Option<MultiplexConfig>,

    /// Transport stream settings
    #[serde(default)]
    pub stream: Option<StreamConfig>,
}

impl SenderConfig {
    /// Validate sender configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(via) = &self.via {
            via.validate()?;
        }
        if let Some(mux) = &self.multiplex {
            mux.validate()?;
        }
        if let Some(tag) = &self.chain_tag {
            if tag.is_empty() {
                return Err(ConfigError::validation("chain_tag must not be empty"));
            }
        }
        Ok(())
    }
}

/// Egress address configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViaConfig {
    /// Via address: an IP literal, or one of the domain aliases `origin`
    /// (derive from session identity / inbound local address) and `srcip`
    /// (inbound client address), or any other value used literally
    pub address: String,

    /// When set, pick a uniformly random source address inside the subnet
    /// `address/cidr_prefix` for every dial
    #[serde(default)]
    pub cidr_prefix: Option<u8>,
}

impl ViaConfig {
    /// Validate the via configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.is_empty() {
            return Err(ConfigError::validation("via address must not be empty"));
        }
        if let Some(prefix) = self.cidr_prefix {
            let ip: IpAddr = self.address.parse().map_err(|_| {
                ConfigError::validation(format!(
                    "via address '{}' must be an IP literal when cidr_prefix is set",
                    self.address
                ))
            })?;
            let max = match ip {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix > max {
                return Err(ConfigError::validation(format!(
                    "cidr_prefix {prefix} exceeds address width {max}"
                )));
            }
        }
        Ok(())
    }
}

/// Multiplex settings.
///
/// The concurrency fields are tri-state and intentionally asymmetric between
/// the TCP and UDP pools:
/// - `concurrency < 0`: TCP mux pool present but disabled; `0`: default
///   concurrency of 8; `> 0`: that value.
/// - `xudp_concurrency < 0`: UDP pool present but disabled; `0`: no UDP pool
///   at all (distinct from disabled); `> 0`: that value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiplexConfig {
    /// Master switch for multiplexing
    #[serde(default)]
    pub enabled: bool,

    /// TCP mux pool concurrency (tri-state, see type docs)
    #[serde(default)]
    pub concurrency: i32,

    /// UDP (xudp) pool concurrency (tri-state, see type docs)
    #[serde(default)]
    pub xudp_concurrency: i32,

    /// Policy for UDP flows to port 443 when multiplexing is configured
    #[serde(default)]
    pub xudp_udp443: Udp443Policy,
}

impl MultiplexConfig {
    /// Validate multiplex configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency > 1024 || self.xudp_concurrency > 1024 {
            return Err(ConfigError::validation(
                "mux concurrency out of range (max 1024)",
            ));
        }
        Ok(())
    }
}

/// Policy for UDP flows targeting port 443 through the xudp pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Udp443Policy {
    /// Fail the flow immediately
    Reject,
    /// Bypass the pools and use the direct path
    Skip,
    /// Pass through to pool selection
    #[default]
    Allow,
}

/// Transport stream settings (on-disk form)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Optional TLS client settings; absent means plaintext
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

/// TLS client settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Server name for SNI and certificate verification; defaults to the
    /// destination address
    #[serde(default)]
    pub server_name: Option<String>,

    /// ALPN protocols to offer
    #[serde(default)]
    pub alpn: Vec<String>,

    /// Skip certificate verification (testing only)
    #[serde(default)]
    pub allow_insecure: bool,
}

/// Authentication scheme of the SOCKS server engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    /// No authentication
    #[default]
    NoAuth,
    /// RFC 1929 username/password
    Password,
    /// Key-based auth carried in the RFC 1929 password field
    Key,
}

/// A username/password account. Equality is by username only; the password
/// is checked separately via lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Username (may be empty for key auth)
    pub username: String,
    /// Password, or the key for key-based auth
    pub password: String,
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
    }
}

impl Eq for Account {}

impl Account {
    /// Create an account
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// SOCKS server engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SocksServerConfig {
    /// Authentication scheme
    #[serde(default)]
    pub auth: AuthType,

    /// username -> password table for `AuthType::Password`
    #[serde(default)]
    pub accounts: HashMap<String, String>,

    /// key -> marker table for `AuthType::Key`; a key is valid only when its
    /// entry equals [`VALID_KEY`]
    #[serde(default)]
    pub keys: HashMap<String, i32>,

    /// Whether UDP ASSOCIATE is served
    #[serde(default)]
    pub udp_enabled: bool,

    /// Address echoed to UDP clients as the relay endpoint; defaults to the
    /// inbound connection's local address
    #[serde(default)]
    pub relay_address: Option<IpAddr>,
}

impl SocksServerConfig {
    /// Exact username+password match
    #[must_use]
    pub fn has_account(&self, username: &str, password: &str) -> bool {
        self.accounts
            .get(username)
            .is_some_and(|stored| stored == password)
    }

    /// Key-only match: the key must exist and map to [`VALID_KEY`]
    #[must_use]
    pub fn validate_key(&self, key: &str) -> bool {
        self.keys.get(key).is_some_and(|v| *v == VALID_KEY)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.auth {
            AuthType::Password if self.accounts.is_empty() => Err(ConfigError::validation(
                "password auth requires at least one account",
            )),
            AuthType::Key if self.keys.is_empty() => Err(ConfigError::validation(
                "key auth requires at least one key",
            )),
            _ => Ok(()),
        }
    }
}
