//! Egress address selection
//!
//! A handler's `via` setting is parsed once into an [`EgressPolicy`], so the
//! per-dial path is a tag match rather than string comparison. The resolved
//! address is recorded as the gateway hint on the session's active outbound
//! record; the transport dialer binds near it.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use rand::rngs::OsRng;
use rand::Rng;
use tracing::debug;

use crate::config::ViaConfig;
use crate::error::ConfigError;
use crate::net::Address;
use crate::session::SessionContext;

/// How a handler picks its egress address for each dial
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EgressPolicy {
    /// Uniformly random address inside a subnet, fresh per dial
    Cidr(IpNet),
    /// Session identity when it encodes an IP, else the inbound local address
    Origin,
    /// The inbound client's source address
    SrcIp,
    /// A fixed address
    Fixed(Address),
}

impl EgressPolicy {
    /// Parse a validated via config into a policy
    pub fn from_config(via: &ViaConfig) -> Result<Self, ConfigError> {
        if let Some(prefix) = via.cidr_prefix {
            let ip: IpAddr = via
                .address
                .parse()
                .map_err(|_| ConfigError::validation("via CIDR base must be an IP literal"))?;
            let net = IpNet::new(ip, prefix)
                .map_err(|e| ConfigError::validation(format!("invalid via CIDR: {e}")))?
                .trunc();
            return Ok(Self::Cidr(net));
        }
        Ok(match via.address.as_str() {
            "origin" => Self::Origin,
            "srcip" => Self::SrcIp,
            other => Self::Fixed(Address::parse(other)),
        })
    }

    /// Resolve the egress address for the current dial. `None` means no
    /// gateway hint is set and the transport picks its own source.
    #[must_use]
    pub fn resolve(&self, ctx: &SessionContext) -> Option<Address> {
        match self {
            Self::Cidr(net) => Some(Address::Ip(random_ip_in_subnet(net))),
            Self::Origin => {
                let inbound = ctx.inbound()?;
                if let Some(user) = &inbound.user {
                    if let Some(ip) = egress_ip_from_identity(&user.email) {
                        return Some(Address::Ip(ip));
                    }
                }
                inbound.local_addr.map(|a| Address::Ip(a.ip()))
            }
            Self::SrcIp => ctx.inbound()?.peer_addr.map(|a| Address::Ip(a.ip())),
            Self::Fixed(addr) => Some(addr.clone()),
        }
    }
}

/// Pick a uniformly random address inside the subnet. Every address in the
/// subnet, network and broadcast included, is a candidate.
#[must_use]
pub fn random_ip_in_subnet(net: &IpNet) -> IpAddr {
    match net {
        IpNet::V4(net) => {
            let host_bits = 32 - u32::from(net.prefix_len());
            let offset: u32 = if host_bits >= 32 {
                OsRng.gen()
            } else {
                OsRng.gen_range(0..1u32 << host_bits)
            };
            IpAddr::V4(Ipv4Addr::from(u32::from(net.network()) | offset))
        }
        IpNet::V6(net) => {
            let host_bits = 128 - u32::from(net.prefix_len());
            let offset: u128 = if host_bits >= 128 {
                OsRng.gen()
            } else {
                OsRng.gen_range(0..1u128 << host_bits)
            };
            IpAddr::V6(Ipv6Addr::from(u128::from(net.network()) | offset))
        }
    }
}

/// Parse an identity-encoded egress IP from a user identity string:
/// `ipv4_A-B-C-D` or `ipv6_G-G-G-G-G-G-G-G` (anything after `@` ignored).
/// Malformed encodings yield `None` so the caller falls back to the inbound
/// local address.
#[must_use]
pub fn egress_ip_from_identity(email: &str) -> Option<IpAddr> {
    let ident = email.split('@').next().unwrap_or(email);
    if let Some(rest) = ident.strip_prefix("ipv4_") {
        let parts: Vec<&str> = rest.split('-').collect();
        if parts.len() >= 4 {
            if let Ok(ip) = parts[..4].join(".").parse::<Ipv4Addr>() {
                return Some(IpAddr::V4(ip));
            }
        }
        debug!(identity = %email, "unparseable ipv4 identity encoding");
        None
    } else if let Some(rest) = ident.strip_prefix("ipv6_") {
        let parts: Vec<&str> = rest.split('-').collect();
        if parts.len() >= 8 {
            if let Ok(ip) = parts[..8].join(":").parse::<Ipv6Addr>() {
                return Some(IpAddr::V6(ip));
            }
        }
        debug!(identity = %email, "unparseable ipv6 identity encoding");
        None
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{InboundRecord, User};
    use std::collections::HashSet;

    #[test]
    fn test_policy_parse() {
        let via = ViaConfig {
            address: "10.0.0.0".into(),
            cidr_prefix: Some(24),
        };
        assert!(matches!(
            EgressPolicy::from_config(&via).unwrap(),
            EgressPolicy::Cidr(_)
        ));

        let via = ViaConfig {
            address: "origin".into(),
            cidr_prefix: None,
        };
        assert_eq!(EgressPolicy::from_config(&via).unwrap(), EgressPolicy::Origin);

        let via = ViaConfig {
            address: "srcip".into(),
            cidr_prefix: None,
        };
        assert_eq!(EgressPolicy::from_config(&via).unwrap(), EgressPolicy::SrcIp);

        let via = ViaConfig {
            address: "192.0.2.5".into(),
            cidr_prefix: None,
        };
        assert_eq!(
            EgressPolicy::from_config(&via).unwrap(),
            EgressPolicy::Fixed(Address::parse("192.0.2.5"))
        );
    }

    #[test]
    fn test_random_subnet_covers_range_uniformly() {
        let net: IpNet = "10.1.2.0/24".parse().unwrap();
        let mut seen = HashSet::new();
        for _ in 0..20_000 {
            let ip = random_ip_in_subnet(&net);
            assert!(net.contains(&ip), "{ip} escaped {net}");
            seen.insert(ip);
        }
        // 20k draws over 256 values miss one with probability < 1e-30
        assert_eq!(seen.len(), 256);
    }

    #[test]
    fn test_random_subnet_degenerate_prefixes() {
        let net: IpNet = "192.0.2.7/32".parse().unwrap();
        for _ in 0..10 {
            assert_eq!(random_ip_in_subnet(&net), "192.0.2.7".parse::<IpAddr>().unwrap());
        }

        // Full-width host part must not overflow the shift.
        let net: IpNet = "0.0.0.0/0".parse().unwrap();
        let _ = random_ip_in_subnet(&net);
        let net: IpNet = "::/0".parse().unwrap();
        let _ = random_ip_in_subnet(&net);

        let net: IpNet = "2001:db8::/64".parse().unwrap();
        for _ in 0..100 {
            assert!(net.contains(&random_ip_in_subnet(&net)));
        }
    }

    #[test]
    fn test_identity_encoding() {
        assert_eq!(
            egress_ip_from_identity("ipv4_10-1-2-3@relay"),
            Some("10.1.2.3".parse().unwrap())
        );
        assert_eq!(
            egress_ip_from_identity("ipv6_2001-db8-0-0-0-0-0-1"),
            Some("2001:db8::1".parse().unwrap())
        );
        // Malformed encodings fall back silently
        assert_eq!(egress_ip_from_identity("ipv4_10-1-2"), None);
        assert_eq!(egress_ip_from_identity("ipv4_300-1-2-3"), None);
        assert_eq!(egress_ip_from_identity("ipv6_2001-db8"), None);
        assert_eq!(egress_ip_from_identity("alice@example.com"), None);
    }

    #[test]
    fn test_resolve_origin_and_srcip() {
        let ctx = SessionContext::new();
        ctx.set_inbound(InboundRecord {
            user: Some(User::new("ipv4_10-9-8-7")),
            local_addr: Some("192.0.2.1:1080".parse().unwrap()),
            peer_addr: Some("198.51.100.2:4242".parse().unwrap()),
        });

        // Identity wins over the local address
        assert_eq!(
            EgressPolicy::Origin.resolve(&ctx),
            Some(Address::parse("10.9.8.7"))
        );
        assert_eq!(
            EgressPolicy::SrcIp.resolve(&ctx),
            Some(Address::parse("198.51.100.2"))
        );

        // Malformed identity falls back to the local address
        let ctx = SessionContext::new();
        ctx.set_inbound(InboundRecord {
            user: Some(User::new("ipv4_broken")),
            local_addr: Some("192.0.2.1:1080".parse().unwrap()),
            peer_addr: None,
        });
        assert_eq!(
            EgressPolicy::Origin.resolve(&ctx),
            Some(Address::parse("192.0.2.1"))
        );
    }

    #[test]
    fn test_resolve_without_inbound() {
        let ctx = SessionContext::new();
        assert_eq!(EgressPolicy::Origin.resolve(&ctx), None);
        assert_eq!(EgressPolicy::SrcIp.resolve(&ctx), None);
        assert_eq!(
            EgressPolicy::Fixed(Address::parse("10.0.0.1")).resolve(&ctx),
            Some(Address::parse("10.0.0.1"))
        );
    }
}
