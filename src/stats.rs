//! Traffic counters and stats/policy capabilities
//!
//! Counters are updated concurrently by every flow through a handler and use
//! atomic accumulation. The stats registry and the system policy are modeled
//! as constructor-injected capabilities rather than ambient singletons.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// A named, atomically accumulated byte counter
#[derive(Debug)]
pub struct TrafficCounter {
    name: String,
    value: AtomicU64,
}

impl TrafficCounter {
    /// Create a counter with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: AtomicU64::new(0),
        }
    }

    /// Counter name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add bytes to the counter
    pub fn add(&self, bytes: u64) {
        self.value.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Stats registry capability: counters are looked up or created by name.
pub trait StatsRegistry: Send + Sync {
    /// Get or register a counter; `None` means stats collection declined it.
    fn get_or_register_counter(&self, name: &str) -> Option<Arc<TrafficCounter>>;
}

/// In-memory stats registry
#[derive(Debug, Default)]
pub struct MemoryStatsRegistry {
    counters: DashMap<String, Arc<TrafficCounter>>,
}

impl MemoryStatsRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a counter without registering it
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<TrafficCounter>> {
        self.counters.get(name).map(|c| Arc::clone(c.value()))
    }

    /// Number of registered counters
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether no counters are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl StatsRegistry for MemoryStatsRegistry {
    fn get_or_register_counter(&self, name: &str) -> Option<Arc<TrafficCounter>> {
        Some(Arc::clone(
            self.counters
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(TrafficCounter::new(name)))
                .value(),
        ))
    }
}

/// System policy capability: whether outbound traffic stats are enabled.
pub trait SystemPolicy: Send + Sync {
    /// Uplink (write direction) byte counting enabled
    fn outbound_uplink_stats(&self) -> bool;
    /// Downlink (read direction) byte counting enabled
    fn outbound_downlink_stats(&self) -> bool;
}

/// Fixed system policy
#[derive(Debug, Clone, Copy)]
pub struct StaticPolicy {
    /// Enable uplink counting
    pub uplink: bool,
    /// Enable downlink counting
    pub downlink: bool,
}

impl StaticPolicy {
    /// Policy with both directions enabled
    #[must_use]
    pub const fn enabled() -> Self {
        Self {
            uplink: true,
            downlink: true,
        }
    }

    /// Policy with both directions disabled
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            uplink: false,
            downlink: false,
        }
    }
}

impl SystemPolicy for StaticPolicy {
    fn outbound_uplink_stats(&self) -> bool {
        self.uplink
    }

    fn outbound_downlink_stats(&self) -> bool {
        self.downlink
    }
}

/// Counter name for a handler's uplink traffic
#[must_use]
pub fn uplink_counter_name(tag: &str) -> String {
    format!("outbound>>>{tag}>>>traffic>>>uplink")
}

/// Counter name for a handler's downlink traffic
#[must_use]
pub fn downlink_counter_name(tag: &str) -> String {
    format!("outbound>>>{tag}>>>traffic>>>downlink")
}
