//! Outbound handler registry
//!
//! Handlers are registered by tag; the first handler added becomes the
//! default route. Lookups are lock-free reads on the shared map, safe under
//! concurrent dispatch from many flows.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::info;

use crate::error::ConfigError;
use crate::outbound::handler::OutboundHandler;

/// Tag-indexed registry of outbound handlers
#[derive(Default)]
pub struct HandlerManager {
    handlers: DashMap<String, Arc<OutboundHandler>>,
    default: RwLock<Option<Arc<OutboundHandler>>>,
}

impl HandlerManager {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a handler. The first registered handler becomes the default
    /// route; a duplicate tag is a configuration error.
    pub fn add(&self, handler: Arc<OutboundHandler>) -> Result<(), ConfigError> {
        let tag = handler.tag().to_string();
        if !tag.is_empty() {
            if self.handlers.contains_key(&tag) {
                return Err(ConfigError::validation(format!(
                    "duplicate outbound tag '{tag}'"
                )));
            }
            self.handlers.insert(tag.clone(), Arc::clone(&handler));
        }
        let mut default = self.default.write();
        if default.is_none() {
            info!(tag = %tag, "default outbound handler set");
            *default = Some(handler);
        }
        Ok(())
    }

    /// Look up a handler by tag
    #[must_use]
    pub fn get(&self, tag: &str) -> Option<Arc<OutboundHandler>> {
        self.handlers.get(tag).map(|h| Arc::clone(h.value()))
    }

    /// The default route, if any handler is registered
    #[must_use]
    pub fn default_handler(&self) -> Option<Arc<OutboundHandler>> {
        self.default.read().clone()
    }

    /// Remove a handler by tag. Removing the default clears it.
    pub fn remove(&self, tag: &str) -> bool {
        if tag.is_empty() {
            return false;
        }
        let removed = self.handlers.remove(tag);
        if let Some((_, handler)) = &removed {
            let mut default = self.default.write();
            if default
                .as_ref()
                .is_some_and(|d| Arc::ptr_eq(d, handler))
            {
                *default = None;
            }
        }
        removed.is_some()
    }

    /// Number of tagged handlers
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no tagged handlers are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Close every registered handler, best-effort
    pub async fn close_all(&self) {
        let handlers: Vec<_> = self
            .handlers
            .iter()
            .map(|h| Arc::clone(h.value()))
            .collect();
        for handler in handlers {
            handler.close().await;
        }
    }
}
