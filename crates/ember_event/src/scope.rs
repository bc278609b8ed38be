//! Namespaced bus views
//!
//! A scope prefixes every name it emits or subscribes to with
//! `namespace.`. Scopes are isolated by default: an emission of `hit` on the
//! `enemy` scope reaches `enemy.hit` subscribers only. With propagation
//! enabled the scope also re-emits the unprefixed name on the parent bus.

use std::sync::Arc;

use crate::bus::{self, EmitStatus, EventBus, EventEnvelope, IntoHandlerResult, Subscription, SubscriptionId};
use crate::error::{BusError, BusResult};
use crate::pattern::{self, WILDCARD};

/// Namespaced view of an [`EventBus`]
pub struct ScopedBus<P> {
    bus: EventBus<P>,
    namespace: Arc<str>,
    /// Copies the payload for the unprefixed re-emit; `None` keeps the scope isolated
    propagate: Option<fn(&P) -> P>,
}

impl<P> Clone for ScopedBus<P> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            namespace: Arc::clone(&self.namespace),
            propagate: self.propagate,
        }
    }
}

impl<P: Send + Sync + 'static> ScopedBus<P> {
    pub(crate) fn new(bus: EventBus<P>, namespace: &str) -> BusResult<Self> {
        pattern::validate_name(namespace).map_err(|reason| BusError::InvalidPattern {
            pattern: namespace.to_string(),
            reason,
        })?;

        Ok(Self {
            bus,
            namespace: namespace.into(),
            propagate: None,
        })
    }

    /// The full namespace prefix
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The underlying bus
    pub fn parent(&self) -> &EventBus<P> {
        &self.bus
    }

    /// Prefix a name or pattern. `*` maps to `namespace.*`.
    pub fn qualify(&self, name: &str) -> String {
        if name == WILDCARD {
            format!("{}.*", self.namespace)
        } else {
            format!("{}.{}", self.namespace, name)
        }
    }

    /// Subscribe to a pattern inside this scope
    pub fn on<F, R>(&self, pattern: &str, handler: F) -> BusResult<Subscription<P>>
    where
        F: Fn(&EventEnvelope<P>) -> R + Send + Sync + 'static,
        R: IntoHandlerResult,
    {
        self.bus.subscribe(
            &self.qualify(pattern),
            false,
            Some(Arc::clone(&self.namespace)),
            bus::wrap(handler),
        )
    }

    /// Subscribe once inside this scope
    pub fn once<F, R>(&self, pattern: &str, handler: F) -> BusResult<Subscription<P>>
    where
        F: Fn(&EventEnvelope<P>) -> R + Send + Sync + 'static,
        R: IntoHandlerResult,
    {
        self.bus.subscribe(
            &self.qualify(pattern),
            true,
            Some(Arc::clone(&self.namespace)),
            bus::wrap(handler),
        )
    }

    /// Remove a subscription made through this scope
    pub fn off(&self, pattern: &str, id: SubscriptionId) -> bool {
        self.bus.off(&self.qualify(pattern), id)
    }

    /// Nested scope: `namespace.child`
    pub fn create_scope(&self, child: &str) -> BusResult<ScopedBus<P>> {
        ScopedBus::new(self.bus.clone(), &self.qualify(child))
    }

    /// Number of subscriptions on a pattern inside this scope
    pub fn subscriber_count(&self, pattern: &str) -> usize {
        self.bus.subscriber_count(&self.qualify(pattern))
    }

    /// Number of live subscriptions created through this scope
    pub fn len(&self) -> usize {
        self.bus.scope_subscriber_count(&self.namespace)
    }

    /// True if no subscriptions were made through this scope
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every subscription created through this scope
    pub fn clear(&self) -> usize {
        self.bus.remove_scope(&self.namespace)
    }

    /// Emit `namespace.name`; with propagation, also emit `name` on the parent
    pub fn emit(&self, name: &str, payload: P) -> EmitStatus {
        match self.propagate {
            Some(duplicate) => {
                let status = self.bus.emit(self.qualify(name), duplicate(&payload));
                self.bus.emit(name, payload);
                status
            }
            None => self.bus.emit(self.qualify(name), payload),
        }
    }
}

impl<P: Clone + Send + Sync + 'static> ScopedBus<P> {
    /// Also re-emit unprefixed names on the parent bus
    pub fn with_propagation(mut self, propagate: bool) -> Self {
        self.propagate = propagate.then_some(<P as Clone>::clone as fn(&P) -> P);
        self
    }
}
