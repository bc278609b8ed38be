//! Event bus
//!
//! Synchronous publish/subscribe hub. Emission invokes every matching handler
//! in subscription order before returning. Handlers run with no lock held, so
//! they may emit, subscribe or unsubscribe re-entrantly.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{BusError, BusResult};
use crate::pattern::{self, Pattern, WILDCARD};
use crate::scope::ScopedBus;
use crate::throttle::Throttle;

/// Subscription identifier, monotonically increasing per bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Get the raw ID
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An emitted event as seen by handlers
#[derive(Debug, Clone)]
pub struct EventEnvelope<P> {
    /// Full event name
    pub name: String,
    /// Event payload
    pub payload: P,
}

/// Payloads that carry their own event name
pub trait NamedEvent {
    /// The name this payload is emitted under
    fn event_name(&self) -> &str;
}

/// Error reported by a failing handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError(pub String);

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for HandlerError {}

/// Handler outcome
pub type HandlerResult = Result<(), HandlerError>;

/// Return types accepted from handler closures
pub trait IntoHandlerResult {
    fn into_handler_result(self) -> HandlerResult;
}

impl IntoHandlerResult for () {
    fn into_handler_result(self) -> HandlerResult {
        Ok(())
    }
}

impl<E: fmt::Display> IntoHandlerResult for Result<(), E> {
    fn into_handler_result(self) -> HandlerResult {
        self.map_err(|e| HandlerError(e.to_string()))
    }
}

type Handler<P> = dyn Fn(&EventEnvelope<P>) -> HandlerResult + Send + Sync;

/// Result of a single emission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitStatus {
    /// Delivered to this many handlers (possibly zero)
    Delivered(usize),
    /// Dropped by a throttle window
    Throttled,
    /// The event name was not a valid concrete name
    Rejected,
}

impl EmitStatus {
    /// Number of handlers invoked
    pub fn delivered(&self) -> usize {
        match self {
            Self::Delivered(n) => *n,
            _ => 0,
        }
    }
}

/// Bus statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Emissions accepted for delivery
    pub events_emitted: u64,
    /// Emissions dropped by throttling
    pub events_throttled: u64,
    /// Handler invocations
    pub handlers_invoked: u64,
    /// Handlers that returned an error or panicked
    pub handler_failures: u64,
}

struct Subscriber<P> {
    id: SubscriptionId,
    once: bool,
    scope: Option<Arc<str>>,
    handler: Arc<Handler<P>>,
}

struct BusState<P> {
    /// Subscribers keyed by pattern, each list in subscription order
    subscribers: HashMap<String, Vec<Subscriber<P>>>,
    throttles: HashMap<String, Throttle>,
    stats: BusStats,
}

impl<P> BusState<P> {
    /// Collect handlers for a concrete name, consuming `once` subscriptions.
    ///
    /// Only the exact, `parent.*` and `*` buckets are visited.
    fn take_handlers(&mut self, name: &str) -> Vec<(SubscriptionId, Arc<Handler<P>>)> {
        let parent = pattern::parent_wildcard(name);
        let keys = [Some(name), parent.as_deref(), Some(WILDCARD)];

        let mut matched = Vec::new();
        let mut buckets = 0;
        for key in keys.into_iter().flatten() {
            let Some(subscribers) = self.subscribers.get_mut(key) else {
                continue;
            };
            buckets += 1;
            matched.extend(subscribers.iter().map(|s| (s.id, Arc::clone(&s.handler))));
            subscribers.retain(|s| !s.once);
            if subscribers.is_empty() {
                self.subscribers.remove(key);
            }
        }

        if buckets > 1 {
            matched.sort_by_key(|(id, _)| *id);
        }
        matched
    }

    fn remove(&mut self, key: &str, id: SubscriptionId) -> bool {
        let Some(subscribers) = self.subscribers.get_mut(key) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            self.subscribers.remove(key);
        }
        removed
    }
}

pub(crate) struct BusInner<P> {
    state: Mutex<BusState<P>>,
    next_id: AtomicU64,
}

/// Handle returned by `on`/`once`
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription<P> {
    id: SubscriptionId,
    key: String,
    bus: Weak<BusInner<P>>,
}

impl<P> Subscription<P> {
    /// Subscription ID
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The pattern this subscription listens on
    pub fn pattern(&self) -> &str {
        &self.key
    }

    /// Remove the subscription. Returns false if it was already gone
    /// (unsubscribed, fired as `once`, cleared, or the bus was dropped).
    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => inner.state.lock().remove(&self.key, self.id),
            None => false,
        }
    }
}

impl<P> fmt::Debug for Subscription<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.key)
            .finish()
    }
}

/// Publish/subscribe event bus
///
/// Cloning is cheap and yields another handle to the same bus.
pub struct EventBus<P> {
    inner: Arc<BusInner<P>>,
}

impl<P> Clone for EventBus<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Send + Sync + 'static> Default for EventBus<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Send + Sync + 'static> EventBus<P> {
    /// Create a new event bus
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState {
                    subscribers: HashMap::new(),
                    throttles: HashMap::new(),
                    stats: BusStats::default(),
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Emit an event to every matching subscriber
    pub fn emit(&self, name: impl Into<String>, payload: P) -> EmitStatus {
        let name = name.into();
        if let Err(reason) = pattern::validate_name(&name) {
            log::warn!("Rejected emission of '{}': {}", name, reason);
            return EmitStatus::Rejected;
        }

        let handlers = {
            let mut state = self.inner.state.lock();
            if let Some(throttle) = state.throttles.get_mut(&name) {
                if !throttle.admit(Instant::now()) {
                    state.stats.events_throttled += 1;
                    log::trace!("Throttled emission of '{}'", name);
                    return EmitStatus::Throttled;
                }
            }
            state.stats.events_emitted += 1;
            state.take_handlers(&name)
        };

        if handlers.is_empty() {
            return EmitStatus::Delivered(0);
        }

        let envelope = EventEnvelope { name, payload };
        let mut failures = 0;
        for (id, handler) in &handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&envelope))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    log::error!("Handler {} for '{}' failed: {}", id, envelope.name, e);
                }
                Err(panic) => {
                    failures += 1;
                    log::error!(
                        "Handler {} for '{}' panicked: {}",
                        id,
                        envelope.name,
                        panic_message(panic.as_ref())
                    );
                }
            }
        }

        let mut state = self.inner.state.lock();
        state.stats.handlers_invoked += handlers.len() as u64;
        state.stats.handler_failures += failures;

        EmitStatus::Delivered(handlers.len())
    }

    /// Emit a payload under its own name
    pub fn publish(&self, payload: P) -> EmitStatus
    where
        P: NamedEvent,
    {
        let name = payload.event_name().to_string();
        self.emit(name, payload)
    }

    /// Subscribe to a pattern
    pub fn on<F, R>(&self, pattern: &str, handler: F) -> BusResult<Subscription<P>>
    where
        F: Fn(&EventEnvelope<P>) -> R + Send + Sync + 'static,
        R: IntoHandlerResult,
    {
        self.subscribe(pattern, false, None, wrap(handler))
    }

    /// Subscribe to a pattern for a single delivery
    pub fn once<F, R>(&self, pattern: &str, handler: F) -> BusResult<Subscription<P>>
    where
        F: Fn(&EventEnvelope<P>) -> R + Send + Sync + 'static,
        R: IntoHandlerResult,
    {
        self.subscribe(pattern, true, None, wrap(handler))
    }

    pub(crate) fn subscribe(
        &self,
        pattern: &str,
        once: bool,
        scope: Option<Arc<str>>,
        handler: Arc<Handler<P>>,
    ) -> BusResult<Subscription<P>> {
        let key = Pattern::parse(pattern)?.key();
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));

        self.inner
            .state
            .lock()
            .subscribers
            .entry(key.clone())
            .or_default()
            .push(Subscriber {
                id,
                once,
                scope,
                handler,
            });

        Ok(Subscription {
            id,
            key,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Remove a specific subscription. No-op (returns false) if not found.
    pub fn off(&self, pattern: &str, id: SubscriptionId) -> bool {
        self.inner.state.lock().remove(pattern, id)
    }

    /// Remove every subscription on a pattern
    pub fn off_all(&self, pattern: &str) -> usize {
        self.inner
            .state
            .lock()
            .subscribers
            .remove(pattern)
            .map_or(0, |subs| subs.len())
    }

    /// Limit deliveries of `name` to one per `interval`
    pub fn throttle(&self, name: &str, interval: Duration) -> BusResult<()> {
        if let Err(reason) = pattern::validate_name(name) {
            return Err(BusError::Throttle {
                event: name.to_string(),
                reason,
            });
        }
        if interval.is_zero() {
            return Err(BusError::Throttle {
                event: name.to_string(),
                reason: "interval must be greater than zero",
            });
        }

        self.inner
            .state
            .lock()
            .throttles
            .insert(name.to_string(), Throttle::new(interval));
        Ok(())
    }

    /// Remove a throttle
    pub fn unthrottle(&self, name: &str) -> bool {
        self.inner.state.lock().throttles.remove(name).is_some()
    }

    /// Configured throttle interval for a name
    pub fn throttle_interval(&self, name: &str) -> Option<Duration> {
        self.inner.state.lock().throttles.get(name).map(Throttle::interval)
    }

    /// Create a namespaced view of this bus
    pub fn create_scope(&self, namespace: &str) -> BusResult<ScopedBus<P>> {
        ScopedBus::new(self.clone(), namespace)
    }

    /// Resolve with the next payload emitted under `name`.
    ///
    /// The subscription is registered immediately, so emissions between this
    /// call and the first poll are not missed. Resolves to `None` if the
    /// subscription is removed before it fires.
    pub fn wait_for(&self, name: &str) -> BusResult<impl Future<Output = Option<P>>>
    where
        P: Clone,
    {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.once(name, move |event: &EventEnvelope<P>| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(event.payload.clone());
            }
        })?;
        Ok(async move { rx.await.ok() })
    }

    /// Patterns that currently have subscribers, sorted
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state.lock().subscribers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of subscriptions registered on exactly this pattern
    pub fn subscriber_count(&self, pattern: &str) -> usize {
        self.inner
            .state
            .lock()
            .subscribers
            .get(pattern)
            .map_or(0, Vec::len)
    }

    /// Number of subscriptions an emission of `name` would reach
    pub fn matching_subscriber_count(&self, name: &str) -> usize {
        let parent = pattern::parent_wildcard(name);
        let state = self.inner.state.lock();
        [Some(name), parent.as_deref(), Some(WILDCARD)]
            .into_iter()
            .flatten()
            .filter_map(|key| state.subscribers.get(key))
            .map(Vec::len)
            .sum()
    }

    /// Drop every subscription and throttle, and reset statistics
    pub fn clear_all_events(&self) {
        let mut state = self.inner.state.lock();
        state.subscribers.clear();
        state.throttles.clear();
        state.stats = BusStats::default();
    }

    /// Snapshot of bus statistics
    pub fn stats(&self) -> BusStats {
        self.inner.state.lock().stats.clone()
    }

    /// Remove every subscription created through a scope
    pub(crate) fn remove_scope(&self, scope: &str) -> usize {
        let mut state = self.inner.state.lock();
        let mut removed = 0;
        state.subscribers.retain(|_, subscribers| {
            let before = subscribers.len();
            subscribers.retain(|s| s.scope.as_deref() != Some(scope));
            removed += before - subscribers.len();
            !subscribers.is_empty()
        });
        removed
    }

    /// Number of subscriptions created through a scope
    pub(crate) fn scope_subscriber_count(&self, scope: &str) -> usize {
        self.inner
            .state
            .lock()
            .subscribers
            .values()
            .flatten()
            .filter(|s| s.scope.as_deref() == Some(scope))
            .count()
    }
}

pub(crate) fn wrap<P, F, R>(handler: F) -> Arc<Handler<P>>
where
    P: 'static,
    F: Fn(&EventEnvelope<P>) -> R + Send + Sync + 'static,
    R: IntoHandlerResult,
{
    Arc::new(move |event: &EventEnvelope<P>| handler(event).into_handler_result())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}
