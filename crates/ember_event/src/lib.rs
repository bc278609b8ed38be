//! # ember_event - Event Bus
//!
//! Publish/subscribe hub used for all inter-component communication:
//! - Synchronous delivery in subscription order
//! - Exact, one-segment wildcard (`prefix.*`) and global (`*`) patterns
//! - Once-subscriptions and unsubscribe handles
//! - Per-subscriber error and panic isolation
//! - Leading-edge throttling
//! - Namespaced scopes
//!
//! ## Example
//!
//! ```
//! use ember_event::{EventBus, EventEnvelope};
//!
//! let bus: EventBus<u32> = EventBus::new();
//! let sub = bus
//!     .on("player.*", |e: &EventEnvelope<u32>| println!("{} -> {}", e.name, e.payload))
//!     .unwrap();
//!
//! assert_eq!(bus.emit("player.move", 3).delivered(), 1);
//! sub.unsubscribe();
//! ```

pub mod bus;
pub mod error;
pub mod pattern;
pub mod scope;
mod throttle;

pub use bus::{
    BusStats, EmitStatus, EventBus, EventEnvelope, HandlerError, HandlerResult,
    IntoHandlerResult, NamedEvent, Subscription, SubscriptionId,
};
pub use error::{BusError, BusResult};
pub use pattern::{Pattern, WILDCARD};
pub use scope::ScopedBus;

/// Prelude
pub mod prelude {
    pub use crate::{EmitStatus, EventBus, EventEnvelope, NamedEvent, ScopedBus, Subscription};
}
