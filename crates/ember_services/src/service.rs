//! Service trait and core types
//!
//! Defines the base Service trait that every registry-managed component
//! implements, its lifecycle states, and the capability traits the registry
//! queries instead of structural type checks.

use std::any::Any;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Service identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId(String);

impl ServiceId {
    /// Create a new service ID
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the service name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Borrow<str> for ServiceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServiceId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ServiceId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Service lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceState {
    /// Registered, `init` not yet called
    Uninitialized,
    /// `init` in progress
    Initializing,
    /// Initialized and operational
    Ready,
    /// Temporarily suspended (pausable services only)
    Paused,
    /// Failed during init or at runtime
    Error,
    /// Recovery in progress
    Recovering,
    /// Recovered with reduced functionality
    Degraded,
    /// Shut down; terminal
    Destroyed,
}

impl ServiceState {
    /// Check if service is operational (Ready or Degraded)
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }

    /// Check if service is in transition
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Initializing | Self::Recovering)
    }

    /// Check if `init` has run (successfully or not) and `shutdown` has not
    pub fn is_initialized(&self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Paused | Self::Error | Self::Recovering | Self::Degraded
        )
    }

    /// Whether the lifecycle permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: ServiceState) -> bool {
        use ServiceState::*;
        match (*self, next) {
            (Destroyed, _) => false,
            (Uninitialized, Initializing) => true,
            (Initializing, Ready) => true,
            // cancelled init
            (Initializing, Uninitialized) => true,
            (Ready, Paused) | (Paused, Ready) => true,
            (Error, Recovering) | (Degraded, Recovering) => true,
            (Recovering, Ready) | (Recovering, Degraded) => true,
            (from, Error) => from != Uninitialized && from != Error,
            (from, Destroyed) => from != Initializing,
            _ => false,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Recovering => "recovering",
            Self::Degraded => "degraded",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Outcome of a recovery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryOutcome {
    /// Fully recovered
    Recovered,
    /// Running with reduced functionality
    Degraded,
}

/// Service errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Service '{id}' failed to initialize: {source}")]
    Initialization {
        id: ServiceId,
        #[source]
        source: Box<ServiceError>,
    },

    #[error("Service not found: {0}")]
    NotFound(ServiceId),

    #[error("Service '{service}' depends on unregistered service '{dependency}'")]
    Dependency {
        service: ServiceId,
        dependency: ServiceId,
    },

    #[error("Circular dependency: {}", format_cycle(.cycle))]
    CircularDependency { cycle: Vec<ServiceId> },

    #[error("Service already registered: {0}")]
    AlreadyRegistered(ServiceId),

    #[error("Cannot register service '{id}': {reason}")]
    Registration { id: ServiceId, reason: String },

    #[error("Service '{id}': invalid state transition {from} -> {to}")]
    InvalidTransition {
        id: ServiceId,
        from: ServiceState,
        to: ServiceState,
    },

    #[error("Registry initialization already in progress")]
    AlreadyInitializing,

    #[error("Service '{id}' does not support {capability}")]
    Unsupported {
        id: ServiceId,
        capability: &'static str,
    },

    #[error("Service '{id}' is not a {expected}")]
    TypeMismatch { id: ServiceId, expected: &'static str },

    #[error("Service operation failed: {0}")]
    Operation(String),
}

impl ServiceError {
    /// Shorthand for an operation failure
    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation(message.into())
    }
}

fn format_cycle(cycle: &[ServiceId]) -> String {
    cycle
        .iter()
        .map(ServiceId::name)
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Dependency instances handed to a service before `init`
pub struct Dependencies {
    instances: HashMap<ServiceId, Arc<dyn Any + Send + Sync>>,
}

impl Dependencies {
    pub(crate) fn new(instances: HashMap<ServiceId, Arc<dyn Any + Send + Sync>>) -> Self {
        Self { instances }
    }

    /// Get a typed dependency
    pub fn get<T: Send + Sync + 'static>(&self, id: &str) -> ServiceResult<Arc<T>> {
        let instance = self
            .instances
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(id.into()))?;
        instance.downcast::<T>().map_err(|_| ServiceError::TypeMismatch {
            id: id.into(),
            expected: std::any::type_name::<T>(),
        })
    }

    /// Check whether a dependency was resolved
    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    /// Number of resolved dependencies
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// True if the service has no dependencies
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Services that want a per-frame tick
pub trait Updatable: Send + Sync {
    /// Advance by `dt` seconds
    fn update(&self, dt: f32);
}

/// Services that can be suspended and resumed
pub trait Pausable: Send + Sync {
    /// Suspend work
    fn pause(&self);

    /// Resume work
    fn resume(&self);
}

/// Base trait for all services
///
/// Instances are shared (`Arc`), so lifecycle methods take `&self` and
/// services keep mutable state behind their own locks.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Dependencies declared by the service itself
    fn dependencies(&self) -> Vec<ServiceId> {
        Vec::new()
    }

    /// Injection point, called with resolved dependencies before `init`
    fn inject(&self, _deps: &Dependencies) -> ServiceResult<()> {
        Ok(())
    }

    /// Initialize the service
    async fn init(&self) -> ServiceResult<()> {
        Ok(())
    }

    /// Release resources; called in reverse dependency order
    async fn shutdown(&self) -> ServiceResult<()> {
        Ok(())
    }

    /// Attempt to leave the error state
    async fn recover(&self) -> ServiceResult<RecoveryOutcome> {
        Ok(RecoveryOutcome::Recovered)
    }

    /// Per-frame update capability
    fn as_updatable(&self) -> Option<&dyn Updatable> {
        None
    }

    /// Pause/resume capability
    fn as_pausable(&self) -> Option<&dyn Pausable> {
        None
    }
}
