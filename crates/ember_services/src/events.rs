//! Events emitted by the service layer
//!
//! Every event the registry, asset service and configuration service publish
//! is a [`CoreEvent`]. Names are stable; subscribe with the constants in
//! [`names`] or with a wildcard.

use ember_event::{EventBus, NamedEvent};
use serde::Serialize;

use crate::asset::{AssetKind, LoadProgress, MemoryUsage, PruneReport};
use crate::service::ServiceId;

/// Stable event names
pub mod names {
    pub const ASSET_REGISTERED: &str = "asset:registered";
    pub const ASSET_LOAD_START: &str = "asset:load:start";
    pub const ASSET_LOAD_COMPLETE: &str = "asset:load:complete";
    pub const ASSET_LOAD_ERROR: &str = "asset:load:error";
    pub const ASSET_LOAD_PROGRESS: &str = "asset:load:progress";
    pub const ASSET_UNLOADED: &str = "asset:unloaded";
    pub const ASSET_MEMORY_WARNING: &str = "asset:memory:warning";
    pub const ASSET_CACHE_PRUNED: &str = "asset:cache:pruned";
    pub const ASSET_GROUP_CREATED: &str = "asset:group:created";
    pub const ASSET_GROUP_LOAD_COMPLETE: &str = "asset:group:load:complete";
    pub const SERVICE_INITIALIZED: &str = "service:initialized";
    pub const SERVICE_DESTROYED: &str = "service:destroyed";
    pub const SERVICE_ERROR: &str = "service:error";
    pub const CONFIG_CHANGED: &str = "config:changed";
}

/// Payload of every service-layer event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CoreEvent {
    AssetRegistered {
        key: String,
        kind: AssetKind,
    },
    AssetLoadStart {
        key: String,
        attempt: u32,
    },
    AssetLoadComplete {
        key: String,
        bytes: u64,
    },
    AssetLoadError {
        key: String,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    AssetLoadProgress(LoadProgress),
    AssetUnloaded {
        key: String,
        bytes_freed: u64,
    },
    AssetMemoryWarning(MemoryUsage),
    AssetCachePruned(PruneReport),
    AssetGroupCreated {
        group: String,
        keys: Vec<String>,
    },
    AssetGroupLoadComplete {
        group: String,
        loaded: usize,
        failed: usize,
    },
    ServiceInitialized {
        id: ServiceId,
    },
    ServiceDestroyed {
        id: ServiceId,
    },
    ServiceError {
        id: ServiceId,
        error: String,
    },
    ConfigChanged {
        environment: String,
        key: String,
    },
    /// Application-defined event; emitted under `name`
    Custom {
        name: String,
        data: serde_json::Value,
    },
}

impl CoreEvent {
    /// Application event with a JSON payload
    pub fn custom(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self::Custom {
            name: name.into(),
            data,
        }
    }
}

impl NamedEvent for CoreEvent {
    fn event_name(&self) -> &str {
        match self {
            Self::AssetRegistered { .. } => names::ASSET_REGISTERED,
            Self::AssetLoadStart { .. } => names::ASSET_LOAD_START,
            Self::AssetLoadComplete { .. } => names::ASSET_LOAD_COMPLETE,
            Self::AssetLoadError { .. } => names::ASSET_LOAD_ERROR,
            Self::AssetLoadProgress(_) => names::ASSET_LOAD_PROGRESS,
            Self::AssetUnloaded { .. } => names::ASSET_UNLOADED,
            Self::AssetMemoryWarning(_) => names::ASSET_MEMORY_WARNING,
            Self::AssetCachePruned(_) => names::ASSET_CACHE_PRUNED,
            Self::AssetGroupCreated { .. } => names::ASSET_GROUP_CREATED,
            Self::AssetGroupLoadComplete { .. } => names::ASSET_GROUP_LOAD_COMPLETE,
            Self::ServiceInitialized { .. } => names::SERVICE_INITIALIZED,
            Self::ServiceDestroyed { .. } => names::SERVICE_DESTROYED,
            Self::ServiceError { .. } => names::SERVICE_ERROR,
            Self::ConfigChanged { .. } => names::CONFIG_CHANGED,
            Self::Custom { name, .. } => name,
        }
    }
}

/// The bus shared by all services
pub type ServiceBus = EventBus<CoreEvent>;
