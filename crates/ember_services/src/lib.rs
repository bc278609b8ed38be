//! # Ember Services
//!
//! Service layer for the Ember game runtime.
//!
//! Provides the long-lived pieces games share:
//! - Service registry with dependency ordering and lifecycle
//! - Configuration with environment layering
//! - Asset registration, loading, caching and pruning
//!
//! Services talk to each other through a shared [`ServiceBus`].
//!
//! ## Usage
//!
//! ```ignore
//! let bus = ServiceBus::new();
//! let registry = ServiceRegistry::new(bus.clone());
//!
//! let config = Arc::new(
//!     ConfigurationService::new("production")
//!         .with_bus(bus.clone())
//!         .with_source("default", "config/default.json"),
//! );
//! // reads the `assets` section once `config` has initialized
//! let assets = AssetService::new(
//!     AssetServiceConfig::default(),
//!     bus.clone(),
//!     Arc::new(FsLoader::new("assets")),
//! )?
//! .configured_by("config");
//!
//! registry.register_service("config", config)?;
//! registry.register_service("assets", Arc::new(assets))?;
//! registry.initialize().await?;
//!
//! let assets = registry.get_service::<AssetService>("assets")?;
//! assets.register_asset("hero", "hero.png", AssetKind::Image, AssetOptions::default())?;
//! assets.load_asset("hero").await?;
//! ```

pub mod asset;
pub mod config;
pub mod events;
pub mod registry;
pub mod service;

pub use asset::{
    AssetError, AssetKind, AssetLoader, AssetOptions, AssetService, AssetServiceConfig,
    CachePolicy, FsLoader,
};
pub use config::{ConfigError, ConfigurationService};
pub use events::{names, CoreEvent, ServiceBus};
pub use registry::{ServiceRegistry, ShutdownReport};
pub use service::{
    Dependencies, Pausable, RecoveryOutcome, Service, ServiceError, ServiceId, ServiceResult,
    ServiceState, Updatable,
};

use thiserror::Error;

/// Service layer errors
#[derive(Debug, Error)]
pub enum ServicesError {
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Asset error: {0}")]
    Asset(#[from] AssetError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Event bus error: {0}")]
    Bus(#[from] ember_event::BusError),
}

pub type ServicesResult<T> = Result<T, ServicesError>;
