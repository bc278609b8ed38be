//! Asset loading, caching and memory management

pub mod cache;
pub mod error;
pub mod loader;
pub mod memory;
pub mod service;
pub mod types;

pub use cache::PruneReport;
pub use error::{AssetError, AssetResult};
pub use loader::{AssetLoader, FsLoader, LoadRequest, LoaderError};
pub use memory::{estimate_bytes, MemoryUsage};
pub use service::{AssetService, AssetServiceConfig, AssetStats, BatchReport, LoadProgress};
pub use types::{
    AssetData, AssetDefinition, AssetInfo, AssetKind, AssetOptions, AudioData, CachePolicy,
    LoadStatus, TextureData,
};
