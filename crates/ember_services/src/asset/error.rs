//! Asset errors

use std::sync::Arc;

use thiserror::Error;

use super::loader::LoaderError;

/// Asset errors
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("Asset not found: {0}")]
    NotFound(String),

    #[error("Asset not loaded: {0}")]
    NotLoaded(String),

    #[error("Asset key already registered: {0}")]
    DuplicateKey(String),

    #[error("Failed to load asset '{key}' after {attempts} attempt(s): {source}")]
    LoadFailed {
        key: String,
        attempts: u32,
        #[source]
        source: Arc<LoaderError>,
    },

    #[error("Load of '{0}' was cancelled by an unload")]
    LoadCancelled(String),

    #[error("Asset type mismatch for '{key}': expected {expected}, got {actual}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Asset group not found: {0}")]
    GroupNotFound(String),

    #[error("Asset group already exists: {0}")]
    DuplicateGroup(String),

    #[error("Invalid asset service configuration: {0}")]
    InvalidConfig(String),

    #[error("No async runtime available: {0}")]
    NoRuntime(String),

    #[error("Asset service is shut down")]
    ShutDown,
}

pub type AssetResult<T> = Result<T, AssetError>;
