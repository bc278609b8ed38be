//! Asset loaders
//!
//! The asset service never touches the filesystem or decoders directly; it
//! hands a [`LoadRequest`] to an [`AssetLoader`] and caches whatever comes
//! back. [`FsLoader`] is the default implementation, reading from a root
//! directory.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::types::{AssetData, AssetKind, AssetOptions, AudioData, TextureData};

/// Bitrate assumed for audio without explicit metadata
pub const DEFAULT_AUDIO_BITRATE_KBPS: u32 = 128;

/// Error during a single load attempt
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unsupported asset kind: {0}")]
    Unsupported(AssetKind),

    #[error("{0}")]
    Other(String),
}

/// What to load
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub key: String,
    pub path: String,
    pub kind: AssetKind,
    pub options: AssetOptions,
    /// 1-based attempt number
    pub attempt: u32,
}

/// Fetches and decodes assets
#[async_trait]
pub trait AssetLoader: Send + Sync {
    /// Load one asset
    async fn load(&self, request: &LoadRequest) -> Result<AssetData, LoaderError>;

    /// Called after an asset leaves the cache
    fn release(&self, _key: &str, _kind: AssetKind) {}
}

/// Loads assets from a directory
#[derive(Debug, Clone)]
pub struct FsLoader {
    root: PathBuf,
}

impl FsLoader {
    /// Create a loader rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn load_texture(&self, full: PathBuf, options: &AssetOptions) -> Result<AssetData, LoaderError> {
        let (width, height) = tokio::task::spawn_blocking(move || image::image_dimensions(&full))
            .await
            .map_err(|e| LoaderError::Other(e.to_string()))??;

        let frame_count = match (options.frame_width, options.frame_height) {
            (Some(fw), Some(fh)) if fw > 0 && fh > 0 => ((width / fw) * (height / fh)).max(1),
            _ => 1,
        };

        Ok(AssetData::Texture(Arc::new(TextureData {
            width,
            height,
            frame_count,
        })))
    }

    async fn load_audio(&self, full: &Path, options: &AssetOptions) -> Result<AssetData, LoaderError> {
        let byte_len = tokio::fs::metadata(full).await?.len();
        let bits = byte_len as f64 * 8.0;

        let (duration_secs, bitrate_kbps) = match (options.duration_secs, options.bitrate_kbps) {
            (Some(d), Some(b)) => (d, b),
            (Some(d), None) if d > 0.0 => (d, (bits / f64::from(d) / 1000.0).round() as u32),
            (None, Some(b)) if b > 0 => ((bits / (f64::from(b) * 1000.0)) as f32, b),
            _ => (
                (bits / (f64::from(DEFAULT_AUDIO_BITRATE_KBPS) * 1000.0)) as f32,
                DEFAULT_AUDIO_BITRATE_KBPS,
            ),
        };

        Ok(AssetData::Audio(Arc::new(AudioData {
            duration_secs,
            bitrate_kbps,
            byte_len,
        })))
    }
}

#[async_trait]
impl AssetLoader for FsLoader {
    async fn load(&self, request: &LoadRequest) -> Result<AssetData, LoaderError> {
        let full = self.root.join(&request.path);
        log::trace!("Loading '{}' from {}", request.key, full.display());

        match request.kind {
            AssetKind::Image | AssetKind::Spritesheet | AssetKind::Atlas | AssetKind::BitmapFont => {
                self.load_texture(full, &request.options).await
            }
            AssetKind::Audio => self.load_audio(&full, &request.options).await,
            AssetKind::Json | AssetKind::Tilemap => {
                let text = tokio::fs::read_to_string(&full).await?;
                let value: serde_json::Value = serde_json::from_str(&text)?;
                Ok(AssetData::Json(Arc::new(value)))
            }
            AssetKind::Html | AssetKind::Shader => {
                let text = tokio::fs::read_to_string(&full).await?;
                Ok(AssetData::Text(text.into()))
            }
            AssetKind::Video => {
                let bytes = tokio::fs::read(&full).await?;
                Ok(AssetData::Binary(bytes.into()))
            }
        }
    }
}
