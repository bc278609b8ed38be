//! Asset metadata types

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Kind of game resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssetKind {
    Image,
    Spritesheet,
    Atlas,
    Audio,
    Json,
    BitmapFont,
    Video,
    Tilemap,
    Html,
    Shader,
}

impl AssetKind {
    /// Every asset kind
    pub const ALL: [AssetKind; 10] = [
        Self::Image,
        Self::Spritesheet,
        Self::Atlas,
        Self::Audio,
        Self::Json,
        Self::BitmapFont,
        Self::Video,
        Self::Tilemap,
        Self::Html,
        Self::Shader,
    ];

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Spritesheet => "spritesheet",
            Self::Atlas => "atlas",
            Self::Audio => "audio",
            Self::Json => "json",
            Self::BitmapFont => "bitmapFont",
            Self::Video => "video",
            Self::Tilemap => "tilemap",
            Self::Html => "html",
            Self::Shader => "shader",
        }
    }

    /// Kinds that produce a texture when loaded
    pub fn is_texture(&self) -> bool {
        matches!(
            self,
            Self::Image | Self::Spritesheet | Self::Atlas | Self::BitmapFont
        )
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-asset rule governing eviction under memory pressure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CachePolicy {
    /// Never evicted or cleared in bulk
    Permanent,
    /// Lives for the play session
    #[default]
    Session,
    /// Lives for the current level
    Level,
    /// First to go
    Temporary,
    /// Lifetime managed by the caller; never pruned automatically
    Custom,
}

impl CachePolicy {
    /// Whether `prune_cache` may evict assets with this policy
    pub fn is_evictable(&self) -> bool {
        matches!(self, Self::Temporary | Self::Level | Self::Session)
    }
}

/// Type-specific registration options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AssetOptions {
    /// Higher loads first; unset behaves as 0
    pub priority: Option<i32>,
    /// Eviction policy
    pub cache_policy: CachePolicy,
    /// Retries after the first failed attempt; falls back to the service default
    pub retry_count: Option<u32>,
    /// Frame size for spritesheets
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    /// Known audio duration, used by the memory estimator
    pub duration_secs: Option<f32>,
    /// Known audio bitrate, used by the memory estimator
    pub bitrate_kbps: Option<u32>,
    /// Companion data file (atlas JSON, bitmap font XML)
    pub data_path: Option<String>,
}

impl AssetOptions {
    /// Set load priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set cache policy
    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Set retry count
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retry_count = Some(retries);
        self
    }

    /// Set spritesheet frame size
    pub fn with_frame_size(mut self, width: u32, height: u32) -> Self {
        self.frame_width = Some(width);
        self.frame_height = Some(height);
        self
    }

    /// Set audio metadata
    pub fn with_audio_info(mut self, duration_secs: f32, bitrate_kbps: u32) -> Self {
        self.duration_secs = Some(duration_secs);
        self.bitrate_kbps = Some(bitrate_kbps);
        self
    }
}

/// Registration entry for `register_multiple`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetDefinition {
    pub key: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: AssetKind,
    #[serde(default)]
    pub options: AssetOptions,
}

impl AssetDefinition {
    /// Create a definition with default options
    pub fn new(key: impl Into<String>, path: impl Into<String>, kind: AssetKind) -> Self {
        Self {
            key: key.into(),
            path: path.into(),
            kind,
            options: AssetOptions::default(),
        }
    }

    /// Replace the options
    pub fn with_options(mut self, options: AssetOptions) -> Self {
        self.options = options;
        self
    }
}

/// Loading state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadStatus {
    /// Registered, not resident
    Unloaded,
    /// Load in flight or queued
    Loading,
    /// Resident
    Loaded,
    /// Last load exhausted its retries
    Failed,
}

/// Texture metadata handed back by the loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub frame_count: u32,
}

/// Audio metadata handed back by the loader
#[derive(Debug, Clone, PartialEq)]
pub struct AudioData {
    pub duration_secs: f32,
    pub bitrate_kbps: u32,
    /// Encoded size on disk
    pub byte_len: u64,
}

/// A resident asset
#[derive(Debug, Clone)]
pub enum AssetData {
    Texture(Arc<TextureData>),
    Audio(Arc<AudioData>),
    Json(Arc<serde_json::Value>),
    Text(Arc<str>),
    Binary(Arc<[u8]>),
}

impl AssetData {
    /// Short name of the variant, for error messages
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Texture(_) => "texture",
            Self::Audio(_) => "audio",
            Self::Json(_) => "json",
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
        }
    }
}

/// Public snapshot of an asset record
#[derive(Debug, Clone)]
pub struct AssetInfo {
    pub key: String,
    pub path: String,
    pub kind: AssetKind,
    pub cache_policy: CachePolicy,
    pub priority: Option<i32>,
    pub status: LoadStatus,
    pub estimated_bytes: u64,
    pub last_used_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evictable_policies() {
        assert!(CachePolicy::Temporary.is_evictable());
        assert!(CachePolicy::Level.is_evictable());
        assert!(CachePolicy::Session.is_evictable());
        assert!(!CachePolicy::Permanent.is_evictable());
        assert!(!CachePolicy::Custom.is_evictable());
    }

    #[test]
    fn test_definition_from_manifest() {
        let defs: Vec<AssetDefinition> = serde_json::from_str(
            r#"[
                {"key": "hero", "path": "hero.png", "type": "spritesheet",
                 "options": {"frameWidth": 32, "frameHeight": 32, "cachePolicy": "permanent"}},
                {"key": "theme", "path": "theme.ogg", "type": "audio"}
            ]"#,
        )
        .unwrap();

        assert_eq!(defs[0].kind, AssetKind::Spritesheet);
        assert_eq!(defs[0].options.frame_width, Some(32));
        assert_eq!(defs[0].options.cache_policy, CachePolicy::Permanent);
        assert_eq!(defs[1].options, AssetOptions::default());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(AssetKind::BitmapFont.to_string(), "bitmapFont");
        assert!(AssetKind::Atlas.is_texture());
        assert!(!AssetKind::Audio.is_texture());
        assert_eq!(AssetKind::ALL.len(), 10);
    }
}
