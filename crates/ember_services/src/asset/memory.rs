//! Approximate memory accounting
//!
//! Figures are estimates derived from asset metadata, not measurements:
//! - textures: `width * height * 4` (RGBA8, one mip level)
//! - audio: `duration * bitrate / 8` (the compressed stream size)
//! - JSON and text: serialized length times two (UTF-16 string storage)
//! - binary: its byte length

use std::collections::BTreeMap;

use serde::Serialize;

use super::types::{AssetData, AssetKind};

/// Bytes per texel assumed for decoded textures
pub const BYTES_PER_PIXEL: u64 = 4;

/// Bytes per character assumed for resident strings
pub const BYTES_PER_CHAR: u64 = 2;

/// Estimate the resident size of a loaded asset
pub fn estimate_bytes(data: &AssetData) -> u64 {
    match data {
        AssetData::Texture(t) => u64::from(t.width) * u64::from(t.height) * BYTES_PER_PIXEL,
        AssetData::Audio(a) => {
            let bits = f64::from(a.duration_secs.max(0.0)) * f64::from(a.bitrate_kbps) * 1000.0;
            (bits / 8.0) as u64
        }
        AssetData::Json(value) => {
            let len = serde_json::to_string(value.as_ref()).map(|s| s.len()).unwrap_or_default();
            len as u64 * BYTES_PER_CHAR
        }
        AssetData::Text(text) => text.chars().count() as u64 * BYTES_PER_CHAR,
        AssetData::Binary(bytes) => bytes.len() as u64,
    }
}

/// Snapshot of estimated cache memory
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    /// Sum over loaded assets
    pub total_bytes: u64,
    /// Per-kind breakdown; kinds with nothing loaded are absent
    pub by_kind: BTreeMap<AssetKind, u64>,
    /// Number of loaded assets
    pub loaded_assets: usize,
    /// Configured budget
    pub budget_bytes: u64,
    /// `total_bytes / budget_bytes`
    pub usage_ratio: f64,
    /// Ratio at which a warning fires
    pub warning_threshold: f64,
}

impl MemoryUsage {
    pub(crate) fn new(budget_bytes: u64, warning_threshold: f64) -> Self {
        Self {
            total_bytes: 0,
            by_kind: BTreeMap::new(),
            loaded_assets: 0,
            budget_bytes,
            usage_ratio: 0.0,
            warning_threshold,
        }
    }

    pub(crate) fn add(&mut self, kind: AssetKind, bytes: u64) {
        self.total_bytes += bytes;
        self.loaded_assets += 1;
        *self.by_kind.entry(kind).or_insert(0) += bytes;
        self.usage_ratio = if self.budget_bytes == 0 {
            if self.total_bytes == 0 { 0.0 } else { f64::INFINITY }
        } else {
            self.total_bytes as f64 / self.budget_bytes as f64
        };
    }

    /// Usage at or above the warning threshold
    pub fn threshold_breached(&self) -> bool {
        self.total_bytes > 0 && self.usage_ratio >= self.warning_threshold
    }

    /// Bytes held by one kind
    pub fn bytes_for(&self, kind: AssetKind) -> u64 {
        self.by_kind.get(&kind).copied().unwrap_or(0)
    }
}
