//! Asset service
//!
//! Registers, loads, caches and evicts game assets. Loads of the same key
//! are coalesced, bounded by a FIFO semaphore, retried with a fixed delay,
//! and can be held back by pausing streaming. Memory figures come from the
//! estimator in [`super::memory`].

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::cache::{self, Candidate, PruneReport};
use super::error::{AssetError, AssetResult};
use super::loader::{AssetLoader, LoadRequest, LoaderError};
use super::memory::{self, MemoryUsage};
use super::types::{
    AssetData, AssetDefinition, AssetInfo, AssetKind, AssetOptions, AudioData, CachePolicy,
    LoadStatus, TextureData,
};
use crate::config::{ConfigResult, ConfigurationService};
use crate::events::{CoreEvent, ServiceBus};
use crate::service::{Dependencies, Pausable, Service, ServiceError, ServiceId, ServiceResult};

/// Asset service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AssetServiceConfig {
    /// Estimated bytes the cache may hold
    pub memory_budget_bytes: u64,
    /// Usage ratio that triggers `asset:memory:warning`
    pub warning_threshold: f64,
    /// Fraction of the budget automatic pruning shrinks to
    pub prune_target_ratio: f64,
    /// Loads in flight at once
    pub max_concurrent: usize,
    /// Retries after a failed attempt, unless the asset overrides it
    pub retry_count: u32,
    /// Pause between attempts
    pub retry_delay_ms: u64,
    /// Weight of staleness against size when choosing what to evict
    pub recency_weight: f64,
    /// Prune when a memory check finds the threshold breached
    pub auto_prune: bool,
}

impl Default for AssetServiceConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 256 * 1024 * 1024, // 256 MB
            warning_threshold: 0.9,
            prune_target_ratio: 0.75,
            max_concurrent: 4,
            retry_count: 2,
            retry_delay_ms: 100,
            recency_weight: 0.6,
            auto_prune: false,
        }
    }
}

impl AssetServiceConfig {
    /// Configuration section read by [`from_configuration`](Self::from_configuration)
    pub const SECTION: &'static str = "assets";

    /// Read the `assets` section; absent keys keep their defaults
    pub fn from_configuration(config: &ConfigurationService) -> ConfigResult<Self> {
        config.get_or(Self::SECTION, Self::default())
    }

    /// Reject values the service cannot run with
    pub fn validate(&self) -> AssetResult<()> {
        if self.max_concurrent == 0 {
            return Err(AssetError::InvalidConfig("maxConcurrent must be at least 1".into()));
        }
        if !(self.warning_threshold > 0.0) {
            return Err(AssetError::InvalidConfig("warningThreshold must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.recency_weight) {
            return Err(AssetError::InvalidConfig("recencyWeight must be within [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.prune_target_ratio) {
            return Err(AssetError::InvalidConfig("pruneTargetRatio must be within [0, 1]".into()));
        }
        Ok(())
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Asset loading statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetStats {
    /// Successful loads
    pub total_loaded: u64,
    /// `load_asset` calls satisfied from the cache
    pub cache_hits: u64,
    /// `load_asset` calls that started a load
    pub cache_misses: u64,
    /// Estimated bytes loaded
    pub bytes_loaded: u64,
    /// Loads that exhausted their retries
    pub failed_loads: u64,
    /// Retried attempts
    pub retries: u64,
    /// Assets dropped by pruning
    pub evictions: u64,
}

/// Progress through a batch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadProgress {
    /// Asset that just finished (either way)
    pub key: String,
    /// Finished so far
    pub loaded: usize,
    /// Batch size
    pub total: usize,
    /// `loaded / total`
    pub progress: f64,
}

/// Outcome of a batch load
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Keys now resident, in completion order
    pub loaded: Vec<String>,
    /// Keys that failed, with their errors
    pub failed: Vec<(String, AssetError)>,
}

impl BatchReport {
    /// True if nothing failed
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Keys that failed
    pub fn failed_keys(&self) -> Vec<&str> {
        self.failed.iter().map(|(key, _)| key.as_str()).collect()
    }
}

struct AssetRecord {
    path: String,
    kind: AssetKind,
    options: AssetOptions,
    status: LoadStatus,
    data: Option<AssetData>,
    estimated_bytes: u64,
    last_used_at: Instant,
    /// Registration order
    sequence: u64,
    /// Reissued from the service-wide counter on every unload; in-flight
    /// loads from another generation are discarded
    generation: u64,
    /// Bumped when a load starts; lets waiters recognize the failure they waited on
    load_epoch: u64,
    last_failure: Option<(u32, Arc<LoaderError>)>,
}

impl AssetRecord {
    fn new(definition: AssetDefinition, sequence: u64, generation: u64) -> Self {
        Self {
            path: definition.path,
            kind: definition.kind,
            options: definition.options,
            status: LoadStatus::Unloaded,
            data: None,
            estimated_bytes: 0,
            last_used_at: Instant::now(),
            sequence,
            generation,
            load_epoch: 0,
            last_failure: None,
        }
    }

    fn info(&self, key: &str) -> AssetInfo {
        AssetInfo {
            key: key.to_string(),
            path: self.path.clone(),
            kind: self.kind,
            cache_policy: self.options.cache_policy,
            priority: self.options.priority,
            status: self.status,
            estimated_bytes: self.estimated_bytes,
            last_used_at: self.last_used_at,
        }
    }
}

/// Returns a record to `Unloaded` if its `load_asset` future is dropped
/// mid-load, waking anyone queued behind it
struct LoadGuard<'a> {
    service: &'a AssetService,
    key: &'a str,
    generation: u64,
    armed: bool,
}

impl LoadGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.service.abandon_load(self.key, self.generation);
        }
    }
}

/// An asset that just left the cache
struct Evicted {
    key: String,
    kind: AssetKind,
    bytes: u64,
    /// False when only an in-flight load was cancelled
    resident: bool,
}

#[derive(Default)]
struct AssetState {
    records: HashMap<String, AssetRecord>,
    groups: HashMap<String, Vec<String>>,
    next_sequence: u64,
    next_generation: u64,
    total_bytes: u64,
    stats: AssetStats,
}

impl AssetState {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Drop an asset's data. Cancels an in-flight load of it.
    fn evict(&mut self, key: &str) -> Option<Evicted> {
        let record = self.records.get_mut(key)?;
        if !matches!(record.status, LoadStatus::Loaded | LoadStatus::Loading) {
            return None;
        }

        self.next_generation += 1;
        let bytes = record.estimated_bytes;
        let resident = record.status == LoadStatus::Loaded;
        record.data = None;
        record.status = LoadStatus::Unloaded;
        record.estimated_bytes = 0;
        record.generation = self.next_generation;
        self.total_bytes = self.total_bytes.saturating_sub(bytes);

        Some(Evicted {
            key: key.to_string(),
            kind: record.kind,
            bytes,
            resident,
        })
    }

    fn evict_where(&mut self, mut predicate: impl FnMut(&AssetRecord) -> bool) -> Vec<Evicted> {
        let mut keys: Vec<(u64, String)> = self
            .records
            .iter()
            .filter(|(_, r)| predicate(r))
            .map(|(key, r)| (r.sequence, key.clone()))
            .collect();
        keys.sort();
        keys.iter().filter_map(|(_, key)| self.evict(key)).collect()
    }
}

enum Finished {
    Loaded(u64),
    Failed(AssetError),
    Stale,
}

/// Asset service - manages asset loading and caching
pub struct AssetService {
    config: RwLock<AssetServiceConfig>,
    /// Registry id of the configuration service settings are read from
    config_source: Option<ServiceId>,
    configuration: Mutex<Option<Arc<ConfigurationService>>>,
    bus: ServiceBus,
    loader: Arc<dyn AssetLoader>,
    state: Mutex<AssetState>,
    /// Replaced when `max_concurrent` changes; permits already handed out
    /// stay with the old semaphore
    load_slots: RwLock<Arc<Semaphore>>,
    load_finished: Notify,
    streaming_paused: watch::Sender<bool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl AssetService {
    /// Create a new asset service
    pub fn new(
        config: AssetServiceConfig,
        bus: ServiceBus,
        loader: Arc<dyn AssetLoader>,
    ) -> AssetResult<Self> {
        config.validate()?;
        let (streaming_paused, _) = watch::channel(false);

        Ok(Self {
            load_slots: RwLock::new(Arc::new(Semaphore::new(config.max_concurrent))),
            config: RwLock::new(config),
            config_source: None,
            configuration: Mutex::new(None),
            bus,
            loader,
            state: Mutex::new(AssetState::default()),
            load_finished: Notify::new(),
            streaming_paused,
            monitor: Mutex::new(None),
        })
    }

    /// Read settings from the [`ConfigurationService`] registered as `id`.
    ///
    /// The service then depends on `id` and applies its `assets` section in
    /// `init`, after the configuration sources have loaded.
    pub fn configured_by(mut self, id: impl Into<ServiceId>) -> Self {
        self.config_source = Some(id.into());
        self
    }

    /// Active configuration
    pub fn config(&self) -> AssetServiceConfig {
        self.config.read().clone()
    }

    /// Replace the configuration. A new `max_concurrent` applies to loads
    /// that have not acquired a slot yet.
    pub fn reconfigure(&self, config: AssetServiceConfig) -> AssetResult<()> {
        config.validate()?;

        let mut current = self.config.write();
        if current.max_concurrent != config.max_concurrent {
            let mut slots = self.load_slots.write();
            if !slots.is_closed() {
                *slots = Arc::new(Semaphore::new(config.max_concurrent));
            }
        }

        log::debug!(
            "Asset service configured: budget {} bytes, {} concurrent load(s)",
            config.memory_budget_bytes,
            config.max_concurrent
        );
        *current = config;
        Ok(())
    }

    /// Loading statistics
    pub fn stats(&self) -> AssetStats {
        self.state.lock().stats.clone()
    }

    // ---- registration ----

    /// Register an asset without loading it
    pub fn register_asset(
        &self,
        key: impl Into<String>,
        path: impl Into<String>,
        kind: AssetKind,
        options: AssetOptions,
    ) -> AssetResult<()> {
        let definition = AssetDefinition::new(key, path, kind).with_options(options);
        self.register_multiple([definition]).map(|_| ())
    }

    /// Register several assets. Nothing is registered if any key is taken.
    pub fn register_multiple(
        &self,
        definitions: impl IntoIterator<Item = AssetDefinition>,
    ) -> AssetResult<usize> {
        let definitions: Vec<AssetDefinition> = definitions.into_iter().collect();

        {
            let mut state = self.state.lock();
            let mut seen = HashSet::new();
            for definition in &definitions {
                if state.records.contains_key(&definition.key) || !seen.insert(definition.key.as_str()) {
                    return Err(AssetError::DuplicateKey(definition.key.clone()));
                }
            }
            for definition in &definitions {
                let sequence = state.next_sequence;
                state.next_sequence += 1;
                let generation = state.next_generation();
                state.records.insert(
                    definition.key.clone(),
                    AssetRecord::new(definition.clone(), sequence, generation),
                );
            }
        }

        for definition in &definitions {
            log::debug!("Registered {} asset '{}'", definition.kind, definition.key);
            self.bus.publish(CoreEvent::AssetRegistered {
                key: definition.key.clone(),
                kind: definition.kind,
            });
        }
        Ok(definitions.len())
    }

    /// Forget an asset, unloading it first
    pub fn unregister_asset(&self, key: &str) -> AssetResult<()> {
        let evicted = {
            let mut state = self.state.lock();
            if !state.records.contains_key(key) {
                return Err(AssetError::NotFound(key.to_string()));
            }
            let evicted = state.evict(key);
            state.records.remove(key);
            for members in state.groups.values_mut() {
                members.retain(|member| member != key);
            }
            evicted
        };

        self.load_finished.notify_waiters();
        self.released(evicted.into_iter().collect());
        Ok(())
    }

    /// Registered keys in registration order
    pub fn registered_keys(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut keys: Vec<(u64, &String)> =
            state.records.iter().map(|(key, r)| (r.sequence, key)).collect();
        keys.sort();
        keys.into_iter().map(|(_, key)| key.clone()).collect()
    }

    /// Snapshot of an asset record
    pub fn asset_info(&self, key: &str) -> Option<AssetInfo> {
        self.state.lock().records.get(key).map(|r| r.info(key))
    }

    /// Whether an asset is resident
    pub fn is_loaded(&self, key: &str) -> bool {
        self.state
            .lock()
            .records
            .get(key)
            .map(|r| r.status == LoadStatus::Loaded)
            .unwrap_or(false)
    }

    // ---- loading ----

    /// Load an asset. Concurrent calls for the same key share one load.
    pub async fn load_asset(&self, key: &str) -> AssetResult<()> {
        let mut waited_on = None;

        let (generation, mut request) = loop {
            let notified = self.load_finished.notified();
            tokio::pin!(notified);

            {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let record = state
                    .records
                    .get_mut(key)
                    .ok_or_else(|| AssetError::NotFound(key.to_string()))?;

                if record.status == LoadStatus::Failed && waited_on == Some(record.load_epoch) {
                    if let Some((attempts, source)) = &record.last_failure {
                        return Err(AssetError::LoadFailed {
                            key: key.to_string(),
                            attempts: *attempts,
                            source: Arc::clone(source),
                        });
                    }
                }

                match record.status {
                    LoadStatus::Loaded => {
                        record.last_used_at = Instant::now();
                        state.stats.cache_hits += 1;
                        return Ok(());
                    }
                    LoadStatus::Loading => {
                        waited_on = Some(record.load_epoch);
                        notified.as_mut().enable();
                    }
                    LoadStatus::Unloaded | LoadStatus::Failed => {
                        record.status = LoadStatus::Loading;
                        record.load_epoch += 1;
                        state.stats.cache_misses += 1;
                        break (
                            record.generation,
                            LoadRequest {
                                key: key.to_string(),
                                path: record.path.clone(),
                                kind: record.kind,
                                options: record.options.clone(),
                                attempt: 0,
                            },
                        );
                    }
                }
            }

            notified.await;
        };

        let pending = LoadGuard {
            service: self,
            key,
            generation,
            armed: true,
        };

        let max_attempts = request
            .options
            .retry_count
            .unwrap_or_else(|| self.config.read().retry_count)
            .saturating_add(1);

        let outcome = loop {
            request.attempt += 1;
            self.bus.publish(CoreEvent::AssetLoadStart {
                key: key.to_string(),
                attempt: request.attempt,
            });

            let result = {
                let _permit = self.acquire_slot().await?;
                self.loader.load(&request).await
            };

            match result {
                Ok(data) => break Ok(data),
                Err(error) => {
                    let will_retry = request.attempt < max_attempts;
                    log::warn!(
                        "Load of '{}' failed (attempt {}/{}): {}",
                        key,
                        request.attempt,
                        max_attempts,
                        error
                    );
                    self.bus.publish(CoreEvent::AssetLoadError {
                        key: key.to_string(),
                        attempt: request.attempt,
                        error: error.to_string(),
                        will_retry,
                    });
                    if !will_retry {
                        break Err(error);
                    }

                    self.state.lock().stats.retries += 1;
                    let delay = self.config.read().retry_delay();
                    tokio::time::sleep(delay).await;
                    if !self.is_current(key, generation) {
                        return Err(AssetError::LoadCancelled(key.to_string()));
                    }
                }
            }
        };

        pending.disarm();
        self.finish_load(&request, generation, outcome)
    }

    /// Load a batch, highest priority first, then registration order
    pub async fn preload<S: AsRef<str>>(&self, keys: &[S]) -> BatchReport {
        self.preload_with_progress(keys, |_| {}).await
    }

    /// Load a batch, reporting after each asset finishes
    pub async fn preload_with_progress<S, F>(&self, keys: &[S], mut on_progress: F) -> BatchReport
    where
        S: AsRef<str>,
        F: FnMut(&LoadProgress),
    {
        let (ordered, unknown) = self.load_order(keys);
        let total = ordered.len() + unknown.len();
        let mut report = BatchReport::default();
        let mut completed = 0;

        for key in unknown {
            completed += 1;
            self.report_progress(&key, completed, total, &mut on_progress);
            report.failed.push((key.clone(), AssetError::NotFound(key)));
        }

        let max_concurrent = self.config.read().max_concurrent;
        let mut loads = stream::iter(ordered)
            .map(|key| async move {
                let result = self.load_asset(&key).await;
                (key, result)
            })
            .buffer_unordered(max_concurrent);

        while let Some((key, result)) = loads.next().await {
            completed += 1;
            self.report_progress(&key, completed, total, &mut on_progress);
            match result {
                Ok(()) => report.loaded.push(key),
                Err(e) => report.failed.push((key, e)),
            }
        }

        report
    }

    /// Load every registered asset that isn't resident
    pub async fn preload_all(&self) -> BatchReport {
        let keys: Vec<String> = {
            let state = self.state.lock();
            state
                .records
                .iter()
                .filter(|(_, r)| r.status != LoadStatus::Loaded)
                .map(|(key, _)| key.clone())
                .collect()
        };
        self.preload(&keys).await
    }

    fn load_order<S: AsRef<str>>(&self, keys: &[S]) -> (Vec<String>, Vec<String>) {
        let state = self.state.lock();
        let mut seen = HashSet::new();
        let mut known = Vec::new();
        let mut unknown = Vec::new();

        for key in keys {
            let key = key.as_ref();
            if !seen.insert(key) {
                continue;
            }
            match state.records.get(key) {
                Some(r) => known.push((Reverse(r.options.priority.unwrap_or(0)), r.sequence, key.to_string())),
                None => unknown.push(key.to_string()),
            }
        }

        known.sort();
        (known.into_iter().map(|(_, _, key)| key).collect(), unknown)
    }

    fn report_progress<F: FnMut(&LoadProgress)>(
        &self,
        key: &str,
        loaded: usize,
        total: usize,
        on_progress: &mut F,
    ) {
        let progress = LoadProgress {
            key: key.to_string(),
            loaded,
            total,
            progress: loaded as f64 / total as f64,
        };
        on_progress(&progress);
        self.bus.publish(CoreEvent::AssetLoadProgress(progress));
    }

    async fn acquire_slot(&self) -> AssetResult<OwnedSemaphorePermit> {
        let slots = Arc::clone(&*self.load_slots.read());
        let permit = slots.acquire_owned().await.map_err(|_| AssetError::ShutDown)?;
        let mut paused = self.streaming_paused.subscribe();
        let unpaused = paused.wait_for(|p| !*p).await.map(|_| ());
        unpaused.map_err(|_| AssetError::ShutDown)?;
        Ok(permit)
    }

    fn is_current(&self, key: &str, generation: u64) -> bool {
        self.state
            .lock()
            .records
            .get(key)
            .map(|r| r.generation == generation)
            .unwrap_or(false)
    }

    fn abandon_load(&self, key: &str, generation: u64) {
        {
            let mut state = self.state.lock();
            if let Some(record) = state.records.get_mut(key) {
                if record.generation == generation && record.status == LoadStatus::Loading {
                    record.status = LoadStatus::Unloaded;
                }
            }
        }
        self.load_finished.notify_waiters();
    }

    fn finish_load(
        &self,
        request: &LoadRequest,
        generation: u64,
        outcome: Result<AssetData, LoaderError>,
    ) -> AssetResult<()> {
        let key = request.key.as_str();
        let loaded = outcome.is_ok();

        let finished = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.records.get_mut(key) {
                Some(record) if record.generation == generation => match outcome {
                    Ok(data) => {
                        let bytes = memory::estimate_bytes(&data);
                        record.data = Some(data);
                        record.status = LoadStatus::Loaded;
                        record.estimated_bytes = bytes;
                        record.last_used_at = Instant::now();
                        record.last_failure = None;
                        state.total_bytes += bytes;
                        state.stats.total_loaded += 1;
                        state.stats.bytes_loaded += bytes;
                        Finished::Loaded(bytes)
                    }
                    Err(error) => {
                        let source = Arc::new(error);
                        record.status = LoadStatus::Failed;
                        record.last_failure = Some((request.attempt, Arc::clone(&source)));
                        state.stats.failed_loads += 1;
                        Finished::Failed(AssetError::LoadFailed {
                            key: key.to_string(),
                            attempts: request.attempt,
                            source,
                        })
                    }
                },
                _ => Finished::Stale,
            }
        };

        self.load_finished.notify_waiters();

        match finished {
            Finished::Loaded(bytes) => {
                log::debug!("Loaded '{}' (~{} bytes)", key, bytes);
                self.bus.publish(CoreEvent::AssetLoadComplete {
                    key: key.to_string(),
                    bytes,
                });
                Ok(())
            }
            Finished::Failed(error) => {
                log::error!("{}", error);
                Err(error)
            }
            Finished::Stale => {
                if loaded {
                    self.loader.release(key, request.kind);
                }
                log::debug!("Discarded load of '{}' superseded by an unload", key);
                Err(AssetError::LoadCancelled(key.to_string()))
            }
        }
    }

    // ---- access ----

    /// Resident data of any kind; marks the asset as used
    pub fn get_data(&self, key: &str) -> AssetResult<AssetData> {
        let mut state = self.state.lock();
        let record = state
            .records
            .get_mut(key)
            .ok_or_else(|| AssetError::NotFound(key.to_string()))?;
        let data = record
            .data
            .clone()
            .ok_or_else(|| AssetError::NotLoaded(key.to_string()))?;
        record.last_used_at = Instant::now();
        Ok(data)
    }

    /// Texture metadata for image, spritesheet, atlas and bitmap font assets
    pub fn get_texture(&self, key: &str) -> AssetResult<Arc<TextureData>> {
        match self.get_data(key)? {
            AssetData::Texture(texture) => Ok(texture),
            other => Err(mismatch(key, "texture", &other)),
        }
    }

    /// Audio metadata
    pub fn get_audio(&self, key: &str) -> AssetResult<Arc<AudioData>> {
        match self.get_data(key)? {
            AssetData::Audio(audio) => Ok(audio),
            other => Err(mismatch(key, "audio", &other)),
        }
    }

    /// Parsed JSON document
    pub fn get_json(&self, key: &str) -> AssetResult<Arc<serde_json::Value>> {
        match self.get_data(key)? {
            AssetData::Json(value) => Ok(value),
            other => Err(mismatch(key, "json", &other)),
        }
    }

    /// Text source (HTML, shaders)
    pub fn get_text(&self, key: &str) -> AssetResult<Arc<str>> {
        match self.get_data(key)? {
            AssetData::Text(text) => Ok(text),
            other => Err(mismatch(key, "text", &other)),
        }
    }

    /// Raw bytes (video)
    pub fn get_binary(&self, key: &str) -> AssetResult<Arc<[u8]>> {
        match self.get_data(key)? {
            AssetData::Binary(bytes) => Ok(bytes),
            other => Err(mismatch(key, "binary", &other)),
        }
    }

    // ---- unloading ----

    /// Unload one asset regardless of policy. Returns the bytes freed.
    pub fn unload_asset(&self, key: &str) -> AssetResult<u64> {
        let evicted = {
            let mut state = self.state.lock();
            if !state.records.contains_key(key) {
                return Err(AssetError::NotFound(key.to_string()));
            }
            state.evict(key)
        };

        self.load_finished.notify_waiters();
        let bytes = evicted.as_ref().map(|e| e.bytes).unwrap_or(0);
        self.released(evicted.into_iter().collect());
        Ok(bytes)
    }

    /// Unload everything except permanent assets
    pub fn clear_assets(&self) -> Vec<String> {
        let evicted = self
            .state
            .lock()
            .evict_where(|r| r.options.cache_policy != CachePolicy::Permanent);
        self.load_finished.notify_waiters();
        self.released(evicted)
    }

    /// Unload every asset with `policy`
    pub fn unload_by_policy(&self, policy: CachePolicy) -> Vec<String> {
        let evicted = self.state.lock().evict_where(|r| r.options.cache_policy == policy);
        self.load_finished.notify_waiters();
        self.released(evicted)
    }

    fn released(&self, evicted: Vec<Evicted>) -> Vec<String> {
        evicted
            .into_iter()
            .map(|e| {
                if e.resident {
                    self.loader.release(&e.key, e.kind);
                    log::debug!("Unloaded '{}' ({} bytes)", e.key, e.bytes);
                    self.bus.publish(CoreEvent::AssetUnloaded {
                        key: e.key.clone(),
                        bytes_freed: e.bytes,
                    });
                } else {
                    log::debug!("Cancelled in-flight load of '{}'", e.key);
                }
                e.key
            })
            .collect()
    }

    // ---- memory ----

    /// Estimated memory held by loaded assets
    pub fn memory_usage(&self) -> MemoryUsage {
        let mut usage = {
            let config = self.config.read();
            MemoryUsage::new(config.memory_budget_bytes, config.warning_threshold)
        };
        let state = self.state.lock();
        for record in state.records.values().filter(|r| r.status == LoadStatus::Loaded) {
            usage.add(record.kind, record.estimated_bytes);
        }
        usage
    }

    /// Warn when over the threshold, pruning if configured to
    pub fn check_memory(&self) -> MemoryUsage {
        let usage = self.memory_usage();
        if usage.threshold_breached() {
            log::warn!(
                "Asset memory at {:.0}% of budget ({} / {} bytes)",
                usage.usage_ratio * 100.0,
                usage.total_bytes,
                usage.budget_bytes
            );
            self.bus.publish(CoreEvent::AssetMemoryWarning(usage.clone()));

            let target = {
                let config = self.config.read();
                config
                    .auto_prune
                    .then(|| (config.memory_budget_bytes as f64 * config.prune_target_ratio) as u64)
            };
            if let Some(target) = target {
                self.prune_cache(Some(target));
            }
        }
        usage
    }

    /// Evict temporary, level and session assets until usage is at or below
    /// `target` (default: the budget). Permanent and custom assets are kept
    /// even if that leaves usage above the target.
    pub fn prune_cache(&self, target: Option<u64>) -> PruneReport {
        let (budget, recency_weight) = {
            let config = self.config.read();
            (config.memory_budget_bytes, config.recency_weight)
        };
        let target = target.unwrap_or(budget);

        let (report, evicted) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut evicted = Vec::new();

            if state.total_bytes > target {
                let order: Vec<String> = {
                    let now = Instant::now();
                    let candidates: Vec<Candidate<'_>> = state
                        .records
                        .iter()
                        .filter(|(_, r)| {
                            r.status == LoadStatus::Loaded && r.options.cache_policy.is_evictable()
                        })
                        .map(|(key, r)| Candidate {
                            key: key.as_str(),
                            bytes: r.estimated_bytes,
                            age: now.saturating_duration_since(r.last_used_at),
                        })
                        .collect();
                    cache::eviction_order(&candidates, recency_weight)
                        .into_iter()
                        .map(str::to_string)
                        .collect()
                };

                for key in order {
                    if state.total_bytes <= target {
                        break;
                    }
                    if let Some(e) = state.evict(&key) {
                        state.stats.evictions += 1;
                        evicted.push(e);
                    }
                }
            }

            let report = PruneReport {
                bytes_freed: evicted.iter().map(|e| e.bytes).sum(),
                removed: evicted.iter().map(|e| e.key.clone()).collect(),
                remaining_bytes: state.total_bytes,
                target_bytes: target,
            };
            (report, evicted)
        };

        self.load_finished.notify_waiters();
        self.released(evicted);

        if report.target_met() {
            log::debug!("Pruned {} asset(s), freed {} bytes", report.removed.len(), report.bytes_freed);
        } else {
            log::warn!(
                "Pruning stopped at {} bytes, above target {}; only non-evictable assets remain",
                report.remaining_bytes,
                report.target_bytes
            );
        }
        self.bus.publish(CoreEvent::AssetCachePruned(report.clone()));
        report
    }

    /// Check memory every `interval` on the current runtime. Replaces any
    /// running monitor; the task ends when the service is dropped.
    pub fn enable_memory_monitoring(self: &Arc<Self>, interval: Duration) -> AssetResult<()> {
        if interval.is_zero() {
            return Err(AssetError::InvalidConfig("monitoring interval must be non-zero".into()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AssetError::NoRuntime(e.to_string()))?;

        let service: Weak<Self> = Arc::downgrade(self);
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(service) = service.upgrade() else { break };
                service.check_memory();
            }
        });

        if let Some(previous) = self.monitor.lock().replace(task) {
            previous.abort();
        }
        log::debug!("Memory monitoring every {:?}", interval);
        Ok(())
    }

    /// Stop the memory monitor. Returns false if none was running.
    pub fn disable_memory_monitoring(&self) -> bool {
        match self.monitor.lock().take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    // ---- streaming ----

    /// Hold back loads that haven't reached the loader yet
    pub fn pause_streaming(&self) {
        self.streaming_paused.send_replace(true);
        log::debug!("Asset streaming paused");
    }

    /// Let held-back loads proceed
    pub fn resume_streaming(&self) {
        self.streaming_paused.send_replace(false);
        log::debug!("Asset streaming resumed");
    }

    /// Whether streaming is paused
    pub fn is_streaming_paused(&self) -> bool {
        *self.streaming_paused.borrow()
    }

    // ---- groups ----

    /// Name a set of registered assets
    pub fn create_group<S: AsRef<str>>(&self, name: &str, keys: &[S]) -> AssetResult<()> {
        let members = {
            let mut state = self.state.lock();
            if state.groups.contains_key(name) {
                return Err(AssetError::DuplicateGroup(name.to_string()));
            }

            let mut members: Vec<String> = Vec::new();
            for key in keys {
                let key = key.as_ref();
                if !state.records.contains_key(key) {
                    return Err(AssetError::NotFound(key.to_string()));
                }
                if !members.iter().any(|m| m == key) {
                    members.push(key.to_string());
                }
            }
            state.groups.insert(name.to_string(), members.clone());
            members
        };

        self.bus.publish(CoreEvent::AssetGroupCreated {
            group: name.to_string(),
            keys: members,
        });
        Ok(())
    }

    /// Load every asset in a group
    pub async fn load_group(&self, name: &str) -> AssetResult<BatchReport> {
        self.load_group_with_progress(name, |_| {}).await
    }

    /// Load every asset in a group, reporting after each asset finishes
    pub async fn load_group_with_progress<F>(&self, name: &str, on_progress: F) -> AssetResult<BatchReport>
    where
        F: FnMut(&LoadProgress),
    {
        let keys = self.group_keys(name)?;
        let report = self.preload_with_progress(&keys, on_progress).await;

        log::debug!(
            "Group '{}' loaded: {} ok, {} failed",
            name,
            report.loaded.len(),
            report.failed.len()
        );
        self.bus.publish(CoreEvent::AssetGroupLoadComplete {
            group: name.to_string(),
            loaded: report.loaded.len(),
            failed: report.failed.len(),
        });
        Ok(report)
    }

    /// Unload a group's non-permanent assets
    pub fn unload_group(&self, name: &str) -> AssetResult<Vec<String>> {
        let evicted = {
            let mut state = self.state.lock();
            let members = state
                .groups
                .get(name)
                .cloned()
                .ok_or_else(|| AssetError::GroupNotFound(name.to_string()))?;
            let mut evicted = Vec::new();
            for key in &members {
                let permanent = state
                    .records
                    .get(key.as_str())
                    .map(|r| r.options.cache_policy == CachePolicy::Permanent)
                    .unwrap_or(true);
                if !permanent {
                    evicted.extend(state.evict(key));
                }
            }
            evicted
        };
        self.load_finished.notify_waiters();
        Ok(self.released(evicted))
    }

    /// Forget a group; its assets stay registered
    pub fn remove_group(&self, name: &str) -> AssetResult<()> {
        self.state
            .lock()
            .groups
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| AssetError::GroupNotFound(name.to_string()))
    }

    /// Members of a group
    pub fn group_keys(&self, name: &str) -> AssetResult<Vec<String>> {
        self.state
            .lock()
            .groups
            .get(name)
            .cloned()
            .ok_or_else(|| AssetError::GroupNotFound(name.to_string()))
    }

    /// Whether every member of a group is resident
    pub fn is_group_loaded(&self, name: &str) -> AssetResult<bool> {
        let state = self.state.lock();
        let members = state
            .groups
            .get(name)
            .ok_or_else(|| AssetError::GroupNotFound(name.to_string()))?;
        Ok(members.iter().all(|key| {
            state
                .records
                .get(key)
                .map(|r| r.status == LoadStatus::Loaded)
                .unwrap_or(false)
        }))
    }
}

fn mismatch(key: &str, expected: &'static str, actual: &AssetData) -> AssetError {
    AssetError::TypeMismatch {
        key: key.to_string(),
        expected,
        actual: actual.variant_name(),
    }
}

impl Drop for AssetService {
    fn drop(&mut self) {
        if let Some(task) = self.monitor.get_mut().take() {
            task.abort();
        }
    }
}

impl Pausable for AssetService {
    fn pause(&self) {
        self.pause_streaming();
    }

    fn resume(&self) {
        self.resume_streaming();
    }
}

#[async_trait]
impl Service for AssetService {
    fn dependencies(&self) -> Vec<ServiceId> {
        self.config_source.iter().cloned().collect()
    }

    fn inject(&self, deps: &Dependencies) -> ServiceResult<()> {
        if let Some(id) = &self.config_source {
            let configuration = deps.get::<ConfigurationService>(id.name())?;
            *self.configuration.lock() = Some(configuration);
        }
        Ok(())
    }

    async fn init(&self) -> ServiceResult<()> {
        let configuration = self.configuration.lock().clone();
        let config = match configuration {
            Some(configuration) => AssetServiceConfig::from_configuration(&configuration)
                .map_err(|e| ServiceError::operation(e.to_string()))?,
            None => self.config(),
        };
        self.reconfigure(config)
            .map_err(|e| ServiceError::operation(e.to_string()))?;

        let registered = self.state.lock().records.len();
        log::info!(
            "Asset service ready: {} asset(s) registered, budget {} bytes",
            registered,
            self.config.read().memory_budget_bytes
        );
        Ok(())
    }

    async fn shutdown(&self) -> ServiceResult<()> {
        self.disable_memory_monitoring();
        self.load_slots.read().close();
        self.streaming_paused.send_replace(false);

        let evicted = self.state.lock().evict_where(|_| true);
        self.load_finished.notify_waiters();
        let unloaded = self.released(evicted);
        log::info!("Asset service shut down, released {} asset(s)", unloaded.len());
        Ok(())
    }

    fn as_pausable(&self) -> Option<&dyn Pausable> {
        Some(self)
    }
}
