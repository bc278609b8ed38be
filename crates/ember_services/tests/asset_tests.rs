//! Integration tests for the asset service

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ember_event::EventEnvelope;
use ember_services::asset::{
    AssetData, AssetDefinition, BatchReport, LoadProgress, LoadRequest, LoadStatus, LoaderError,
    TextureData,
};
use ember_services::*;
use parking_lot::Mutex;

// Loader with scripted sizes, failures and latency. Images come back as 5x5
// textures, everything else as binary blobs.
#[derive(Default)]
struct MockLoader {
    delay: Duration,
    sizes: HashMap<String, usize>,
    failures: Mutex<HashMap<String, u32>>,
    order: Mutex<Vec<String>>,
    released: Mutex<Vec<String>>,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockLoader {
    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_size(mut self, key: &str, bytes: usize) -> Self {
        self.sizes.insert(key.to_string(), bytes);
        self
    }

    fn failing(self, key: &str, times: u32) -> Self {
        self.failures.lock().insert(key.to_string(), times);
        self
    }
}

#[async_trait]
impl AssetLoader for MockLoader {
    async fn load(&self, request: &LoadRequest) -> Result<AssetData, LoaderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.order.lock().push(request.key.clone());

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        {
            let mut failures = self.failures.lock();
            if let Some(remaining) = failures.get_mut(&request.key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(LoaderError::Other(format!("{} is flaky", request.key)));
                }
            }
        }

        if request.kind == AssetKind::Image {
            return Ok(AssetData::Texture(Arc::new(TextureData {
                width: 5,
                height: 5,
                frame_count: 1,
            })));
        }
        let bytes = self.sizes.get(&request.key).copied().unwrap_or(100);
        Ok(AssetData::Binary(vec![0u8; bytes].into()))
    }

    fn release(&self, key: &str, _kind: AssetKind) {
        self.released.lock().push(key.to_string());
    }
}

fn config() -> AssetServiceConfig {
    AssetServiceConfig {
        retry_delay_ms: 10,
        ..Default::default()
    }
}

fn service_with(config: AssetServiceConfig, loader: &Arc<MockLoader>) -> (AssetService, ServiceBus) {
    let bus = ServiceBus::new();
    let loader: Arc<dyn AssetLoader> = loader.clone();
    let service = AssetService::new(config, bus.clone(), loader).unwrap();
    (service, bus)
}

fn register(service: &AssetService, key: &str, options: AssetOptions) {
    service
        .register_asset(key, format!("{}.bin", key), AssetKind::Video, options)
        .unwrap();
}

fn record_events(bus: &ServiceBus) -> Arc<Mutex<Vec<CoreEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    bus.on("*", move |e: &EventEnvelope<CoreEvent>| sink.lock().push(e.payload.clone()))
        .unwrap();
    events
}

fn event_names(events: &Mutex<Vec<CoreEvent>>) -> Vec<String> {
    use ember_event::NamedEvent;
    events.lock().iter().map(|e| e.event_name().to_string()).collect()
}

fn loaded_keys(report: &BatchReport) -> Vec<&str> {
    let mut keys: Vec<&str> = report.loaded.iter().map(String::as_str).collect();
    keys.sort();
    keys
}

#[tokio::test]
async fn test_register_and_load_events() {
    let loader = Arc::new(MockLoader::default().with_size("intro", 64));
    let (assets, bus) = service_with(config(), &loader);
    let events = record_events(&bus);

    register(&assets, "intro", AssetOptions::default());
    assets.load_asset("intro").await.unwrap();

    assert_eq!(
        event_names(&events),
        vec!["asset:registered", "asset:load:start", "asset:load:complete"]
    );
    assert!(events
        .lock()
        .contains(&CoreEvent::AssetLoadComplete { key: "intro".into(), bytes: 64 }));
    assert_eq!(assets.get_binary("intro").unwrap().len(), 64);
    assert!(matches!(
        assets.load_asset("missing").await,
        Err(AssetError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_loads_share_one_fetch() {
    let loader = Arc::new(MockLoader::default().with_delay(Duration::from_millis(50)));
    let (assets, _bus) = service_with(config(), &loader);
    register(&assets, "music", AssetOptions::default());

    let (first, second) = tokio::join!(assets.load_asset("music"), assets.load_asset("music"));
    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    assert!(assets.is_loaded("music"));
}

#[tokio::test(start_paused = true)]
async fn test_waiters_share_a_failure() {
    let loader = Arc::new(
        MockLoader::default()
            .with_delay(Duration::from_millis(20))
            .failing("bad", u32::MAX),
    );
    let (assets, _bus) = service_with(config(), &loader);
    register(&assets, "bad", AssetOptions::default().with_retries(0));

    let (first, second) = tokio::join!(assets.load_asset("bad"), assets.load_asset("bad"));
    assert!(matches!(first, Err(AssetError::LoadFailed { attempts: 1, .. })));
    assert!(matches!(second, Err(AssetError::LoadFailed { attempts: 1, .. })));
    assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_bound() {
    let loader = Arc::new(MockLoader::default().with_delay(Duration::from_millis(10)));
    let (assets, _bus) = service_with(
        AssetServiceConfig {
            max_concurrent: 2,
            ..config()
        },
        &loader,
    );
    let keys: Vec<String> = (0..6).map(|i| format!("tile{}", i)).collect();
    for key in &keys {
        register(&assets, key, AssetOptions::default());
    }

    let report = assets.preload(&keys).await;
    assert!(report.is_success());
    assert_eq!(report.loaded.len(), 6);
    assert_eq!(loader.max_active.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_priority_then_registration_order() {
    let loader = Arc::new(MockLoader::default());
    let (assets, _bus) = service_with(
        AssetServiceConfig {
            max_concurrent: 1,
            ..config()
        },
        &loader,
    );
    register(&assets, "a", AssetOptions::default());
    register(&assets, "b", AssetOptions::default().with_priority(5));
    register(&assets, "c", AssetOptions::default());
    register(&assets, "d", AssetOptions::default().with_priority(5));
    register(&assets, "e", AssetOptions::default().with_priority(-1));

    assets.preload(&["e", "a", "b", "c", "d"]).await;
    assert_eq!(*loader.order.lock(), vec!["b", "d", "a", "c", "e"]);
}

#[tokio::test(start_paused = true)]
async fn test_retry_then_success() {
    let loader = Arc::new(MockLoader::default().failing("flaky", 1));
    let (assets, bus) = service_with(config(), &loader);
    let events = record_events(&bus);
    register(&assets, "flaky", AssetOptions::default());

    assets.load_asset("flaky").await.unwrap();

    assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    assert_eq!(assets.stats().retries, 1);
    let errors: Vec<CoreEvent> = events
        .lock()
        .iter()
        .filter(|e| matches!(e, CoreEvent::AssetLoadError { .. }))
        .cloned()
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        &errors[0],
        CoreEvent::AssetLoadError { attempt: 1, will_retry: true, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted() {
    let loader = Arc::new(MockLoader::default().failing("broken", u32::MAX));
    let (assets, _bus) = service_with(config(), &loader);
    register(&assets, "broken", AssetOptions::default().with_retries(1));

    match assets.load_asset("broken").await {
        Err(AssetError::LoadFailed { key, attempts, .. }) => {
            assert_eq!(key, "broken");
            assert_eq!(attempts, 2);
        }
        other => panic!("expected load failure, got {:?}", other),
    }
    assert_eq!(assets.asset_info("broken").unwrap().status, LoadStatus::Failed);
    assert_eq!(assets.stats().failed_loads, 1);
}

#[tokio::test(start_paused = true)]
async fn test_partial_batch_failure() {
    let loader = Arc::new(MockLoader::default().failing("b", u32::MAX));
    let (assets, _bus) = service_with(config(), &loader);
    register(&assets, "a", AssetOptions::default());
    register(&assets, "b", AssetOptions::default().with_retries(0));
    register(&assets, "c", AssetOptions::default());

    let mut progress: Vec<LoadProgress> = Vec::new();
    let report = assets
        .preload_with_progress(&["a", "b", "c", "ghost"], |p| progress.push(p.clone()))
        .await;

    assert_eq!(loaded_keys(&report), vec!["a", "c"]);
    let mut failed = report.failed_keys();
    failed.sort();
    assert_eq!(failed, vec!["b", "ghost"]);

    assert_eq!(progress.len(), 4);
    assert_eq!(progress.last().unwrap().loaded, 4);
    assert!((progress.last().unwrap().progress - 1.0).abs() < f64::EPSILON);
    assert!(assets.is_loaded("a"));
    assert!(!assets.is_loaded("b"));
}

#[tokio::test]
async fn test_clear_keeps_permanent_assets() {
    let loader = Arc::new(MockLoader::default());
    let (assets, _bus) = service_with(config(), &loader);
    assets
        .register_asset(
            "ui",
            "ui.png",
            AssetKind::Image,
            AssetOptions::default().with_cache_policy(CachePolicy::Permanent),
        )
        .unwrap();
    register(&assets, "level", AssetOptions::default().with_cache_policy(CachePolicy::Level));
    register(&assets, "fx", AssetOptions::default().with_cache_policy(CachePolicy::Temporary));
    assets.preload(&["ui", "level", "fx"]).await;

    let cleared = assets.clear_assets();
    assert_eq!(cleared, vec!["level", "fx"]);
    assert!(assets.is_loaded("ui"));
    assert!(!assets.is_loaded("level"));
    assert_eq!(*loader.released.lock(), vec!["level", "fx"]);
    assert_eq!(assets.memory_usage().total_bytes, 100);
    assert_eq!(assets.get_texture("ui").unwrap().width, 5);
    assert!(matches!(assets.get_texture("level"), Err(AssetError::NotLoaded(_))));

    // explicit unload ignores the policy
    assert_eq!(assets.unload_asset("ui").unwrap(), 100);
    assert!(!assets.is_loaded("ui"));
}

#[tokio::test]
async fn test_unload_by_policy() {
    let loader = Arc::new(MockLoader::default());
    let (assets, _bus) = service_with(config(), &loader);
    register(&assets, "l1", AssetOptions::default().with_cache_policy(CachePolicy::Level));
    register(&assets, "l2", AssetOptions::default().with_cache_policy(CachePolicy::Level));
    register(&assets, "s", AssetOptions::default());
    assets.preload_all().await;

    assert_eq!(assets.unload_by_policy(CachePolicy::Level), vec!["l1", "l2"]);
    assert!(assets.is_loaded("s"));
}

#[tokio::test(start_paused = true)]
async fn test_prune_respects_policy_and_recency() {
    let loader = Arc::new(
        MockLoader::default()
            .with_size("perm", 600)
            .with_size("old", 300)
            .with_size("recent", 300)
            .with_size("custom", 100),
    );
    let (assets, bus) = service_with(
        AssetServiceConfig {
            memory_budget_bytes: 1000,
            ..config()
        },
        &loader,
    );
    let events = record_events(&bus);
    register(&assets, "perm", AssetOptions::default().with_cache_policy(CachePolicy::Permanent));
    register(&assets, "old", AssetOptions::default().with_cache_policy(CachePolicy::Temporary));
    register(&assets, "recent", AssetOptions::default().with_cache_policy(CachePolicy::Session));
    register(&assets, "custom", AssetOptions::default().with_cache_policy(CachePolicy::Custom));
    assets.preload(&["perm", "old", "recent", "custom"]).await;
    assert_eq!(assets.memory_usage().total_bytes, 1300);

    tokio::time::advance(Duration::from_secs(30)).await;
    assets.get_binary("recent").unwrap();

    let report = assets.prune_cache(None);
    assert_eq!(report.removed, vec!["old"]);
    assert_eq!(report.bytes_freed, 300);
    assert_eq!(report.remaining_bytes, 1000);
    assert!(report.target_met());

    let report = assets.prune_cache(Some(100));
    assert_eq!(report.removed, vec!["recent"]);
    assert_eq!(report.remaining_bytes, 700);
    assert!(!report.target_met());
    assert!(assets.is_loaded("perm"));
    assert!(assets.is_loaded("custom"));
    assert_eq!(assets.stats().evictions, 2);

    let pruned = events
        .lock()
        .iter()
        .filter(|e| matches!(e, CoreEvent::AssetCachePruned(_)))
        .count();
    assert_eq!(pruned, 2);
}

#[tokio::test(start_paused = true)]
async fn test_memory_warning_and_auto_prune() {
    let loader = Arc::new(MockLoader::default().with_size("big", 500).with_size("small", 450));
    let (assets, bus) = service_with(
        AssetServiceConfig {
            memory_budget_bytes: 1000,
            warning_threshold: 0.9,
            prune_target_ratio: 0.5,
            auto_prune: true,
            ..config()
        },
        &loader,
    );
    let events = record_events(&bus);
    register(&assets, "big", AssetOptions::default());
    register(&assets, "small", AssetOptions::default());
    assets.preload(&["big", "small"]).await;

    let usage = assets.check_memory();
    assert_eq!(usage.total_bytes, 950);
    assert!(usage.threshold_breached());

    assert!(!assets.is_loaded("big"));
    assert!(assets.is_loaded("small"));
    assert!(events
        .lock()
        .iter()
        .any(|e| matches!(e, CoreEvent::AssetMemoryWarning(u) if u.total_bytes == 950)));
}

#[tokio::test]
async fn test_memory_usage_by_kind() {
    let loader = Arc::new(MockLoader::default().with_size("clip", 250));
    let (assets, _bus) = service_with(config(), &loader);
    register(&assets, "clip", AssetOptions::default());
    assets.load_asset("clip").await.unwrap();

    let usage = assets.memory_usage();
    assert_eq!(usage.bytes_for(AssetKind::Video), 250);
    assert_eq!(usage.loaded_assets, 1);
    assert!(!usage.threshold_breached());
    assert_eq!(assets.asset_info("clip").unwrap().estimated_bytes, 250);
}

#[tokio::test(start_paused = true)]
async fn test_memory_monitoring() {
    let loader = Arc::new(MockLoader::default().with_size("huge", 2000));
    let (assets, bus) = service_with(
        AssetServiceConfig {
            memory_budget_bytes: 1000,
            ..config()
        },
        &loader,
    );
    let assets = Arc::new(assets);
    let warnings = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&warnings);
    bus.on(names::ASSET_MEMORY_WARNING, move |_: &EventEnvelope<CoreEvent>| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    register(&assets, "huge", AssetOptions::default());
    assets.load_asset("huge").await.unwrap();

    assets.enable_memory_monitoring(Duration::from_secs(1)).unwrap();
    tokio::time::sleep(Duration::from_millis(3500)).await;
    let seen = warnings.load(Ordering::SeqCst);
    assert!(seen >= 2, "expected periodic warnings, saw {}", seen);

    assert!(assets.disable_memory_monitoring());
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(warnings.load(Ordering::SeqCst), seen);

    assert!(matches!(
        assets.enable_memory_monitoring(Duration::ZERO),
        Err(AssetError::InvalidConfig(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_streaming_pause_holds_queued_loads() {
    let loader = Arc::new(MockLoader::default());
    let (assets, _bus) = service_with(config(), &loader);
    let assets = Arc::new(assets);
    register(&assets, "track", AssetOptions::default());

    assets.pause_streaming();
    assert!(assets.is_streaming_paused());

    let pending = {
        let assets = Arc::clone(&assets);
        tokio::spawn(async move { assets.load_asset("track").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
    assert!(!assets.is_loaded("track"));

    assets.resume_streaming();
    pending.await.unwrap().unwrap();
    assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    assert!(assets.is_loaded("track"));
}

#[tokio::test(start_paused = true)]
async fn test_unload_cancels_in_flight_load() {
    let loader = Arc::new(MockLoader::default().with_delay(Duration::from_millis(50)));
    let (assets, _bus) = service_with(config(), &loader);
    let assets = Arc::new(assets);
    register(&assets, "cutscene", AssetOptions::default());

    let pending = {
        let assets = Arc::clone(&assets);
        tokio::spawn(async move { assets.load_asset("cutscene").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(assets.unload_asset("cutscene").unwrap(), 0);

    assert!(matches!(
        pending.await.unwrap(),
        Err(AssetError::LoadCancelled(_))
    ));
    assert!(!assets.is_loaded("cutscene"));
    assert_eq!(*loader.released.lock(), vec!["cutscene"]);
    assert_eq!(assets.memory_usage().total_bytes, 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_load_can_be_retried() {
    let loader = Arc::new(MockLoader::default().with_delay(Duration::from_millis(100)));
    let (assets, _bus) = service_with(config(), &loader);
    register(&assets, "k", AssetOptions::default());

    let timed_out = tokio::time::timeout(Duration::from_millis(10), assets.load_asset("k")).await;
    assert!(timed_out.is_err());
    assert_eq!(assets.asset_info("k").unwrap().status, LoadStatus::Unloaded);

    tokio::time::timeout(Duration::from_secs(1), assets.load_asset("k"))
        .await
        .expect("second load hung")
        .unwrap();
    assert!(assets.is_loaded("k"));
    assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reregistered_asset_ignores_stale_load() {
    let loader = Arc::new(MockLoader::default().with_delay(Duration::from_millis(100)));
    let (assets, _bus) = service_with(config(), &loader);
    let assets = Arc::new(assets);
    assets
        .register_asset("k", "old_path_long_name.bin", AssetKind::Video, AssetOptions::default())
        .unwrap();

    let pending = {
        let assets = Arc::clone(&assets);
        tokio::spawn(async move { assets.load_asset("k").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assets.unregister_asset("k").unwrap();
    assets
        .register_asset("k", "new.bin", AssetKind::Video, AssetOptions::default())
        .unwrap();

    assert!(matches!(
        pending.await.unwrap(),
        Err(AssetError::LoadCancelled(_))
    ));
    let info = assets.asset_info("k").unwrap();
    assert_eq!(info.status, LoadStatus::Unloaded);
    assert_eq!(info.path, "new.bin");
    assert_eq!(assets.memory_usage().total_bytes, 0);
    assert!(loader.released.lock().iter().any(|k| k == "k"));
}

#[tokio::test]
async fn test_groups() {
    let loader = Arc::new(MockLoader::default());
    let (assets, bus) = service_with(config(), &loader);
    let events = record_events(&bus);
    register(&assets, "map", AssetOptions::default());
    register(&assets, "tiles", AssetOptions::default());
    register(&assets, "hud", AssetOptions::default().with_cache_policy(CachePolicy::Permanent));

    assets.create_group("level1", &["map", "tiles", "hud", "map"]).unwrap();
    assert_eq!(assets.group_keys("level1").unwrap(), vec!["map", "tiles", "hud"]);
    assert!(matches!(
        assets.create_group("level1", &["map"]),
        Err(AssetError::DuplicateGroup(_))
    ));
    assert!(matches!(
        assets.create_group("level2", &["nope"]),
        Err(AssetError::NotFound(_))
    ));
    assert!(!assets.is_group_loaded("level1").unwrap());

    let report = assets.load_group("level1").await.unwrap();
    assert!(report.is_success());
    assert!(assets.is_group_loaded("level1").unwrap());
    assert!(events.lock().contains(&CoreEvent::AssetGroupLoadComplete {
        group: "level1".into(),
        loaded: 3,
        failed: 0,
    }));

    assert_eq!(assets.unload_group("level1").unwrap(), vec!["map", "tiles"]);
    assert!(assets.is_loaded("hud"));

    let mut fractions = Vec::new();
    assets
        .load_group_with_progress("level1", |p| fractions.push(p.progress))
        .await
        .unwrap();
    assert_eq!(fractions.len(), 3);
    assert!((fractions[2] - 1.0).abs() < f64::EPSILON);

    assets.remove_group("level1").unwrap();
    assert!(matches!(
        assets.load_group("level1").await,
        Err(AssetError::GroupNotFound(_))
    ));
}

#[tokio::test]
async fn test_register_multiple_and_unregister() {
    let loader = Arc::new(MockLoader::default());
    let (assets, _bus) = service_with(config(), &loader);

    let count = assets
        .register_multiple(vec![
            AssetDefinition::new("a", "a.json", AssetKind::Json),
            AssetDefinition::new("b", "b.json", AssetKind::Json),
        ])
        .unwrap();
    assert_eq!(count, 2);
    assert!(matches!(
        assets.register_asset("a", "again.json", AssetKind::Json, AssetOptions::default()),
        Err(AssetError::DuplicateKey(_))
    ));

    assets.create_group("both", &["a", "b"]).unwrap();
    assets.load_asset("a").await.unwrap();
    assets.unregister_asset("a").unwrap();

    assert_eq!(assets.registered_keys(), vec!["b"]);
    assert_eq!(assets.group_keys("both").unwrap(), vec!["b"]);
    assert_eq!(*loader.released.lock(), vec!["a"]);
    assert!(matches!(assets.unregister_asset("a"), Err(AssetError::NotFound(_))));
}

#[tokio::test]
async fn test_asset_service_under_registry() {
    let loader = Arc::new(MockLoader::default());
    let (assets, bus) = service_with(config(), &loader);
    let assets = Arc::new(assets);
    register(&assets, "logo", AssetOptions::default().with_cache_policy(CachePolicy::Permanent));

    let registry = ServiceRegistry::new(bus);
    registry.register_service("assets", Arc::clone(&assets)).unwrap();
    registry.initialize().await.unwrap();
    assets.load_asset("logo").await.unwrap();

    registry.pause("assets").unwrap();
    assert!(assets.is_streaming_paused());
    registry.resume("assets").unwrap();
    assert!(!assets.is_streaming_paused());

    registry.shutdown().await.unwrap();
    assert!(!assets.is_loaded("logo"));
    assert!(matches!(
        assets.load_asset("logo").await,
        Err(AssetError::ShutDown)
    ));
}
