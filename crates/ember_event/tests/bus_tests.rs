//! Integration tests for the event bus

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ember_event::prelude::*;
use ember_event::{BusError, EmitStatus, NamedEvent};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq)]
enum GameEvent {
    Score(u32),
    LevelComplete { level: u32 },
}

impl NamedEvent for GameEvent {
    fn event_name(&self) -> &str {
        match self {
            GameEvent::Score(_) => "game.score",
            GameEvent::LevelComplete { .. } => "game.level_complete",
        }
    }
}

#[test]
fn test_emit_from_many_threads() {
    let bus: EventBus<u32> = EventBus::new();
    let total = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&total);
    bus.on("physics.*", move |e: &EventEnvelope<u32>| {
        sink.fetch_add(e.payload as usize, Ordering::SeqCst);
    })
    .unwrap();

    std::thread::scope(|s| {
        for _ in 0..4 {
            let bus = bus.clone();
            s.spawn(move || {
                for _ in 0..250 {
                    bus.emit("physics.step", 1);
                }
            });
        }
    });

    assert_eq!(total.load(Ordering::SeqCst), 1000);
    let stats = bus.stats();
    assert_eq!(stats.events_emitted, 1000);
    assert_eq!(stats.handlers_invoked, 1000);
}

#[test]
fn test_subscribe_while_other_threads_emit() {
    let bus: EventBus<u32> = EventBus::new();
    let seen = Arc::new(AtomicUsize::new(0));

    std::thread::scope(|s| {
        let emitter = bus.clone();
        s.spawn(move || {
            for i in 0..500 {
                emitter.emit("net.packet", i);
            }
        });

        for _ in 0..50 {
            let sink = Arc::clone(&seen);
            let sub = bus
                .on("net.*", move |_: &EventEnvelope<u32>| {
                    sink.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            sub.unsubscribe();
        }
    });

    assert_eq!(bus.subscriber_count("net.*"), 0);
}

#[test]
fn test_named_events() {
    let bus: EventBus<GameEvent> = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    bus.on("game.*", move |e: &EventEnvelope<GameEvent>| {
        sink.lock().push(e.payload.clone());
    })
    .unwrap();

    assert_eq!(bus.publish(GameEvent::Score(10)), EmitStatus::Delivered(1));
    bus.publish(GameEvent::LevelComplete { level: 2 });

    assert_eq!(
        *log.lock(),
        vec![GameEvent::Score(10), GameEvent::LevelComplete { level: 2 }]
    );
}

#[test]
fn test_failing_handler_does_not_stop_delivery() {
    let bus: EventBus<u32> = EventBus::new();
    let delivered = Arc::new(AtomicUsize::new(0));

    bus.on("save", |e: &EventEnvelope<u32>| -> Result<(), String> {
        Err(format!("disk full writing slot {}", e.payload))
    })
    .unwrap();
    bus.on::<_, ()>("save", |_: &EventEnvelope<u32>| {
        panic!("corrupt save");
    })
    .unwrap();
    let sink = Arc::clone(&delivered);
    bus.on("*", move |_: &EventEnvelope<u32>| {
        sink.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    assert_eq!(bus.emit("save", 1).delivered(), 3);
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert_eq!(bus.stats().handler_failures, 2);
}

#[test]
fn test_scopes_and_wildcards() {
    let bus: EventBus<u32> = EventBus::new();
    let ui = bus.create_scope("ui").unwrap();
    let menu = ui.create_scope("menu").unwrap();

    let global = Arc::new(AtomicUsize::new(0));
    let ui_children = Arc::new(AtomicUsize::new(0));

    let sink = Arc::clone(&global);
    bus.on("*", move |_: &EventEnvelope<u32>| {
        sink.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    let sink = Arc::clone(&ui_children);
    ui.on("*", move |_: &EventEnvelope<u32>| {
        sink.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    ui.emit("click", 1);
    // ui.menu.open is two segments below ui
    menu.emit("open", 2);

    assert_eq!(global.load(Ordering::SeqCst), 2);
    assert_eq!(ui_children.load(Ordering::SeqCst), 1);
    assert_eq!(menu.namespace(), "ui.menu");

    assert_eq!(ui.len(), 1);
    assert_eq!(ui.clear(), 1);
    assert!(ui.is_empty());
    assert_eq!(bus.subscriber_count("*"), 1);
}

#[test]
fn test_invalid_patterns() {
    let bus: EventBus<u32> = EventBus::new();
    assert!(matches!(
        bus.on("ui.*.click", |_: &EventEnvelope<u32>| {}),
        Err(BusError::InvalidPattern { .. })
    ));
    assert_eq!(bus.emit("", 0), EmitStatus::Rejected);
}

#[tokio::test(start_paused = true)]
async fn test_throttled_input() {
    let bus: EventBus<u32> = EventBus::new();
    let moves = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&moves);
    bus.on("input.mouse_move", move |_: &EventEnvelope<u32>| {
        sink.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    bus.throttle("input.mouse_move", Duration::from_millis(16)).unwrap();

    // 100 emissions, 4ms apart: one delivery per 16ms window
    for i in 0..100 {
        bus.emit("input.mouse_move", i);
        tokio::time::advance(Duration::from_millis(4)).await;
    }

    assert_eq!(moves.load(Ordering::SeqCst), 25);
    assert_eq!(bus.stats().events_throttled, 75);

    assert!(bus.unthrottle("input.mouse_move"));
    assert_eq!(bus.emit("input.mouse_move", 0), EmitStatus::Delivered(1));
}

#[tokio::test]
async fn test_wait_for_across_tasks() {
    let bus: EventBus<GameEvent> = EventBus::new();
    let next_level = bus.wait_for("game.level_complete").unwrap();

    let publisher = bus.clone();
    let task = tokio::spawn(async move {
        publisher.publish(GameEvent::Score(5));
        publisher.publish(GameEvent::LevelComplete { level: 3 });
        publisher.publish(GameEvent::LevelComplete { level: 4 });
    });

    assert_eq!(next_level.await, Some(GameEvent::LevelComplete { level: 3 }));
    task.await.unwrap();
    assert_eq!(bus.subscriber_count("game.level_complete"), 0);
}
