//! Tests for deferred activation and engine lifecycle
//!
//! Timer and eager triggers race on separate threads; activation must run
//! once, and features registered while it runs must still be installed.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::{wait_until, FakeHost};
use hostpatch::engine::{
    ActivationOutcome, ActivationPhase, Engine, FeatureSpec, FeatureStatus, HookSpec, HostValue,
    OverrideRule, SweepSpec, SymbolRef, TickBus, TickEvent, ToggleSpec,
};
use hostpatch::EngineConfig;

const WAIT: Duration = Duration::from_secs(5);

fn config(delay_ms: u64) -> EngineConfig {
    EngineConfig {
        activation_delay_ms: delay_ms,
        ..EngineConfig::default()
    }
}

/// Touches four distinct host symbols.
fn full_feature() -> FeatureSpec {
    FeatureSpec::new("everything")
        .toggle(ToggleSpec::flag("on", "Everything", true))
        .hook(HookSpec::new(SymbolRef::method("Player", "hurt")).after(|_, _, _| Ok(None)))
        .override_field(OverrideRule::pin("on", SymbolRef::field("Player", "life"), HostValue::Int(100)))
        .sweep(
            SweepSpec::new(
                "everything",
                "on",
                SymbolRef::method("World", "light"),
                16,
                16,
                |_, _, _| Ok(()),
            )
            .receiver(SymbolRef::property("Game", "world")),
        )
}

#[test]
fn test_timer_and_eager_race_activates_once() {
    common::init_tracing();
    let host = FakeHost::new(16, 16);
    let engine = Engine::builder(host.table.clone()).config(config(0)).build();
    engine.register(full_feature());

    let barrier = Arc::new(Barrier::new(2));
    let eager = {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            engine.ensure_activated()
        })
    };
    barrier.wait();
    engine.start();
    eager.join().unwrap();

    assert!(wait_until(WAIT, || engine.activation_phase() == ActivationPhase::Done));
    assert!(wait_until(WAIT, || engine.stats().activation_races == 1));

    let stats = engine.stats();
    assert_eq!(stats.activation_passes, 1);
    assert_eq!(stats.resolver_lookups, 4);
    assert_eq!(stats.applied_patch_sets, 1);
    assert_eq!(stats.override_rules, 1);
    assert_eq!(stats.sweeps, 1);
    assert_eq!(host.hurt.hook_count(), 1);
}

#[test]
fn test_timer_activates_after_delay() {
    let host = FakeHost::new(4, 4);
    let engine = Engine::builder(host.table.clone()).config(config(20)).build();
    engine.register(full_feature());
    engine.start();
    engine.start();

    assert!(wait_until(WAIT, || engine.is_installed()));
    assert_eq!(engine.feature_status("everything"), Some(FeatureStatus::Active));
    assert_eq!(engine.ensure_activated(), ActivationOutcome::AlreadyClaimed);
    assert_eq!(engine.stats().activation_passes, 1);
}

#[test]
fn test_registration_during_activation_installs_each_once() {
    let host = FakeHost::new(4, 4);
    let engine = Engine::builder(host.table.clone()).build();
    let counters: Vec<Arc<AtomicUsize>> = (0..8).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let barrier = Arc::new(Barrier::new(counters.len() + 1));

    let mut handles = Vec::new();
    for (i, counter) in counters.iter().enumerate() {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        let counter = Arc::clone(counter);
        handles.push(thread::spawn(move || {
            barrier.wait();
            engine.register(FeatureSpec::new(&format!("f{}", i)).hook(
                HookSpec::new(SymbolRef::method("Player", "hurt")).after(move |_, _, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }),
            ));
        }));
    }
    {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            engine.ensure_activated();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(engine.is_installed());
    for i in 0..counters.len() {
        assert_eq!(
            engine.feature_status(&format!("f{}", i)),
            Some(FeatureStatus::Active)
        );
    }
    host.hurt(1).unwrap();
    assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    assert_eq!(host.hurt.hook_count(), counters.len());
}

#[test]
fn test_concurrent_duplicate_registration_installs_once() {
    for _ in 0..50 {
        let host = FakeHost::new(4, 4);
        let engine = Engine::builder(host.table.clone()).build();
        engine.ensure_activated();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    engine.register(
                        FeatureSpec::new("vitality")
                            .toggle(ToggleSpec::multiplier("vitality", "Vitality", 10))
                            .override_field(OverrideRule::multiply(
                                "vitality",
                                SymbolRef::field("Player", "life"),
                                HostValue::Int(9999),
                            )),
                    );
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = engine.stats();
        assert_eq!(stats.override_rules, 1);
        assert_eq!(engine.feature_status("vitality"), Some(FeatureStatus::Active));
    }
}

#[test]
fn test_shutdown_detaches_everything() {
    let host = FakeHost::new(16, 16);
    let bus = Arc::new(TickBus::new());
    let engine = Engine::builder(host.table.clone())
        .ticks(bus.clone())
        .config(config(60_000))
        .build();
    engine.register(full_feature());
    engine.start();
    engine.ensure_activated();

    bus.publish(&TickEvent::World { frame: 0 });
    assert!(engine.sweep_cursor("everything").is_some());

    engine.shutdown();
    engine.shutdown();

    assert_eq!(bus.listener_count(), 0);
    assert!(engine.registry().applied().is_empty());
    assert!(engine.resolver().is_empty());
    assert_eq!(host.hurt.hook_count(), 0);
    assert!(engine.sweep_cursor("everything").is_none());

    host.set_life(5);
    engine.on_tick(&host.local_tick());
    assert_eq!(host.life(), 5);

    engine.register(FeatureSpec::new("late").hook(
        HookSpec::new(SymbolRef::method("Player", "hurt")).after(|_, _, _| Ok(None)),
    ));
    assert_eq!(engine.feature_status("late"), None);
}

#[test]
fn test_shutdown_cancels_pending_timer() {
    let host = FakeHost::new(4, 4);
    let engine = Engine::builder(host.table.clone()).config(config(50)).build();
    engine.register(full_feature());
    engine.start();
    engine.shutdown();

    thread::sleep(Duration::from_millis(200));
    assert_eq!(engine.activation_phase(), ActivationPhase::Pending);
    assert!(!engine.is_installed());
    assert_eq!(host.hurt.hook_count(), 0);
}

#[test]
fn test_activation_with_nothing_resolvable_still_completes() {
    let host = FakeHost::new(4, 4);
    let engine = Engine::builder(host.table.clone()).build();
    engine.register(
        FeatureSpec::new("ghost")
            .hook(HookSpec::new(SymbolRef::method("Ghost", "haunt")).after(|_, _, _| Ok(None))),
    );
    assert_eq!(engine.ensure_activated(), ActivationOutcome::Ran);
    assert_eq!(engine.activation_phase(), ActivationPhase::Done);
    assert_eq!(engine.feature_status("ghost"), Some(FeatureStatus::Inert));
    assert_eq!(engine.ensure_activated(), ActivationOutcome::AlreadyClaimed);
}
