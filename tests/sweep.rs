//! Tests for budgeted grid sweeps
//!
//! The controller is exercised directly for pacing, and through the engine
//! against the fake host's `World::light(int,int)` for binding and gating.

mod common;

use std::collections::HashSet;

use common::FakeHost;
use hostpatch::engine::{
    Args, ChunkedSweepController, Engine, FeatureSpec, HostFault, HostValue, SweepConfig,
    SweepSpec, SweepTick, SymbolRef, TickEvent, ToggleSpec,
};

fn light_cell(call: &hostpatch::engine::BoundCall, x: usize, y: usize) -> Result<(), HostFault> {
    let mut args = Args::new();
    args.push(HostValue::Int(x as i64));
    args.push(HostValue::Int(y as i64));
    call.call(&mut args).map(|_| ())
}

fn lighting(width: usize, height: usize) -> FeatureSpec {
    FeatureSpec::new("lighting")
        .toggle(ToggleSpec::flag("light", "Full bright", true))
        .sweep(
            SweepSpec::new(
                "lighting",
                "light",
                SymbolRef::method_sig("World", "light", &["int", "int"]),
                width,
                height,
                light_cell,
            )
            .receiver(SymbolRef::property("Game", "world")),
        )
}

fn world_tick(engine: &Engine, frame: u64) {
    engine.on_tick(&TickEvent::World { frame });
}

#[test]
fn test_controller_paces_full_pass() {
    let config = SweepConfig {
        width: 1000,
        height: 600,
        margin: 5,
        budget: 100,
        refresh_interval: 0,
    };
    let mut sweep = ChunkedSweepController::new("grid", config);
    sweep.enable();

    let mut columns = HashSet::new();
    let mut rows = HashSet::new();
    let mut cells = 0usize;
    let mut body = |x: usize, y: usize| -> Result<(), HostFault> {
        columns.insert(x);
        rows.insert(y);
        cells += 1;
        Ok(())
    };

    let mut spans = Vec::new();
    for _ in 0..10 {
        match sweep.tick(&mut body) {
            SweepTick::Advanced { span, completed, .. } => spans.push((span, completed)),
            other => panic!("unexpected tick {:?}", other),
        }
    }

    assert!(matches!(sweep.tick(&mut body), SweepTick::Idle { .. }));

    assert_eq!(spans.len(), 10);
    assert!(spans[..9].iter().all(|(_, completed)| !completed));
    assert_eq!(spans[9], (900..990, true));
    assert_eq!(cells, 990 * 590);
    assert_eq!(columns, (5..995).collect::<HashSet<_>>());
    assert_eq!(rows, (5..595).collect::<HashSet<_>>());
}

#[test]
fn test_engine_sweep_visits_every_cell_once() {
    common::init_tracing();
    let host = FakeHost::new(1000, 600);
    let engine = Engine::builder(host.table.clone()).build();
    engine.register(lighting(1000, 600));
    engine.ensure_activated();

    for frame in 0..9 {
        world_tick(&engine, frame);
    }
    let cursor = engine.sweep_cursor("lighting").unwrap();
    assert!(!cursor.pass_complete);
    assert_eq!(cursor.next_column, 900);

    world_tick(&engine, 9);
    assert!(engine.sweep_cursor("lighting").unwrap().pass_complete);

    let world = host.world();
    assert_eq!(world.total_visits(), 990 * 590);
    assert_eq!(world.visits(5, 5), 1);
    assert_eq!(world.visits(994, 594), 1);
    assert_eq!(world.visits(4, 5), 0);
    assert_eq!(world.visits(995, 594), 0);
}

#[test]
fn test_gate_off_discards_progress() {
    let host = FakeHost::new(60, 20);
    let engine = Engine::builder(host.table.clone())
        .config(hostpatch::EngineConfig::from_toml_str("[sweep]\nbudget = 10").unwrap())
        .build();
    engine.register(lighting(60, 20));
    engine.ensure_activated();

    world_tick(&engine, 0);
    world_tick(&engine, 1);
    assert_eq!(engine.sweep_cursor("lighting").unwrap().next_column, 20);

    engine.toggle("light").unwrap();
    world_tick(&engine, 2);
    assert!(engine.sweep_cursor("lighting").is_none());
    let visited = host.world().total_visits();
    world_tick(&engine, 3);
    assert_eq!(host.world().total_visits(), visited);

    engine.toggle("light").unwrap();
    world_tick(&engine, 4);
    assert_eq!(engine.sweep_cursor("lighting").unwrap().next_column, 10);
    assert_eq!(host.world().visits(5, 5), 2);
}

#[test]
fn test_refresh_pass_binds_to_replaced_world() {
    let host = FakeHost::new(30, 12);
    let engine = Engine::builder(host.table.clone()).build();
    engine.register(
        FeatureSpec::new("lighting")
            .toggle(ToggleSpec::flag("light", "Full bright", true))
            .sweep(
                SweepSpec::new(
                    "lighting",
                    "light",
                    SymbolRef::method("World", "light"),
                    30,
                    12,
                    light_cell,
                )
                .receiver(SymbolRef::property("Game", "world"))
                .margin(1)
                .budget(100)
                .refresh_interval(3),
            ),
    );
    engine.ensure_activated();

    let first = host.world();
    world_tick(&engine, 0);
    assert_eq!(first.total_visits(), 28 * 10);

    let second = host.replace_world();
    world_tick(&engine, 1);
    world_tick(&engine, 2);
    assert_eq!(second.total_visits(), 0);

    world_tick(&engine, 3);
    let cursor = engine.sweep_cursor("lighting").unwrap();
    assert_eq!(cursor.pass, 2);
    assert_eq!(second.total_visits(), 28 * 10);
    assert_eq!(first.total_visits(), 28 * 10);
}

#[test]
fn test_missing_sweep_target_is_skipped() {
    let host = FakeHost::new(10, 10);
    let engine = Engine::builder(host.table.clone()).build();
    engine.register(
        FeatureSpec::new("fog")
            .toggle(ToggleSpec::flag("fog", "Fog", true))
            .sweep(SweepSpec::new(
                "fog",
                "fog",
                SymbolRef::method("World", "fog"),
                10,
                10,
                |_, _, _| Ok(()),
            )),
    );
    engine.ensure_activated();
    world_tick(&engine, 0);
    assert!(engine.sweep_cursor("fog").is_none());
    assert_eq!(engine.stats().sweeps, 0);
}

#[test]
fn test_faulting_cell_does_not_stop_pass() {
    let host = FakeHost::new(20, 8);
    let engine = Engine::builder(host.table.clone()).build();
    let world = host.world();
    engine.register(
        FeatureSpec::new("patchy")
            .toggle(ToggleSpec::flag("patchy", "Patchy", true))
            .sweep(
                SweepSpec::new(
                    "patchy",
                    "patchy",
                    SymbolRef::method("World", "light"),
                    20,
                    8,
                    |call, x, y| {
                        if x == 7 {
                            return Err(HostFault::new("cursed column"));
                        }
                        // Off-grid on purpose for one column: the host faults
                        let x = if x == 9 { 500 } else { x };
                        light_cell(call, x, y)
                    },
                )
                .receiver(SymbolRef::property("Game", "world"))
                .margin(1),
            ),
    );
    engine.ensure_activated();
    world_tick(&engine, 0);

    assert!(engine.sweep_cursor("patchy").unwrap().pass_complete);
    assert_eq!(world.visits(6, 3), 1);
    assert_eq!(world.visits(7, 3), 0);
    assert_eq!(world.visits(8, 3), 1);
    assert_eq!(world.visits(18, 6), 1);
    assert_eq!(world.total_visits(), 16 * 6);
}
