//! Drives an engine against a toy in-memory host.
//!
//! Run with `cargo run --example tick_demo`. The "host" has one player with
//! a `hp` field and a `take_damage(int)` method, plus a small tile grid. A
//! god-mode hook, an hp multiplier and a grid sweep are registered, then the
//! loop below plays the part of the host's frame loop.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use hostpatch::engine::{
    Accessor, Args, BeforeOutcome, FrameEvent, HostFault, HostValue, MemberTable, MethodSlot,
    ObjectRef, TickBus, TickEvent,
};
use hostpatch::{
    ConfigStore, Engine, EngineConfig, FeatureSpec, HookSpec, MemoryConfigStore, OverrideRule,
    SweepSpec, SymbolRef, ToggleSpec, ToggleValue,
};

struct Hero {
    hp: Mutex<i64>,
}

struct Tiles {
    lit: Mutex<Vec<bool>>,
    width: usize,
}

fn hero(recv: &HostValue) -> Result<&Hero, HostFault> {
    recv.as_object()
        .and_then(|o| o.downcast_ref::<Hero>())
        .ok_or_else(|| HostFault::new("not a hero"))
}

fn build_host(tiles: Arc<Tiles>) -> Arc<MemberTable> {
    let table = Arc::new(MemberTable::new());
    table.add_field(
        "Hero",
        "hp",
        Accessor::new(
            |recv| Ok(HostValue::Int(*hero(recv)?.hp.lock())),
            |recv, value| {
                *hero(recv)?.hp.lock() = value.as_int().ok_or_else(|| HostFault::new("hp is an int"))?;
                Ok(())
            },
        ),
    );
    table.add_method(
        "Hero",
        "take_damage",
        &["int"],
        MethodSlot::new(|recv, args| {
            let amount = args.first().and_then(HostValue::as_int).unwrap_or(0);
            let mut hp = hero(recv)?.hp.lock();
            *hp -= amount;
            Ok(HostValue::Int(*hp))
        }),
    );
    table.add_property(
        "Level",
        "tiles",
        Accessor::read_only(move |_| Ok(HostValue::Object(ObjectRef::from_arc(Arc::clone(&tiles))))),
    );
    table.add_method(
        "Tiles",
        "light",
        &["int", "int"],
        MethodSlot::new(|recv, args| {
            let tiles = recv
                .as_object()
                .and_then(|o| o.downcast_ref::<Tiles>())
                .ok_or_else(|| HostFault::new("not a tile grid"))?;
            let (Some(x), Some(y)) = (
                args.first().and_then(HostValue::as_int),
                args.get(1).and_then(HostValue::as_int),
            ) else {
                return Err(HostFault::new("light takes two ints"));
            };
            let index = y as usize * tiles.width + x as usize;
            match tiles.lit.lock().get_mut(index) {
                Some(tile) => *tile = true,
                None => return Err(HostFault::new("tile out of range")),
            }
            Ok(HostValue::Unit)
        }),
    );
    table
}

fn features() -> Vec<FeatureSpec> {
    vec![
        FeatureSpec::new("god")
            .toggle(ToggleSpec::flag("god", "God mode", false))
            .hook(
                HookSpec::new(SymbolRef::method("Hero", "take_damage"))
                    .gated("god")
                    .before(|_, _| Ok(BeforeOutcome::suppress())),
            ),
        FeatureSpec::new("vigor")
            .toggle(ToggleSpec::multiplier("vigor", "Vigor", 10))
            .override_field(OverrideRule::multiply(
                "vigor",
                SymbolRef::field("Hero", "hp"),
                HostValue::Int(9999),
            )),
        FeatureSpec::new("daylight")
            .toggle(ToggleSpec::flag("daylight", "Daylight", true))
            .sweep(
                SweepSpec::new(
                    "daylight",
                    "daylight",
                    SymbolRef::method("Tiles", "light"),
                    64,
                    32,
                    |call, x, y| {
                        let mut args = Args::new();
                        args.push(HostValue::Int(x as i64));
                        args.push(HostValue::Int(y as i64));
                        call.call(&mut args).map(|_| ())
                    },
                )
                .receiver(SymbolRef::property("Level", "tiles"))
                .margin(2)
                .budget(12),
            ),
    ]
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(true)
        .init();

    let hero_state = Arc::new(Hero { hp: Mutex::new(50) });
    let hero_value = HostValue::Object(ObjectRef::from_arc(Arc::clone(&hero_state)));
    let tiles = Arc::new(Tiles {
        lit: Mutex::new(vec![false; 64 * 32]),
        width: 64,
    });
    let table = build_host(Arc::clone(&tiles));

    let bus = Arc::new(TickBus::new());
    let config = EngineConfig {
        activation_delay_ms: 0,
        ..EngineConfig::default()
    };
    let engine = Engine::builder(table.clone()).ticks(bus.clone()).config(config).build();
    for feature in features() {
        engine.register(feature);
    }

    // Stands in for the toggles a previous session saved
    let mut store = MemoryConfigStore::new();
    store.set("vigor", ToggleValue::Int(2));
    engine.load_toggles(&store);
    engine.start();

    let take_damage = engine.resolver().resolve(&SymbolRef::method("Hero", "take_damage"));
    for frame in 0..12u64 {
        match frame {
            2 => {
                let _ = engine.toggle("god");
            }
            5 => {
                let _ = engine.set_multiplier("vigor", 0);
            }
            8 => {
                let _ = engine.set_multiplier("vigor", 1);
            }
            _ => {}
        }

        let mut args = Args::new();
        args.push(HostValue::Int(1));
        let _ = take_damage.invoke(&hero_value, &mut args);

        bus.publish(&TickEvent::Entity(FrameEvent {
            entity: 0,
            local_entity: 0,
            target: hero_value.clone(),
        }));
        bus.publish(&TickEvent::World { frame });

        let lit = tiles.lit.lock().iter().filter(|&&t| t).count();
        info!(frame, hp = *hero_state.hp.lock(), lit, "Frame done");
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    if let Err(e) = engine.persist_toggles(&mut store) {
        eprintln!("Failed to persist toggles: {}", e);
    }
    info!(stats = ?engine.stats(), "Shutting down");
    engine.shutdown();
}
