//! Test utilities for engine integration tests
//!
//! This module provides a small fake host the engine can be pointed at:
//! - A `Player` entity with a `life` field and a `speed` property
//! - `Player::hurt(int)`, an interceptable method that counts its calls
//! - `Player::heal` with two overloads and `Player::jump`, which is sealed
//! - A static `Game::world` property holding a replaceable `World`
//! - `World::light(int,int)`, the per-cell sweep target

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use hostpatch::engine::{
    Accessor, Args, FrameEvent, HostFault, HostValue, MemberTable, MethodSlot, Notifier, ObjectRef,
    TickEvent, Tone,
};

/// Install a test-friendly tracing subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub struct Player {
    pub life: Mutex<i64>,
    pub speed: Mutex<i64>,
}

pub struct World {
    pub width: usize,
    pub height: usize,
    visits: Mutex<Vec<u32>>,
}

impl World {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            visits: Mutex::new(vec![0; width * height]),
        }
    }

    fn visit(&self, x: usize, y: usize) -> Result<(), HostFault> {
        if x >= self.width || y >= self.height {
            return Err(HostFault::new(format!("tile ({}, {}) out of range", x, y)));
        }
        self.visits.lock()[y * self.width + x] += 1;
        Ok(())
    }

    pub fn visits(&self, x: usize, y: usize) -> u32 {
        self.visits.lock()[y * self.width + x]
    }

    pub fn total_visits(&self) -> u64 {
        self.visits.lock().iter().map(|&n| u64::from(n)).sum()
    }
}

fn as_player(receiver: &HostValue) -> Result<&Player, HostFault> {
    receiver
        .as_object()
        .and_then(|o| o.downcast_ref::<Player>())
        .ok_or_else(|| HostFault::new("receiver is not a Player"))
}

fn as_world(receiver: &HostValue) -> Result<&World, HostFault> {
    receiver
        .as_object()
        .and_then(|o| o.downcast_ref::<World>())
        .ok_or_else(|| HostFault::new("receiver is not a World"))
}

fn int_arg(args: &[HostValue], i: usize) -> Result<i64, HostFault> {
    args.get(i)
        .and_then(HostValue::as_int)
        .ok_or_else(|| HostFault::new(format!("argument {} is not an int", i)))
}

pub struct FakeHost {
    pub table: Arc<MemberTable>,
    pub player: Arc<Player>,
    pub player_value: HostValue,
    world: Arc<Mutex<Arc<World>>>,
    pub hurt_calls: Arc<AtomicUsize>,
    pub hurt: Arc<MethodSlot>,
    pub light: Arc<MethodSlot>,
}

impl FakeHost {
    pub fn new(width: usize, height: usize) -> Self {
        let table = Arc::new(MemberTable::new());
        let player = Arc::new(Player {
            life: Mutex::new(100),
            speed: Mutex::new(10),
        });
        let player_value = HostValue::Object(ObjectRef::from_arc(Arc::clone(&player)));
        let world = Arc::new(Mutex::new(Arc::new(World::new(width, height))));
        let hurt_calls = Arc::new(AtomicUsize::new(0));

        table.add_field(
            "Player",
            "life",
            Accessor::new(
                |recv| Ok(HostValue::Int(*as_player(recv)?.life.lock())),
                |recv, value| {
                    let life = value.as_int().ok_or_else(|| HostFault::new("life is an int"))?;
                    *as_player(recv)?.life.lock() = life;
                    Ok(())
                },
            ),
        );
        table.add_property(
            "Player",
            "speed",
            Accessor::new(
                |recv| Ok(HostValue::Int(*as_player(recv)?.speed.lock())),
                |recv, value| {
                    let speed = value.as_int().ok_or_else(|| HostFault::new("speed is an int"))?;
                    *as_player(recv)?.speed.lock() = speed;
                    Ok(())
                },
            ),
        );

        let calls = Arc::clone(&hurt_calls);
        let hurt = table.add_method(
            "Player",
            "hurt",
            &["int"],
            MethodSlot::new(move |recv, args| {
                calls.fetch_add(1, Ordering::SeqCst);
                let player = as_player(recv)?;
                let mut life = player.life.lock();
                *life -= int_arg(args, 0)?;
                Ok(HostValue::Int(*life))
            }),
        );
        table.add_method("Player", "heal", &["int"], MethodSlot::new(|_, _| Ok(HostValue::Int(1))));
        table.add_method("Player", "heal", &["float"], MethodSlot::new(|_, _| Ok(HostValue::Int(2))));
        table.add_method("Player", "jump", &[], MethodSlot::sealed(|_, _| Ok(HostValue::Unit)));

        let current = Arc::clone(&world);
        table.add_property(
            "Game",
            "world",
            Accessor::read_only(move |_| {
                let world = Arc::clone(&*current.lock());
                Ok(HostValue::Object(ObjectRef::from_arc(world)))
            }),
        );
        let light = table.add_method(
            "World",
            "light",
            &["int", "int"],
            MethodSlot::new(|recv, args| {
                let x = int_arg(args, 0)? as usize;
                let y = int_arg(args, 1)? as usize;
                as_world(recv)?.visit(x, y)?;
                Ok(HostValue::Unit)
            }),
        );

        Self {
            table,
            player,
            player_value,
            world,
            hurt_calls,
            hurt,
            light,
        }
    }

    pub fn world(&self) -> Arc<World> {
        Arc::clone(&*self.world.lock())
    }

    /// Swap in a fresh world, as a new session would.
    pub fn replace_world(&self) -> Arc<World> {
        let current = self.world();
        let fresh = Arc::new(World::new(current.width, current.height));
        *self.world.lock() = Arc::clone(&fresh);
        fresh
    }

    pub fn life(&self) -> i64 {
        *self.player.life.lock()
    }

    pub fn set_life(&self, life: i64) {
        *self.player.life.lock() = life;
    }

    pub fn speed(&self) -> i64 {
        *self.player.speed.lock()
    }

    /// Call `Player::hurt(amount)` the way host code would.
    pub fn hurt(&self, amount: i64) -> Result<HostValue, HostFault> {
        let mut args = Args::new();
        args.push(HostValue::Int(amount));
        self.hurt.invoke(&self.player_value, &mut args)
    }

    /// An entity tick for the local player.
    pub fn local_tick(&self) -> TickEvent {
        TickEvent::Entity(FrameEvent {
            entity: 0,
            local_entity: 0,
            target: self.player_value.clone(),
        })
    }

    /// An entity tick for some other player.
    pub fn remote_tick(&self) -> TickEvent {
        TickEvent::Entity(FrameEvent {
            entity: 1,
            local_entity: 0,
            target: self.player_value.clone(),
        })
    }
}

/// Notifier that remembers every announcement
#[derive(Default)]
pub struct RecordingNotifier {
    pub seen: Mutex<Vec<(String, Tone)>>,
}

impl Notifier for RecordingNotifier {
    fn announce(&self, text: &str, tone: Tone) -> Result<(), HostFault> {
        self.seen.lock().push((text.to_string(), tone));
        Ok(())
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
