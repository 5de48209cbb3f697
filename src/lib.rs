//! hostpatch - in-process interception and override engine
//!
//! This library observes and mutates a live host process from the inside:
//! it resolves host members by name, wraps host methods with before/after
//! hooks, re-asserts field overrides once per tick and spreads large grid
//! mutations over many ticks.
//!
//! # Architecture
//!
//! Components, leaves first (all under `engine`):
//!
//! 1. **Symbol resolution** (`symbol`, `binding_cache`)
//!    - `SymbolTable` is the host's name-based reflection surface
//!    - `SymbolResolver` looks each symbol up once and caches the `Handle`,
//!      including "not found"
//!
//! 2. **Interception** (`intercept`, `fast_path`)
//!    - `MethodSlot` runs before-hooks, the original, then after-hooks
//!    - `PatchSet` groups records that install and uninstall together
//!    - `FastPathBinder` binds a hot method to its receiver for sweeps
//!
//! 3. **Scheduling** (`activation`, `overrides`, `sweep`, `tick`)
//!    - `DeferredActivator` runs activation once, from a timer or on demand
//!    - `FrameOverrideLoop` writes override values on every local-entity tick
//!    - `ChunkedSweepController` walks a grid a few columns per world tick
//!
//! 4. **`Engine`** ties them together around registered `FeatureSpec`s.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use hostpatch::engine::*;
//!
//! let host = Arc::new(MemberTable::new());
//! host.add_method("Player", "hurt", &["int"], MethodSlot::new(|_, _| Ok(HostValue::Unit)));
//!
//! let engine = Engine::builder(host).build();
//! engine.register(
//!     FeatureSpec::new("god")
//!         .toggle(ToggleSpec::flag("god", "God mode", false))
//!         .hook(
//!             HookSpec::new(SymbolRef::method("Player", "hurt"))
//!                 .gated("god")
//!                 .before(|_, _| Ok(BeforeOutcome::suppress())),
//!         ),
//! );
//! engine.ensure_activated();
//! engine.toggle("god").unwrap();
//! assert_eq!(engine.registry().applied(), vec!["god".to_string()]);
//! ```
//!
//! # Fault policy
//!
//! Nothing raised by a hook, an override write or a sweep cell reaches the
//! host. Every such boundary is wrapped in `catch_boundary`; the fault is
//! logged and that tick's effect is simply absent.

pub mod config;
pub mod engine;
pub mod ffi;

pub use config::{ConfigError, ConfigStore, EngineConfig, MemoryConfigStore, TomlConfigStore};
pub use engine::{
    Engine, EngineBuilder, EngineError, EngineStats, FeatureSpec, FeatureStatus, HookSpec,
    HostFault, HostValue, OverrideRule, SweepSpec, SymbolRef, TickBus, TickEvent, ToggleSpec,
    ToggleValue,
};
