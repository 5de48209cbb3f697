// Interception engine
//
// One `Engine` per host process. It owns the binding cache, every patch set,
// the override state and the active sweeps. Features register what they need
// as a `FeatureSpec`; activation (timer or eager) resolves and installs them.

pub mod activation;
pub mod binding_cache;
pub mod error;
pub mod fast_path;
pub mod feature;
pub mod intercept;
pub mod notify;
pub mod overrides;
pub mod sweep;
pub mod symbol;
pub mod tick;
pub mod value;

pub use activation::{ActivationOutcome, ActivationPhase, DeferredActivator, Trigger};
pub use binding_cache::{AmbiguityPolicy, SymbolResolver};
pub use error::{catch_boundary, EngineError, HostFault};
pub use fast_path::{BoundCall, FastPathBinder};
pub use feature::{CellFn, FeatureSpec, HookSpec, SweepSpec};
pub use intercept::{
    AfterHook, BeforeHook, BeforeOutcome, InterceptionRecord, InterceptionRegistry, MethodSlot,
    NativeFn, PatchSet, PatchState, RecordId,
};
pub use notify::{Notifier, Tone, TracingNotifier};
pub use overrides::{
    FrameOverrideLoop, FrameReport, OverrideAction, OverrideRule, OverrideState, ToggleChange,
    ToggleError, ToggleSpec, ToggleValue,
};
pub use sweep::{ChunkedSweepController, SweepBody, SweepConfig, SweepCursor, SweepTick};
pub use symbol::{
    Accessor, Candidate, Handle, Member, MemberTable, Signature, SymbolKind, SymbolRef, SymbolTable,
};
pub use tick::{FrameEvent, SubscriptionId, TickBus, TickEvent, TickListener, TickSource};
pub use value::{Args, HostValue, ObjectRef};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ConfigStore, EngineConfig};

/// Where a registered feature stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureStatus {
    /// Registered, waiting for activation
    Pending,
    /// Hooks installed, rules and sweeps attached
    Active,
    /// A hook target was missing or refused the hook; does nothing this run
    Inert,
}

/// Counters for diagnostics and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Times the activation body ran
    pub activation_passes: u64,
    /// Activation triggers that found activation already claimed
    pub activation_races: u64,
    /// Lookups that reached the host symbol table
    pub resolver_lookups: u64,
    pub applied_patch_sets: usize,
    pub override_rules: usize,
    pub sweeps: usize,
    pub inert_features: usize,
}

struct Registration {
    activated: bool,
    pending: Vec<FeatureSpec>,
    features: Vec<(String, FeatureStatus)>,
}

struct ActiveSweep {
    gate: String,
    controller: ChunkedSweepController,
    binder: FastPathBinder,
    receiver: Option<Handle>,
    receiver_warned: bool,
    cell: CellFn,
}

/// Sweep body that re-binds the hot call before each pass
struct SweepPass<'a> {
    binder: &'a mut FastPathBinder,
    receiver: Option<&'a Handle>,
    receiver_warned: &'a mut bool,
    cell: &'a CellFn,
}

impl SweepBody for SweepPass<'_> {
    fn begin_pass(&mut self) -> bool {
        let receiver = match self.receiver {
            Some(handle) => match catch_boundary(|| handle.read(&HostValue::Unit)) {
                Ok(value) => value,
                Err(fault) => {
                    if !*self.receiver_warned {
                        *self.receiver_warned = true;
                        warn!(target: "hostpatch::sweep", error = %fault, "Cannot read sweep receiver; pass skipped until it reads");
                    }
                    return false;
                }
            },
            None => HostValue::Unit,
        };
        self.binder.prepare(&receiver).is_some()
    }

    fn visit(&mut self, x: usize, y: usize) -> Result<(), HostFault> {
        let call = self
            .binder
            .current()
            .ok_or_else(|| HostFault::new("sweep has no bound call"))?;
        (self.cell)(call, x, y)
    }
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    symbols: Arc<dyn SymbolTable>,
    ticks: Option<Arc<dyn TickSource>>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn ticks(mut self, source: Arc<dyn TickSource>) -> Self {
        self.ticks = Some(source);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Arc<Engine> {
        let frame = FrameOverrideLoop::new().with_default_throttle(self.config.frame.default_throttle);
        Arc::new(Engine {
            resolver: SymbolResolver::new(self.symbols, self.config.resolver.ambiguity),
            registry: InterceptionRegistry::new(),
            activator: DeferredActivator::new(),
            state: Arc::new(OverrideState::new()),
            notifier: self.notifier,
            ticks: self.ticks,
            subscription: Mutex::new(None),
            registration: Mutex::new(Registration {
                activated: false,
                pending: Vec::new(),
                features: Vec::new(),
            }),
            frame: Mutex::new(frame),
            sweeps: Mutex::new(Vec::new()),
            installed: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            activation_passes: AtomicU64::new(0),
            config: self.config,
        })
    }
}

/// The interception and override engine
pub struct Engine {
    config: EngineConfig,
    resolver: SymbolResolver,
    registry: InterceptionRegistry,
    activator: DeferredActivator,
    state: Arc<OverrideState>,
    notifier: Arc<dyn Notifier>,
    ticks: Option<Arc<dyn TickSource>>,
    subscription: Mutex<Option<SubscriptionId>>,
    registration: Mutex<Registration>,
    frame: Mutex<FrameOverrideLoop>,
    sweeps: Mutex<Vec<ActiveSweep>>,
    /// Set once activation has installed everything queued before it
    installed: AtomicBool,
    shut_down: AtomicBool,
    activation_passes: AtomicU64,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("phase", &self.activator.phase())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder(symbols: Arc<dyn SymbolTable>) -> EngineBuilder {
        EngineBuilder {
            symbols,
            ticks: None,
            notifier: Arc::new(TracingNotifier),
            config: EngineConfig::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resolver(&self) -> &SymbolResolver {
        &self.resolver
    }

    pub fn registry(&self) -> &InterceptionRegistry {
        &self.registry
    }

    pub fn activation_phase(&self) -> ActivationPhase {
        self.activator.phase()
    }

    /// Whether activation has finished installing.
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Declare a feature's toggles and queue it for activation.
    ///
    /// After activation the feature installs immediately. Registering an id
    /// that is already known does nothing.
    pub fn register(&self, feature: FeatureSpec) {
        if self.shut_down.load(Ordering::Acquire) {
            warn!(target: "hostpatch::engine", feature = %feature.id, "Engine shut down; registration ignored");
            return;
        }
        for toggle in &feature.toggles {
            self.state.declare(toggle.clone());
        }

        let install_now = {
            let mut reg = self.registration.lock();
            let known = reg.features.iter().any(|(id, _)| *id == feature.id)
                || reg.pending.iter().any(|f| f.id == feature.id);
            if known {
                debug!(target: "hostpatch::engine", feature = %feature.id, "Feature already registered");
                return;
            }
            // Claim the id before installing so a concurrent duplicate sees it
            reg.features.push((feature.id.clone(), FeatureStatus::Pending));
            if !reg.activated {
                reg.pending.push(feature.clone());
            }
            reg.activated
        };

        if install_now {
            let status = self.install_feature(&feature);
            self.set_feature_status(&feature.id, status);
        }
    }

    fn set_feature_status(&self, id: &str, status: FeatureStatus) {
        let mut reg = self.registration.lock();
        if let Some(entry) = reg.features.iter_mut().find(|(fid, _)| fid == id) {
            entry.1 = status;
        }
    }

    pub fn feature_status(&self, id: &str) -> Option<FeatureStatus> {
        self.registration
            .lock()
            .features
            .iter()
            .find(|(fid, _)| fid == id)
            .map(|(_, status)| *status)
    }

    /// Subscribe to ticks and schedule timer-driven activation.
    ///
    /// Calling this twice is harmless.
    pub fn start(self: &Arc<Self>) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        {
            let mut subscription = self.subscription.lock();
            if subscription.is_some() {
                debug!(target: "hostpatch::engine", "Engine already started");
                return;
            }
            if let Some(ticks) = &self.ticks {
                let weak: Weak<Engine> = Arc::downgrade(self);
                *subscription = Some(ticks.subscribe(Arc::new(move |event: &TickEvent| {
                    if let Some(engine) = weak.upgrade() {
                        engine.on_tick(event);
                    }
                })));
            }
        }

        let weak = Arc::downgrade(self);
        self.activator.schedule(self.config.activation_delay(), move || {
            if let Some(engine) = weak.upgrade() {
                engine.activate(Trigger::Timer);
            }
        });
        info!(
            target: "hostpatch::engine",
            delay_ms = self.config.activation_delay_ms,
            "Engine started"
        );
    }

    /// Activate now unless some trigger already has.
    pub fn ensure_activated(&self) -> ActivationOutcome {
        self.activate(Trigger::Eager)
    }

    fn activate(&self, trigger: Trigger) -> ActivationOutcome {
        self.activator.trigger(trigger, || self.run_activation())
    }

    fn run_activation(&self) {
        if self.shut_down.load(Ordering::Acquire) {
            debug!(target: "hostpatch::engine", "Activation after shutdown skipped");
            return;
        }
        self.activation_passes.fetch_add(1, Ordering::Relaxed);

        loop {
            let batch = {
                let mut reg = self.registration.lock();
                if reg.pending.is_empty() {
                    reg.activated = true;
                    break;
                }
                std::mem::take(&mut reg.pending)
            };
            for feature in batch {
                let status = self.install_feature(&feature);
                self.set_feature_status(&feature.id, status);
            }
        }

        self.installed.store(true, Ordering::Release);
        let stats = self.stats();
        info!(
            target: "hostpatch::engine",
            patch_sets = stats.applied_patch_sets,
            rules = stats.override_rules,
            sweeps = stats.sweeps,
            inert = stats.inert_features,
            "Activation complete"
        );
    }

    fn gate_before(&self, gate: &Option<String>, hook: BeforeHook) -> BeforeHook {
        match gate {
            None => hook,
            Some(toggle) => {
                let state = Arc::clone(&self.state);
                let toggle = toggle.clone();
                Arc::new(move |receiver: &HostValue, args: &mut Args| {
                    if state.is_on(&toggle) {
                        hook(receiver, args)
                    } else {
                        Ok(BeforeOutcome::Continue)
                    }
                })
            }
        }
    }

    fn gate_after(&self, gate: &Option<String>, hook: AfterHook) -> AfterHook {
        match gate {
            None => hook,
            Some(toggle) => {
                let state = Arc::clone(&self.state);
                let toggle = toggle.clone();
                Arc::new(move |receiver: &HostValue, args: &[HostValue], result: &HostValue| {
                    if state.is_on(&toggle) {
                        hook(receiver, args, result)
                    } else {
                        Ok(None)
                    }
                })
            }
        }
    }

    fn install_feature(&self, feature: &FeatureSpec) -> FeatureStatus {
        if !feature.hooks.is_empty() {
            let records = feature
                .hooks
                .iter()
                .map(|hook| {
                    let target = self.resolver.resolve(&hook.target);
                    let before = hook.before.clone().map(|h| self.gate_before(&hook.gate, h));
                    let after = hook.after.clone().map(|h| self.gate_after(&hook.gate, h));
                    InterceptionRecord::new(format!("{}:{}", feature.id, hook.target), target)
                        .with_hooks(before, after)
                })
                .collect();

            if let Err(e) = self.registry.install(PatchSet::new(feature.id.clone(), records)) {
                self.registry.uninstall(&feature.id);
                warn!(target: "hostpatch::engine", feature = %feature.id, error = %e, "Feature inert for this run");
                return FeatureStatus::Inert;
            }
        }

        if !feature.overrides.is_empty() {
            let mut frame = self.frame.lock();
            for rule in &feature.overrides {
                let handle = self.resolver.resolve(&rule.field);
                if handle.is_null() {
                    continue;
                }
                frame.attach(rule.clone(), handle);
            }
        }

        if !feature.sweeps.is_empty() {
            let defaults = self.config.sweep.as_sweep_config();
            let mut sweeps = self.sweeps.lock();
            for spec in &feature.sweeps {
                let target = self.resolver.resolve(&spec.target);
                if target.is_null() {
                    continue;
                }
                let receiver = match &spec.receiver {
                    Some(symbol) => {
                        let handle = self.resolver.resolve(symbol);
                        if handle.is_null() {
                            continue;
                        }
                        Some(handle)
                    }
                    None => None,
                };
                sweeps.push(ActiveSweep {
                    gate: spec.gate.clone(),
                    controller: ChunkedSweepController::new(spec.id.clone(), spec.config(&defaults)),
                    binder: FastPathBinder::new(target, receiver.is_some()),
                    receiver,
                    receiver_warned: false,
                    cell: Arc::clone(&spec.cell),
                });
            }
        }

        debug!(target: "hostpatch::engine", feature = %feature.id, "Feature active");
        FeatureStatus::Active
    }

    /// Handle one host tick. Does nothing until activation has installed.
    pub fn on_tick(&self, event: &TickEvent) {
        if !self.is_installed() || self.shut_down.load(Ordering::Acquire) {
            return;
        }
        match event {
            TickEvent::Entity(frame_event) => {
                self.frame.lock().on_entity_tick(frame_event, &self.state);
            }
            TickEvent::World { .. } => self.advance_sweeps(),
        }
    }

    fn advance_sweeps(&self) {
        let mut sweeps = self.sweeps.lock();
        for sweep in sweeps.iter_mut() {
            let on = self.state.is_on(&sweep.gate);
            if !on {
                if sweep.controller.is_enabled() {
                    sweep.controller.disable();
                    sweep.binder.reset();
                }
                continue;
            }
            if !sweep.controller.is_enabled() {
                sweep.controller.enable();
            }
            let mut pass = SweepPass {
                binder: &mut sweep.binder,
                receiver: sweep.receiver.as_ref(),
                receiver_warned: &mut sweep.receiver_warned,
                cell: &sweep.cell,
            };
            sweep.controller.tick(&mut pass);
        }
    }

    /// Progress of the sweep with id `id`, if it is attached and enabled.
    pub fn sweep_cursor(&self, id: &str) -> Option<SweepCursor> {
        self.sweeps
            .lock()
            .iter()
            .find(|s| s.controller.id() == id)
            .and_then(|s| s.controller.cursor().cloned())
    }

    /// Set a toggle, announcing the transition if the value changed.
    ///
    /// Returns whether the value changed.
    pub fn set_toggle(&self, name: &str, value: ToggleValue) -> Result<bool, ToggleError> {
        let change = self.state.set(name, value)?;
        if !change.changed() {
            return Ok(false);
        }
        let (text, tone) = match change.to {
            ToggleValue::Bool(true) => (format!("{} enabled", change.label), Tone::Enabled),
            ToggleValue::Bool(false) => (format!("{} disabled", change.label), Tone::Disabled),
            ToggleValue::Int(n) => (format!("{}: {}", change.label, n), Tone::Info),
        };
        notify::announce(self.notifier.as_ref(), &text, tone);
        debug!(target: "hostpatch::engine", toggle = name, from = %change.from, to = %change.to, "Toggle changed");
        Ok(true)
    }

    /// Flip a boolean toggle and return its new value.
    pub fn toggle(&self, name: &str) -> Result<bool, ToggleError> {
        let current = match self.state.get(name) {
            Some(ToggleValue::Bool(b)) => b,
            Some(ToggleValue::Int(_)) => {
                return Err(ToggleError::TypeMismatch {
                    name: name.to_string(),
                    expected: "boolean",
                })
            }
            None => return Err(ToggleError::Unknown(name.to_string())),
        };
        self.set_toggle(name, ToggleValue::Bool(!current))?;
        Ok(!current)
    }

    /// Set a multiplier toggle. 1 is pass-through; 0 is the special mode.
    pub fn set_multiplier(&self, name: &str, factor: i64) -> Result<bool, ToggleError> {
        self.set_toggle(name, ToggleValue::Int(factor))
    }

    pub fn toggle_value(&self, name: &str) -> Option<ToggleValue> {
        self.state.get(name)
    }

    /// Every toggle and its value, for display.
    pub fn toggles(&self) -> Vec<(String, ToggleValue)> {
        self.state.snapshot()
    }

    /// Read initial toggle values from `store`. Keys the store does not have
    /// keep their declared defaults. Nothing is announced.
    pub fn load_toggles(&self, store: &dyn ConfigStore) -> usize {
        let mut loaded = 0;
        for (name, value) in self.state.snapshot() {
            let stored = match value {
                ToggleValue::Bool(_) => store.get_bool(&name).map(ToggleValue::Bool),
                ToggleValue::Int(_) => store.get_int(&name).map(ToggleValue::Int),
            };
            if let Some(stored) = stored {
                if self.state.set(&name, stored).is_ok() {
                    loaded += 1;
                }
            }
        }
        debug!(target: "hostpatch::engine", loaded, "Loaded toggles");
        loaded
    }

    /// Write every toggle to `store` and save it.
    pub fn persist_toggles(&self, store: &mut dyn ConfigStore) -> Result<(), ConfigError> {
        for (name, value) in self.state.snapshot() {
            store.set(&name, value);
        }
        store.save()
    }

    /// Detach from the host: unsubscribe, cancel a pending activation,
    /// remove every patch set and drop every cached binding.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let (Some(ticks), Some(id)) = (&self.ticks, self.subscription.lock().take()) {
            ticks.unsubscribe(id);
        }
        self.activator.cancel();
        let removed = self.registry.uninstall_all();
        for sweep in self.sweeps.lock().iter_mut() {
            sweep.controller.disable();
            sweep.binder.reset();
        }
        self.resolver.clear();
        self.installed.store(false, Ordering::Release);
        info!(target: "hostpatch::engine", removed_patch_sets = removed, "Engine shut down");
    }

    pub fn stats(&self) -> EngineStats {
        let inert_features = self
            .registration
            .lock()
            .features
            .iter()
            .filter(|(_, s)| *s == FeatureStatus::Inert)
            .count();
        EngineStats {
            activation_passes: self.activation_passes.load(Ordering::Relaxed),
            activation_races: self.activator.races(),
            resolver_lookups: self.resolver.lookups(),
            applied_patch_sets: self.registry.applied().len(),
            override_rules: self.frame.lock().rule_count(),
            sweeps: self.sweeps.lock().len(),
            inert_features,
        }
    }
}
