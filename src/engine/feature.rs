//! Feature declarations
//!
//! A feature is a bundle of what it needs from the host: toggles it owns,
//! hooks it installs, fields it overrides every tick and grids it sweeps.
//! Features do not touch the engine directly; they hand a [`FeatureSpec`] to
//! [`Engine::register`](super::Engine::register) and the engine resolves and
//! installs everything at activation.

use std::fmt;
use std::sync::Arc;

use super::error::HostFault;
use super::fast_path::BoundCall;
use super::intercept::{AfterHook, BeforeHook, BeforeOutcome};
use super::overrides::{OverrideRule, ToggleSpec};
use super::sweep::SweepConfig;
use super::symbol::SymbolRef;
use super::value::{Args, HostValue};

/// Per-cell sweep body: the bound hot call plus absolute grid coordinates
pub type CellFn = Arc<dyn Fn(&BoundCall, usize, usize) -> Result<(), HostFault> + Send + Sync>;

/// An interceptor on one host method
#[derive(Clone)]
pub struct HookSpec {
    pub target: SymbolRef,
    /// Toggle checked at the top of every call; the hook is a no-op while off
    pub gate: Option<String>,
    pub before: Option<BeforeHook>,
    pub after: Option<AfterHook>,
}

impl fmt::Debug for HookSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSpec")
            .field("target", &self.target.to_string())
            .field("gate", &self.gate)
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .finish()
    }
}

impl HookSpec {
    pub fn new(target: SymbolRef) -> Self {
        Self {
            target,
            gate: None,
            before: None,
            after: None,
        }
    }

    pub fn gated(mut self, toggle: &str) -> Self {
        self.gate = Some(toggle.to_string());
        self
    }

    pub fn before<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HostValue, &mut Args) -> Result<BeforeOutcome, HostFault> + Send + Sync + 'static,
    {
        self.before = Some(Arc::new(hook));
        self
    }

    pub fn after<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HostValue, &[HostValue], &HostValue) -> Result<Option<HostValue>, HostFault>
            + Send
            + Sync
            + 'static,
    {
        self.after = Some(Arc::new(hook));
        self
    }
}

/// A budgeted sweep over a host grid
///
/// `target` is the method called for every cell. When `receiver` is set it
/// names a static field or property holding the object `target` is called
/// on; it is read again before every pass so a replaced object is noticed.
/// Without it `target` is treated as a static method.
///
/// Pacing left unset here comes from the engine's `[sweep]` configuration.
#[derive(Clone)]
pub struct SweepSpec {
    pub id: String,
    /// Toggle that enables the sweep
    pub gate: String,
    pub target: SymbolRef,
    pub receiver: Option<SymbolRef>,
    pub width: usize,
    pub height: usize,
    pub margin: Option<usize>,
    pub budget: Option<usize>,
    pub refresh_interval: Option<u32>,
    pub cell: CellFn,
}

impl fmt::Debug for SweepSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SweepSpec")
            .field("id", &self.id)
            .field("gate", &self.gate)
            .field("target", &self.target.to_string())
            .field("receiver", &self.receiver.as_ref().map(ToString::to_string))
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl SweepSpec {
    pub fn new<F>(id: &str, gate: &str, target: SymbolRef, width: usize, height: usize, cell: F) -> Self
    where
        F: Fn(&BoundCall, usize, usize) -> Result<(), HostFault> + Send + Sync + 'static,
    {
        Self {
            id: id.to_string(),
            gate: gate.to_string(),
            target,
            receiver: None,
            width,
            height,
            margin: None,
            budget: None,
            refresh_interval: None,
            cell: Arc::new(cell),
        }
    }

    pub fn receiver(mut self, symbol: SymbolRef) -> Self {
        self.receiver = Some(symbol);
        self
    }

    pub fn margin(mut self, margin: usize) -> Self {
        self.margin = Some(margin);
        self
    }

    pub fn budget(mut self, columns: usize) -> Self {
        self.budget = Some(columns);
        self
    }

    pub fn refresh_interval(mut self, ticks: u32) -> Self {
        self.refresh_interval = Some(ticks);
        self
    }

    /// Fill unset pacing from `defaults`.
    pub fn config(&self, defaults: &SweepConfig) -> SweepConfig {
        SweepConfig {
            width: self.width,
            height: self.height,
            margin: self.margin.unwrap_or(defaults.margin),
            budget: self.budget.unwrap_or(defaults.budget).max(1),
            refresh_interval: self.refresh_interval.unwrap_or(defaults.refresh_interval),
        }
    }
}

/// Everything one feature needs from the host
#[derive(Debug, Clone)]
pub struct FeatureSpec {
    pub id: String,
    pub toggles: Vec<ToggleSpec>,
    pub hooks: Vec<HookSpec>,
    pub overrides: Vec<OverrideRule>,
    pub sweeps: Vec<SweepSpec>,
}

impl FeatureSpec {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            toggles: Vec::new(),
            hooks: Vec::new(),
            overrides: Vec::new(),
            sweeps: Vec::new(),
        }
    }

    pub fn toggle(mut self, spec: ToggleSpec) -> Self {
        self.toggles.push(spec);
        self
    }

    pub fn hook(mut self, hook: HookSpec) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn override_field(mut self, rule: OverrideRule) -> Self {
        self.overrides.push(rule);
        self
    }

    pub fn sweep(mut self, sweep: SweepSpec) -> Self {
        self.sweeps.push(sweep);
        self
    }
}
