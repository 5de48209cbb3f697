//! Override state and the per-tick override loop
//!
//! Toggles are named booleans or bounded integers set by the presentation
//! layer. Override rules tie a toggle to a host field; on every qualifying
//! entity tick the loop writes the override value through the field's handle.
//!
//! Only the locally controlled entity qualifies. Rules run in registration
//! order, so when two rules write the same field the later one wins.
//!
//! Multiplier rules scale a baseline captured the first time they modify the
//! field, never the field's current (already scaled) value, so switching
//! between factors cannot drift. If the field no longer holds what the rule
//! last wrote, the host changed it in between and that value becomes the new
//! baseline. A factor of 1 writes the baseline back at once, throttle or not,
//! unless the host has changed the field since, in which case the host's value
//! stays. A factor of 0 is not "scale by zero": it selects the rule's
//! `zero_mode` value.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::error::{catch_boundary, EngineError, HostFault};
use super::symbol::{Handle, SymbolRef};
use super::tick::FrameEvent;
use super::value::HostValue;

/// Current value of a toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToggleValue {
    Bool(bool),
    Int(i64),
}

impl ToggleValue {
    /// Booleans are on when true, integers when non-zero.
    pub fn is_on(&self) -> bool {
        match self {
            ToggleValue::Bool(b) => *b,
            ToggleValue::Int(n) => *n != 0,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ToggleValue::Int(n) => Some(*n),
            ToggleValue::Bool(_) => None,
        }
    }

    fn same_type(&self, other: &ToggleValue) -> bool {
        matches!(
            (self, other),
            (ToggleValue::Bool(_), ToggleValue::Bool(_)) | (ToggleValue::Int(_), ToggleValue::Int(_))
        )
    }

    fn to_host(self) -> HostValue {
        match self {
            ToggleValue::Bool(b) => HostValue::Bool(b),
            ToggleValue::Int(n) => HostValue::Int(n),
        }
    }
}

impl fmt::Display for ToggleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToggleValue::Bool(true) => f.write_str("on"),
            ToggleValue::Bool(false) => f.write_str("off"),
            ToggleValue::Int(n) => write!(f, "{}", n),
        }
    }
}

/// Declaration of a toggle
#[derive(Debug, Clone, PartialEq)]
pub struct ToggleSpec {
    pub name: String,
    /// Human-readable name used in announcements
    pub label: String,
    pub default: ToggleValue,
    /// Inclusive bounds for integer toggles
    pub range: Option<(i64, i64)>,
}

impl ToggleSpec {
    pub fn flag(name: &str, label: &str, default: bool) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            default: ToggleValue::Bool(default),
            range: None,
        }
    }

    /// Integer toggle clamped into `min..=max`.
    pub fn level(name: &str, label: &str, default: i64, min: i64, max: i64) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            default: ToggleValue::Int(default.clamp(min, max)),
            range: Some((min, max)),
        }
    }

    /// Multiplier toggle: 1 is pass-through, 0 the special mode.
    pub fn multiplier(name: &str, label: &str, max: i64) -> Self {
        Self::level(name, label, 1, 0, max)
    }

    fn clamp(&self, value: ToggleValue) -> ToggleValue {
        match (value, self.range) {
            (ToggleValue::Int(n), Some((min, max))) => ToggleValue::Int(n.clamp(min, max)),
            (v, _) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleError {
    Unknown(String),
    TypeMismatch { name: String, expected: &'static str },
}

impl fmt::Display for ToggleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(name) => write!(f, "unknown toggle '{}'", name),
            Self::TypeMismatch { name, expected } => {
                write!(f, "toggle '{}' expects a {} value", name, expected)
            }
        }
    }
}

impl std::error::Error for ToggleError {}

/// What a successful `set` did
#[derive(Debug, Clone, PartialEq)]
pub struct ToggleChange {
    pub label: String,
    pub from: ToggleValue,
    pub to: ToggleValue,
}

impl ToggleChange {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

struct Toggle {
    spec: ToggleSpec,
    value: ToggleValue,
}

#[derive(Default)]
struct Toggles {
    entries: Vec<Toggle>,
    index: HashMap<String, usize>,
}

/// Named toggles, readable from any thread
#[derive(Default)]
pub struct OverrideState {
    toggles: RwLock<Toggles>,
}

impl fmt::Debug for OverrideState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.snapshot()).finish()
    }
}

impl OverrideState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a toggle. A toggle declared twice keeps its first spec and
    /// current value; returns `false` in that case.
    pub fn declare(&self, spec: ToggleSpec) -> bool {
        let mut toggles = self.toggles.write();
        if toggles.index.contains_key(&spec.name) {
            return false;
        }
        let slot = toggles.entries.len();
        toggles.index.insert(spec.name.clone(), slot);
        let value = spec.default;
        toggles.entries.push(Toggle { spec, value });
        true
    }

    pub fn set(&self, name: &str, value: ToggleValue) -> Result<ToggleChange, ToggleError> {
        let mut toggles = self.toggles.write();
        let slot = *toggles
            .index
            .get(name)
            .ok_or_else(|| ToggleError::Unknown(name.to_string()))?;
        let toggle = &mut toggles.entries[slot];
        if !toggle.value.same_type(&value) {
            return Err(ToggleError::TypeMismatch {
                name: name.to_string(),
                expected: match toggle.value {
                    ToggleValue::Bool(_) => "boolean",
                    ToggleValue::Int(_) => "integer",
                },
            });
        }
        let from = toggle.value;
        toggle.value = toggle.spec.clamp(value);
        Ok(ToggleChange {
            label: toggle.spec.label.clone(),
            from,
            to: toggle.value,
        })
    }

    pub fn get(&self, name: &str) -> Option<ToggleValue> {
        let toggles = self.toggles.read();
        toggles.index.get(name).map(|&slot| toggles.entries[slot].value)
    }

    /// Whether `name` exists and is on.
    pub fn is_on(&self, name: &str) -> bool {
        self.get(name).is_some_and(|v| v.is_on())
    }

    pub fn spec(&self, name: &str) -> Option<ToggleSpec> {
        let toggles = self.toggles.read();
        toggles.index.get(name).map(|&slot| toggles.entries[slot].spec.clone())
    }

    /// Every toggle and its value, in declaration order.
    pub fn snapshot(&self) -> Vec<(String, ToggleValue)> {
        self.toggles
            .read()
            .entries
            .iter()
            .map(|t| (t.spec.name.clone(), t.value))
            .collect()
    }
}

/// What an override rule writes while its toggle is on
#[derive(Debug, Clone, PartialEq)]
pub enum OverrideAction {
    /// Write a fixed value
    Pin(HostValue),
    /// Write the toggle's own value
    Mirror,
    /// Scale the captured baseline by the toggle's integer value;
    /// a factor of 0 writes `zero_mode` instead
    Multiply { zero_mode: HostValue },
}

/// A toggle bound to a host field
#[derive(Debug, Clone, PartialEq)]
pub struct OverrideRule {
    pub toggle: String,
    pub field: SymbolRef,
    pub action: OverrideAction,
    /// Run on every `every`th qualifying tick; `None` takes the loop default
    pub every: Option<u32>,
}

impl OverrideRule {
    pub fn pin(toggle: &str, field: SymbolRef, value: HostValue) -> Self {
        Self::new(toggle, field, OverrideAction::Pin(value))
    }

    pub fn mirror(toggle: &str, field: SymbolRef) -> Self {
        Self::new(toggle, field, OverrideAction::Mirror)
    }

    pub fn multiply(toggle: &str, field: SymbolRef, zero_mode: HostValue) -> Self {
        Self::new(toggle, field, OverrideAction::Multiply { zero_mode })
    }

    fn new(toggle: &str, field: SymbolRef, action: OverrideAction) -> Self {
        Self {
            toggle: toggle.to_string(),
            field,
            action,
            every: None,
        }
    }

    /// Throttle to every `k`th qualifying tick.
    pub fn every(mut self, k: u32) -> Self {
        self.every = Some(k.max(1));
        self
    }
}

struct Baseline {
    receiver: HostValue,
    value: HostValue,
    /// What the rule last wrote; anything else in the field came from the host
    written: Option<HostValue>,
}

struct ActiveRule {
    rule: OverrideRule,
    handle: Handle,
    baseline: Option<Baseline>,
    faults: u64,
}

impl ActiveRule {
    fn write(&mut self, receiver: &HostValue, value: HostValue) -> bool {
        let handle = &self.handle;
        match catch_boundary(|| handle.write(receiver, value)) {
            Ok(()) => true,
            Err(fault) => {
                self.fault(fault);
                false
            }
        }
    }

    fn fault(&mut self, fault: HostFault) {
        self.faults += 1;
        let err = EngineError::RuntimeHookException {
            hook: format!("override {} -> {}", self.rule.toggle, self.rule.field),
            fault,
        };
        if self.faults == 1 {
            warn!(target: "hostpatch::overrides", error = %err, "Override write failed; effect skipped");
        } else {
            trace!(target: "hostpatch::overrides", error = %err, "Override write failed again");
        }
    }

    fn read(&mut self, receiver: &HostValue) -> Option<HostValue> {
        let handle = &self.handle;
        match catch_boundary(|| handle.read(receiver)) {
            Ok(value) => Some(value),
            Err(fault) => {
                self.fault(fault);
                None
            }
        }
    }

    /// Put the baseline back and forget it. Returns whether a write happened.
    fn restore(&mut self, receiver: &HostValue) -> bool {
        let Some(b) = self.baseline.take() else {
            return false;
        };
        if !b.receiver.same_receiver(receiver) {
            return false;
        }
        if let Some(written) = &b.written {
            if self.read(receiver).as_ref() != Some(written) {
                debug!(target: "hostpatch::overrides", field = %self.rule.field, "Host changed the field; keeping its value");
                return false;
            }
        }
        self.write(receiver, b.value)
    }

    fn ensure_baseline(&mut self, receiver: &HostValue) -> Option<HostValue> {
        let current = self.read(receiver)?;
        let rebase = match &self.baseline {
            Some(b) if b.receiver.same_receiver(receiver) => match &b.written {
                Some(written) => *written != current,
                None => false,
            },
            _ => true,
        };
        if rebase {
            if self.baseline.is_some() {
                debug!(target: "hostpatch::overrides", field = %self.rule.field, "Field changed outside the rule; new baseline");
            }
            self.baseline = Some(Baseline {
                receiver: receiver.clone(),
                value: current,
                written: None,
            });
        }
        self.baseline.as_ref().map(|b| b.value.clone())
    }

    fn record_write(&mut self, value: HostValue) {
        if let Some(b) = self.baseline.as_mut() {
            b.written = Some(value);
        }
    }
}

/// Counts from one entity tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameReport {
    pub writes: usize,
    /// The event was for a non-local entity
    pub filtered: bool,
}

/// Re-asserts override values on the local entity every tick
pub struct FrameOverrideLoop {
    rules: Vec<ActiveRule>,
    local_ticks: u64,
    default_every: u32,
}

impl Default for FrameOverrideLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FrameOverrideLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameOverrideLoop")
            .field("rules", &self.rules.len())
            .field("local_ticks", &self.local_ticks)
            .finish()
    }
}

impl FrameOverrideLoop {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            local_ticks: 0,
            default_every: 1,
        }
    }

    /// Throttle applied to rules that do not set their own.
    pub fn with_default_throttle(mut self, every: u32) -> Self {
        self.default_every = every.max(1);
        self
    }

    /// Add a rule whose field has been resolved to `handle`.
    pub fn attach(&mut self, rule: OverrideRule, handle: Handle) {
        if self.rules.iter().any(|r| r.rule.field == rule.field) {
            debug!(
                target: "hostpatch::overrides",
                field = %rule.field,
                toggle = %rule.toggle,
                "Field already overridden; the later rule wins"
            );
        }
        self.rules.push(ActiveRule {
            rule,
            handle,
            baseline: None,
            faults: 0,
        });
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Qualifying ticks seen so far.
    pub fn local_ticks(&self) -> u64 {
        self.local_ticks
    }

    /// Apply every rule to the entity in `event`, if it is the local one.
    pub fn on_entity_tick(&mut self, event: &FrameEvent, state: &OverrideState) -> FrameReport {
        if !event.is_local() {
            return FrameReport {
                writes: 0,
                filtered: true,
            };
        }
        let tick = self.local_ticks;
        self.local_ticks += 1;
        let receiver = &event.target;
        let mut writes = 0;

        for active in &mut self.rules {
            let Some(value) = state.get(&active.rule.toggle) else {
                continue;
            };
            let every = active.rule.every.unwrap_or(self.default_every);
            let due = tick % u64::from(every) == 0;

            match active.rule.action.clone() {
                OverrideAction::Pin(pinned) => {
                    if due && value.is_on() && active.write(receiver, pinned) {
                        writes += 1;
                    }
                }
                OverrideAction::Mirror => {
                    if due && value.is_on() && active.write(receiver, value.to_host()) {
                        writes += 1;
                    }
                }
                OverrideAction::Multiply { zero_mode } => {
                    let factor = value.as_int().unwrap_or(1);
                    if factor == 1 {
                        if active.restore(receiver) {
                            writes += 1;
                        }
                        continue;
                    }
                    if !due {
                        continue;
                    }
                    let Some(baseline) = active.ensure_baseline(receiver) else {
                        continue;
                    };
                    let target = if factor == 0 {
                        Some(zero_mode)
                    } else {
                        baseline.scaled(factor)
                    };
                    match target {
                        Some(v) => {
                            if active.write(receiver, v.clone()) {
                                active.record_write(v);
                                writes += 1;
                            }
                        }
                        None => active.fault(HostFault::new(format!(
                            "cannot scale a {} baseline",
                            baseline.type_name()
                        ))),
                    }
                }
            }
        }

        FrameReport {
            writes,
            filtered: false,
        }
    }
}
