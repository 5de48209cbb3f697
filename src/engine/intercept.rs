//! Interception Registry
//!
//! Host methods are reached through a [`MethodSlot`]: the original body plus
//! an ordered chain of [`InterceptionRecord`]s. Host-side adapter code routes
//! every call through [`MethodSlot::invoke`], which runs the chain:
//!
//! ```text
//! before-hooks (installation order) ──Suppress──▶ replacement or Unit
//!        │ Continue
//!        ▼
//!    original(receiver, args)
//!        │
//!        ▼
//! after-hooks (installation order, each may replace the visible result)
//! ```
//!
//! A `Suppress` from any before-hook means the original never runs and no
//! after-hook runs for that call. A hook that faults (returns `Err` or panics)
//! is treated as if it were absent for that call; the fault never reaches the
//! host.
//!
//! Records are grouped into [`PatchSet`]s which install and uninstall as a
//! unit, exactly once.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use super::error::{catch_boundary, EngineError, HostFault};
use super::symbol::Handle;
use super::value::{Args, HostValue};

/// Original body of a host method
pub type NativeFn = Arc<dyn Fn(&HostValue, &[HostValue]) -> Result<HostValue, HostFault> + Send + Sync>;

/// Runs before the original; may rewrite arguments or suppress the call
pub type BeforeHook =
    Arc<dyn Fn(&HostValue, &mut Args) -> Result<BeforeOutcome, HostFault> + Send + Sync>;

/// Runs after the original with the visible result; may return a replacement
pub type AfterHook = Arc<
    dyn Fn(&HostValue, &[HostValue], &HostValue) -> Result<Option<HostValue>, HostFault>
        + Send
        + Sync,
>;

/// What a before-hook wants done with the call
#[derive(Debug, Clone, PartialEq)]
pub enum BeforeOutcome {
    /// Run the rest of the chain and the original
    Continue,
    /// Skip the original and every after-hook. The call yields `result`,
    /// or `Unit` when none is given.
    Suppress { result: Option<HostValue> },
}

impl BeforeOutcome {
    pub fn suppress() -> Self {
        BeforeOutcome::Suppress { result: None }
    }

    pub fn suppress_with(value: HostValue) -> Self {
        BeforeOutcome::Suppress {
            result: Some(value),
        }
    }
}

static NEXT_RECORD_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of an installed interception record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId(u64);

/// One interceptor attached to one host method
pub struct InterceptionRecord {
    id: RecordId,
    label: String,
    target: Handle,
    before: Option<BeforeHook>,
    after: Option<AfterHook>,
    faults: AtomicU64,
}

impl fmt::Debug for InterceptionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptionRecord")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("target", &self.target)
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .field("faults", &self.faults.load(Ordering::Relaxed))
            .finish()
    }
}

impl InterceptionRecord {
    pub fn new(label: impl Into<String>, target: Handle) -> Self {
        Self {
            id: RecordId(NEXT_RECORD_ID.fetch_add(1, Ordering::Relaxed)),
            label: label.into(),
            target,
            before: None,
            after: None,
            faults: AtomicU64::new(0),
        }
    }

    pub fn with_before<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HostValue, &mut Args) -> Result<BeforeOutcome, HostFault> + Send + Sync + 'static,
    {
        self.before = Some(Arc::new(hook));
        self
    }

    pub fn with_after<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HostValue, &[HostValue], &HostValue) -> Result<Option<HostValue>, HostFault>
            + Send
            + Sync
            + 'static,
    {
        self.after = Some(Arc::new(hook));
        self
    }

    pub(crate) fn with_hooks(mut self, before: Option<BeforeHook>, after: Option<AfterHook>) -> Self {
        self.before = before;
        self.after = after;
        self
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn target(&self) -> &Handle {
        &self.target
    }

    /// Faults raised by this record's hooks so far.
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    fn note_fault(&self, stage: &'static str, fault: &HostFault) {
        let previous = self.faults.fetch_add(1, Ordering::Relaxed);
        let err = EngineError::RuntimeHookException {
            hook: self.label.clone(),
            fault: fault.clone(),
        };
        if previous == 0 {
            warn!(target: "hostpatch::intercept", stage, error = %err, "Hook faulted; effect skipped");
        } else {
            trace!(target: "hostpatch::intercept", stage, error = %err, "Hook faulted again");
        }
    }

    fn run_before(&self, receiver: &HostValue, args: &mut Args) -> BeforeOutcome {
        let Some(hook) = &self.before else {
            return BeforeOutcome::Continue;
        };
        match catch_boundary(|| hook(receiver, args)) {
            Ok(outcome) => outcome,
            Err(fault) => {
                self.note_fault("before", &fault);
                BeforeOutcome::Continue
            }
        }
    }

    fn run_after(&self, receiver: &HostValue, args: &[HostValue], result: &HostValue) -> Option<HostValue> {
        let hook = self.after.as_ref()?;
        match catch_boundary(|| hook(receiver, args, result)) {
            Ok(replacement) => replacement,
            Err(fault) => {
                self.note_fault("after", &fault);
                None
            }
        }
    }
}

/// A host method as seen by the engine
///
/// The chain is copy-on-write so a call in flight keeps the snapshot it
/// started with even if a patch set is installed or removed meanwhile.
pub struct MethodSlot {
    original: NativeFn,
    chain: RwLock<Arc<Vec<Arc<InterceptionRecord>>>>,
    patchable: bool,
    original_calls: AtomicU64,
}

impl fmt::Debug for MethodSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodSlot")
            .field("hooks", &self.chain.read().len())
            .field("patchable", &self.patchable)
            .field("original_calls", &self.original_calls.load(Ordering::Relaxed))
            .finish()
    }
}

impl MethodSlot {
    pub fn new<F>(original: F) -> Self
    where
        F: Fn(&HostValue, &[HostValue]) -> Result<HostValue, HostFault> + Send + Sync + 'static,
    {
        Self {
            original: Arc::new(original),
            chain: RwLock::new(Arc::new(Vec::new())),
            patchable: true,
            original_calls: AtomicU64::new(0),
        }
    }

    /// A method the host will not let us detour (inlined, intrinsic, ...).
    pub fn sealed<F>(original: F) -> Self
    where
        F: Fn(&HostValue, &[HostValue]) -> Result<HostValue, HostFault> + Send + Sync + 'static,
    {
        Self {
            patchable: false,
            ..Self::new(original)
        }
    }

    pub fn is_patchable(&self) -> bool {
        self.patchable
    }

    /// Number of interceptors currently attached.
    pub fn hook_count(&self) -> usize {
        self.chain.read().len()
    }

    /// Number of times the original body has run.
    pub fn original_calls(&self) -> u64 {
        self.original_calls.load(Ordering::Relaxed)
    }

    /// Run the original body, bypassing every interceptor.
    pub fn call_original(&self, receiver: &HostValue, args: &[HostValue]) -> Result<HostValue, HostFault> {
        self.original_calls.fetch_add(1, Ordering::Relaxed);
        (self.original)(receiver, args)
    }

    /// Call the method through its interception chain.
    ///
    /// Only faults raised by the original body are returned; hook faults are
    /// absorbed here.
    pub fn invoke(&self, receiver: &HostValue, args: &mut Args) -> Result<HostValue, HostFault> {
        let chain = Arc::clone(&self.chain.read());
        if chain.is_empty() {
            return self.call_original(receiver, args);
        }

        for record in chain.iter() {
            if let BeforeOutcome::Suppress { result } = record.run_before(receiver, args) {
                trace!(target: "hostpatch::intercept", hook = %record.label, "Call suppressed");
                return Ok(result.unwrap_or_default());
            }
        }

        let mut result = self.call_original(receiver, args)?;
        for record in chain.iter() {
            if let Some(replacement) = record.run_after(receiver, args, &result) {
                result = replacement;
            }
        }
        Ok(result)
    }

    fn attach(&self, record: Arc<InterceptionRecord>) {
        let mut chain = self.chain.write();
        let mut next = Vec::clone(&chain);
        next.push(record);
        *chain = Arc::new(next);
    }

    fn detach(&self, id: RecordId) -> bool {
        let mut chain = self.chain.write();
        let before = chain.len();
        let next: Vec<_> = chain.iter().filter(|r| r.id != id).cloned().collect();
        let removed = next.len() != before;
        *chain = Arc::new(next);
        removed
    }
}

/// Lifecycle of a patch set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    Unapplied,
    Applied,
    /// Uninstalled after being applied; terminal
    Removed,
    /// A target was missing or refused the hook; terminal, feature inert
    Failed,
}

/// A named group of interceptors that installs and uninstalls as a unit
pub struct PatchSet {
    id: String,
    records: Vec<Arc<InterceptionRecord>>,
    state: Mutex<PatchState>,
}

impl fmt::Debug for PatchSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchSet")
            .field("id", &self.id)
            .field("records", &self.records.len())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl PatchSet {
    pub fn new(id: impl Into<String>, records: Vec<InterceptionRecord>) -> Self {
        Self {
            id: id.into(),
            records: records.into_iter().map(Arc::new).collect(),
            state: Mutex::new(PatchState::Unapplied),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn records(&self) -> &[Arc<InterceptionRecord>] {
        &self.records
    }

    pub fn state(&self) -> PatchState {
        *self.state.lock()
    }

    pub fn is_applied(&self) -> bool {
        self.state() == PatchState::Applied
    }

    fn validate(&self) -> Result<(), EngineError> {
        for record in &self.records {
            let target = &record.target;
            let symbol = target
                .symbol()
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("<null target of {}>", record.label));
            if target.is_null() {
                return Err(EngineError::SymbolUnresolved { symbol });
            }
            match target.method() {
                None => {
                    return Err(EngineError::HookInstallFailed {
                        symbol,
                        reason: "target is not a method".to_string(),
                    })
                }
                Some(slot) if !slot.is_patchable() => {
                    return Err(EngineError::HookInstallFailed {
                        symbol,
                        reason: "host method cannot be intercepted".to_string(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Attach every record to its target.
    ///
    /// Returns `Ok(true)` when this call performed the installation and
    /// `Ok(false)` when the set was already applied. A set with a bad target
    /// attaches nothing and stays inert for the rest of the process run.
    pub fn apply(&self) -> Result<bool, EngineError> {
        let mut state = self.state.lock();
        match *state {
            PatchState::Applied => return Ok(false),
            PatchState::Removed | PatchState::Failed => {
                debug!(target: "hostpatch::intercept", set = %self.id, state = ?*state, "Patch set is terminal");
                return Ok(false);
            }
            PatchState::Unapplied => {}
        }

        if let Err(e) = self.validate() {
            *state = PatchState::Failed;
            warn!(target: "hostpatch::intercept", set = %self.id, error = %e, "Patch set not installed");
            return Err(e);
        }

        for record in &self.records {
            if let Some(slot) = record.target.method() {
                slot.attach(Arc::clone(record));
            }
        }
        *state = PatchState::Applied;
        info!(target: "hostpatch::intercept", set = %self.id, hooks = self.records.len(), "Patch set installed");
        Ok(true)
    }

    /// Detach exactly this set's records. Returns `true` if it was applied.
    pub fn remove(&self) -> bool {
        let mut state = self.state.lock();
        if *state != PatchState::Applied {
            return false;
        }
        for record in &self.records {
            if let Some(slot) = record.target.method() {
                slot.detach(record.id);
            }
        }
        *state = PatchState::Removed;
        info!(target: "hostpatch::intercept", set = %self.id, "Patch set removed");
        true
    }
}

/// Owner of every patch set installed by an engine
#[derive(Default)]
pub struct InterceptionRegistry {
    sets: Mutex<HashMap<String, Arc<PatchSet>>>,
}

impl fmt::Debug for InterceptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptionRegistry")
            .field("sets", &self.sets.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl InterceptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and apply `set`.
    ///
    /// If a set with the same id is already registered, that set is returned
    /// untouched and nothing new is attached.
    pub fn install(&self, set: PatchSet) -> Result<Arc<PatchSet>, EngineError> {
        let set = {
            let mut sets = self.sets.lock();
            if let Some(existing) = sets.get(&set.id) {
                debug!(target: "hostpatch::intercept", set = %set.id, "Patch set already registered");
                return Ok(Arc::clone(existing));
            }
            let set = Arc::new(set);
            sets.insert(set.id.clone(), Arc::clone(&set));
            set
        };
        set.apply()?;
        Ok(set)
    }

    pub fn get(&self, id: &str) -> Option<Arc<PatchSet>> {
        self.sets.lock().get(id).cloned()
    }

    /// Remove one set and its records. Returns `true` if it was applied.
    pub fn uninstall(&self, id: &str) -> bool {
        let set = self.sets.lock().remove(id);
        set.map(|s| s.remove()).unwrap_or(false)
    }

    /// Remove every set. Returns how many were applied.
    pub fn uninstall_all(&self) -> usize {
        let sets: Vec<_> = self.sets.lock().drain().map(|(_, s)| s).collect();
        sets.iter().filter(|s| s.remove()).count()
    }

    /// Ids of the sets currently applied, sorted.
    pub fn applied(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .sets
            .lock()
            .values()
            .filter(|s| s.is_applied())
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }
}
