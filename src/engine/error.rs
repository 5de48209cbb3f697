//! Error taxonomy and the catch boundary
//!
//! No fault raised by a hook body, a per-tick body or a sweep cell may reach
//! host code. Every such boundary goes through [`catch_boundary`], which turns
//! both `Err` returns and panics into a [`HostFault`] the caller can log and
//! drop.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// A fault raised by host code or by a hook body running on its behalf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFault {
    message: String,
}

impl HostFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            format!("panic: {}", s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("panic: {}", s)
        } else {
            "panic with non-string payload".to_string()
        };
        Self { message }
    }
}

impl fmt::Display for HostFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HostFault {}

/// Engine-level failures
///
/// None of these ever surface to an end user. A feature either works or
/// silently does nothing; the detail goes to the log.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// A symbol could not be found in the host
    SymbolUnresolved { symbol: String },
    /// A symbol resolved but cannot carry an interceptor
    HookInstallFailed { symbol: String, reason: String },
    /// A hook body faulted during live operation
    RuntimeHookException { hook: String, fault: HostFault },
    /// One sweep column faulted and was skipped for this pass
    SweepCellFailure { sweep: String, column: usize, fault: HostFault },
    /// Activation was triggered after it had already been claimed
    ActivationRace { trigger: &'static str },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SymbolUnresolved { symbol } => write!(f, "symbol unresolved: {}", symbol),
            Self::HookInstallFailed { symbol, reason } => {
                write!(f, "cannot install hook on {}: {}", symbol, reason)
            }
            Self::RuntimeHookException { hook, fault } => {
                write!(f, "hook '{}' faulted: {}", hook, fault)
            }
            Self::SweepCellFailure {
                sweep,
                column,
                fault,
            } => write!(f, "sweep '{}' column {} faulted: {}", sweep, column, fault),
            Self::ActivationRace { trigger } => {
                write!(f, "activation already claimed (trigger: {})", trigger)
            }
        }
    }
}

impl std::error::Error for EngineError {}

/// Run `f`, converting a returned error or a panic into a `HostFault`.
pub fn catch_boundary<T, F>(f: F) -> Result<T, HostFault>
where
    F: FnOnce() -> Result<T, HostFault>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(HostFault::from_panic(payload)),
    }
}
