//! Deferred, one-shot activation
//!
//! Activation (resolve every symbol, install every patch set) must not run
//! before the host has loaded its own types, so it is scheduled on a timer a
//! fixed delay after start-up. A later lifecycle event may also demand it
//! right away. Either path may fire first, possibly on different threads; the
//! body runs exactly once.
//!
//! The guard only covers "check the phase, claim it". The body itself runs
//! with the lock released; the claimed phase is what keeps a second trigger
//! out. If the body fails to resolve anything, or faults outright, activation
//! still counts as done and is never retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{after, bounded, select, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::error::{catch_boundary, EngineError};

/// Where an activation request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The start-up delay elapsed
    Timer,
    /// Someone asked for activation now
    Eager,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Timer => "timer",
            Trigger::Eager => "eager",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationPhase {
    Pending,
    /// Claimed by a trigger; the body is running
    Running,
    Done,
}

/// Result of one trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// This trigger ran the body
    Ran,
    /// Another trigger got there first
    AlreadyClaimed,
}

/// Runs an activation body at most once
#[derive(Debug)]
pub struct DeferredActivator {
    phase: Mutex<ActivationPhase>,
    cancel: Mutex<Option<Sender<()>>>,
    triggers: AtomicU64,
    races: AtomicU64,
}

impl Default for DeferredActivator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredActivator {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(ActivationPhase::Pending),
            cancel: Mutex::new(None),
            triggers: AtomicU64::new(0),
            races: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> ActivationPhase {
        *self.phase.lock()
    }

    /// Whether the body has finished.
    pub fn is_done(&self) -> bool {
        self.phase() == ActivationPhase::Done
    }

    /// Number of triggers received, including losing ones.
    pub fn triggers(&self) -> u64 {
        self.triggers.load(Ordering::Relaxed)
    }

    /// Number of triggers that found activation already claimed.
    pub fn races(&self) -> u64 {
        self.races.load(Ordering::Relaxed)
    }

    /// Run `body` unless some trigger has already claimed activation.
    pub fn trigger<F: FnOnce()>(&self, source: Trigger, body: F) -> ActivationOutcome {
        self.triggers.fetch_add(1, Ordering::Relaxed);
        {
            let mut phase = self.phase.lock();
            if *phase != ActivationPhase::Pending {
                self.races.fetch_add(1, Ordering::Relaxed);
                let race = EngineError::ActivationRace {
                    trigger: source.as_str(),
                };
                debug!(target: "hostpatch::activation", phase = ?*phase, reason = %race, "Activation trigger ignored");
                return ActivationOutcome::AlreadyClaimed;
            }
            *phase = ActivationPhase::Running;
        }

        info!(target: "hostpatch::activation", trigger = source.as_str(), "Activating");
        if let Err(fault) = catch_boundary(|| {
            body();
            Ok(())
        }) {
            warn!(target: "hostpatch::activation", %fault, "Activation body faulted; activation is still complete");
        }
        *self.phase.lock() = ActivationPhase::Done;
        ActivationOutcome::Ran
    }

    /// Call `fire` on a background thread after `delay`, unless cancelled first.
    ///
    /// Scheduling again replaces (and cancels) the previous timer.
    pub fn schedule<F>(&self, delay: Duration, fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let spawned = thread::Builder::new()
            .name("hostpatch-activation".to_string())
            .spawn(move || {
                let timeout = after(delay);
                select! {
                    recv(timeout) -> _ => fire(),
                    recv(cancel_rx) -> _ => {
                        debug!(target: "hostpatch::activation", "Activation timer cancelled");
                    }
                }
            });

        match spawned {
            Ok(_) => {
                // Replacing the sender disconnects any previous timer.
                *self.cancel.lock() = Some(cancel_tx);
                debug!(target: "hostpatch::activation", delay_ms = delay.as_millis() as u64, "Activation scheduled");
            }
            Err(e) => {
                warn!(target: "hostpatch::activation", error = %e, "Cannot spawn activation timer; waiting for an eager trigger");
            }
        }
    }

    /// Stop a pending timer. Has no effect once it has fired.
    pub fn cancel(&self) {
        if self.cancel.lock().take().is_some() {
            debug!(target: "hostpatch::activation", "Cancelling activation timer");
        }
    }
}
