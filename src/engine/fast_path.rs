//! Fast-path call binding
//!
//! Sweeps call one host method hundreds of thousands of times per pass.
//! Going through the resolver on every call means hashing the symbol name
//! each time; a [`BoundCall`] instead holds the method slot and the receiver
//! directly.
//!
//! A bound call is only valid for the receiver it was built for. The host may
//! replace its backing object (a new session, a reloaded world), so callers
//! run [`FastPathBinder::prepare`] once before each pass. That is an explicit
//! identity check, not a cache that silently outlives the object.

use std::sync::Arc;

use tracing::{debug, warn};

use super::error::HostFault;
use super::intercept::MethodSlot;
use super::symbol::Handle;
use super::value::{Args, HostValue};

/// A host method bound to one receiver
#[derive(Debug, Clone)]
pub struct BoundCall {
    slot: Arc<MethodSlot>,
    receiver: HostValue,
}

impl BoundCall {
    #[inline]
    pub fn call(&self, args: &mut Args) -> Result<HostValue, HostFault> {
        self.slot.invoke(&self.receiver, args)
    }

    pub fn receiver(&self) -> &HostValue {
        &self.receiver
    }

    /// Whether this call was built for `receiver`.
    pub fn is_bound_to(&self, receiver: &HostValue) -> bool {
        self.receiver.same_receiver(receiver)
    }
}

/// Builds and keeps a [`BoundCall`] current
#[derive(Debug)]
pub struct FastPathBinder {
    handle: Handle,
    /// Whether the target is an instance method (needs a non-Unit receiver)
    instance: bool,
    bound: Option<BoundCall>,
    rebuilds: u64,
    warned: bool,
}

impl FastPathBinder {
    pub fn new(handle: Handle, instance: bool) -> Self {
        Self {
            handle,
            instance,
            bound: None,
            rebuilds: 0,
            warned: false,
        }
    }

    /// Make sure the bound call targets `receiver`, rebuilding if needed.
    ///
    /// Returns `None` when the handle is null or not a method, or when an
    /// instance method is asked to bind to a missing receiver.
    pub fn prepare(&mut self, receiver: &HostValue) -> Option<&BoundCall> {
        if self.instance && receiver.is_unit() {
            if self.bound.take().is_some() {
                debug!(target: "hostpatch::fast_path", "Receiver gone; dropping bound call");
            }
            return None;
        }

        let stale = match &self.bound {
            Some(bound) => !bound.is_bound_to(receiver),
            None => true,
        };
        if stale {
            let Some(slot) = self.handle.method() else {
                if !self.warned {
                    self.warned = true;
                    warn!(target: "hostpatch::fast_path", handle = ?self.handle, "Cannot bind: target is not a resolved method");
                }
                return None;
            };
            self.bound = Some(BoundCall {
                slot: Arc::clone(slot),
                receiver: receiver.clone(),
            });
            self.rebuilds += 1;
            debug!(target: "hostpatch::fast_path", rebuilds = self.rebuilds, "Rebuilt bound call");
        }
        self.bound.as_ref()
    }

    /// The current bound call, if `prepare` succeeded last time.
    pub fn current(&self) -> Option<&BoundCall> {
        self.bound.as_ref()
    }

    /// Number of times a bound call was built.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Forget the bound call.
    pub fn reset(&mut self) {
        self.bound = None;
    }
}
