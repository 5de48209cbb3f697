//! Announcements to the user
//!
//! The engine tells the presentation side about state transitions through a
//! single fire-and-forget call. Whatever the sink does with it (toast, chat
//! line, status bar) is its business; if it fails, the engine carries on.

use tracing::{info, trace};

use super::error::HostFault;

/// Semantic colour of an announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Enabled,
    Disabled,
    Info,
}

pub trait Notifier: Send + Sync {
    fn announce(&self, text: &str, tone: Tone) -> Result<(), HostFault>;
}

/// Announces as `info` events on the `hostpatch::announce` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn announce(&self, text: &str, tone: Tone) -> Result<(), HostFault> {
        info!(target: "hostpatch::announce", ?tone, "{}", text);
        Ok(())
    }
}

/// Send `text` to `notifier`, ignoring failure.
pub(crate) fn announce(notifier: &dyn Notifier, text: &str, tone: Tone) {
    if let Err(e) = notifier.announce(text, tone) {
        trace!(target: "hostpatch::announce", error = %e, "Announcement dropped");
    }
}
