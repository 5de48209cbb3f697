//! Symbol Resolver and Binding Cache
//!
//! Resolves a [`SymbolRef`] against the host's [`SymbolTable`] at most once
//! per process run. Both outcomes are cached: a member that is missing in this
//! host build stays missing, so a broken feature costs one lookup and one
//! warning instead of a lookup storm on every tick.
//!
//! # Overloads
//!
//! When a method is requested without a signature and the host reports more
//! than one overload, the outcome depends on [`AmbiguityPolicy`]. `FirstMatch`
//! takes whatever the host listed first, which is not stable across host
//! builds; `Reject` refuses and yields the null handle. Debug builds default to
//! `Reject` so ambiguous registrations show up during development.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::error::catch_boundary;
use super::symbol::{Handle, SymbolRef, SymbolTable};

/// How to treat a signature-less method lookup that matches several overloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AmbiguityPolicy {
    /// Take the first overload the host reports
    FirstMatch,
    /// Refuse and return the null handle
    Reject,
}

impl Default for AmbiguityPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            AmbiguityPolicy::Reject
        } else {
            AmbiguityPolicy::FirstMatch
        }
    }
}

/// Memoizing resolver over a host symbol table
pub struct SymbolResolver {
    table: Arc<dyn SymbolTable>,
    cache: DashMap<SymbolRef, Handle>,
    policy: AmbiguityPolicy,
    /// Backend lookups performed (cache misses)
    lookups: AtomicU64,
    /// Lookups answered from the cache
    hits: AtomicU64,
}

impl std::fmt::Debug for SymbolResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolResolver")
            .field("cached", &self.cache.len())
            .field("policy", &self.policy)
            .field("lookups", &self.lookups.load(Ordering::Relaxed))
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .finish()
    }
}

impl SymbolResolver {
    pub fn new(table: Arc<dyn SymbolTable>, policy: AmbiguityPolicy) -> Self {
        Self {
            table,
            cache: DashMap::new(),
            policy,
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    /// Resolve `symbol`, consulting the host only on first use.
    ///
    /// Never fails: a missing or ambiguous member yields the null handle.
    pub fn resolve(&self, symbol: &SymbolRef) -> Handle {
        if let Some(handle) = self.cache.get(symbol) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return handle.value().clone();
        }

        // The entry guard is held across the backend lookup so that two
        // threads racing on the same key perform exactly one lookup.
        self.cache
            .entry(symbol.clone())
            .or_insert_with(|| self.resolve_uncached(symbol))
            .value()
            .clone()
    }

    fn resolve_uncached(&self, symbol: &SymbolRef) -> Handle {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let candidates = match catch_boundary(|| {
            Ok(self.table.lookup(&symbol.owner, &symbol.name, symbol.kind))
        }) {
            Ok(candidates) => candidates,
            Err(fault) => {
                warn!(
                    target: "hostpatch::resolver",
                    symbol = %symbol,
                    %fault,
                    "Host symbol table faulted; treating symbol as missing"
                );
                return Handle::unresolved(symbol.clone());
            }
        };

        let chosen = match &symbol.signature {
            Some(sig) => candidates
                .into_iter()
                .find(|c| c.signature.as_ref() == Some(sig)),
            None if candidates.len() > 1 => match self.policy {
                AmbiguityPolicy::FirstMatch => {
                    debug!(
                        target: "hostpatch::resolver",
                        symbol = %symbol,
                        overloads = candidates.len(),
                        "Ambiguous symbol, taking first overload"
                    );
                    candidates.into_iter().next()
                }
                AmbiguityPolicy::Reject => {
                    error!(
                        target: "hostpatch::resolver",
                        symbol = %symbol,
                        overloads = candidates.len(),
                        "Ambiguous symbol rejected; give a signature"
                    );
                    return Handle::unresolved(symbol.clone());
                }
            },
            None => candidates.into_iter().next(),
        };

        match chosen {
            Some(candidate) => {
                debug!(target: "hostpatch::resolver", symbol = %symbol, "Resolved");
                Handle::bound(symbol.clone(), candidate.member)
            }
            None => {
                warn!(
                    target: "hostpatch::resolver",
                    symbol = %symbol,
                    kind = %symbol.kind,
                    "Symbol not found in host; dependent feature disabled"
                );
                Handle::unresolved(symbol.clone())
            }
        }
    }

    /// Cached handle for `symbol`, without triggering a lookup.
    pub fn cached(&self, symbol: &SymbolRef) -> Option<Handle> {
        self.cache.get(symbol).map(|h| h.value().clone())
    }

    /// Number of lookups that reached the symbol table.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Number of lookups answered from the cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn policy(&self) -> AmbiguityPolicy {
        self.policy
    }

    /// Number of cached entries, resolved or not.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Drop every cached binding. Used at engine shutdown.
    pub fn clear(&self) {
        self.cache.clear();
    }
}
