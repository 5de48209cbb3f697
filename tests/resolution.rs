//! Tests for symbol resolution against a fake host
//!
//! Missing members must degrade to the null handle without faulting, every
//! symbol must reach the host at most once, and features whose hook targets
//! are missing must stay inert.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{wait_until, FakeHost};
use hostpatch::engine::{
    ActivationOutcome, ActivationPhase, AmbiguityPolicy, Args, BeforeOutcome, Candidate, Engine,
    FeatureSpec, FeatureStatus, HookSpec, HostValue, MemberTable, OverrideRule, SymbolKind,
    SymbolRef, SymbolResolver, SymbolTable, ToggleSpec,
};
use hostpatch::EngineConfig;

#[test]
fn test_absent_symbol_is_null() {
    common::init_tracing();
    let host = FakeHost::new(4, 4);
    let resolver = SymbolResolver::new(host.table.clone(), AmbiguityPolicy::FirstMatch);

    for symbol in [
        SymbolRef::field("Player", "mana"),
        SymbolRef::property("Npc", "speed"),
        SymbolRef::method("Player", "teleport"),
        SymbolRef::method_sig("Player", "hurt", &["float"]),
    ] {
        let handle = resolver.resolve(&symbol);
        assert!(handle.is_null(), "{} should not resolve", symbol);
        assert!(handle.read(&host.player_value).is_err());
        assert!(handle.invoke(&host.player_value, &mut Args::new()).is_err());
    }
}

#[test]
fn test_unresolved_is_cached() {
    let host = FakeHost::new(4, 4);
    let resolver = SymbolResolver::new(host.table.clone(), AmbiguityPolicy::FirstMatch);
    let missing = SymbolRef::field("Player", "mana");

    for _ in 0..100 {
        assert!(resolver.resolve(&missing).is_null());
    }
    assert_eq!(resolver.lookups(), 1);
    assert_eq!(resolver.hits(), 99);
}

#[test]
fn test_resolved_field_reads_and_writes() {
    let host = FakeHost::new(4, 4);
    let resolver = SymbolResolver::new(host.table.clone(), AmbiguityPolicy::FirstMatch);
    let life = resolver.resolve(&SymbolRef::field("Player", "life"));

    assert_eq!(life.read(&host.player_value).unwrap(), HostValue::Int(100));
    life.write(&host.player_value, HostValue::Int(42)).unwrap();
    assert_eq!(host.life(), 42);

    // Same kind, same owner, other name
    assert!(resolver.resolve(&SymbolRef::property("Player", "life")).is_null());
}

#[test]
fn test_overload_policy() {
    let host = FakeHost::new(4, 4);
    let heal = SymbolRef::method("Player", "heal");

    let lenient = SymbolResolver::new(host.table.clone(), AmbiguityPolicy::FirstMatch);
    let first = lenient.resolve(&heal);
    assert_eq!(
        first.invoke(&HostValue::Unit, &mut Args::new()).unwrap(),
        HostValue::Int(1)
    );

    let strict = SymbolResolver::new(host.table.clone(), AmbiguityPolicy::Reject);
    assert!(strict.resolve(&heal).is_null());
    let exact = strict.resolve(&SymbolRef::method_sig("Player", "heal", &["float"]));
    assert_eq!(
        exact.invoke(&HostValue::Unit, &mut Args::new()).unwrap(),
        HostValue::Int(2)
    );
}

#[test]
fn test_engine_reports_overload_policy_from_config() {
    let host = FakeHost::new(4, 4);
    let config = EngineConfig::from_toml_str("[resolver]\nambiguity = \"reject\"").unwrap();
    let engine = Engine::builder(host.table.clone()).config(config).build();
    assert_eq!(engine.resolver().policy(), AmbiguityPolicy::Reject);
}

#[test]
fn test_feature_with_missing_target_is_inert() {
    let host = FakeHost::new(4, 4);
    let engine = Engine::builder(host.table.clone()).build();

    engine.register(
        FeatureSpec::new("shield")
            .toggle(ToggleSpec::flag("shield", "Shield", true))
            .hook(HookSpec::new(SymbolRef::method("Player", "hurt")).before(|_, _| Ok(BeforeOutcome::suppress())))
            .hook(HookSpec::new(SymbolRef::method("Player", "block")).before(|_, _| Ok(BeforeOutcome::Continue)))
            .override_field(OverrideRule::pin("shield", SymbolRef::field("Player", "life"), HostValue::Int(999))),
    );
    assert_eq!(engine.feature_status("shield"), Some(FeatureStatus::Pending));
    engine.ensure_activated();
    assert_eq!(engine.feature_status("shield"), Some(FeatureStatus::Inert));

    // Nothing of it is live: hurt still hurts, life is not pinned.
    host.hurt(10).unwrap();
    assert_eq!(host.life(), 90);
    engine.on_tick(&host.local_tick());
    assert_eq!(host.life(), 90);
    assert_eq!(host.hurt.hook_count(), 0);
}

#[test]
fn test_sealed_target_is_inert() {
    let host = FakeHost::new(4, 4);
    let engine = Engine::builder(host.table.clone()).build();
    engine.register(
        FeatureSpec::new("moonjump")
            .hook(HookSpec::new(SymbolRef::method("Player", "jump")).after(|_, _, _| Ok(None))),
    );
    engine.ensure_activated();
    assert_eq!(engine.feature_status("moonjump"), Some(FeatureStatus::Inert));
    assert!(engine.registry().applied().is_empty());
}

/// Symbol table whose reflection blows up for one owner
struct FaultyTable {
    inner: Arc<MemberTable>,
}

impl SymbolTable for FaultyTable {
    fn lookup(&self, owner: &str, name: &str, kind: SymbolKind) -> Vec<Candidate> {
        if owner == "Broken" {
            panic!("type {} failed to load", owner);
        }
        self.inner.lookup(owner, name, kind)
    }
}

fn faulty_host() -> (FakeHost, Arc<FaultyTable>) {
    let host = FakeHost::new(4, 4);
    let table = Arc::new(FaultyTable {
        inner: host.table.clone(),
    });
    (host, table)
}

fn broken_and_working() -> [FeatureSpec; 2] {
    [
        FeatureSpec::new("broken").hook(
            HookSpec::new(SymbolRef::method("Broken", "thing")).after(|_, _, _| Ok(None)),
        ),
        FeatureSpec::new("working").hook(
            HookSpec::new(SymbolRef::method("Player", "hurt")).after(|_, _, _| Ok(None)),
        ),
    ]
}

#[test]
fn test_faulting_symbol_table_resolves_to_null_once() {
    let (_host, table) = faulty_host();
    let resolver = SymbolResolver::new(table, AmbiguityPolicy::FirstMatch);
    let broken = SymbolRef::field("Broken", "value");

    assert!(resolver.resolve(&broken).is_null());
    assert!(resolver.resolve(&broken).is_null());
    assert_eq!(resolver.lookups(), 1);
    assert!(!resolver.resolve(&SymbolRef::field("Player", "life")).is_null());
}

#[test]
fn test_faulting_symbol_table_does_not_escape_activation() {
    let (host, table) = faulty_host();
    let engine = Engine::builder(table).build();
    for feature in broken_and_working() {
        engine.register(feature);
    }

    assert_eq!(engine.ensure_activated(), ActivationOutcome::Ran);
    assert_eq!(engine.activation_phase(), ActivationPhase::Done);
    assert!(engine.is_installed());
    assert_eq!(engine.feature_status("broken"), Some(FeatureStatus::Inert));
    assert_eq!(engine.feature_status("working"), Some(FeatureStatus::Active));
    assert_eq!(host.hurt.hook_count(), 1);
}

#[test]
fn test_faulting_symbol_table_on_timer_path_completes() {
    let (_host, table) = faulty_host();
    let engine = Engine::builder(table)
        .config(EngineConfig {
            activation_delay_ms: 0,
            ..EngineConfig::default()
        })
        .build();
    for feature in broken_and_working() {
        engine.register(feature);
    }
    engine.start();

    assert!(wait_until(Duration::from_secs(5), || engine.is_installed()));
    assert_eq!(engine.activation_phase(), ActivationPhase::Done);
    assert_eq!(engine.feature_status("working"), Some(FeatureStatus::Active));
}
