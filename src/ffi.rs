//! FFI layer for loaders and presentation code living outside Rust
//!
//! The host adapter builds an `Engine` in Rust and parks it here with
//! `install_engine`; everything else talks to it through the C functions
//! below. Return codes: `1` yes/changed, `0` no/unchanged, `-1` on a null or
//! invalid argument, an unknown toggle, or no installed engine.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::engine::{catch_boundary, ActivationOutcome, Engine, ToggleValue};

static ENGINE: RwLock<Option<Arc<Engine>>> = parking_lot::const_rwlock(None);

/// Make `engine` the one the C functions talk to. Returns the previously
/// installed engine, if any.
pub fn install_engine(engine: Arc<Engine>) -> Option<Arc<Engine>> {
    let previous = ENGINE.write().replace(engine);
    if previous.is_some() {
        warn!(target: "hostpatch::ffi", "Replacing installed engine");
    }
    previous
}

/// The installed engine, if any.
pub fn installed_engine() -> Option<Arc<Engine>> {
    ENGINE.read().clone()
}

/// Run `f` against the installed engine; no panic leaves this function.
fn with_engine<F>(f: F) -> i32
where
    F: FnOnce(&Engine) -> i32,
{
    let Some(engine) = installed_engine() else {
        debug!(target: "hostpatch::ffi", "No engine installed");
        return -1;
    };
    catch_boundary(|| Ok(f(&engine))).unwrap_or(-1)
}

unsafe fn name_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

fn changed_code(result: Result<bool, crate::engine::ToggleError>) -> i32 {
    match result {
        Ok(true) => 1,
        Ok(false) => 0,
        Err(e) => {
            debug!(target: "hostpatch::ffi", error = %e, "Toggle command rejected");
            -1
        }
    }
}

/// Activate now. `1` if this call ran activation, `0` if it had already run.
#[no_mangle]
pub extern "C" fn hostpatch_ensure_activated() -> i32 {
    with_engine(|engine| match engine.ensure_activated() {
        ActivationOutcome::Ran => 1,
        ActivationOutcome::AlreadyClaimed => 0,
    })
}

/// Set a boolean toggle (`value != 0` is on).
///
/// # Safety
/// - name must be null or a valid null-terminated C string
#[no_mangle]
pub unsafe extern "C" fn hostpatch_set_toggle_bool(name: *const c_char, value: i32) -> i32 {
    let Some(name) = name_arg(name) else {
        return -1;
    };
    with_engine(|engine| changed_code(engine.set_toggle(name, ToggleValue::Bool(value != 0))))
}

/// Set an integer toggle. Out-of-range values are clamped.
///
/// # Safety
/// - name must be null or a valid null-terminated C string
#[no_mangle]
pub unsafe extern "C" fn hostpatch_set_toggle_int(name: *const c_char, value: i64) -> i32 {
    let Some(name) = name_arg(name) else {
        return -1;
    };
    with_engine(|engine| changed_code(engine.set_toggle(name, ToggleValue::Int(value))))
}

/// Read a toggle into `out`. Boolean toggles read as 0 or 1.
///
/// # Safety
/// - name must be null or a valid null-terminated C string
/// - out must be null or valid for a write of one `i64`
#[no_mangle]
pub unsafe extern "C" fn hostpatch_get_toggle_int(name: *const c_char, out: *mut i64) -> i32 {
    let Some(name) = name_arg(name) else {
        return -1;
    };
    if out.is_null() {
        return -1;
    }
    let value = match installed_engine().and_then(|engine| engine.toggle_value(name)) {
        Some(ToggleValue::Int(n)) => n,
        Some(ToggleValue::Bool(b)) => i64::from(b),
        None => return -1,
    };
    *out = value;
    0
}

/// Shut the installed engine down and clear the slot.
#[no_mangle]
pub extern "C" fn hostpatch_shutdown() -> i32 {
    let Some(engine) = ENGINE.write().take() else {
        return -1;
    };
    catch_boundary(|| {
        engine.shutdown();
        Ok(1)
    })
    .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FeatureSpec, MemberTable, ToggleSpec};
    use parking_lot::Mutex;
    use std::ffi::CString;

    // The engine slot is process-wide.
    static SERIAL: Mutex<()> = parking_lot::const_mutex(());

    fn engine() -> Arc<Engine> {
        let engine = Engine::builder(Arc::new(MemberTable::new())).build();
        engine.register(
            FeatureSpec::new("f")
                .toggle(ToggleSpec::flag("god", "God mode", false))
                .toggle(ToggleSpec::multiplier("regen", "Regen", 10)),
        );
        engine
    }

    #[test]
    fn test_ffi_without_engine() {
        let _guard = SERIAL.lock();
        ENGINE.write().take();
        let name = CString::new("god").unwrap();
        assert_eq!(hostpatch_ensure_activated(), -1);
        assert_eq!(unsafe { hostpatch_set_toggle_bool(name.as_ptr(), 1) }, -1);
        assert_eq!(hostpatch_shutdown(), -1);
    }

    #[test]
    fn test_ffi_null_pointers() {
        let _guard = SERIAL.lock();
        install_engine(engine());
        let mut out = 0i64;
        unsafe {
            assert_eq!(hostpatch_set_toggle_bool(std::ptr::null(), 1), -1);
            assert_eq!(hostpatch_set_toggle_int(std::ptr::null(), 1), -1);
            assert_eq!(hostpatch_get_toggle_int(std::ptr::null(), &mut out), -1);
            let name = CString::new("god").unwrap();
            assert_eq!(hostpatch_get_toggle_int(name.as_ptr(), std::ptr::null_mut()), -1);
        }
        ENGINE.write().take();
    }

    #[test]
    fn test_ffi_toggle_roundtrip() {
        let _guard = SERIAL.lock();
        install_engine(engine());
        let god = CString::new("god").unwrap();
        let regen = CString::new("regen").unwrap();
        let missing = CString::new("missing").unwrap();
        let mut out = -7i64;

        unsafe {
            assert_eq!(hostpatch_set_toggle_bool(god.as_ptr(), 1), 1);
            assert_eq!(hostpatch_set_toggle_bool(god.as_ptr(), 1), 0);
            assert_eq!(hostpatch_get_toggle_int(god.as_ptr(), &mut out), 0);
            assert_eq!(out, 1);

            assert_eq!(hostpatch_set_toggle_int(regen.as_ptr(), 99), 1);
            assert_eq!(hostpatch_get_toggle_int(regen.as_ptr(), &mut out), 0);
            assert_eq!(out, 10);

            assert_eq!(hostpatch_set_toggle_int(god.as_ptr(), 3), -1);
            assert_eq!(hostpatch_set_toggle_bool(missing.as_ptr(), 1), -1);
            assert_eq!(hostpatch_get_toggle_int(missing.as_ptr(), &mut out), -1);
        }

        assert_eq!(hostpatch_ensure_activated(), 1);
        assert_eq!(hostpatch_ensure_activated(), 0);
        assert_eq!(hostpatch_shutdown(), 1);
        assert!(installed_engine().is_none());
    }
}
