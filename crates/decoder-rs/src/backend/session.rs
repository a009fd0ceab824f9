//! Process-wide active backend selection.
//!
//! The active backend only changes through [`activate`], [`deactivate`], [`reload`], or the
//! scoped [`with_backend`]. Switching while a forward pass is running on another thread is not
//! supported; [`with_backend`] serializes scoped switches so test suites can hop between
//! backends safely.

use std::sync::{Mutex, RwLock};

use anyhow::Result;

use super::registry::{self, DynBackend};
use crate::env;
use crate::error::ModelError;

#[derive(Clone)]
struct ActiveBackend {
    name: String,
    backend: DynBackend,
}

static ACTIVE: RwLock<Option<ActiveBackend>> = RwLock::new(None);
static SCOPED_SWITCH: Mutex<()> = Mutex::new(());

fn read_active() -> Option<ActiveBackend> {
    match ACTIVE.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn write_active(next: Option<ActiveBackend>) -> Option<ActiveBackend> {
    let mut guard = match ACTIVE.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    std::mem::replace(&mut *guard, next)
}

fn construct(name: &str) -> Result<DynBackend> {
    registry::create_backend(name).ok_or_else(|| {
        ModelError::BackendUnavailable {
            name: name.to_string(),
            available: registry::list_backends(),
        }
        .into()
    })
}

/// Makes `name` the active backend and returns it.
///
/// Fails with [`ModelError::BackendUnavailable`] when no backend is registered under `name`;
/// the previously active backend stays in place in that case.
pub fn activate(name: &str) -> Result<DynBackend> {
    let backend = construct(name)?;
    write_active(Some(ActiveBackend {
        name: name.to_string(),
        backend: backend.clone(),
    }));
    log::info!(
        "activated backend '{}' ({})",
        name,
        backend.backend_name()
    );
    Ok(backend)
}

/// Returns the active backend, activating the default one on first use.
///
/// The default comes from the `DECODER_RS_BACKEND` environment variable and falls back to
/// `"cpu"`.
pub fn active() -> Result<DynBackend> {
    match read_active() {
        Some(active) => Ok(active.backend),
        None => activate(env::default_backend_name()),
    }
}

/// Name the active backend was registered under, if any backend is active.
pub fn active_name() -> Option<String> {
    read_active().map(|active| active.name)
}

/// Clears the active backend. The next [`active`] call falls back to the default.
pub fn deactivate() {
    if let Some(previous) = write_active(None) {
        log::info!("deactivated backend '{}'", previous.name);
    }
}

/// Rebuilds the active backend from its registered constructor.
///
/// Tensors created before the reload stay bound to the old instance.
pub fn reload() -> Result<DynBackend> {
    let name = match active_name() {
        Some(name) => name,
        None => env::default_backend_name().to_string(),
    };
    activate(&name)
}

/// Puts the captured backend back when dropped, including during unwinding.
struct RestoreActive {
    previous: Option<ActiveBackend>,
}

impl Drop for RestoreActive {
    fn drop(&mut self) {
        write_active(self.previous.take());
    }
}

/// Runs `f` with `name` active, then restores whatever was active before, even if `f` panics.
pub fn with_backend<R>(name: &str, f: impl FnOnce(DynBackend) -> Result<R>) -> Result<R> {
    let _switch = match SCOPED_SWITCH.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let _restore = RestoreActive {
        previous: read_active(),
    };
    let backend = activate(name)?;
    f(backend)
}
