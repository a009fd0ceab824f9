//! Runtime backend registry for dynamic backend selection.
//!
//! Backends are registered by name and constructed on demand, so model code never hardcodes a
//! backend type. Backend crates contribute a registrar to [`BACKEND_REGISTRARS`]; the registrars
//! run the first time the registry is queried, which makes linking a backend crate enough to
//! make it selectable.

use std::collections::BTreeMap;
use std::sync::{Arc, Once, OnceLock, RwLock};

use super::spec::PortableBackend;

/// Backend handle shared by everything that runs on it.
pub type DynBackend = Arc<dyn PortableBackend>;

/// Factory function that creates a new backend instance.
pub type BackendConstructor = Box<dyn Fn() -> DynBackend + Send + Sync>;

/// Registration hooks contributed by backend crates.
///
/// ```ignore
/// #[decoder_rs::linkme::distributed_slice(decoder_rs::backend::registry::BACKEND_REGISTRARS)]
/// static REGISTER_MY_BACKEND: fn() = register_my_backend;
/// ```
#[linkme::distributed_slice]
pub static BACKEND_REGISTRARS: [fn()] = [..];

/// Global backend registry mapping backend names to constructors.
struct BackendRegistry {
    backends: RwLock<BTreeMap<String, BackendConstructor>>,
}

impl BackendRegistry {
    fn new() -> Self {
        Self {
            backends: RwLock::new(BTreeMap::new()),
        }
    }

    fn register(&self, name: String, constructor: BackendConstructor) {
        let mut backends = match self.backends.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        backends.insert(name, constructor);
    }

    fn create(&self, name: &str) -> Option<DynBackend> {
        let backends = match self.backends.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let constructor = backends.get(name)?;
        Some(constructor())
    }

    fn list_backends(&self) -> Vec<String> {
        let backends = match self.backends.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        backends.keys().cloned().collect()
    }

    fn has_backend(&self, name: &str) -> bool {
        let backends = match self.backends.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        backends.contains_key(name)
    }
}

static GLOBAL_REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();
static REGISTRARS_RAN: Once = Once::new();

fn global_registry() -> &'static BackendRegistry {
    GLOBAL_REGISTRY.get_or_init(BackendRegistry::new)
}

fn populated_registry() -> &'static BackendRegistry {
    REGISTRARS_RAN.call_once(|| {
        for registrar in BACKEND_REGISTRARS {
            registrar();
        }
        log::debug!(
            "ran {} backend registrars: {:?}",
            BACKEND_REGISTRARS.len(),
            global_registry().list_backends()
        );
    });
    global_registry()
}

/// Register a backend by name with a constructor function.
///
/// The constructor runs each time the backend is requested via [`create_backend`]. Registering
/// an existing name replaces the previous constructor.
pub fn register_backend<F>(name: impl Into<String>, constructor: F)
where
    F: Fn() -> DynBackend + Send + Sync + 'static,
{
    global_registry().register(name.into(), Box::new(constructor));
}

/// Register a concrete [`PortableBackend`] implementation.
pub fn register_portable_backend<B, F>(name: impl Into<String>, constructor: F)
where
    B: PortableBackend + 'static,
    F: Fn() -> B + Send + Sync + 'static,
{
    register_backend(name, move || Arc::new(constructor()) as DynBackend);
}

/// Create a backend instance by name, or `None` when nothing is registered under it.
pub fn create_backend(name: &str) -> Option<DynBackend> {
    populated_registry().create(name)
}

/// List all registered backend names in sorted order.
pub fn list_backends() -> Vec<String> {
    populated_registry().list_backends()
}

/// Check if a backend with the given name is registered.
pub fn has_backend(name: &str) -> bool {
    populated_registry().has_backend(name)
}
