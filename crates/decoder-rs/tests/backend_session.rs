use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard};

use decoder_rs::backend::registry::{create_backend, has_backend, list_backends, register_portable_backend};
use decoder_rs::backend::session;
use decoder_rs::{create_model, ModelConfig, ModelError, TokenBatch};
use decoder_rs_backend_ref_cpu::CpuPortableBackend;

// The active backend is process-wide; tests that touch it run one at a time.
static SESSION: Mutex<()> = Mutex::new(());

fn exclusive() -> MutexGuard<'static, ()> {
    decoder_rs_backend_ref_cpu::register_cpu_backend();
    register_portable_backend("cpu-alt", CpuPortableBackend::new);
    match SESSION.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[test]
fn cpu_backend_is_registered() {
    let _session = exclusive();
    assert!(has_backend("cpu"));
    assert!(list_backends().contains(&"cpu".to_string()));
    let backend = create_backend("cpu").unwrap();
    assert_eq!(backend.backend_name(), "cpu");
    assert!(!has_backend("nonexistent"));
    assert!(create_backend("nonexistent").is_none());
}

#[test]
fn scoped_backend_runs_a_model() {
    let _session = exclusive();
    let config = ModelConfig {
        vocab_size: 11,
        num_heads: 2,
        num_layers: 1,
        embedding_dim: 4,
        d_hid: 6,
        max_len: 8,
        debug: true,
        ..ModelConfig::default()
    };
    let outputs = session::with_backend("cpu", |backend| {
        create_model(backend, &config)?.forward(&TokenBatch::new(vec![vec![1, 2, 3]]))
    })
    .unwrap();
    assert_eq!(outputs.logits.shape().dims(), &[1, 3, 11]);
}

#[test]
fn activating_an_unknown_backend_keeps_the_previous_one() {
    let _session = exclusive();
    session::activate("cpu").unwrap();

    let Err(err) = session::activate("quantum") else {
        panic!("activating an unregistered backend succeeded");
    };
    match err.downcast_ref::<ModelError>() {
        Some(ModelError::BackendUnavailable { name, available }) => {
            assert_eq!(name, "quantum");
            assert!(available.contains(&"cpu".to_string()));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(session::active_name().as_deref(), Some("cpu"));
    let reloaded = session::reload().unwrap();
    assert_eq!(reloaded.backend_name(), "cpu");
    assert_eq!(session::active_name().as_deref(), Some("cpu"));
}

#[test]
fn deactivate_falls_back_to_the_default_backend() {
    let _session = exclusive();
    session::activate("cpu-alt").unwrap();
    assert_eq!(session::active_name().as_deref(), Some("cpu-alt"));

    session::deactivate();
    assert_eq!(session::active_name(), None);

    if std::env::var_os("DECODER_RS_BACKEND").is_none() {
        let backend = session::active().unwrap();
        assert_eq!(backend.backend_name(), "cpu");
        assert_eq!(session::active_name().as_deref(), Some("cpu"));
    }
}

#[test]
fn reload_builds_a_fresh_instance() {
    let _session = exclusive();
    let first = session::activate("cpu-alt").unwrap();
    let second = session::reload().unwrap();
    assert!(!std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(session::active_name().as_deref(), Some("cpu-alt"));
}

#[test]
fn scoped_backend_is_restored_after_errors_and_panics() {
    let _session = exclusive();
    session::activate("cpu").unwrap();

    let failed: anyhow::Result<()> =
        session::with_backend("cpu-alt", |_| anyhow::bail!("forward failed"));
    assert!(failed.is_err());
    assert_eq!(session::active_name().as_deref(), Some("cpu"));

    let unwound = panic::catch_unwind(AssertUnwindSafe(|| {
        session::with_backend("cpu-alt", |_| -> anyhow::Result<()> {
            panic!("kernel blew up");
        })
    }));
    assert!(unwound.is_err());
    assert_eq!(session::active_name().as_deref(), Some("cpu"));

    // The scoped lock survives the poisoned unwind.
    let name = session::with_backend("cpu-alt", |_| Ok(session::active_name())).unwrap();
    assert_eq!(name.as_deref(), Some("cpu-alt"));
    assert_eq!(session::active_name().as_deref(), Some("cpu"));
}
