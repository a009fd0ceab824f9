//! Sequential reference kernels for decoder-rs.
//!
//! Every kernel here fixes the per-element evaluation order promised by
//! [`decoder_rs::backend::spec::PortableBackend`]. Other CPU backends reuse
//! [`GenericCpuBackend`] with a different [`RowExecutor`] so their outputs stay bit-identical.

pub mod cpu;

pub use cpu::{CpuPortableBackend, GenericCpuBackend, RowExecutor, SequentialRows};

/// Register the sequential CPU backend under `"cpu"`.
///
/// Runs automatically the first time the registry is queried, provided this crate is linked.
/// Calling it again simply replaces the constructor.
pub fn register_cpu_backend() {
    decoder_rs::backend::registry::register_portable_backend("cpu", CpuPortableBackend::new);
    log::debug!("registered sequential cpu backend");
}

#[decoder_rs::linkme::distributed_slice(decoder_rs::backend::registry::BACKEND_REGISTRARS)]
#[linkme(crate = decoder_rs::linkme)]
static REGISTER_CPU_BACKEND: fn() = register_cpu_backend;
