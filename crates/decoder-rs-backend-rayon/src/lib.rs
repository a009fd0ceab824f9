//! Row-parallel CPU backend.
//!
//! Reuses the reference kernels from `decoder-rs-backend-ref-cpu` and only changes how output
//! rows are scheduled, so results are bit-identical to the sequential backend.

use decoder_rs_backend_ref_cpu::{GenericCpuBackend, RowExecutor};
use rayon::prelude::*;

/// Outputs smaller than this many elements are filled on the calling thread.
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 4096;

/// Fills output rows on the rayon global pool.
#[derive(Debug, Clone, Copy)]
pub struct RayonRows {
    threshold: usize,
}

impl RayonRows {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_PARALLEL_THRESHOLD)
    }

    /// `threshold` is the smallest output (in elements) worth splitting across threads.
    pub fn with_threshold(threshold: usize) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

impl Default for RayonRows {
    fn default() -> Self {
        Self::new()
    }
}

impl RowExecutor for RayonRows {
    fn executor_name(&self) -> &'static str {
        "rayon"
    }

    fn run_rows(&self, out: &mut [f32], row_len: usize, fill: &(dyn Fn(usize, &mut [f32]) + Sync)) {
        if row_len == 0 || out.is_empty() {
            return;
        }
        if out.len() < self.threshold {
            for (row, chunk) in out.chunks_mut(row_len).enumerate() {
                fill(row, chunk);
            }
            return;
        }
        out.par_chunks_mut(row_len)
            .enumerate()
            .for_each(|(row, chunk)| fill(row, chunk));
    }
}

pub type RayonPortableBackend = GenericCpuBackend<RayonRows>;

/// Builds the rayon backend with the default threshold.
pub fn rayon_backend() -> RayonPortableBackend {
    GenericCpuBackend::with_executor(RayonRows::new())
}

/// Register the row-parallel backend under `"rayon"`.
pub fn register_rayon_backend() {
    decoder_rs::backend::registry::register_portable_backend("rayon", rayon_backend);
    log::debug!(
        "registered rayon backend ({} worker threads)",
        rayon::current_num_threads()
    );
}

#[decoder_rs::linkme::distributed_slice(decoder_rs::backend::registry::BACKEND_REGISTRARS)]
#[linkme(crate = decoder_rs::linkme)]
static REGISTER_RAYON_BACKEND: fn() = register_rayon_backend;
