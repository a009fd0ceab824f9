//! Full-model persistence: configuration, layer manifest, and every parameter in one file.
//!
//! Layout: `DECRSCHK`, `u32` version, `u32` header length, a JSON [`CheckpointHeader`], `u32`
//! tensor count, then per tensor its name, blake3 base id, dims, byte length, and little-endian
//! `f32` payload.

use serde::{Deserialize, Serialize};

use crate::model::{ManifestEntry, ModelConfig};

pub mod loader;
pub mod saver;

pub use loader::{CheckpointLoader, CheckpointReader, CheckpointTensorEntry};
pub use saver::CheckpointSaver;

pub(crate) const MAGIC: &[u8; 8] = b"DECRSCHK";
pub(crate) const VERSION_V1: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub model: ModelConfig,
    pub layers: Vec<ManifestEntry>,
}
