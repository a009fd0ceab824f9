//! Embedding table lookups.

use anyhow::Result;

use crate::backend::spec::PortableBackend;
use crate::error::ModelError;
use crate::ops::functional::common::ensure_rank;
use crate::tensor::DeviceTensor;

fn validate_embedding_lookup<B: PortableBackend + ?Sized + 'static>(
    table: &DeviceTensor<B>,
    indices: &[usize],
    leading: &[usize],
) -> Result<()> {
    ensure_rank("embedding table", table, 2)?;
    let rows = table.shape().dims()[0];
    let expected: usize = leading.iter().product();
    if expected != indices.len() {
        return Err(ModelError::invalid_input(format!(
            "{} indices cannot fill leading shape {:?}",
            indices.len(),
            leading
        ))
        .into());
    }
    if let Some(&bad) = indices.iter().find(|&&idx| idx >= rows) {
        return Err(ModelError::invalid_input(format!(
            "index {bad} is out of range for an embedding table with {rows} rows"
        ))
        .into());
    }
    Ok(())
}

/// Looks up `indices` in a `(rows, dim)` table and returns `(*leading, dim)`.
pub fn embedding_lookup<B: PortableBackend + ?Sized + 'static>(
    backend: &B,
    table: &DeviceTensor<B>,
    indices: &[usize],
    leading: &[usize],
) -> Result<DeviceTensor<B>> {
    validate_embedding_lookup(table, indices, leading)?;
    let dim = table.shape().dims()[1];
    let gathered =
        DeviceTensor::from_kernel(table.backend(), backend.gather_rows(table.host(), indices))?;
    let mut dims = leading.to_vec();
    dims.push(dim);
    gathered.reshape(dims)
}
