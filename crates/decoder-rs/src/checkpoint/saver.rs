use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{ensure, Context, Result};

use super::{CheckpointHeader, MAGIC, VERSION_V1};
use crate::backend::spec::PortableBackend;
use crate::io::tensor_archive::write_f32_payload;
use crate::model::TransformerModel;
use crate::params::base_param_id;

pub struct CheckpointSaver;

impl CheckpointSaver {
    pub fn save<B: PortableBackend + ?Sized + 'static>(
        path: impl AsRef<Path>,
        model: &TransformerModel<B>,
    ) -> Result<()> {
        let path = path.as_ref();
        let header = CheckpointHeader {
            model: model.config().clone(),
            layers: model.layer_manifest()?,
        };
        let header_bytes = serde_json::to_vec(&header)?;
        ensure!(
            header_bytes.len() <= u32::MAX as usize,
            "checkpoint header too large"
        );
        let params = model.named_parameters()?;

        let file = File::create(path)
            .with_context(|| format!("failed to create checkpoint {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION_V1.to_le_bytes())?;
        writer.write_all(&(header_bytes.len() as u32).to_le_bytes())?;
        writer.write_all(&header_bytes)?;

        writer.write_all(&(params.len() as u32).to_le_bytes())?;
        for (name, tensor) in &params {
            let name_bytes = name.as_bytes();
            writer.write_all(&(name_bytes.len() as u32).to_le_bytes())?;
            writer.write_all(name_bytes)?;
            writer.write_all(&base_param_id(name)?.0.to_le_bytes())?;

            let dims = tensor.shape().dims();
            writer.write_all(&(dims.len() as u32).to_le_bytes())?;
            for &dim in dims {
                writer.write_all(&(dim as u64).to_le_bytes())?;
            }
            writer.write_all(&((tensor.len() * 4) as u64).to_le_bytes())?;
            write_f32_payload(&mut writer, tensor.data())?;
        }
        writer.flush()?;
        log::info!(
            "saved checkpoint with {} layers and {} tensors to {}",
            header.layers.len(),
            params.len(),
            path.display()
        );
        Ok(())
    }
}
