use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};

use super::{CheckpointHeader, MAGIC, VERSION_V1};
use crate::backend::spec::PortableBackend;
use crate::io::tensor_archive::{read_bytes, read_f32_payload, read_u32};
use crate::model::{LayerRegistry, TransformerModel};
use crate::params::{base_param_id, BaseParamId, TensorMap};
use crate::tensor::{Shape, Tensor};

const MAX_RANK: usize = 8;
const MAX_PREALLOCATED_ENTRIES: usize = 4096;

#[derive(Clone, Debug)]
pub struct CheckpointTensorEntry {
    pub name: String,
    pub base_id: BaseParamId,
    pub dims: Vec<usize>,
}

/// Parsed checkpoint: header plus every tensor, before any layer is rebuilt.
pub struct CheckpointReader {
    header: CheckpointHeader,
    entries: Vec<CheckpointTensorEntry>,
    tensors: HashMap<String, Tensor>,
}

impl CheckpointReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open checkpoint {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            bail!("invalid checkpoint magic header");
        }
        match read_u32(&mut reader)? {
            VERSION_V1 => Self::read_v1(reader),
            other => bail!("unsupported checkpoint version {}", other),
        }
    }

    fn read_v1(mut reader: impl Read) -> Result<Self> {
        let header_len = read_u32(&mut reader)?;
        let header_bytes = read_bytes(&mut reader, header_len.into(), "checkpoint header")?;
        let header: CheckpointHeader = serde_json::from_slice(&header_bytes)?;

        let tensor_count = read_u32(&mut reader)? as usize;
        let capacity = tensor_count.min(MAX_PREALLOCATED_ENTRIES);
        let mut entries = Vec::with_capacity(capacity);
        let mut tensors = HashMap::with_capacity(capacity);
        for _ in 0..tensor_count {
            let name_len = read_u32(&mut reader)?;
            let name_bytes = read_bytes(&mut reader, name_len.into(), "tensor name")?;
            let name = String::from_utf8(name_bytes)?;

            let stored_base_id = BaseParamId(read_u128(&mut reader)?);
            let computed_base_id = base_param_id(&name)?;
            if stored_base_id != computed_base_id {
                bail!(
                    "tensor {} base_id mismatch: expected {:?}, got {:?}",
                    name,
                    computed_base_id,
                    stored_base_id
                );
            }

            let rank = read_u32(&mut reader)? as usize;
            if rank > MAX_RANK {
                bail!("tensor {} has rank {}, at most {} is supported", name, rank, MAX_RANK);
            }
            let mut dims = Vec::with_capacity(rank);
            for _ in 0..rank {
                let dim = read_u64(&mut reader)?;
                dims.push(
                    usize::try_from(dim).map_err(|_| anyhow!("tensor {} dim overflow", name))?,
                );
            }
            let byte_len = read_u64(&mut reader)?;
            let data = read_f32_payload(&mut reader, &name, &dims, byte_len)?;
            let tensor = Tensor::from_vec(Shape::new(dims.clone()), data)?;

            if tensors.insert(name.clone(), tensor).is_some() {
                bail!("checkpoint lists tensor '{}' twice", name);
            }
            entries.push(CheckpointTensorEntry {
                name,
                base_id: computed_base_id,
                dims,
            });
        }

        Ok(Self {
            header,
            entries,
            tensors,
        })
    }

    pub fn header(&self) -> &CheckpointHeader {
        &self.header
    }

    pub fn entries(&self) -> &[CheckpointTensorEntry] {
        &self.entries
    }

    /// Rebuilds the model, failing if any stored tensor goes unused.
    pub fn into_model<B: PortableBackend + ?Sized + 'static>(
        self,
        backend: Arc<B>,
        registry: &LayerRegistry<B>,
    ) -> Result<TransformerModel<B>> {
        let mut params = TensorMap::new(self.tensors);
        let model = TransformerModel::from_manifest(
            registry,
            backend,
            self.header.model,
            &self.header.layers,
            &mut params,
        )?;
        params.ensure_consumed()?;
        Ok(model)
    }
}

pub struct CheckpointLoader;

impl CheckpointLoader {
    pub fn load<B: PortableBackend + ?Sized + 'static>(
        path: impl AsRef<Path>,
        backend: Arc<B>,
        registry: &LayerRegistry<B>,
    ) -> Result<TransformerModel<B>> {
        let path = path.as_ref();
        let reader = CheckpointReader::open(path)?;
        let tensor_count = reader.entries().len();
        let model = reader.into_model(backend, registry)?;
        log::info!(
            "loaded checkpoint with {} blocks and {} tensors from {}",
            model.blocks.len(),
            tensor_count,
            path.display()
        );
        Ok(model)
    }
}

fn read_u64(reader: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_u128(reader: &mut impl Read) -> Result<u128> {
    let mut buf = [0u8; 16];
    reader.read_exact(&mut buf)?;
    Ok(u128::from_le_bytes(buf))
}
