//! Named-tensor archive used for weights-only persistence.
//!
//! Layout: `DECRSTEN`, `u32` version, `u32` index length, a bincode index of
//! `{name, dims, offset, len}` with offsets relative to the data section, then every tensor's
//! `f32` values in little-endian order.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{anyhow, bail, ensure, Result};
use serde::{Deserialize, Serialize};

use crate::tensor::{Shape, Tensor};

const MAGIC: &[u8; 8] = b"DECRSTEN";
const VERSION_V1: u32 = 1;
const F32_BYTES: u64 = 4;
const PREALLOC_LIMIT: u64 = 1 << 20;

#[derive(Clone, Debug)]
pub struct TensorArchiveEntry {
    pub name: String,
    pub dims: Vec<usize>,
    /// Absolute byte offset of the payload in the file.
    pub offset: u64,
    pub len: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct TensorArchiveIndex {
    entries: Vec<TensorArchiveIndexEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct TensorArchiveIndexEntry {
    name: String,
    dims: Vec<u64>,
    offset: u64,
    len: u64,
}

pub struct TensorArchiveReader {
    reader: BufReader<File>,
    entries: Vec<TensorArchiveEntry>,
    by_name: HashMap<String, usize>,
}

impl TensorArchiveReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path.as_ref())?);

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            bail!("invalid tensor archive magic header");
        }
        let version = read_u32(&mut reader)?;
        if version != VERSION_V1 {
            bail!("unsupported tensor archive version {}", version);
        }

        let index_len = read_u32(&mut reader)? as usize;
        let index_bytes = read_bytes(&mut reader, index_len as u64, "tensor archive index")?;
        let index: TensorArchiveIndex = bincode::deserialize(&index_bytes)?;
        let data_start = (MAGIC.len() + 4 + 4 + index_len) as u64;

        let mut entries = Vec::with_capacity(index.entries.len());
        let mut by_name = HashMap::with_capacity(index.entries.len());
        for (i, e) in index.entries.into_iter().enumerate() {
            let dims = e
                .dims
                .into_iter()
                .map(|d| usize::try_from(d).map_err(|_| anyhow!("tensor {} dim overflow", e.name)))
                .collect::<Result<Vec<_>>>()?;
            let offset = data_start
                .checked_add(e.offset)
                .ok_or_else(|| anyhow!("tensor {} offset overflow", e.name))?;
            if by_name.insert(e.name.clone(), i).is_some() {
                bail!("tensor archive lists '{}' twice", e.name);
            }
            entries.push(TensorArchiveEntry {
                name: e.name,
                dims,
                offset,
                len: e.len,
            });
        }

        Ok(Self {
            reader,
            entries,
            by_name,
        })
    }

    pub fn entries(&self) -> &[TensorArchiveEntry] {
        &self.entries
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn get(&mut self, name: &str) -> Result<Tensor> {
        let idx = *self
            .by_name
            .get(name)
            .ok_or_else(|| anyhow!("tensor '{}' not found in archive", name))?;
        let entry = self
            .entries
            .get(idx)
            .cloned()
            .ok_or_else(|| anyhow!("tensor '{}' index out of range", name))?;
        self.read_entry(&entry)
    }

    fn read_entry(&mut self, entry: &TensorArchiveEntry) -> Result<Tensor> {
        self.reader.seek(SeekFrom::Start(entry.offset))?;
        let data = read_f32_payload(&mut self.reader, &entry.name, &entry.dims, entry.len)?;
        Tensor::from_vec(Shape::new(entry.dims.clone()), data)
    }
}

pub struct TensorArchive;

impl TensorArchive {
    pub fn load(path: impl AsRef<Path>) -> Result<HashMap<String, Tensor>> {
        let mut reader = TensorArchiveReader::open(path)?;
        let entries = reader.entries().to_vec();
        let mut tensors = HashMap::with_capacity(entries.len());
        for entry in entries {
            let tensor = reader.read_entry(&entry)?;
            tensors.insert(entry.name, tensor);
        }
        Ok(tensors)
    }

    /// Writes `tensors` sorted by name.
    pub fn save(path: impl AsRef<Path>, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let mut entries: Vec<(&String, &Tensor)> = tensors.iter().collect();
        entries.sort_by(|(a, _), (b, _)| a.as_str().cmp(b.as_str()));

        let mut index = TensorArchiveIndex {
            entries: Vec::with_capacity(entries.len()),
        };
        let mut running_offset: u64 = 0;
        for (name, tensor) in &entries {
            let len = tensor.len() as u64 * F32_BYTES;
            index.entries.push(TensorArchiveIndexEntry {
                name: (*name).clone(),
                dims: tensor.shape().dims().iter().map(|&d| d as u64).collect(),
                offset: running_offset,
                len,
            });
            running_offset = running_offset
                .checked_add(len)
                .ok_or_else(|| anyhow!("tensor archive data offset overflow"))?;
        }
        let index_bytes = bincode::serialize(&index)?;
        ensure!(
            index_bytes.len() <= u32::MAX as usize,
            "tensor archive index too large"
        );

        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION_V1.to_le_bytes())?;
        writer.write_all(&(index_bytes.len() as u32).to_le_bytes())?;
        writer.write_all(&index_bytes)?;
        for (_name, tensor) in entries {
            write_f32_payload(&mut writer, tensor.data())?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn reader(path: impl AsRef<Path>) -> Result<TensorArchiveReader> {
        TensorArchiveReader::open(path)
    }
}

pub(crate) fn write_f32_payload(writer: &mut impl Write, data: &[f32]) -> Result<()> {
    for &value in data {
        writer.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

/// Reads `len` bytes, growing the buffer only as data arrives so a corrupt length fails with an
/// error instead of a huge allocation.
pub(crate) fn read_bytes(reader: &mut impl Read, len: u64, what: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(len.min(PREALLOC_LIMIT) as usize);
    reader.take(len).read_to_end(&mut buf)?;
    ensure!(
        buf.len() as u64 == len,
        "{what} truncated: expected {len} bytes, found {}",
        buf.len()
    );
    Ok(buf)
}

/// Reads a tensor payload whose byte length must agree with `dims`.
pub(crate) fn read_f32_payload(
    reader: &mut impl Read,
    name: &str,
    dims: &[usize],
    byte_len: u64,
) -> Result<Vec<f32>> {
    let expected = dims
        .iter()
        .try_fold(F32_BYTES, |acc, &d| acc.checked_mul(d as u64))
        .ok_or_else(|| anyhow!("tensor {} shape {:?} overflows", name, dims))?;
    ensure!(
        byte_len == expected,
        "tensor {} stores {} bytes but shape {:?} needs {}",
        name,
        byte_len,
        dims,
        expected
    );
    let raw = read_bytes(reader, byte_len, &format!("tensor {name}"))?;
    Ok(raw
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

pub(crate) fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
