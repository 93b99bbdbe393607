//! Sharded safetensors checkpoints.
//!
//! Layout of one shard:
//! ```text
//! [u64 header length, little-endian]
//! [JSON header: name -> {dtype, shape, data_offsets}, optional __metadata__]
//! [raw tensor bytes]
//! ```
//! Shards are memory-mapped so tensor data is read zero-copy.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::InferenceError;
use crate::tensor::{DataType, HostTensor};

use super::CheckpointSource;

/// Upper bound on the JSON header size (100 MB), rejecting corrupt lengths.
const MAX_HEADER_LEN: u64 = 100 * 1024 * 1024;

/// Header entry for one tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TensorMeta {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

struct Shard {
    path: PathBuf,
    /// Absolute file offset of the data section.
    data_start: usize,
    mmap: memmap2::Mmap,
}

struct Entry {
    name: String,
    shard: usize,
    meta: TensorMeta,
}

/// All `*.safetensors` shards of a checkpoint directory.
pub struct SafetensorsDir {
    shards: Vec<Shard>,
    entries: Vec<Entry>,
}

impl SafetensorsDir {
    /// Open every `*.safetensors` file in `dir`, in lexicographic file order.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, InferenceError> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().map_or(false, |ext| ext == "safetensors"))
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(InferenceError::Checkpoint(format!(
                "no .safetensors files in {}",
                dir.display()
            )));
        }

        let mut shards = Vec::with_capacity(paths.len());
        let mut entries = Vec::new();
        for (index, path) in paths.into_iter().enumerate() {
            let (shard, metas) = open_shard(path)?;
            for (name, meta) in metas {
                entries.push(Entry {
                    name,
                    shard: index,
                    meta,
                });
            }
            shards.push(shard);
        }

        info!(
            dir = %dir.display(),
            shards = shards.len(),
            tensors = entries.len(),
            "Opened safetensors checkpoint"
        );

        Ok(Self { shards, entries })
    }

    /// Number of shard files.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

fn open_shard(path: PathBuf) -> Result<(Shard, BTreeMap<String, TensorMeta>), InferenceError> {
    let file = File::open(&path)?;
    // SAFETY: The mapping is read-only and lives as long as the Shard. The
    // file is not modified by this process while mapped; concurrent external
    // modification is undefined behaviour, accepted as for any mmap loader.
    let mmap = unsafe { memmap2::MmapOptions::new().map(&file)? };

    if mmap.len() < 8 {
        return Err(InferenceError::Checkpoint(format!(
            "{}: file too small for a safetensors header",
            path.display()
        )));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&mmap[..8]);
    let header_len = u64::from_le_bytes(len_bytes);
    if header_len > MAX_HEADER_LEN || 8 + header_len as usize > mmap.len() {
        return Err(InferenceError::Checkpoint(format!(
            "{}: invalid header length {}",
            path.display(),
            header_len
        )));
    }
    let data_start = 8 + header_len as usize;

    let header: BTreeMap<String, serde_json::Value> =
        serde_json::from_slice(&mmap[8..data_start])?;

    let data_len = mmap.len() - data_start;
    let mut metas = BTreeMap::new();
    for (name, value) in header {
        if name == "__metadata__" {
            continue;
        }
        let meta: TensorMeta = serde_json::from_value(value)?;
        let [start, end] = meta.data_offsets;
        if start > end || end > data_len {
            return Err(InferenceError::Checkpoint(format!(
                "{}: tensor '{}' has data offsets [{}, {}] outside {} data bytes",
                path.display(),
                name,
                start,
                end,
                data_len
            )));
        }
        metas.insert(name, meta);
    }

    debug!(path = %path.display(), tensors = metas.len(), "Parsed safetensors shard");

    Ok((
        Shard {
            path,
            data_start,
            mmap,
        },
        metas,
    ))
}

impl CheckpointSource for SafetensorsDir {
    fn tensor_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    fn tensor(&self, index: usize) -> Result<HostTensor<'_>, InferenceError> {
        let entry = self.entries.get(index).ok_or_else(|| {
            InferenceError::Checkpoint(format!("tensor index {} out of range", index))
        })?;
        let shard = &self.shards[entry.shard];
        let dtype = DataType::from_safetensors(&entry.meta.dtype).ok_or_else(|| {
            InferenceError::Checkpoint(format!(
                "{}: tensor '{}' has unsupported dtype {}",
                shard.path.display(),
                entry.name,
                entry.meta.dtype
            ))
        })?;
        let [start, end] = entry.meta.data_offsets;
        let bytes = &shard.mmap[shard.data_start + start..shard.data_start + end];
        HostTensor::new(dtype, entry.meta.shape.clone(), bytes)
    }
}

/// Write a single safetensors shard. Tensors are stored in name order.
pub fn write_safetensors(
    path: impl AsRef<Path>,
    tensors: &BTreeMap<String, HostTensor<'_>>,
) -> Result<(), InferenceError> {
    let mut header = BTreeMap::new();
    let mut raw = Vec::new();
    for (name, tensor) in tensors {
        let contiguous = tensor.view().contiguous();
        let bytes = contiguous.as_bytes().unwrap_or_default();
        let start = raw.len();
        raw.extend_from_slice(bytes);
        let dtype = match tensor.dtype() {
            DataType::F32 => "F32",
            DataType::F16 => "F16",
            DataType::BF16 => "BF16",
        };
        header.insert(
            name.clone(),
            TensorMeta {
                dtype: dtype.to_string(),
                shape: tensor.shape().to_vec(),
                data_offsets: [start, raw.len()],
            },
        );
    }

    let header_json = serde_json::to_vec(&header)?;
    let mut out = Vec::with_capacity(8 + header_json.len() + raw.len());
    out.extend_from_slice(&(header_json.len() as u64).to_le_bytes());
    out.extend_from_slice(&header_json);
    out.extend_from_slice(&raw);
    std::fs::write(path, out)?;
    Ok(())
}
