//! Safetensors I/O: whole-file dictionaries and a lazy memory-mapped reader

use memmap2::Mmap;
use safetensors::tensor::{serialize_to_file, TensorView};
use safetensors::SafeTensors;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::ops::Index;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{ForgeError, Result};
use crate::tensor::Tensor;

const METADATA_KEY: &str = "__metadata__";
const MAX_HEADER_SIZE: usize = 100_000_000;

/// A named-tensor dictionary plus the string metadata block of its file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorDict {
    tensors: HashMap<String, Tensor>,
    metadata: HashMap<String, String>,
}

impl TensorDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a whole safetensors file into memory
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ForgeError::InputNotFound(path.to_path_buf()));
        }

        info!("📂 Loading {}", path.display());
        let buffer = fs::read(path)?;
        let dict = Self::from_bytes(&buffer)?;
        debug!("   {} tensors, {} metadata entries", dict.len(), dict.metadata.len());
        Ok(dict)
    }

    pub fn from_bytes(buffer: &[u8]) -> Result<Self> {
        let metadata = parse_header_metadata(buffer)?;
        let st = SafeTensors::deserialize(buffer)?;

        let mut tensors = HashMap::new();
        for (name, view) in st.tensors() {
            let tensor = Tensor::new(view.dtype(), view.shape().to_vec(), view.data().to_vec())?;
            tensors.insert(name, tensor);
        }

        Ok(Self { tensors, metadata })
    }

    /// Write to disk, creating parent directories. Not atomic: a failure
    /// mid-write can leave a truncated file behind.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        info!("💾 Saving {} tensors to {}", self.len(), path.display());
        let views = self.views()?;
        serialize_to_file(views.iter().map(|(k, v)| (k, v)), self.metadata_block(), path)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let views = self.views()?;
        Ok(safetensors::tensor::serialize(
            views.iter().map(|(k, v)| (k, v)),
            self.metadata_block(),
        )?)
    }

    fn views(&self) -> Result<Vec<(String, TensorView<'_>)>> {
        let mut views = Vec::with_capacity(self.tensors.len());
        for key in self.sorted_keys() {
            views.push((key.clone(), self.tensors[key].view()?));
        }
        Ok(views)
    }

    fn metadata_block(&self) -> Option<HashMap<String, String>> {
        if self.metadata.is_empty() {
            None
        } else {
            Some(self.metadata.clone())
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(key.into(), tensor)
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.tensors.iter()
    }

    pub fn sorted_keys(&self) -> Vec<&String> {
        let mut keys: Vec<&String> = self.tensors.keys().collect();
        keys.sort();
        keys
    }

    /// Consume into `(key, tensor)` pairs sorted by key
    pub fn into_sorted_entries(self) -> Vec<(String, Tensor)> {
        let mut entries: Vec<(String, Tensor)> = self.tensors.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.metadata
    }

    pub fn set_metadata(&mut self, metadata: HashMap<String, String>) {
        self.metadata = metadata;
    }

    pub fn total_parameters(&self) -> usize {
        self.tensors.values().map(Tensor::numel).sum()
    }
}

impl Index<&str> for TensorDict {
    type Output = Tensor;

    fn index(&self, key: &str) -> &Tensor {
        &self.tensors[key]
    }
}

impl FromIterator<(String, Tensor)> for TensorDict {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
            metadata: HashMap::new(),
        }
    }
}

/// Read only the `__metadata__` block of a safetensors file
pub fn read_metadata(path: impl AsRef<Path>) -> Result<HashMap<String, String>> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(|e| not_found_or_io(path, e))?;

    let mut len_buf = [0u8; 8];
    file.read_exact(&mut len_buf)?;
    let header_len = header_length(u64::from_le_bytes(len_buf))?;

    let mut buffer = vec![0u8; 8 + header_len];
    buffer[..8].copy_from_slice(&len_buf);
    file.read_exact(&mut buffer[8..])?;
    parse_header_metadata(&buffer)
}

fn header_length(raw: u64) -> Result<usize> {
    match usize::try_from(raw) {
        Ok(len) if len <= MAX_HEADER_SIZE => Ok(len),
        _ => Err(ForgeError::InvalidHeader(format!(
            "header length {raw} exceeds {MAX_HEADER_SIZE} bytes"
        ))),
    }
}

fn parse_header_metadata(buffer: &[u8]) -> Result<HashMap<String, String>> {
    if buffer.len() < 8 {
        return Err(ForgeError::InvalidHeader("file shorter than 8 bytes".to_string()));
    }
    let mut len_buf = [0u8; 8];
    len_buf.copy_from_slice(&buffer[..8]);
    let header_len = header_length(u64::from_le_bytes(len_buf))?;
    let header = buffer.get(8..8 + header_len).ok_or_else(|| {
        ForgeError::InvalidHeader(format!("header length {header_len} exceeds file size"))
    })?;

    let header: Value = serde_json::from_slice(header)?;
    let mut metadata = HashMap::new();
    if let Some(block) = header.get(METADATA_KEY).and_then(|m| m.as_object()) {
        for (key, value) in block {
            let value = value.as_str().ok_or_else(|| {
                ForgeError::InvalidHeader(format!("metadata value for {key} is not a string"))
            })?;
            metadata.insert(key.clone(), value.to_string());
        }
    }
    Ok(metadata)
}

fn not_found_or_io(path: &Path, e: std::io::Error) -> ForgeError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ForgeError::InputNotFound(path.to_path_buf())
    } else {
        ForgeError::Io(e)
    }
}

/// Key-addressable reader over a memory-mapped safetensors file.
///
/// Only the tensor requested by [`LazyReader::get`] is copied into memory,
/// which bounds peak usage when a second large checkpoint is streamed
/// against one already loaded.
pub struct LazyReader {
    mmap: Mmap,
    metadata: HashMap<String, String>,
}

impl LazyReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| not_found_or_io(path, e))?;
        // Safety: the file is not mutated while the mmap is alive.
        let mmap = unsafe { Mmap::map(&file)? };

        let metadata = parse_header_metadata(&mmap)?;
        // Validate the header once up front
        SafeTensors::deserialize(&mmap)?;

        info!("📂 Streaming {}", path.display());
        Ok(Self { mmap, metadata })
    }

    fn tensors(&self) -> Result<SafeTensors<'_>> {
        Ok(SafeTensors::deserialize(&self.mmap)?)
    }

    /// Tensor names, sorted
    pub fn keys(&self) -> Result<Vec<String>> {
        let st = self.tensors()?;
        let mut keys: Vec<String> = st.tensors().into_iter().map(|(name, _)| name).collect();
        keys.sort();
        Ok(keys)
    }

    pub fn shape(&self, key: &str) -> Result<Vec<usize>> {
        let st = self.tensors()?;
        let view = st
            .tensor(key)
            .map_err(|_| ForgeError::KeyNotFound(key.to_string()))?;
        Ok(view.shape().to_vec())
    }

    /// Copy one tensor out of the mapping
    pub fn get(&self, key: &str) -> Result<Tensor> {
        let st = self.tensors()?;
        let view = st
            .tensor(key)
            .map_err(|_| ForgeError::KeyNotFound(key.to_string()))?;
        Tensor::new(view.dtype(), view.shape().to_vec(), view.data().to_vec())
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }
}
