//! Firmware file providers and the blob cache
//!
//! A boot run asks for files by bare name (`bootcode.bin`, `start.elf`,
//! `config.txt`, ...). Where those bytes come from is up to a
//! [`FileProvider`]; [`BlobCache`] sits in front of it so every device served
//! by the process shares one copy of each file.

use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// Source of firmware files
///
/// `io::ErrorKind::NotFound` means "the file does not exist". Any other error
/// is a provider failure.
pub trait FileProvider: Send + Sync + 'static {
    fn read_file(&self, name: &str) -> io::Result<Vec<u8>>;
}

/// Serves files from a single flat directory
#[derive(Debug, Clone)]
pub struct DirectoryProvider {
    root: PathBuf,
}

impl DirectoryProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Names come from the device, so anything that could leave the directory
/// is treated as missing
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && !name.contains("..")
}

impl FileProvider for DirectoryProvider {
    fn read_file(&self, name: &str) -> io::Result<Vec<u8>> {
        if !is_plain_file_name(name) {
            debug!("Refusing to serve {:?} outside {}", name, self.root.display());
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a plain file name", name),
            ));
        }
        std::fs::read(self.root.join(name))
    }
}

/// Serves files from memory
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    files: HashMap<String, Bytes>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.insert(name, data);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, data: impl Into<Bytes>) {
        self.files.insert(name.into(), data.into());
    }
}

impl FileProvider for MemoryProvider {
    fn read_file(&self, name: &str) -> io::Result<Vec<u8>> {
        self.files
            .get(name)
            .map(|data| data.to_vec())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))
    }
}

/// Process-wide cache of firmware files
///
/// Concurrent first reads of the same name may both hit the provider; the
/// first result stored wins and every caller gets identical bytes from then
/// on. Missing files are not cached.
pub struct BlobCache {
    provider: Arc<dyn FileProvider>,
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl BlobCache {
    pub fn new(provider: Arc<dyn FileProvider>) -> Self {
        Self {
            provider,
            blobs: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch a file, `Ok(None)` when the provider does not have it
    pub async fn get(&self, name: &str) -> io::Result<Option<Bytes>> {
        if let Some(data) = self.blobs.read().await.get(name) {
            trace!("Blob cache hit for {}", name);
            return Ok(Some(data.clone()));
        }

        let provider = Arc::clone(&self.provider);
        let owned = name.to_string();
        let result = tokio::task::spawn_blocking(move || provider.read_file(&owned))
            .await
            .map_err(io::Error::other)?;

        let data = match result {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} is not available", name);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut blobs = self.blobs.write().await;
        let stored = blobs.entry(name.to_string()).or_insert(data);
        debug!("Cached {} ({} bytes)", name, stored.len());
        Ok(Some(stored.clone()))
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}
