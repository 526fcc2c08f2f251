//! Storage backend collaborator
//!
//! Backups and WAL segments are distributed across several named backends
//! (primary, archive, cold). Each backend implements [`ObjectStore`] and
//! advertises a [`BackendDescriptor`] with its region, storage class, and
//! whether it supports object-lock immutability.
//!
//! Objects are write-once: a `put` against an existing key fails rather
//! than overwriting (new content means a new object key).

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

/// Storage backend error
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Object not found
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Object key already exists (objects are write-once)
    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    /// Compression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Backend rejected or failed the operation
    #[error("Backend error: {0}")]
    Backend(String),

    /// Location URI does not belong to this backend
    #[error("Invalid location: {0}")]
    InvalidLocation(String),
}

/// Physical media/storage class of a backend or location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    /// Local or attached disk
    PrimaryDisk,
    /// Standard cloud object storage
    CloudStandard,
    /// Cloud archive class
    CloudArchive,
    /// Cloud cold/deep-archive class
    CloudCold,
    /// Tape library
    Tape,
    /// Object-lock / WORM storage
    Immutable,
}

impl std::fmt::Display for StorageClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PrimaryDisk => "primary_disk",
            Self::CloudStandard => "cloud_standard",
            Self::CloudArchive => "cloud_archive",
            Self::CloudCold => "cloud_cold",
            Self::Tape => "tape",
            Self::Immutable => "immutable",
        };
        f.write_str(s)
    }
}

/// Identity and capabilities of one storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Backend name ("primary", "archive", "cold")
    pub name: String,
    /// Region the backend lives in
    pub region: String,
    /// Bucket or base container name
    pub bucket: String,
    /// Storage class of objects written to this backend
    pub class: StorageClass,
    /// Whether the backend supports object-lock retention
    pub immutable_capable: bool,
}

/// Storage backend interface
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Backend identity and capabilities
    fn descriptor(&self) -> &BackendDescriptor;

    /// Location URI an object key maps to on this backend
    fn location_of(&self, key: &str) -> String;

    /// Store an object, returning its location URI.
    ///
    /// Fails with [`StorageError::AlreadyExists`] if the key is taken.
    async fn put(&self, key: &str, data: &[u8]) -> Result<String, StorageError>;

    /// Retrieve an object by location URI
    async fn get(&self, location: &str) -> Result<Bytes, StorageError>;

    /// Delete an object by location URI
    async fn delete(&self, location: &str) -> Result<(), StorageError>;
}

/// Directory-backed object store with optional gzip compression.
///
/// Stands in for an S3-compatible backend in single-node deployments and
/// lower environments.
pub struct LocalObjectStore {
    descriptor: BackendDescriptor,
    base_dir: PathBuf,
    compress: bool,
}

impl LocalObjectStore {
    /// Create a local object store rooted at `base_dir`
    pub fn new(descriptor: BackendDescriptor, base_dir: PathBuf) -> Self {
        Self {
            descriptor,
            base_dir,
            compress: false,
        }
    }

    /// Enable or disable transparent gzip of stored objects
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let filename = if self.compress {
            format!("{}.obj.gz", key)
        } else {
            format!("{}.obj", key)
        };
        self.base_dir.join(&self.descriptor.bucket).join(filename)
    }

    fn location_uri(&self, key: &str) -> String {
        format!(
            "file://{}/{}/{}",
            self.descriptor.name, self.descriptor.bucket, key
        )
    }

    /// Map a location URI produced by this backend back to an object key
    fn key_from_location(&self, location: &str) -> Result<String, StorageError> {
        let prefix = format!("file://{}/{}/", self.descriptor.name, self.descriptor.bucket);
        location
            .strip_prefix(&prefix)
            .map(str::to_string)
            .ok_or_else(|| StorageError::InvalidLocation(location.to_string()))
    }

    fn compress_data(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(data)
            .map_err(|e| StorageError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| StorageError::Compression(e.to_string()))
    }

    fn decompress_data(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        use flate2::read::GzDecoder;

        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| StorageError::Compression(e.to_string()))?;
        Ok(decompressed)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn location_of(&self, key: &str) -> String {
        self.location_uri(key)
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<String, StorageError> {
        let path = self.object_path(key);
        if path.exists() {
            return Err(StorageError::AlreadyExists(key.to_string()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let data_to_write = if self.compress {
            self.compress_data(data)?
        } else {
            data.to_vec()
        };

        fs::write(&path, &data_to_write).await?;
        debug!(
            "Object stored: {:?} ({} bytes, backend={})",
            path,
            data_to_write.len(),
            self.descriptor.name
        );

        Ok(self.location_uri(key))
    }

    async fn get(&self, location: &str) -> Result<Bytes, StorageError> {
        let key = self.key_from_location(location)?;
        let path = self.object_path(&key);
        if !path.exists() {
            return Err(StorageError::NotFound(location.to_string()));
        }

        let data = fs::read(&path).await?;
        let result = if self.compress {
            Bytes::from(self.decompress_data(&data)?)
        } else {
            Bytes::from(data)
        };
        Ok(result)
    }

    async fn delete(&self, location: &str) -> Result<(), StorageError> {
        let key = self.key_from_location(location)?;
        let path = self.object_path(&key);
        if !path.exists() {
            return Err(StorageError::NotFound(location.to_string()));
        }

        fs::remove_file(&path).await?;
        info!("Object deleted: {} (backend={})", location, self.descriptor.name);
        Ok(())
    }
}

/// In-memory object store for tests and simulated environments.
///
/// Faults can be injected per operation to exercise partial-failure paths.
pub struct MemoryObjectStore {
    descriptor: BackendDescriptor,
    objects: RwLock<HashMap<String, Bytes>>,
    fail_puts: RwLock<bool>,
    fail_gets: RwLock<bool>,
    fail_deletes: RwLock<bool>,
}

impl MemoryObjectStore {
    /// Create an empty in-memory store
    pub fn new(descriptor: BackendDescriptor) -> Self {
        Self {
            descriptor,
            objects: RwLock::new(HashMap::new()),
            fail_puts: RwLock::new(false),
            fail_gets: RwLock::new(false),
            fail_deletes: RwLock::new(false),
        }
    }

    /// Make subsequent puts fail
    pub fn fail_puts(&self, fail: bool) {
        *self.fail_puts.write() = fail;
    }

    /// Make subsequent gets fail
    pub fn fail_gets(&self, fail: bool) {
        *self.fail_gets.write() = fail;
    }

    /// Make subsequent deletes fail
    pub fn fail_deletes(&self, fail: bool) {
        *self.fail_deletes.write() = fail;
    }

    /// Number of stored objects
    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    fn location_uri(&self, key: &str) -> String {
        format!(
            "mem://{}/{}/{}",
            self.descriptor.name, self.descriptor.bucket, key
        )
    }

    fn key_from_location(&self, location: &str) -> Result<String, StorageError> {
        let prefix = format!("mem://{}/{}/", self.descriptor.name, self.descriptor.bucket);
        location
            .strip_prefix(&prefix)
            .map(str::to_string)
            .ok_or_else(|| StorageError::InvalidLocation(location.to_string()))
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn location_of(&self, key: &str) -> String {
        self.location_uri(key)
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<String, StorageError> {
        if *self.fail_puts.read() {
            return Err(StorageError::Backend(format!(
                "injected put failure on backend {}",
                self.descriptor.name
            )));
        }
        let mut objects = self.objects.write();
        if objects.contains_key(key) {
            return Err(StorageError::AlreadyExists(key.to_string()));
        }
        objects.insert(key.to_string(), Bytes::copy_from_slice(data));
        Ok(self.location_uri(key))
    }

    async fn get(&self, location: &str) -> Result<Bytes, StorageError> {
        if *self.fail_gets.read() {
            return Err(StorageError::Backend(format!(
                "injected get failure on backend {}",
                self.descriptor.name
            )));
        }
        let key = self.key_from_location(location)?;
        self.objects
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(location.to_string()))
    }

    async fn delete(&self, location: &str) -> Result<(), StorageError> {
        if *self.fail_deletes.read() {
            return Err(StorageError::Backend(format!(
                "injected delete failure on backend {}",
                self.descriptor.name
            )));
        }
        let key = self.key_from_location(location)?;
        self.objects
            .write()
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(location.to_string()))
    }
}

/// Descriptor helpers for the standard three-backend layout
impl BackendDescriptor {
    /// On-site-equivalent primary backend
    pub fn primary(region: impl Into<String>) -> Self {
        Self {
            name: "primary".to_string(),
            region: region.into(),
            bucket: "walvault-primary".to_string(),
            class: StorageClass::CloudStandard,
            immutable_capable: false,
        }
    }

    /// Cross-region archive backend
    pub fn archive(region: impl Into<String>) -> Self {
        Self {
            name: "archive".to_string(),
            region: region.into(),
            bucket: "walvault-archive".to_string(),
            class: StorageClass::CloudArchive,
            immutable_capable: false,
        }
    }

    /// Immutable cold backend (object lock)
    pub fn cold(region: impl Into<String>) -> Self {
        Self {
            name: "cold".to_string(),
            region: region.into(),
            bucket: "walvault-cold".to_string(),
            class: StorageClass::CloudCold,
            immutable_capable: true,
        }
    }
}
