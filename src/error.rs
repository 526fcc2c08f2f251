//! Error types for walvault
//!
//! This module defines the top-level error type used across the engines.
//! Uses `thiserror` for ergonomic error definitions; collaborator modules
//! define their own local error enums which convert into `VaultError`.

use thiserror::Error;

use crate::audit::AuditError;
use crate::crypto::CryptoError;
use crate::metadata::MetadataError;
use crate::storage::StorageError;

/// Main error type for walvault operations
#[derive(Debug, Error)]
pub enum VaultError {
    /// The base-backup snapshot mechanism failed
    #[error("Backup creation failed: {0}")]
    BackupCreation(String),

    /// Fewer than the minimum required storage locations could be written
    #[error("Storage distribution failed: wrote {written} of {required} required copies: {reason}")]
    StorageDistribution {
        /// Copies successfully written
        written: usize,
        /// Minimum copies required for the backup to be committed
        required: usize,
        /// Underlying failure
        reason: String,
    },

    /// Another base-backup creation is already running
    #[error("A base backup is already in progress")]
    BackupInProgress,

    /// Backup not found in the metadata store
    #[error("Backup not found: {0}")]
    NotFound(String),

    /// Content checksum did not match the recorded value
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Live database collaborator error
    #[error("Database error: {0}")]
    Database(String),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Encryption/decryption error
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Metadata store error
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Audit log error
    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for walvault operations
pub type Result<T> = std::result::Result<T, VaultError>;
