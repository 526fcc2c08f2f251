//! # walvault
//!
//! Backup integrity and point-in-time recovery for a PostgreSQL-backed
//! service: continuous WAL archiving, base backups distributed per the
//! 3-2-1 rule (three copies, two media types, one immutable/offline),
//! scheduled restore drills that measure achieved RPO/RTO against tier
//! targets, retention enforcement with object-lock immutability holds,
//! and a tamper-evident hash-chained audit log over all of it.
//!
//! ## Architecture
//!
//! Engines in [`backup`] orchestrate the work; everything they touch is a
//! trait-shaped collaborator:
//!
//! - [`db::DatabaseSource`] — WAL positions, snapshots, restores
//! - [`storage::ObjectStore`] — the named backends (primary, archive, cold)
//! - [`crypto::ArtifactCipher`] — encryption with rotating keys
//! - [`metadata::MetadataStore`] — the system of record for backups,
//!   locations, compliance, WAL status, and drill history
//! - [`audit::AuditLog`] — the append-only chain
//!
//! Production backends and the simulated ones used in drills and tests
//! wire up identically.

pub mod audit;
pub mod backup;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod metadata;
pub mod storage;

pub use audit::AuditLog;
pub use backup::{BackupEngine, BackupTargets, DrillEngine, RetentionEngine, WalArchiver};
pub use config::{BackupTier, TierPolicy, VaultConfig};
pub use error::{Result, VaultError};
