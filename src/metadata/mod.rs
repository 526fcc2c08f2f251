//! Metadata store
//!
//! Single source of truth for backup metadata, storage locations, WAL
//! archive status, compliance evaluations, and restore-drill results.
//! Record shapes mirror the relational tables (`backup_metadata`,
//! `storage_locations`, `backup_321_compliance`, `wal_archive_status`,
//! `restore_drill_results`); the engines only touch the [`MetadataStore`]
//! trait, so a SQL-backed implementation slots in without changes.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageClass;

/// Metadata store error
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Record with this identity already exists
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Record violates an invariant
    #[error("Invalid record: {0}")]
    Invalid(String),
}

/// Kind of backup artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Full base backup
    Base,
    /// Archived WAL segment
    Wal,
    /// Incremental backup
    Incremental,
}

/// One backup artifact's metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Unique, time-derived identifier
    pub backup_id: String,
    /// Artifact kind
    pub kind: BackupKind,
    /// When the snapshot started
    pub start_time: DateTime<Utc>,
    /// When the snapshot completed
    pub end_time: DateTime<Utc>,
    /// Plaintext artifact size
    pub size_bytes: u64,
    /// Compressed artifact size
    pub compressed_size_bytes: u64,
    /// SHA-256 over the plaintext artifact; immutable once recorded
    pub checksum: String,
    /// WAL position before the snapshot
    pub wal_start_lsn: Option<String>,
    /// WAL position after the snapshot
    pub wal_end_lsn: Option<String>,
    /// Key id the distributed blob was encrypted under
    pub encryption_key_id: String,
    /// Flipped to true after a successful restore drill
    pub restore_tested: bool,
    /// No deletion permitted before this time, regardless of retention
    pub immutable_until: Option<DateTime<Utc>>,
}

/// One physical copy of a backup or WAL segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageLocation {
    /// Owning backup id (or WAL filename for WAL copies)
    pub backup_id: String,
    /// Backend name
    pub provider: String,
    /// Backend region
    pub region: String,
    /// Bucket/container
    pub bucket: String,
    /// Object key within the bucket
    pub object_key: String,
    /// Full location URI as returned by the backend
    pub location_uri: String,
    /// Media type of this copy
    pub storage_class: StorageClass,
    /// Stored (encrypted) size
    pub size_bytes: u64,
    /// Must equal the parent record's checksum
    pub checksum: String,
    /// Object-lock window, if any
    pub immutable_until: Option<DateTime<Utc>>,
    /// Last successful integrity check against this copy
    pub access_verified_at: Option<DateTime<Utc>>,
}

/// Point-in-time 3-2-1 judgment for one backup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceRecord {
    /// Backup evaluated
    pub backup_id: String,
    /// Copies counted
    pub total_copies: usize,
    /// Distinct storage classes among the copies
    pub distinct_media_count: usize,
    /// Copies that are immutable or offline
    pub offline_immutable_count: usize,
    /// Whether all three clauses hold
    pub compliant: bool,
    /// One specific reason per failed clause
    pub violations: Vec<String>,
    /// Evaluation time
    pub evaluated_at: DateTime<Utc>,
}

/// Archive status of one WAL segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalArchiveRecord {
    /// Segment filename, e.g. "000000010000000000000005"
    pub wal_filename: String,
    /// SHA-256 over the plaintext segment
    pub checksum: String,
    /// Plaintext segment size
    pub size_bytes: u64,
    /// Key id the copies were encrypted under
    pub encryption_key_id: String,
    /// When archiving completed
    pub archived_at: DateTime<Utc>,
    /// Ransomware-protection window
    pub immutable_until: Option<DateTime<Utc>>,
    /// Physical copies (at least two)
    pub locations: Vec<StorageLocation>,
}

/// What triggered a restore drill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrillType {
    /// Regular scheduled drill
    Scheduled,
    /// Deliberate failure-injection exercise
    Gameday,
    /// Drill run as part of an actual incident
    Incident,
}

impl std::fmt::Display for DrillType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::Gameday => "gameday",
            Self::Incident => "incident",
        };
        f.write_str(s)
    }
}

/// Outcome of one restore drill; append-only history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrillRecord {
    /// Unique drill identifier
    pub drill_id: String,
    /// What triggered the drill
    pub drill_type: DrillType,
    /// Point in time the drill tried to recover to
    pub target_point_in_time: DateTime<Utc>,
    /// Point in time actually reached, when recovery got that far
    pub actual_point_in_time: Option<DateTime<Utc>>,
    /// When the drill started
    pub start_time: DateTime<Utc>,
    /// When the drill finalized
    pub completion_time: DateTime<Utc>,
    /// |target - actual| in seconds
    pub rpo_achieved_seconds: Option<f64>,
    /// Wall-clock duration in seconds
    pub rto_achieved_seconds: f64,
    /// True only when both metrics met tier targets and no issues occurred
    pub success: bool,
    /// Everything that went wrong, in order
    pub issues: Vec<String>,
    /// Location URIs and artifacts examined during the drill
    pub evidence_references: Vec<String>,
}

/// Metadata store interface
pub trait MetadataStore: Send + Sync {
    /// Commit a backup record together with its storage locations.
    ///
    /// All-or-nothing: either the record and every location land, or
    /// nothing does. Rejects records without a checksum or locations whose
    /// checksum differs from the record's.
    fn insert_backup(
        &self,
        record: BackupRecord,
        locations: Vec<StorageLocation>,
    ) -> Result<(), MetadataError>;

    /// Fetch one backup record
    fn backup(&self, backup_id: &str) -> Option<BackupRecord>;

    /// All backup records, newest first
    fn list_backups(&self) -> Vec<BackupRecord>;

    /// Storage locations belonging to a backup
    fn locations(&self, backup_id: &str) -> Vec<StorageLocation>;

    /// Most recent base backup with `start_time <= at`
    fn latest_base_backup_at_or_before(&self, at: DateTime<Utc>) -> Option<BackupRecord>;

    /// Flip `restore_tested` after a successful drill. The only mutation
    /// permitted on a committed backup record.
    fn mark_restore_tested(&self, backup_id: &str) -> Result<(), MetadataError>;

    /// Remove a backup record and its locations (retention cleanup only)
    fn remove_backup(&self, backup_id: &str) -> Result<(), MetadataError>;

    /// Record a compliance evaluation (re-evaluations replace the previous
    /// judgment for the same backup)
    fn record_compliance(&self, record: ComplianceRecord);

    /// Latest compliance judgment for a backup
    fn compliance(&self, backup_id: &str) -> Option<ComplianceRecord>;

    /// Archive status for one WAL segment
    fn wal_segment(&self, wal_filename: &str) -> Option<WalArchiveRecord>;

    /// Insert a WAL archive record unless one already exists for the same
    /// filename. Returns false when the row was already present — the
    /// uniqueness constraint that deduplicates concurrent archivers.
    fn try_insert_wal(&self, record: WalArchiveRecord) -> bool;

    /// All archived WAL segments
    fn list_wal_segments(&self) -> Vec<WalArchiveRecord>;

    /// Remove a WAL archive record (retention cleanup only)
    fn remove_wal_segment(&self, wal_filename: &str) -> Result<(), MetadataError>;

    /// Append a finalized drill result. History is never edited.
    fn record_drill(&self, record: DrillRecord);

    /// All drill results, newest first
    fn list_drills(&self) -> Vec<DrillRecord>;

    /// Mark a backup as referenced by an in-flight drill. Returns false if
    /// it was already pinned.
    fn pin_backup(&self, backup_id: &str) -> bool;

    /// Release a drill's reference
    fn unpin_backup(&self, backup_id: &str);

    /// Whether a drill currently references this backup
    fn is_pinned(&self, backup_id: &str) -> bool;
}

/// Serializable image of the whole store.
///
/// Drill pins are deliberately absent: they guard in-flight work and mean
/// nothing across a restart.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub backups: Vec<BackupRecord>,
    pub locations: Vec<StorageLocation>,
    pub compliance: Vec<ComplianceRecord>,
    pub wal_segments: Vec<WalArchiveRecord>,
    pub drills: Vec<DrillRecord>,
}

/// In-process metadata store backed by `parking_lot` tables.
#[derive(Default)]
pub struct MemoryMetadataStore {
    backups: RwLock<HashMap<String, BackupRecord>>,
    locations: RwLock<Vec<StorageLocation>>,
    compliance: RwLock<HashMap<String, ComplianceRecord>>,
    wal: RwLock<HashMap<String, WalArchiveRecord>>,
    drills: RwLock<Vec<DrillRecord>>,
    pins: Mutex<HashSet<String>>,
}

impl MemoryMetadataStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a snapshot
    pub fn from_snapshot(snapshot: MetadataSnapshot) -> Self {
        let store = Self::default();
        *store.backups.write() = snapshot
            .backups
            .into_iter()
            .map(|b| (b.backup_id.clone(), b))
            .collect();
        *store.locations.write() = snapshot.locations;
        *store.compliance.write() = snapshot
            .compliance
            .into_iter()
            .map(|c| (c.backup_id.clone(), c))
            .collect();
        *store.wal.write() = snapshot
            .wal_segments
            .into_iter()
            .map(|w| (w.wal_filename.clone(), w))
            .collect();
        *store.drills.write() = snapshot.drills;
        store
    }

    /// Serializable image of the current contents
    pub fn snapshot(&self) -> MetadataSnapshot {
        MetadataSnapshot {
            backups: self.list_backups(),
            locations: self.locations.read().clone(),
            compliance: self.compliance.read().values().cloned().collect(),
            wal_segments: self.list_wal_segments(),
            drills: self.list_drills(),
        }
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn insert_backup(
        &self,
        record: BackupRecord,
        locations: Vec<StorageLocation>,
    ) -> Result<(), MetadataError> {
        if record.checksum.is_empty() {
            return Err(MetadataError::Invalid(
                "backup record requires a checksum".to_string(),
            ));
        }
        if record.end_time < record.start_time {
            return Err(MetadataError::Invalid(
                "end_time precedes start_time".to_string(),
            ));
        }
        if locations.is_empty() {
            return Err(MetadataError::Invalid(
                "backup record requires at least one storage location".to_string(),
            ));
        }
        for loc in &locations {
            if loc.checksum != record.checksum {
                return Err(MetadataError::Invalid(format!(
                    "location {} checksum differs from backup checksum",
                    loc.location_uri
                )));
            }
        }

        // One write lock spans the record and its locations: all-or-nothing.
        let mut backups = self.backups.write();
        if backups.contains_key(&record.backup_id) {
            return Err(MetadataError::Duplicate(record.backup_id));
        }
        backups.insert(record.backup_id.clone(), record);
        self.locations.write().extend(locations);
        Ok(())
    }

    fn backup(&self, backup_id: &str) -> Option<BackupRecord> {
        self.backups.read().get(backup_id).cloned()
    }

    fn list_backups(&self) -> Vec<BackupRecord> {
        let mut records: Vec<_> = self.backups.read().values().cloned().collect();
        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        records
    }

    fn locations(&self, backup_id: &str) -> Vec<StorageLocation> {
        self.locations
            .read()
            .iter()
            .filter(|l| l.backup_id == backup_id)
            .cloned()
            .collect()
    }

    fn latest_base_backup_at_or_before(&self, at: DateTime<Utc>) -> Option<BackupRecord> {
        self.backups
            .read()
            .values()
            .filter(|b| b.kind == BackupKind::Base && b.start_time <= at)
            .max_by_key(|b| b.start_time)
            .cloned()
    }

    fn mark_restore_tested(&self, backup_id: &str) -> Result<(), MetadataError> {
        let mut backups = self.backups.write();
        let record = backups
            .get_mut(backup_id)
            .ok_or_else(|| MetadataError::NotFound(backup_id.to_string()))?;
        record.restore_tested = true;
        Ok(())
    }

    fn remove_backup(&self, backup_id: &str) -> Result<(), MetadataError> {
        let mut backups = self.backups.write();
        backups
            .remove(backup_id)
            .ok_or_else(|| MetadataError::NotFound(backup_id.to_string()))?;
        self.locations.write().retain(|l| l.backup_id != backup_id);
        self.compliance.write().remove(backup_id);
        Ok(())
    }

    fn record_compliance(&self, record: ComplianceRecord) {
        self.compliance
            .write()
            .insert(record.backup_id.clone(), record);
    }

    fn compliance(&self, backup_id: &str) -> Option<ComplianceRecord> {
        self.compliance.read().get(backup_id).cloned()
    }

    fn wal_segment(&self, wal_filename: &str) -> Option<WalArchiveRecord> {
        self.wal.read().get(wal_filename).cloned()
    }

    fn try_insert_wal(&self, record: WalArchiveRecord) -> bool {
        let mut wal = self.wal.write();
        if wal.contains_key(&record.wal_filename) {
            return false;
        }
        wal.insert(record.wal_filename.clone(), record);
        true
    }

    fn list_wal_segments(&self) -> Vec<WalArchiveRecord> {
        let mut records: Vec<_> = self.wal.read().values().cloned().collect();
        records.sort_by(|a, b| a.wal_filename.cmp(&b.wal_filename));
        records
    }

    fn remove_wal_segment(&self, wal_filename: &str) -> Result<(), MetadataError> {
        self.wal
            .write()
            .remove(wal_filename)
            .map(|_| ())
            .ok_or_else(|| MetadataError::NotFound(wal_filename.to_string()))
    }

    fn record_drill(&self, record: DrillRecord) {
        self.drills.write().push(record);
    }

    fn list_drills(&self) -> Vec<DrillRecord> {
        let mut records = self.drills.read().clone();
        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        records
    }

    fn pin_backup(&self, backup_id: &str) -> bool {
        self.pins.lock().insert(backup_id.to_string())
    }

    fn unpin_backup(&self, backup_id: &str) {
        self.pins.lock().remove(backup_id);
    }

    fn is_pinned(&self, backup_id: &str) -> bool {
        self.pins.lock().contains(backup_id)
    }
}
