//! Backup creation engine
//!
//! Produces a base backup artifact bracketed by WAL positions, checksums
//! the plaintext, encrypts, distributes the blob across the three-backend
//! layout (primary, cross-region archive, immutable cold), commits
//! metadata all-or-nothing, and triggers the 3-2-1 compliance evaluation.
//! Every run appends audit events, on failure included.

use std::io::Write;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::audit::{AuditDraft, AuditEventType, AuditLog, Outcome, Severity};
use crate::backup::compliance;
use crate::config::VaultConfig;
use crate::crypto::{checksum, ArtifactCipher};
use crate::db::DatabaseSource;
use crate::error::{Result, VaultError};
use crate::metadata::{BackupKind, BackupRecord, MetadataStore, StorageLocation};
use crate::storage::{ObjectStore, StorageError};

/// The three-backend distribution layout for base backups
pub struct BackupTargets {
    /// On-site-equivalent backend; the hard minimum for a committed backup
    pub primary: Arc<dyn ObjectStore>,
    /// Cross-region archive backend
    pub archive: Arc<dyn ObjectStore>,
    /// Immutable-capable cold backend
    pub cold: Arc<dyn ObjectStore>,
}

/// Backup creation engine
pub struct BackupEngine {
    config: VaultConfig,
    db: Arc<dyn DatabaseSource>,
    cipher: Arc<dyn ArtifactCipher>,
    targets: BackupTargets,
    meta: Arc<dyn MetadataStore>,
    audit: Arc<AuditLog>,
    // Advisory lock: at most one base-backup creation at a time
    creation_lock: Mutex<()>,
}

impl BackupEngine {
    /// Create a backup engine over injected collaborators
    pub fn new(
        config: VaultConfig,
        db: Arc<dyn DatabaseSource>,
        cipher: Arc<dyn ArtifactCipher>,
        targets: BackupTargets,
        meta: Arc<dyn MetadataStore>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            config,
            db,
            cipher,
            targets,
            meta,
            audit,
            creation_lock: Mutex::new(()),
        }
    }

    /// Create a base backup and distribute it per the 3-2-1 policy.
    ///
    /// Returns the new backup id. Fails with
    /// [`VaultError::BackupInProgress`] if another creation is running,
    /// [`VaultError::BackupCreation`] if the snapshot mechanism errors, and
    /// [`VaultError::StorageDistribution`] if the primary copy cannot be
    /// written. Archive/cold failures do not fail the backup; they surface
    /// as recorded 3-2-1 violations.
    pub async fn create_base_backup(&self, compression_level: Option<u32>) -> Result<String> {
        let _guard = self
            .creation_lock
            .try_lock()
            .map_err(|_| VaultError::BackupInProgress)?;

        match self.create_locked(compression_level).await {
            Ok(backup_id) => Ok(backup_id),
            Err(e) => {
                self.audit.append(
                    AuditDraft::new(
                        AuditEventType::BackupCreated,
                        "base_backup",
                        "create_base_backup",
                        Outcome::Failure,
                    )
                    .severity(Severity::Warning)
                    .details(serde_json::json!({ "error": e.to_string() })),
                );
                Err(e)
            }
        }
    }

    async fn create_locked(&self, compression_level: Option<u32>) -> Result<String> {
        let start_time = Utc::now();
        let backup_id = format!("base-{}", start_time.timestamp_millis());
        info!("Creating base backup: {}", backup_id);

        // WAL bounds bracket the snapshot
        let wal_start_lsn = self.db.current_wal_lsn().await?;
        let artifact = self
            .db
            .base_snapshot()
            .await
            .map_err(|e| VaultError::BackupCreation(e.to_string()))?;
        let end_time = Utc::now();
        let wal_end_lsn = self.db.current_wal_lsn().await?;

        // Checksum covers the plaintext artifact, before compression and
        // encryption, so key rotation never invalidates it
        let artifact_checksum = checksum(&artifact);
        let size_bytes = artifact.len() as u64;

        let level = compression_level.unwrap_or(self.config.compression_level);
        let compressed = gzip_compress(&artifact, level)?;
        let compressed_size_bytes = compressed.len() as u64;

        let key_id = self.cipher.active_key_id();
        let encrypted = self.cipher.encrypt(&compressed, &key_id)?;

        let object_key = format!("base/{}", backup_id);
        let policy = self.config.tier.policy();
        let immutable_until = start_time + ChronoDuration::days(policy.immutable_days as i64);

        let mut locations = Vec::new();
        let mut distribution_errors = Vec::new();

        // Primary copy is the hard minimum: without it nothing is committed
        match self
            .put_copy(&*self.targets.primary, &backup_id, &object_key, &encrypted, &artifact_checksum, None)
            .await
        {
            Ok(location) => locations.push(location),
            Err(e) => {
                return Err(VaultError::StorageDistribution {
                    written: 0,
                    required: 1,
                    reason: e.to_string(),
                });
            }
        }

        // Archive and cold copies degrade to recorded 3-2-1 violations on
        // failure rather than failing the backup
        match self
            .put_copy(&*self.targets.archive, &backup_id, &object_key, &encrypted, &artifact_checksum, None)
            .await
        {
            Ok(location) => locations.push(location),
            Err(e) => {
                warn!("Archive copy failed for {}: {}", backup_id, e);
                distribution_errors.push(format!("archive: {}", e));
            }
        }
        match self
            .put_copy(
                &*self.targets.cold,
                &backup_id,
                &object_key,
                &encrypted,
                &artifact_checksum,
                Some(immutable_until),
            )
            .await
        {
            Ok(location) => locations.push(location),
            Err(e) => {
                warn!("Cold copy failed for {}: {}", backup_id, e);
                distribution_errors.push(format!("cold: {}", e));
            }
        }

        let record = BackupRecord {
            backup_id: backup_id.clone(),
            kind: BackupKind::Base,
            start_time,
            end_time,
            size_bytes,
            compressed_size_bytes,
            checksum: artifact_checksum,
            wal_start_lsn: Some(wal_start_lsn),
            wal_end_lsn: Some(wal_end_lsn),
            encryption_key_id: key_id,
            restore_tested: false,
            immutable_until: Some(immutable_until),
        };
        self.meta.insert_backup(record, locations.clone())?;

        // Evaluate 3-2-1 immediately after the location set is final
        let evaluation = compliance::evaluate(&backup_id, &locations);
        let compliant = evaluation.compliant;
        let violations = evaluation.violations.clone();
        self.meta.record_compliance(evaluation);

        self.audit.append(
            AuditDraft::new(
                AuditEventType::ComplianceEvaluated,
                &backup_id,
                "evaluate_321",
                if compliant { Outcome::Success } else { Outcome::Failure },
            )
            .severity(if compliant { Severity::Info } else { Severity::Warning })
            .details(serde_json::json!({
                "compliant": compliant,
                "violations": violations,
            })),
        );

        let outcome = if distribution_errors.is_empty() {
            Outcome::Success
        } else {
            Outcome::Partial
        };
        self.audit.append(
            AuditDraft::new(
                AuditEventType::BackupCreated,
                &backup_id,
                "create_base_backup",
                outcome,
            )
            .details(serde_json::json!({
                "size_bytes": size_bytes,
                "compressed_size_bytes": compressed_size_bytes,
                "copies_written": locations.len(),
                "distribution_errors": distribution_errors,
            })),
        );

        info!(
            "Base backup created: {} ({} bytes raw, {} compressed, {} copies)",
            backup_id,
            size_bytes,
            compressed_size_bytes,
            locations.len()
        );
        Ok(backup_id)
    }

    async fn put_copy(
        &self,
        store: &dyn ObjectStore,
        backup_id: &str,
        object_key: &str,
        encrypted: &[u8],
        artifact_checksum: &str,
        immutable_until: Option<chrono::DateTime<Utc>>,
    ) -> std::result::Result<StorageLocation, StorageError> {
        let location_uri = store.put(object_key, encrypted).await?;
        let descriptor = store.descriptor();
        Ok(StorageLocation {
            backup_id: backup_id.to_string(),
            provider: descriptor.name.clone(),
            region: descriptor.region.clone(),
            bucket: descriptor.bucket.clone(),
            object_key: object_key.to_string(),
            location_uri,
            storage_class: descriptor.class,
            size_bytes: encrypted.len() as u64,
            checksum: artifact_checksum.to_string(),
            immutable_until,
            access_verified_at: None,
        })
    }

    /// Rotate the active encryption key, auditing the rotation.
    ///
    /// Previously written backups stay decryptable under their recorded
    /// key ids.
    pub fn rotate_encryption_key(&self) -> String {
        let new_key_id = self.cipher.rotate_key();
        self.audit.append(
            AuditDraft::new(
                AuditEventType::KeyRotated,
                "encryption_keyring",
                "rotate_key",
                Outcome::Success,
            )
            .details(serde_json::json!({ "active_key_id": new_key_id })),
        );
        new_key_id
    }
}

fn gzip_compress(data: &[u8], level: u32) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder
        .write_all(data)
        .map_err(|e| VaultError::BackupCreation(format!("compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| VaultError::BackupCreation(format!("compression failed: {}", e)))
}

/// Decompress a gzip artifact (used by the drill engine after decryption)
pub(crate) fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| VaultError::Integrity(format!("decompression failed: {}", e)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ChaChaCipher;
    use crate::db::SimulatedDatabase;
    use crate::metadata::MemoryMetadataStore;
    use crate::storage::{BackendDescriptor, MemoryObjectStore};

    struct Fixture {
        engine: BackupEngine,
        db: Arc<SimulatedDatabase>,
        meta: Arc<MemoryMetadataStore>,
        audit: Arc<AuditLog>,
        primary: Arc<MemoryObjectStore>,
        archive: Arc<MemoryObjectStore>,
        cold: Arc<MemoryObjectStore>,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(SimulatedDatabase::new("cluster snapshot payload"));
        let meta = Arc::new(MemoryMetadataStore::new());
        let audit = Arc::new(AuditLog::new());
        let primary = Arc::new(MemoryObjectStore::new(BackendDescriptor::primary("eu-west-1")));
        let archive = Arc::new(MemoryObjectStore::new(BackendDescriptor::archive("us-east-2")));
        let cold = Arc::new(MemoryObjectStore::new(BackendDescriptor::cold("eu-central-1")));

        let engine = BackupEngine::new(
            VaultConfig::default(),
            db.clone(),
            Arc::new(ChaChaCipher::new()),
            BackupTargets {
                primary: primary.clone(),
                archive: archive.clone(),
                cold: cold.clone(),
            },
            meta.clone(),
            audit.clone(),
        );

        Fixture {
            engine,
            db,
            meta,
            audit,
            primary,
            archive,
            cold,
        }
    }

    #[tokio::test]
    async fn test_create_base_backup_distributes_three_copies() {
        let f = fixture();
        let backup_id = f.engine.create_base_backup(None).await.unwrap();

        let record = f.meta.backup(&backup_id).unwrap();
        assert_eq!(record.kind, BackupKind::Base);
        assert!(!record.checksum.is_empty());
        assert!(record.wal_start_lsn.is_some());
        assert!(record.wal_end_lsn.is_some());
        assert!(record.immutable_until.is_some());

        let locations = f.meta.locations(&backup_id);
        assert_eq!(locations.len(), 3);
        assert_eq!(f.primary.object_count(), 1);
        assert_eq!(f.archive.object_count(), 1);
        assert_eq!(f.cold.object_count(), 1);

        // Cold copy carries the object-lock window
        let cold_loc = locations.iter().find(|l| l.provider == "cold").unwrap();
        assert!(cold_loc.immutable_until.is_some());

        let evaluation = f.meta.compliance(&backup_id).unwrap();
        assert!(evaluation.compliant);
    }

    #[tokio::test]
    async fn test_snapshot_failure_commits_nothing() {
        let f = fixture();
        f.db.fail_snapshots(true);

        let result = f.engine.create_base_backup(None).await;
        assert!(matches!(result, Err(VaultError::BackupCreation(_))));
        assert!(f.meta.list_backups().is_empty());
        assert_eq!(f.primary.object_count(), 0);

        // Failure was audited
        let exported = f.audit.export_jsonl().unwrap();
        assert!(exported.contains("\"outcome\":\"failure\""));
    }

    #[tokio::test]
    async fn test_primary_failure_aborts_distribution() {
        let f = fixture();
        f.primary.fail_puts(true);

        let result = f.engine.create_base_backup(None).await;
        assert!(matches!(
            result,
            Err(VaultError::StorageDistribution { written: 0, .. })
        ));
        assert!(f.meta.list_backups().is_empty());
    }

    #[tokio::test]
    async fn test_secondary_failures_degrade_to_violations() {
        let f = fixture();
        f.archive.fail_puts(true);
        f.cold.fail_puts(true);

        let backup_id = f.engine.create_base_backup(None).await.unwrap();

        assert_eq!(f.meta.locations(&backup_id).len(), 1);
        let evaluation = f.meta.compliance(&backup_id).unwrap();
        assert!(!evaluation.compliant);
        assert!(!evaluation.violations.is_empty());

        let exported = f.audit.export_jsonl().unwrap();
        assert!(exported.contains("\"outcome\":\"partial\""));
    }

    #[tokio::test]
    async fn test_concurrent_creation_is_excluded() {
        let f = fixture();
        f.db.set_snapshot_delay(std::time::Duration::from_millis(100));

        let (a, b) = tokio::join!(
            f.engine.create_base_backup(None),
            f.engine.create_base_backup(None)
        );

        let failures = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(VaultError::BackupInProgress)))
            .count();
        assert_eq!(failures, 1);
        assert_eq!(f.meta.list_backups().len(), 1);
    }

    #[tokio::test]
    async fn test_key_rotation_is_audited() {
        let f = fixture();
        let new_key = f.engine.rotate_encryption_key();
        assert!(new_key.contains("v2"));

        let exported = f.audit.export_jsonl().unwrap();
        assert!(exported.contains("key_rotated"));
    }
}
