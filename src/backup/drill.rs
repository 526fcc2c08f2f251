//! Restore drill engine
//!
//! Exercises recovery against a target point in time: locate the most
//! recent base backup at or before the target, fetch and decrypt a copy,
//! re-verify the plaintext checksum, restore, and measure achieved RPO/RTO
//! against the tier's targets.
//!
//! A drill must always produce a terminal result record for audit
//! purposes. Every phase error is caught and recorded as an issue; the
//! engine never propagates an exception out of a drill.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::audit::{AuditDraft, AuditEventType, AuditLog, Outcome, Severity};
use crate::backup::engine::gzip_decompress;
use crate::config::BackupTier;
use crate::crypto::{checksum, ArtifactCipher};
use crate::db::DatabaseSource;
use crate::error::{Result, VaultError};
use crate::metadata::{BackupRecord, DrillRecord, DrillType, MetadataStore, StorageLocation};
use crate::storage::ObjectStore;

/// Drill progression, for logging and issue attribution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrillPhase {
    Preparing,
    Executing,
    Validating,
}

impl std::fmt::Display for DrillPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Preparing => "preparing",
            Self::Executing => "executing",
            Self::Validating => "validating",
        };
        f.write_str(s)
    }
}

/// Restore drill engine
pub struct DrillEngine {
    db: Arc<dyn DatabaseSource>,
    cipher: Arc<dyn ArtifactCipher>,
    stores: Vec<Arc<dyn ObjectStore>>,
    meta: Arc<dyn MetadataStore>,
    audit: Arc<AuditLog>,
    tier: BackupTier,
}

impl DrillEngine {
    /// Create a drill engine over injected collaborators
    pub fn new(
        db: Arc<dyn DatabaseSource>,
        cipher: Arc<dyn ArtifactCipher>,
        stores: Vec<Arc<dyn ObjectStore>>,
        meta: Arc<dyn MetadataStore>,
        audit: Arc<AuditLog>,
        tier: BackupTier,
    ) -> Self {
        Self {
            db,
            cipher,
            stores,
            meta,
            audit,
            tier,
        }
    }

    /// Run one restore drill.
    ///
    /// `target` defaults to one hour before now. Always returns a terminal
    /// [`DrillRecord`]; failures of any phase land in `issues` with
    /// `success = false`.
    pub async fn perform_restore_drill(
        &self,
        target: Option<DateTime<Utc>>,
        drill_type: DrillType,
    ) -> DrillRecord {
        let start_time = Utc::now();
        let target_point_in_time = target.unwrap_or(start_time - ChronoDuration::hours(1));
        let drill_id = format!("drill-{}", start_time.timestamp_millis());
        info!(
            "Restore drill {} started (type={}, target={})",
            drill_id, drill_type, target_point_in_time
        );

        let mut issues: Vec<String> = Vec::new();
        let mut evidence_references: Vec<String> = Vec::new();
        let mut actual_point_in_time: Option<DateTime<Utc>> = None;
        let mut exercised_backup: Option<String> = None;

        // Preparing: locate the base backup to restore from
        debug!("Drill {} phase: {}", drill_id, DrillPhase::Preparing);
        let backup = match self
            .meta
            .latest_base_backup_at_or_before(target_point_in_time)
        {
            Some(backup) => {
                // Referenced backups are ineligible for cleanup this cycle
                self.meta.pin_backup(&backup.backup_id);
                exercised_backup = Some(backup.backup_id.clone());
                Some(backup)
            }
            None => {
                issues.push("no suitable base backup found".to_string());
                None
            }
        };

        // Executing: fetch, decrypt, verify, restore
        if let Some(ref backup) = backup {
            debug!("Drill {} phase: {}", drill_id, DrillPhase::Executing);
            match self
                .execute_restore(backup, target_point_in_time, &mut evidence_references)
                .await
            {
                Ok(achieved) => actual_point_in_time = Some(achieved),
                Err(e) => {
                    warn!("Drill {} execution failed: {}", drill_id, e);
                    if matches!(e, VaultError::Integrity(_)) {
                        self.audit.append(
                            AuditDraft::new(
                                AuditEventType::SecurityEvent,
                                &backup.backup_id,
                                "drill_integrity_check",
                                Outcome::Failure,
                            )
                            .severity(Severity::Critical)
                            .details(serde_json::json!({ "error": e.to_string() })),
                        );
                    }
                    issues.push(format!("{}: {}", DrillPhase::Executing, e));
                }
            }
        }

        // Validating: measure achieved RPO/RTO against the tier targets
        debug!("Drill {} phase: {}", drill_id, DrillPhase::Validating);
        let completion_time = Utc::now();
        let rto_achieved_seconds =
            (completion_time - start_time).num_milliseconds() as f64 / 1000.0;
        let rpo_achieved_seconds = actual_point_in_time.map(|actual| {
            (target_point_in_time - actual)
                .num_milliseconds()
                .unsigned_abs() as f64
                / 1000.0
        });

        let policy = self.tier.policy();
        let within_targets = match rpo_achieved_seconds {
            Some(rpo) => {
                rpo <= policy.rpo_target.as_secs_f64()
                    && rto_achieved_seconds <= policy.rto_target.as_secs_f64()
            }
            None => false,
        };
        if let Some(rpo) = rpo_achieved_seconds {
            if rpo > policy.rpo_target.as_secs_f64() {
                issues.push(format!(
                    "RPO target exceeded: achieved {:.1}s, target {}s",
                    rpo,
                    policy.rpo_target.as_secs()
                ));
            }
        }
        if rto_achieved_seconds > policy.rto_target.as_secs_f64() {
            issues.push(format!(
                "RTO target exceeded: achieved {:.1}s, target {}s",
                rto_achieved_seconds,
                policy.rto_target.as_secs()
            ));
        }

        let success = within_targets && issues.is_empty();

        let record = DrillRecord {
            drill_id: drill_id.clone(),
            drill_type,
            target_point_in_time,
            actual_point_in_time,
            start_time,
            completion_time,
            rpo_achieved_seconds,
            rto_achieved_seconds,
            success,
            issues,
            evidence_references,
        };
        self.meta.record_drill(record.clone());

        if success {
            if let Some(ref backup_id) = exercised_backup {
                if let Err(e) = self.meta.mark_restore_tested(backup_id) {
                    warn!("Failed to mark {} restore-tested: {}", backup_id, e);
                }
            }
        }
        if let Some(ref backup_id) = exercised_backup {
            self.meta.unpin_backup(backup_id);
        }

        self.audit.append(
            AuditDraft::new(
                AuditEventType::DrillCompleted,
                exercised_backup.as_deref().unwrap_or("none"),
                "perform_restore_drill",
                if success { Outcome::Success } else { Outcome::Failure },
            )
            .severity(if success { Severity::Info } else { Severity::Warning })
            .details(serde_json::json!({
                "drill_id": record.drill_id,
                "drill_type": drill_type.to_string(),
                "rpo_achieved_seconds": record.rpo_achieved_seconds,
                "rto_achieved_seconds": record.rto_achieved_seconds,
                "issues": record.issues,
            })),
        );

        info!(
            "Restore drill {} finished: success={}, issues={}",
            drill_id,
            record.success,
            record.issues.len()
        );
        record
    }

    async fn execute_restore(
        &self,
        backup: &BackupRecord,
        target: DateTime<Utc>,
        evidence: &mut Vec<String>,
    ) -> Result<DateTime<Utc>> {
        let locations = self.meta.locations(&backup.backup_id);
        let location = pick_location(&locations)
            .ok_or_else(|| VaultError::NotFound(format!("no locations for {}", backup.backup_id)))?;

        let store = self
            .stores
            .iter()
            .find(|s| s.descriptor().name == location.provider)
            .ok_or_else(|| {
                VaultError::Config(format!("no backend registered for '{}'", location.provider))
            })?;

        let encrypted = store.get(&location.location_uri).await?;
        evidence.push(location.location_uri.clone());

        let compressed = self
            .cipher
            .decrypt(&encrypted, &backup.encryption_key_id)?;
        let plaintext = gzip_decompress(&compressed)?;

        let restored_checksum = checksum(&plaintext);
        if restored_checksum != backup.checksum {
            return Err(VaultError::Integrity(format!(
                "checksum mismatch for {}: recorded {}, restored {}",
                backup.backup_id, backup.checksum, restored_checksum
            )));
        }

        self.db.restore_to(target, &plaintext).await
    }
}

/// Prefer the primary copy for restores, fall back to any other
fn pick_location(locations: &[StorageLocation]) -> Option<&StorageLocation> {
    locations
        .iter()
        .find(|l| l.provider == "primary")
        .or_else(|| locations.first())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::engine::{BackupEngine, BackupTargets};
    use crate::config::VaultConfig;
    use crate::crypto::ChaChaCipher;
    use crate::db::SimulatedDatabase;
    use crate::metadata::MemoryMetadataStore;
    use crate::storage::{BackendDescriptor, MemoryObjectStore};

    struct Fixture {
        backup_engine: BackupEngine,
        drill_engine: DrillEngine,
        db: Arc<SimulatedDatabase>,
        meta: Arc<MemoryMetadataStore>,
        primary: Arc<MemoryObjectStore>,
    }

    fn fixture(tier: BackupTier) -> Fixture {
        let db = Arc::new(SimulatedDatabase::new("cluster snapshot payload"));
        let meta = Arc::new(MemoryMetadataStore::new());
        let audit = Arc::new(AuditLog::new());
        let cipher: Arc<dyn ArtifactCipher> = Arc::new(ChaChaCipher::new());
        let primary = Arc::new(MemoryObjectStore::new(BackendDescriptor::primary("eu-west-1")));
        let archive = Arc::new(MemoryObjectStore::new(BackendDescriptor::archive("us-east-2")));
        let cold = Arc::new(MemoryObjectStore::new(BackendDescriptor::cold("eu-central-1")));

        let backup_engine = BackupEngine::new(
            VaultConfig {
                tier,
                ..Default::default()
            },
            db.clone(),
            cipher.clone(),
            BackupTargets {
                primary: primary.clone(),
                archive: archive.clone(),
                cold: cold.clone(),
            },
            meta.clone(),
            audit.clone(),
        );
        let drill_engine = DrillEngine::new(
            db.clone(),
            cipher,
            vec![primary.clone(), archive, cold],
            meta.clone(),
            audit,
            tier,
        );

        Fixture {
            backup_engine,
            drill_engine,
            db,
            meta,
            primary,
        }
    }

    #[tokio::test]
    async fn test_successful_drill() {
        let f = fixture(BackupTier::Standard);
        let backup_id = f.backup_engine.create_base_backup(None).await.unwrap();

        let backup = f.meta.backup(&backup_id).unwrap();
        let target = backup.start_time + ChronoDuration::seconds(1);
        let record = f
            .drill_engine
            .perform_restore_drill(Some(target), DrillType::Scheduled)
            .await;

        assert!(record.success, "issues: {:?}", record.issues);
        assert!(record.issues.is_empty());
        assert!(record.rpo_achieved_seconds.unwrap() <= 900.0);
        assert!(!record.evidence_references.is_empty());

        // Successful drill flips restore_tested
        assert!(f.meta.backup(&backup_id).unwrap().restore_tested);
        // And releases its pin
        assert!(!f.meta.is_pinned(&backup_id));
    }

    #[tokio::test]
    async fn test_drill_without_backup_reports_issue() {
        let f = fixture(BackupTier::Standard);
        let record = f
            .drill_engine
            .perform_restore_drill(None, DrillType::Scheduled)
            .await;

        assert!(!record.success);
        assert!(record
            .issues
            .iter()
            .any(|i| i.contains("no suitable base backup found")));
    }

    #[tokio::test]
    async fn test_storage_failure_finalizes_drill() {
        let f = fixture(BackupTier::Standard);
        let backup_id = f.backup_engine.create_base_backup(None).await.unwrap();
        let backup = f.meta.backup(&backup_id).unwrap();

        // Restores read the primary copy; fail it
        f.primary.fail_gets(true);

        let record = f
            .drill_engine
            .perform_restore_drill(
                Some(backup.start_time + ChronoDuration::seconds(1)),
                DrillType::Gameday,
            )
            .await;

        assert!(!record.success);
        assert!(!record.issues.is_empty());
        assert!(!f.meta.backup(&backup_id).unwrap().restore_tested);
        assert!(!f.meta.is_pinned(&backup_id));
        // The record was still persisted
        assert_eq!(f.meta.list_drills().len(), 1);
    }

    #[tokio::test]
    async fn test_excessive_lag_fails_rpo() {
        let f = fixture(BackupTier::Critical);
        let backup_id = f.backup_engine.create_base_backup(None).await.unwrap();
        let backup = f.meta.backup(&backup_id).unwrap();

        // Critical tier allows 60s RPO; lag of 5 minutes exceeds it
        f.db.set_replication_lag(std::time::Duration::from_secs(300));

        let record = f
            .drill_engine
            .perform_restore_drill(
                Some(backup.start_time + ChronoDuration::seconds(1)),
                DrillType::Scheduled,
            )
            .await;

        assert!(!record.success);
        assert!(record.issues.iter().any(|i| i.contains("RPO target exceeded")));
        assert!(!f.meta.backup(&backup_id).unwrap().restore_tested);
    }

    #[tokio::test]
    async fn test_restore_failure_finalizes_drill() {
        let f = fixture(BackupTier::Standard);
        let backup_id = f.backup_engine.create_base_backup(None).await.unwrap();
        let backup = f.meta.backup(&backup_id).unwrap();

        f.db.fail_restores(true);

        let record = f
            .drill_engine
            .perform_restore_drill(
                Some(backup.start_time + ChronoDuration::seconds(1)),
                DrillType::Incident,
            )
            .await;

        assert!(!record.success);
        assert!(record.issues.iter().any(|i| i.contains("executing")));
    }

    #[tokio::test]
    async fn test_drill_history_is_append_only() {
        let f = fixture(BackupTier::Standard);
        let backup_id = f.backup_engine.create_base_backup(None).await.unwrap();
        let backup = f.meta.backup(&backup_id).unwrap();
        let target = backup.start_time + ChronoDuration::seconds(1);

        let first = f
            .drill_engine
            .perform_restore_drill(Some(target), DrillType::Scheduled)
            .await;
        let second = f
            .drill_engine
            .perform_restore_drill(Some(target), DrillType::Scheduled)
            .await;

        assert_ne!(first.drill_id, second.drill_id);
        assert_eq!(f.meta.list_drills().len(), 2);
    }
}
