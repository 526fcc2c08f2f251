//! Retention engine
//!
//! Removes backups and WAL archives whose retention window has elapsed.
//! Immutability holds always win over retention: a copy inside its
//! object-lock window is untouchable no matter how old the backup is, and
//! so is a backup currently pinned by an in-flight restore drill.
//!
//! Deletion order is physical-first. Metadata is removed only after every
//! copy is gone; a failed delete leaves the backup's metadata in place so
//! the next pass retries it.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::audit::{AuditDraft, AuditEventType, AuditLog, Outcome, Severity};
use crate::config::VaultConfig;
use crate::metadata::{MetadataStore, StorageLocation};
use crate::storage::ObjectStore;

/// Retention enforcement engine
pub struct RetentionEngine {
    config: VaultConfig,
    stores: Vec<Arc<dyn ObjectStore>>,
    meta: Arc<dyn MetadataStore>,
    audit: Arc<AuditLog>,
}

impl RetentionEngine {
    /// Create a retention engine over injected collaborators
    pub fn new(
        config: VaultConfig,
        stores: Vec<Arc<dyn ObjectStore>>,
        meta: Arc<dyn MetadataStore>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            config,
            stores,
            meta,
            audit,
        }
    }

    /// Run one cleanup pass over expired backups and WAL archives.
    ///
    /// Returns how many base backups were fully removed. Per-backup
    /// failures are isolated: a backend refusing one delete never stops
    /// the pass.
    pub async fn cleanup_expired_backups(&self) -> usize {
        let now = Utc::now();
        let cutoff = now - ChronoDuration::days(self.config.retention_days() as i64);
        info!(
            "Retention pass started (retention={}d, cutoff={})",
            self.config.retention_days(),
            cutoff
        );

        let mut removed = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;

        for backup in self.meta.list_backups() {
            if backup.start_time >= cutoff {
                continue;
            }
            if under_immutability_hold(backup.immutable_until, now) {
                debug!(
                    "Backup {} expired but held immutable until {:?}",
                    backup.backup_id, backup.immutable_until
                );
                skipped += 1;
                continue;
            }
            if self.meta.is_pinned(&backup.backup_id) {
                debug!(
                    "Backup {} expired but referenced by an in-flight drill",
                    backup.backup_id
                );
                skipped += 1;
                continue;
            }

            let locations = self.meta.locations(&backup.backup_id);
            if self.delete_copies(&backup.backup_id, &locations, now).await {
                match self.meta.remove_backup(&backup.backup_id) {
                    Ok(()) => {
                        info!("Backup removed by retention: {}", backup.backup_id);
                        removed += 1;
                    }
                    Err(e) => {
                        warn!("Failed to remove metadata for {}: {}", backup.backup_id, e);
                        failed += 1;
                    }
                }
            } else {
                failed += 1;
            }
        }

        let wal_removed = self.cleanup_expired_wal(now, cutoff).await;

        self.audit.append(
            AuditDraft::new(
                AuditEventType::RetentionCleanup,
                "retention",
                "cleanup_expired_backups",
                if failed == 0 { Outcome::Success } else { Outcome::Partial },
            )
            .severity(if failed == 0 { Severity::Info } else { Severity::Warning })
            .details(serde_json::json!({
                "backups_removed": removed,
                "backups_skipped": skipped,
                "backups_failed": failed,
                "wal_segments_removed": wal_removed,
            })),
        );

        info!(
            "Retention pass finished: {} backups removed, {} skipped, {} failed, {} WAL segments removed",
            removed, skipped, failed, wal_removed
        );
        removed
    }

    /// Delete every physical copy. Returns false if any copy survives, in
    /// which case metadata must stay so the next pass retries.
    async fn delete_copies(
        &self,
        backup_id: &str,
        locations: &[StorageLocation],
        now: DateTime<Utc>,
    ) -> bool {
        let mut all_deleted = true;
        for location in locations {
            if under_immutability_hold(location.immutable_until, now) {
                warn!(
                    "Copy {} still object-locked; deferring removal of {}",
                    location.location_uri, backup_id
                );
                all_deleted = false;
                continue;
            }
            let Some(store) = self.store_for(&location.provider) else {
                warn!(
                    "No backend registered for '{}'; deferring removal of {}",
                    location.provider, backup_id
                );
                all_deleted = false;
                continue;
            };
            match store.delete(&location.location_uri).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(
                        "Failed to delete {} on backend {}: {}",
                        location.location_uri, location.provider, e
                    );
                    all_deleted = false;
                }
            }
        }
        all_deleted
    }

    async fn cleanup_expired_wal(&self, now: DateTime<Utc>, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0usize;
        for segment in self.meta.list_wal_segments() {
            if segment.archived_at >= cutoff {
                continue;
            }
            if under_immutability_hold(segment.immutable_until, now) {
                continue;
            }
            if !self
                .delete_copies(&segment.wal_filename, &segment.locations, now)
                .await
            {
                continue;
            }
            match self.meta.remove_wal_segment(&segment.wal_filename) {
                Ok(()) => {
                    debug!("WAL archive removed by retention: {}", segment.wal_filename);
                    removed += 1;
                }
                Err(e) => {
                    warn!(
                        "Failed to remove WAL metadata for {}: {}",
                        segment.wal_filename, e
                    );
                }
            }
        }
        removed
    }

    fn store_for(&self, provider: &str) -> Option<&Arc<dyn ObjectStore>> {
        self.stores.iter().find(|s| s.descriptor().name == provider)
    }
}

fn under_immutability_hold(immutable_until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    matches!(immutable_until, Some(until) if until > now)
}
