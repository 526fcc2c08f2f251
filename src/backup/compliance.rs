//! 3-2-1 compliance evaluation
//!
//! A backup satisfies the 3-2-1 policy when it has at least 3 copies, on at
//! least 2 distinct storage classes, with at least 1 copy that is immutable
//! or offline. Evaluation is a pure function over the location set; each
//! failed clause produces its own violation message so operators can see
//! exactly which dimension failed.

use std::collections::HashSet;

use chrono::Utc;

use crate::metadata::{ComplianceRecord, StorageLocation};
use crate::storage::StorageClass;

/// Minimum copies required
pub const MIN_COPIES: usize = 3;

/// Minimum distinct storage classes required
pub const MIN_MEDIA_TYPES: usize = 2;

/// Minimum immutable/offline copies required
pub const MIN_OFFLINE_COPIES: usize = 1;

/// Whether one copy counts as immutable/offline
fn is_offline_immutable(location: &StorageLocation) -> bool {
    location.storage_class == StorageClass::Immutable || location.immutable_until.is_some()
}

/// Evaluate a backup's location set against the 3-2-1 policy.
pub fn evaluate(backup_id: &str, locations: &[StorageLocation]) -> ComplianceRecord {
    let total_copies = locations.len();

    let distinct_media: HashSet<StorageClass> =
        locations.iter().map(|l| l.storage_class).collect();
    let distinct_media_count = distinct_media.len();

    let offline_immutable_count = locations.iter().filter(|l| is_offline_immutable(l)).count();

    let mut violations = Vec::new();
    if total_copies < MIN_COPIES {
        violations.push(format!(
            "insufficient copies: {} of {} required",
            total_copies, MIN_COPIES
        ));
    }
    if distinct_media_count < MIN_MEDIA_TYPES {
        violations.push(format!(
            "insufficient media diversity: {} distinct storage types of {} required",
            distinct_media_count, MIN_MEDIA_TYPES
        ));
    }
    if offline_immutable_count < MIN_OFFLINE_COPIES {
        violations.push(format!(
            "no immutable/offline copy: {} of {} required",
            offline_immutable_count, MIN_OFFLINE_COPIES
        ));
    }

    ComplianceRecord {
        backup_id: backup_id.to_string(),
        total_copies,
        distinct_media_count,
        offline_immutable_count,
        compliant: violations.is_empty(),
        violations,
        evaluated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn location(class: StorageClass, immutable: bool) -> StorageLocation {
        StorageLocation {
            backup_id: "b1".to_string(),
            provider: "test".to_string(),
            region: "eu-west-1".to_string(),
            bucket: "bucket".to_string(),
            object_key: "base/b1".to_string(),
            location_uri: "mem://test/bucket/base/b1".to_string(),
            storage_class: class,
            size_bytes: 100,
            checksum: "abc".to_string(),
            immutable_until: immutable.then(|| Utc::now() + Duration::days(14)),
            access_verified_at: None,
        }
    }

    #[test]
    fn test_compliant_set() {
        let locations = vec![
            location(StorageClass::CloudStandard, false),
            location(StorageClass::CloudArchive, false),
            location(StorageClass::CloudCold, true),
        ];
        let record = evaluate("b1", &locations);
        assert!(record.compliant);
        assert!(record.violations.is_empty());
        assert_eq!(record.total_copies, 3);
        assert_eq!(record.distinct_media_count, 3);
        assert_eq!(record.offline_immutable_count, 1);
    }

    #[test]
    fn test_immutable_class_counts_as_offline() {
        let locations = vec![
            location(StorageClass::CloudStandard, false),
            location(StorageClass::CloudArchive, false),
            location(StorageClass::Immutable, false),
        ];
        assert!(evaluate("b1", &locations).compliant);
    }

    #[test]
    fn test_too_few_copies() {
        let locations = vec![
            location(StorageClass::CloudStandard, false),
            location(StorageClass::CloudCold, true),
        ];
        let record = evaluate("b1", &locations);
        assert!(!record.compliant);
        assert_eq!(record.violations.len(), 1);
        assert!(record.violations[0].contains("insufficient copies"));
    }

    #[test]
    fn test_single_media_type() {
        let locations = vec![
            location(StorageClass::CloudStandard, false),
            location(StorageClass::CloudStandard, false),
            location(StorageClass::CloudStandard, true),
        ];
        let record = evaluate("b1", &locations);
        assert!(!record.compliant);
        assert_eq!(record.violations.len(), 1);
        assert!(record.violations[0].contains("media diversity"));
    }

    #[test]
    fn test_no_immutable_copy() {
        let locations = vec![
            location(StorageClass::CloudStandard, false),
            location(StorageClass::CloudArchive, false),
            location(StorageClass::CloudCold, false),
        ];
        let record = evaluate("b1", &locations);
        assert!(!record.compliant);
        assert_eq!(record.violations.len(), 1);
        assert!(record.violations[0].contains("immutable/offline"));
    }

    #[test]
    fn test_empty_set_fails_every_clause() {
        let record = evaluate("b1", &[]);
        assert!(!record.compliant);
        assert_eq!(record.violations.len(), 3);
    }
}
