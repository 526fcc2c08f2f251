//! Property-based tests for the 3-2-1 compliance evaluation: for any
//! location set, the verdict must equal the conjunction of the three
//! clauses computed independently, and each failed clause must surface
//! exactly one violation message.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use proptest::prelude::*;

use walvault::backup::compliance::{self, MIN_COPIES, MIN_MEDIA_TYPES, MIN_OFFLINE_COPIES};
use walvault::metadata::StorageLocation;
use walvault::storage::StorageClass;

fn any_storage_class() -> impl Strategy<Value = StorageClass> {
    prop_oneof![
        Just(StorageClass::PrimaryDisk),
        Just(StorageClass::CloudStandard),
        Just(StorageClass::CloudArchive),
        Just(StorageClass::CloudCold),
        Just(StorageClass::Tape),
        Just(StorageClass::Immutable),
    ]
}

fn any_location() -> impl Strategy<Value = StorageLocation> {
    (any_storage_class(), any::<bool>(), 0u64..10_000_000).prop_map(
        |(class, locked, size_bytes)| StorageLocation {
            backup_id: "b1".to_string(),
            provider: "prop".to_string(),
            region: "eu-west-1".to_string(),
            bucket: "bucket".to_string(),
            object_key: "base/b1".to_string(),
            location_uri: "mem://prop/bucket/base/b1".to_string(),
            storage_class: class,
            size_bytes,
            checksum: "abc".to_string(),
            immutable_until: locked.then(|| Utc::now() + Duration::days(14)),
            access_verified_at: None,
        },
    )
}

proptest! {
    #[test]
    fn verdict_matches_clause_conjunction(locations in prop::collection::vec(any_location(), 0..6)) {
        let record = compliance::evaluate("b1", &locations);

        let distinct: HashSet<StorageClass> = locations.iter().map(|l| l.storage_class).collect();
        let offline = locations
            .iter()
            .filter(|l| l.storage_class == StorageClass::Immutable || l.immutable_until.is_some())
            .count();

        let expected = locations.len() >= MIN_COPIES
            && distinct.len() >= MIN_MEDIA_TYPES
            && offline >= MIN_OFFLINE_COPIES;

        prop_assert_eq!(record.compliant, expected);
        prop_assert_eq!(record.total_copies, locations.len());
        prop_assert_eq!(record.distinct_media_count, distinct.len());
        prop_assert_eq!(record.offline_immutable_count, offline);
    }

    #[test]
    fn one_violation_per_failed_clause(locations in prop::collection::vec(any_location(), 0..6)) {
        let record = compliance::evaluate("b1", &locations);

        let mut expected_violations = 0;
        if record.total_copies < MIN_COPIES {
            expected_violations += 1;
        }
        if record.distinct_media_count < MIN_MEDIA_TYPES {
            expected_violations += 1;
        }
        if record.offline_immutable_count < MIN_OFFLINE_COPIES {
            expected_violations += 1;
        }

        prop_assert_eq!(record.violations.len(), expected_violations);
        prop_assert_eq!(record.compliant, record.violations.is_empty());
    }

    #[test]
    fn adding_a_copy_never_hurts(locations in prop::collection::vec(any_location(), 0..5), extra in any_location()) {
        let before = compliance::evaluate("b1", &locations);

        let mut grown = locations;
        grown.push(extra);
        let after = compliance::evaluate("b1", &grown);

        // Compliance is monotone in the location set
        prop_assert!(after.total_copies > before.total_copies);
        prop_assert!(after.distinct_media_count >= before.distinct_media_count);
        prop_assert!(after.offline_immutable_count >= before.offline_immutable_count);
        if before.compliant {
            prop_assert!(after.compliant);
        }
    }
}
