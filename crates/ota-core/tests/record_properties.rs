//! Property-based tests for update record persistence and boot recovery.

use ota_common::{FilePair, UpdateRecord, UpdateStatus, MARKER_KEY, RECORD_KEY};
use ota_core::test_utils::{MemStore, TestRig};
use ota_core::update::{BootOutcome, RecordOrigin, RecordStore};
use proptest::prelude::*;

fn slot_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,11}"
}

fn record_strategy() -> impl Strategy<Value = UpdateRecord> {
    prop_oneof![
        Just(UpdateRecord::committed()),
        slot_name().prop_map(UpdateRecord::pending_for),
        prop::collection::vec(slot_name(), 1..4).prop_map(|names| UpdateRecord {
            status: UpdateStatus::Pending,
            files: names.into_iter().map(FilePair::staged).collect(),
        }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    /// Whatever bytes sit in the record slot, loading yields a record and
    /// leaves a parsable record behind.
    #[test]
    fn any_stored_bytes_load_and_self_heal(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let store = MemStore::new();
        store.put(RECORD_KEY, &bytes);
        let records = RecordStore::new(&store, RECORD_KEY, MARKER_KEY);

        let (record, origin) = records.load_with_origin().expect("reads never fail here");
        match origin {
            RecordOrigin::Stored => {
                prop_assert_eq!(store.get(RECORD_KEY), Some(bytes));
            }
            RecordOrigin::Repaired | RecordOrigin::Defaulted => {
                prop_assert_eq!(&record, &UpdateRecord::committed());
                let healed = store.get(RECORD_KEY).expect("default written back");
                prop_assert_eq!(UpdateRecord::from_bytes(&healed).ok(), Some(UpdateRecord::committed()));
            }
        }

        // A second load is stable.
        let again = records.load().expect("reads never fail here");
        prop_assert_eq!(again, record);
    }

    #[test]
    fn saved_records_load_back(record in record_strategy()) {
        let store = MemStore::new();
        let records = RecordStore::new(&store, RECORD_KEY, MARKER_KEY);
        records.save(&record).expect("memory store accepts writes");

        let (loaded, origin) = records.load_with_origin().expect("reads never fail here");
        prop_assert_eq!(origin, RecordOrigin::Stored);
        prop_assert_eq!(loaded, record);
    }

    /// Boot never fails on a garbage record and never leaves a swap marker.
    #[test]
    fn boot_survives_garbage_record(bytes in prop::collection::vec(any::<u8>(), 0..128)) {
        let rig = TestRig::new();
        rig.store.put("app", b"v1");
        rig.store.put(RECORD_KEY, &bytes);

        let outcome = rig.updater().boot().expect("boot tolerates any record");
        prop_assert!(!matches!(outcome, BootOutcome::Trial { .. }));
        prop_assert_eq!(rig.store.get(MARKER_KEY), None);
        prop_assert_eq!(rig.store.get_string("app").as_deref(), Some("v1"));
    }
}
