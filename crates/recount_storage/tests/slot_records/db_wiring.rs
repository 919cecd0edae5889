#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use recount_kernel_contracts::count::{PageRequest, SlotListFilter, SlotListQuery};
use recount_kernel_contracts::slot::{
    ActorId, InventoryId, ItemCode, LocationCode, LotCode, Quantity, SlotKey, SlotLedgerAction,
    SlotMetadata, SlotRecord, SlotRecordId, SlotStatus,
};
use recount_kernel_contracts::MonotonicTimeNs;
use recount_storage::repo::SlotRecordRepo;
use recount_storage::slot_store::{slot_record_digest, SlotStore, StorageError};
use rust_decimal::Decimal;

fn op() -> ActorId {
    ActorId::new("dbw_op_1").unwrap()
}

fn key(inv: &str, loc: &str, item: &str) -> SlotKey {
    SlotKey::v1(
        InventoryId::new(inv).unwrap(),
        LocationCode::new(loc).unwrap(),
        ItemCode::new(item).unwrap(),
        None,
    )
}

fn primary(k: SlotKey, q: i64) -> SlotRecord {
    SlotRecord::new_primary_v1(
        k,
        Quantity::new(Decimal::from(q)).unwrap(),
        op(),
        MonotonicTimeNs(10),
        true,
        SlotMetadata::default(),
    )
    .unwrap()
}

fn with_divergent_secondary(mut r: SlotRecord, q: i64) -> SlotRecord {
    r.quantity_secondary = Some(Quantity::new(Decimal::from(q)).unwrap());
    r.secondary_contributor = Some(ActorId::new("dbw_op_2").unwrap());
    r.secondary_counted_at = Some(MonotonicTimeNs(20));
    r.phase_count = 2;
    r.status = SlotStatus::Divergent;
    r.may_advance = false;
    r
}

fn temp_journal(tag: &str) -> std::path::PathBuf {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("recount_db_wiring_{tag}_{seed}.jsonl"))
}

#[test]
fn at_slot_db_01_insert_assigns_id_version_and_ledger_row() {
    let s = SlotStore::new_in_memory();
    let stored = s
        .insert_slot_row(primary(key("inv_1", "A-01", "SKU-1"), 5), &op(), MonotonicTimeNs(10))
        .unwrap();
    assert_eq!(stored.record_id, SlotRecordId(1));
    assert_eq!(stored.version, 1);

    let events = s.slot_event_rows(stored.record_id).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, SlotLedgerAction::Created);
    assert_eq!(events[0].record, stored);
    assert_eq!(events[0].record_digest, slot_record_digest(&stored).unwrap());
}

#[test]
fn at_slot_db_02_second_insert_for_same_key_is_duplicate() {
    let s = SlotStore::new_in_memory();
    let k = key("inv_1", "A-01", "SKU-1");
    s.insert_slot_row(primary(k.clone(), 5), &op(), MonotonicTimeNs(10))
        .unwrap();
    assert!(matches!(
        s.insert_slot_row(primary(k.clone(), 7), &op(), MonotonicTimeNs(11)),
        Err(StorageError::DuplicateKey { .. })
    ));

    let mut lotted = k.clone();
    lotted.lot = Some(LotCode::new("LOT-1").unwrap());
    assert!(s
        .insert_slot_row(primary(lotted, 7), &op(), MonotonicTimeNs(12))
        .is_ok());
    assert_eq!(s.ledger_rows().unwrap().len(), 2);
}

#[test]
fn at_slot_db_03_stale_version_is_rejected_without_side_effects() {
    let s = SlotStore::new_in_memory();
    let first = s
        .insert_slot_row(primary(key("inv_1", "A-01", "SKU-1"), 5), &op(), MonotonicTimeNs(10))
        .unwrap();
    let mut merged = first.clone();
    merged.quantity_primary = Quantity::new(Decimal::from(9)).unwrap();
    let v2 = s
        .cas_slot_row(1, merged.clone(), SlotLedgerAction::PrimaryMerged, &op(), MonotonicTimeNs(11))
        .unwrap();
    assert_eq!(v2.version, 2);

    let out = s.cas_slot_row(1, merged, SlotLedgerAction::PrimaryMerged, &op(), MonotonicTimeNs(12));
    assert!(matches!(
        out,
        Err(StorageError::VersionConflict {
            expected: 1,
            found: 2,
            ..
        })
    ));
    assert_eq!(s.ledger_rows().unwrap().len(), 2);
    assert_eq!(s.slot_row_by_id(first.record_id).unwrap(), Some(v2));
}

#[test]
fn at_slot_db_04_status_never_moves_backwards() {
    let s = SlotStore::new_in_memory();
    let first = s
        .insert_slot_row(primary(key("inv_1", "A-01", "SKU-1"), 100), &op(), MonotonicTimeNs(10))
        .unwrap();
    let divergent = s
        .cas_slot_row(
            1,
            with_divergent_secondary(first.clone(), 130),
            SlotLedgerAction::SecondaryAccepted,
            &op(),
            MonotonicTimeNs(20),
        )
        .unwrap();
    let mut back = first;
    back.record_id = divergent.record_id;
    assert!(matches!(
        s.cas_slot_row(2, back, SlotLedgerAction::PrimaryMerged, &op(), MonotonicTimeNs(21)),
        Err(StorageError::StatusRegression { .. })
    ));
}

#[test]
fn at_slot_db_05_sealed_record_rejects_every_write() {
    let s = SlotStore::new_in_memory();
    let first = s
        .insert_slot_row(primary(key("inv_1", "A-01", "SKU-1"), 100), &op(), MonotonicTimeNs(10))
        .unwrap();
    let mut sealed = first.clone();
    sealed.finalized = true;
    sealed.finalized_at = Some(MonotonicTimeNs(30));
    sealed.finalized_by = Some(ActorId::new("dbw_sup").unwrap());
    sealed.may_advance = false;
    let sealed = s
        .cas_slot_row(1, sealed, SlotLedgerAction::Finalized, &op(), MonotonicTimeNs(30))
        .unwrap();
    let digest_before = slot_record_digest(&sealed).unwrap();

    let mut reopen = sealed.clone();
    reopen.may_advance = true;
    assert!(matches!(
        s.cas_slot_row(2, reopen, SlotLedgerAction::PhaseReleased, &op(), MonotonicTimeNs(31)),
        Err(StorageError::SealedRecord { record_id: 1 })
    ));
    let after = s.slot_row_by_id(first.record_id).unwrap().unwrap();
    assert_eq!(slot_record_digest(&after).unwrap(), digest_before);
}

#[test]
fn at_slot_db_06_list_filters_and_pages_with_cursor() {
    let s = SlotStore::new_in_memory();
    for i in 0..5 {
        s.insert_slot_row(
            primary(key("inv_1", &format!("A-{i:02}"), "SKU-1"), 100),
            &op(),
            MonotonicTimeNs(10),
        )
        .unwrap();
    }
    s.insert_slot_row(primary(key("inv_2", "A-00", "SKU-1"), 1), &op(), MonotonicTimeNs(10))
        .unwrap();
    let third = s
        .slot_row_by_key(&key("inv_1", "A-02", "SKU-1"))
        .unwrap()
        .unwrap();
    s.cas_slot_row(
        1,
        with_divergent_secondary(third, 150),
        SlotLedgerAction::SecondaryAccepted,
        &op(),
        MonotonicTimeNs(20),
    )
    .unwrap();

    let mut query = SlotListQuery {
        inventory_id: InventoryId::new("inv_1").unwrap(),
        filter: SlotListFilter::default(),
        page: PageRequest {
            cursor: None,
            limit: 2,
        },
    };
    let mut seen = Vec::new();
    loop {
        let page = s.list_slot_rows(&query).unwrap();
        assert!(page.items.len() <= 2);
        seen.extend(page.items.iter().map(|r| r.key.location_code.as_str().to_string()));
        match page.next_cursor {
            Some(c) => query.page.cursor = Some(c),
            None => break,
        }
    }
    assert_eq!(seen, vec!["A-00", "A-01", "A-02", "A-03", "A-04"]);

    query.page = PageRequest::default();
    query.filter.divergent_only = true;
    let divergent = s.list_slot_rows(&query).unwrap();
    assert_eq!(divergent.items.len(), 1);
    assert_eq!(divergent.items[0].key.location_code.as_str(), "A-02");
    assert_eq!(divergent.next_cursor, None);

    query.page.cursor = Some("garbage".to_string());
    assert!(matches!(
        s.list_slot_rows(&query),
        Err(StorageError::ContractViolation(_))
    ));
}

#[test]
fn at_slot_db_07_rebuild_current_from_ledger_is_exact() {
    let s = SlotStore::new_in_memory();
    let first = s
        .insert_slot_row(primary(key("inv_1", "A-01", "SKU-1"), 100), &op(), MonotonicTimeNs(10))
        .unwrap();
    s.cas_slot_row(
        1,
        with_divergent_secondary(first, 130),
        SlotLedgerAction::SecondaryAccepted,
        &op(),
        MonotonicTimeNs(20),
    )
    .unwrap();
    s.insert_slot_row(primary(key("inv_1", "B-01", "SKU-2"), 3), &op(), MonotonicTimeNs(11))
        .unwrap();

    let before = s.current_rows().unwrap();
    s.rebuild_current_from_ledger().unwrap();
    assert_eq!(s.current_rows().unwrap(), before);
    assert!(matches!(
        s.attempt_overwrite_slot_event(1),
        Err(StorageError::AppendOnlyViolation { .. })
    ));
}

#[test]
fn at_slot_db_08_journal_replays_into_identical_tables() {
    let path = temp_journal("replay");
    {
        let s = SlotStore::open_journal(&path).unwrap();
        let first = s
            .insert_slot_row(primary(key("inv_1", "A-01", "SKU-1"), 100), &op(), MonotonicTimeNs(10))
            .unwrap();
        s.cas_slot_row(
            1,
            with_divergent_secondary(first, 130),
            SlotLedgerAction::SecondaryAccepted,
            &op(),
            MonotonicTimeNs(20),
        )
        .unwrap();
    }
    let reopened = SlotStore::open_journal(&path).unwrap();
    let rows = reopened.ledger_rows().unwrap();
    assert_eq!(rows.len(), 2);
    let current = reopened.slot_row_by_id(SlotRecordId(1)).unwrap().unwrap();
    assert_eq!(current.status, SlotStatus::Divergent);
    assert_eq!(current.version, 2);

    let next = reopened
        .insert_slot_row(primary(key("inv_1", "C-01", "SKU-1"), 1), &op(), MonotonicTimeNs(30))
        .unwrap();
    assert_eq!(next.record_id, SlotRecordId(2));
    let _ = std::fs::remove_file(&path);
}

#[test]
fn at_slot_db_09_tampered_journal_is_refused() {
    let path = temp_journal("tamper");
    {
        let s = SlotStore::open_journal(&path).unwrap();
        s.insert_slot_row(primary(key("inv_1", "A-01", "SKU-1"), 100), &op(), MonotonicTimeNs(10))
            .unwrap();
    }
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, text.replace("\"quantity_primary\":\"100\"", "\"quantity_primary\":\"900\""))
        .unwrap();
    assert!(matches!(
        SlotStore::open_journal(&path),
        Err(StorageError::CorruptJournal { line: 1, .. })
    ));
    let _ = std::fs::remove_file(&path);
}

#[test]
fn at_slot_db_10_journal_failure_leaves_memory_untouched() {
    let path = temp_journal("unavailable");
    let s = SlotStore::open_journal(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    std::fs::create_dir_all(&path).unwrap();

    let out = s.insert_slot_row(primary(key("inv_1", "A-01", "SKU-1"), 1), &op(), MonotonicTimeNs(10));
    assert!(matches!(out, Err(StorageError::Unavailable(_))));
    assert!(s.ledger_rows().unwrap().is_empty());
    assert_eq!(s.slot_row_by_key(&key("inv_1", "A-01", "SKU-1")).unwrap(), None);
    let _ = std::fs::remove_dir_all(&path);
}
