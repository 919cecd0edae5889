#![forbid(unsafe_code)]

use recount_kernel_contracts::count::{Page, SlotListQuery};
use recount_kernel_contracts::slot::{
    ActorId, SlotKey, SlotLedgerAction, SlotLedgerEvent, SlotRecord, SlotRecordId,
};
use recount_kernel_contracts::MonotonicTimeNs;

use crate::slot_store::{SlotStore, StorageError};

/// Typed repository interface for slot record persistence.
///
/// Writes are conditional: the first record for a key goes through `insert_slot_row`, every
/// later change through `cas_slot_row` keyed on the version the caller read.
pub trait SlotRecordRepo: Send + Sync {
    fn insert_slot_row(
        &self,
        record: SlotRecord,
        actor_id: &ActorId,
        now: MonotonicTimeNs,
    ) -> Result<SlotRecord, StorageError>;

    fn cas_slot_row(
        &self,
        expected_version: u64,
        record: SlotRecord,
        action: SlotLedgerAction,
        actor_id: &ActorId,
        now: MonotonicTimeNs,
    ) -> Result<SlotRecord, StorageError>;

    fn slot_row_by_key(&self, key: &SlotKey) -> Result<Option<SlotRecord>, StorageError>;
    fn slot_row_by_id(&self, record_id: SlotRecordId) -> Result<Option<SlotRecord>, StorageError>;
    fn list_slot_rows(&self, query: &SlotListQuery) -> Result<Page<SlotRecord>, StorageError>;
    fn slot_event_rows(&self, record_id: SlotRecordId)
        -> Result<Vec<SlotLedgerEvent>, StorageError>;
}

impl SlotRecordRepo for SlotStore {
    fn insert_slot_row(
        &self,
        record: SlotRecord,
        actor_id: &ActorId,
        now: MonotonicTimeNs,
    ) -> Result<SlotRecord, StorageError> {
        self.insert_if_absent(record, actor_id, now)
    }

    fn cas_slot_row(
        &self,
        expected_version: u64,
        record: SlotRecord,
        action: SlotLedgerAction,
        actor_id: &ActorId,
        now: MonotonicTimeNs,
    ) -> Result<SlotRecord, StorageError> {
        self.compare_and_swap(expected_version, record, action, actor_id, now)
    }

    fn slot_row_by_key(&self, key: &SlotKey) -> Result<Option<SlotRecord>, StorageError> {
        self.get_by_key(key)
    }

    fn slot_row_by_id(&self, record_id: SlotRecordId) -> Result<Option<SlotRecord>, StorageError> {
        self.get_by_id(record_id)
    }

    fn list_slot_rows(&self, query: &SlotListQuery) -> Result<Page<SlotRecord>, StorageError> {
        self.list(query)
    }

    fn slot_event_rows(
        &self,
        record_id: SlotRecordId,
    ) -> Result<Vec<SlotLedgerEvent>, StorageError> {
        self.events_for(record_id)
    }
}
