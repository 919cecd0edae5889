#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use base64::engine::general_purpose::URL_SAFE_NO_PAD as CURSOR_B64;
use base64::Engine;
use recount_kernel_contracts::count::{Page, SlotListQuery};
use recount_kernel_contracts::slot::{
    ActorId, SlotKey, SlotLedgerAction, SlotLedgerEvent, SlotRecord, SlotRecordId,
    SLOT_CONTRACT_VERSION,
};
use recount_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("duplicate key in {table}: {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("version conflict on record {record_id}: expected {expected}, found {found}")]
    VersionConflict {
        record_id: u64,
        expected: u64,
        found: u64,
    },
    #[error("{table} row not found: {key}")]
    NotFound { table: &'static str, key: String },
    #[error("status regression on record {record_id}: {from} -> {to}")]
    StatusRegression {
        record_id: u64,
        from: &'static str,
        to: &'static str,
    },
    #[error("record {record_id} is finalized")]
    SealedRecord { record_id: u64 },
    #[error("append-only violation on {table}")]
    AppendOnlyViolation { table: &'static str },
    #[error("journal line {line} is corrupt: {reason}")]
    CorruptJournal { line: usize, reason: String },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("slot tables lock poisoned")]
    Poisoned,
    #[error("slot journal '{path}' holds a partial row: {reason}")]
    TornJournal { path: String, reason: String },
    #[error("contract violation: {0}")]
    ContractViolation(ContractViolation),
}

impl From<ContractViolation> for StorageError {
    fn from(v: ContractViolation) -> Self {
        StorageError::ContractViolation(v)
    }
}

/// Lowercase hex SHA-256 over the canonical JSON encoding of a record.
pub fn slot_record_digest(record: &SlotRecord) -> Result<String, StorageError> {
    let bytes = serde_json::to_vec(record)
        .map_err(|err| StorageError::Unavailable(format!("failed to encode slot record: {err}")))?;
    let digest = Sha256::digest(&bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    Ok(out)
}

pub fn encode_cursor(last: SlotRecordId) -> String {
    CURSOR_B64.encode(format!("slot:{}", last.0))
}

pub fn decode_cursor(cursor: &str) -> Result<SlotRecordId, ContractViolation> {
    const BAD: ContractViolation = ContractViolation::InvalidValue {
        field: "page_request.cursor",
        reason: "not a cursor issued by this store",
    };
    let raw = CURSOR_B64.decode(cursor.as_bytes()).map_err(|_| BAD)?;
    let text = String::from_utf8(raw).map_err(|_| BAD)?;
    let id = text
        .strip_prefix("slot:")
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or(BAD)?;
    Ok(SlotRecordId(id))
}

#[derive(Debug, Default)]
struct SlotTables {
    slot_events: Vec<SlotLedgerEvent>,
    slot_current: BTreeMap<SlotRecordId, SlotRecord>,
    slot_key_index: BTreeMap<SlotKey, SlotRecordId>,
    next_record_id: u64,
    next_event_id: u64,
}

impl SlotTables {
    fn new() -> Self {
        Self {
            next_record_id: 1,
            next_event_id: 1,
            ..Self::default()
        }
    }

    fn apply_event_to_current(&mut self, event: &SlotLedgerEvent) {
        self.slot_key_index
            .insert(event.record.key.clone(), event.record_id);
        self.slot_current.insert(event.record_id, event.record.clone());
        self.next_record_id = self.next_record_id.max(event.record_id.0.saturating_add(1));
        self.next_event_id = self.next_event_id.max(event.event_id.saturating_add(1));
    }
}

/// Slot tables: append-only `slot_events` ledger, `slot_current` projection and a key index.
///
/// Every accepted write appends exactly one ledger event carrying the full post-write
/// snapshot, so the projection is always reproducible from the ledger. When opened with a
/// journal path, each event is written and synced before it becomes visible in memory.
#[derive(Debug)]
pub struct SlotStore {
    tables: Mutex<SlotTables>,
    journal_path: Option<PathBuf>,
}

impl SlotStore {
    pub fn new_in_memory() -> Self {
        Self {
            tables: Mutex::new(SlotTables::new()),
            journal_path: None,
        }
    }

    /// Opens (creating if needed) a JSONL journal and replays it into memory.
    pub fn open_journal(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    StorageError::Unavailable(format!(
                        "failed to create slot journal directory '{}': {err}",
                        parent.display()
                    ))
                })?;
            }
        }
        if !path.exists() {
            File::create(&path).map_err(|err| {
                StorageError::Unavailable(format!(
                    "failed to create slot journal '{}': {err}",
                    path.display()
                ))
            })?;
        }
        let mut tables = SlotTables::new();
        for event in read_journal(&path)? {
            tables.slot_events.push(event.clone());
            tables.apply_event_to_current(&event);
        }
        Ok(Self {
            tables: Mutex::new(tables),
            journal_path: Some(path),
        })
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal_path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, SlotTables>, StorageError> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Poisoned)
    }

    /// Inserts the first record for a key. A racing insert for the same key gets `DuplicateKey`.
    pub fn insert_if_absent(
        &self,
        record: SlotRecord,
        actor_id: &ActorId,
        now: MonotonicTimeNs,
    ) -> Result<SlotRecord, StorageError> {
        record.validate()?;
        let mut t = self.lock()?;
        if t.slot_key_index.contains_key(&record.key) {
            return Err(StorageError::DuplicateKey {
                table: "slot_current.key",
                key: slot_key_label(&record.key),
            });
        }
        let mut stored = record;
        stored.record_id = SlotRecordId(t.next_record_id);
        stored.version = 1;
        self.append_locked(&mut t, stored, SlotLedgerAction::Created, actor_id, now)
    }

    /// Replaces the current row only if its version still equals `expected_version`.
    pub fn compare_and_swap(
        &self,
        expected_version: u64,
        record: SlotRecord,
        action: SlotLedgerAction,
        actor_id: &ActorId,
        now: MonotonicTimeNs,
    ) -> Result<SlotRecord, StorageError> {
        if action == SlotLedgerAction::Created {
            return Err(StorageError::AppendOnlyViolation {
                table: "slot_events.created",
            });
        }
        record.validate()?;
        let mut t = self.lock()?;
        let current = t
            .slot_current
            .get(&record.record_id)
            .ok_or_else(|| StorageError::NotFound {
                table: "slot_current",
                key: record.record_id.0.to_string(),
            })?;
        if current.version != expected_version {
            return Err(StorageError::VersionConflict {
                record_id: record.record_id.0,
                expected: expected_version,
                found: current.version,
            });
        }
        if current.finalized {
            return Err(StorageError::SealedRecord {
                record_id: record.record_id.0,
            });
        }
        if current.key != record.key {
            return Err(ContractViolation::InvalidValue {
                field: "slot_record.key",
                reason: "is immutable once stored",
            }
            .into());
        }
        if record.status.rank() < current.status.rank()
            || record.phase_count < current.phase_count
        {
            return Err(StorageError::StatusRegression {
                record_id: record.record_id.0,
                from: current.status.as_str(),
                to: record.status.as_str(),
            });
        }
        let mut stored = record;
        stored.version = current.version.saturating_add(1);
        self.append_locked(&mut t, stored, action, actor_id, now)
    }

    fn append_locked(
        &self,
        t: &mut SlotTables,
        record: SlotRecord,
        action: SlotLedgerAction,
        actor_id: &ActorId,
        now: MonotonicTimeNs,
    ) -> Result<SlotRecord, StorageError> {
        let event = SlotLedgerEvent {
            schema_version: SLOT_CONTRACT_VERSION,
            event_id: t.next_event_id,
            record_id: record.record_id,
            action,
            actor_id: actor_id.clone(),
            recorded_at: now,
            record_digest: slot_record_digest(&record)?,
            record,
        };
        event.validate()?;
        // Durable first; memory only changes once the journal accepted the row.
        self.append_journal_line(&event)?;
        t.slot_events.push(event.clone());
        t.apply_event_to_current(&event);
        Ok(event.record)
    }

    fn append_journal_line(&self, event: &SlotLedgerEvent) -> Result<(), StorageError> {
        let Some(path) = self.journal_path.as_ref() else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(event).map_err(|err| {
            StorageError::Unavailable(format!("failed to encode slot journal entry: {err}"))
        })?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|err| {
                StorageError::Unavailable(format!(
                    "failed opening slot journal '{}' for append: {err}",
                    path.display()
                ))
            })?;
        append_with_rollback(&mut file, path, &line, |f, buf| {
            f.write_all(buf)?;
            f.sync_data()
        })
    }

    pub fn get_by_key(&self, key: &SlotKey) -> Result<Option<SlotRecord>, StorageError> {
        let t = self.lock()?;
        Ok(t
            .slot_key_index
            .get(key)
            .and_then(|id| t.slot_current.get(id))
            .cloned())
    }

    pub fn get_by_id(&self, record_id: SlotRecordId) -> Result<Option<SlotRecord>, StorageError> {
        Ok(self.lock()?.slot_current.get(&record_id).cloned())
    }

    /// Records of one inventory in `record_id` order, after the cursor if one is given.
    pub fn list(&self, query: &SlotListQuery) -> Result<Page<SlotRecord>, StorageError> {
        query.validate()?;
        let after = query
            .page
            .cursor
            .as_deref()
            .map(decode_cursor)
            .transpose()?;
        let limit = usize::from(query.page.limit);
        let t = self.lock()?;
        let mut items = Vec::new();
        let mut has_more = false;
        for r in t.slot_current.values() {
            if after.is_some_and(|a| r.record_id <= a) {
                continue;
            }
            if r.key.inventory_id != query.inventory_id || !query.filter.matches(r) {
                continue;
            }
            if items.len() == limit {
                has_more = true;
                break;
            }
            items.push(r.clone());
        }
        let next_cursor = if has_more {
            items.last().map(|r: &SlotRecord| encode_cursor(r.record_id))
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    pub fn events_for(&self, record_id: SlotRecordId) -> Result<Vec<SlotLedgerEvent>, StorageError> {
        Ok(self
            .lock()?
            .slot_events
            .iter()
            .filter(|e| e.record_id == record_id)
            .cloned()
            .collect())
    }

    pub fn ledger_rows(&self) -> Result<Vec<SlotLedgerEvent>, StorageError> {
        Ok(self.lock()?.slot_events.clone())
    }

    pub fn current_rows(&self) -> Result<BTreeMap<SlotRecordId, SlotRecord>, StorageError> {
        Ok(self.lock()?.slot_current.clone())
    }

    /// Ledger rows can never be edited or removed through the store.
    pub fn attempt_overwrite_slot_event(&self, _event_id: u64) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "slot_events",
        })
    }

    pub fn rebuild_current_from_ledger(&self) -> Result<(), StorageError> {
        let mut t = self.lock()?;
        t.slot_current.clear();
        t.slot_key_index.clear();
        t.next_record_id = 1;
        t.next_event_id = 1;
        for event in t.slot_events.clone() {
            t.apply_event_to_current(&event);
        }
        Ok(())
    }
}

/// Runs `write` for one journal row. On failure the file is cut back to its length before the
/// call, so a retry never lands behind partial bytes or repeats a synced row.
fn append_with_rollback<F>(
    file: &mut File,
    path: &Path,
    line: &[u8],
    write: F,
) -> Result<(), StorageError>
where
    F: FnOnce(&mut File, &[u8]) -> io::Result<()>,
{
    let prev_len = file
        .metadata()
        .map_err(|err| {
            StorageError::Unavailable(format!(
                "failed to stat slot journal '{}': {err}",
                path.display()
            ))
        })?
        .len();
    let Err(err) = write(file, line) else {
        return Ok(());
    };
    file.set_len(prev_len)
        .and_then(|_| file.sync_data())
        .map_err(|trunc_err| StorageError::TornJournal {
            path: path.display().to_string(),
            reason: format!(
                "write failed ({err}); truncate to {prev_len} bytes failed: {trunc_err}"
            ),
        })?;
    Err(StorageError::Unavailable(format!(
        "failed writing slot journal '{}': {err}",
        path.display()
    )))
}

/// Parses and checks every journal line: schema version, contract validity and digest.
pub fn read_journal(path: &Path) -> Result<Vec<SlotLedgerEvent>, StorageError> {
    let file = File::open(path).map_err(|err| {
        StorageError::Unavailable(format!(
            "failed to open slot journal '{}': {err}",
            path.display()
        ))
    })?;
    let mut out: Vec<SlotLedgerEvent> = Vec::new();
    for (line_no, line_result) in BufReader::new(file).lines().enumerate() {
        let line_no = line_no + 1;
        let line = line_result.map_err(|err| {
            StorageError::Unavailable(format!(
                "failed reading slot journal '{}' at line {line_no}: {err}",
                path.display()
            ))
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let event: SlotLedgerEvent =
            serde_json::from_str(&line).map_err(|err| StorageError::CorruptJournal {
                line: line_no,
                reason: err.to_string(),
            })?;
        if event.schema_version != SLOT_CONTRACT_VERSION {
            return Err(StorageError::CorruptJournal {
                line: line_no,
                reason: format!("unsupported schema_version={}", event.schema_version.0),
            });
        }
        event
            .validate()
            .map_err(|v| StorageError::CorruptJournal {
                line: line_no,
                reason: v.to_string(),
            })?;
        if slot_record_digest(&event.record)? != event.record_digest {
            return Err(StorageError::CorruptJournal {
                line: line_no,
                reason: "record_digest mismatch".to_string(),
            });
        }
        if out.last().is_some_and(|prev| prev.event_id >= event.event_id) {
            return Err(StorageError::CorruptJournal {
                line: line_no,
                reason: "event_id must increase".to_string(),
            });
        }
        out.push(event);
    }
    Ok(out)
}

fn slot_key_label(key: &SlotKey) -> String {
    format!(
        "{}/{}/{}/{}",
        key.inventory_id.as_str(),
        key.location_code.as_str(),
        key.item_code.as_str(),
        key.lot.as_ref().map(|l| l.as_str()).unwrap_or("-")
    )
}
