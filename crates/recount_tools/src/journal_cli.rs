#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;

use recount_kernel_contracts::slot::{SlotRecord, SlotRecordId};
use recount_storage::slot_store::{read_journal, SlotStore};

pub const USAGE: &str = "usage: recount <verify|summary|inspect> <journal_path> [record_id]";

/// Offline journal commands. Never writes to the journal.
pub fn execute_journal_command(
    subcommand: &str,
    journal_path: &Path,
    record_id: Option<&str>,
) -> Result<String, String> {
    if !journal_path.is_file() {
        return Err(format!("journal not found: {}", journal_path.display()));
    }
    match subcommand {
        "verify" => {
            let events =
                read_journal(journal_path).map_err(|e| format!("journal verify failed: {e}"))?;
            let store = open(journal_path)?;
            let current = store
                .current_rows()
                .map_err(|e| format!("failed to read projection: {e}"))?;
            store
                .rebuild_current_from_ledger()
                .map_err(|e| format!("failed to rebuild projection: {e}"))?;
            let rebuilt = store
                .current_rows()
                .map_err(|e| format!("failed to read projection: {e}"))?;
            if rebuilt != current {
                return Err("projection rebuilt from ledger does not match replay".to_string());
            }
            Ok(format!("OK events={} records={}", events.len(), current.len()))
        }
        "summary" => {
            let store = open(journal_path)?;
            let current = store
                .current_rows()
                .map_err(|e| format!("failed to read projection: {e}"))?;
            let mut by_status: BTreeMap<&'static str, usize> = BTreeMap::new();
            let mut finalized = 0;
            for r in current.values() {
                *by_status.entry(r.status.as_str()).or_default() += 1;
                if r.finalized {
                    finalized += 1;
                }
            }
            let mut lines: Vec<String> = by_status
                .into_iter()
                .map(|(status, n)| format!("{status}={n}"))
                .collect();
            lines.push(format!("finalized={finalized}"));
            lines.push(format!("total={}", current.len()));
            Ok(lines.join("\n"))
        }
        "inspect" => {
            let store = open(journal_path)?;
            match record_id {
                None => {
                    let current = store
                        .current_rows()
                        .map_err(|e| format!("failed to read projection: {e}"))?;
                    Ok(current
                        .values()
                        .map(record_line)
                        .collect::<Vec<_>>()
                        .join("\n"))
                }
                Some(raw) => {
                    let id = raw
                        .trim()
                        .parse::<u64>()
                        .ok()
                        .filter(|v| *v > 0)
                        .ok_or_else(|| format!("record_id must be a positive integer, got '{raw}'"))?;
                    let events = store
                        .events_for(SlotRecordId(id))
                        .map_err(|e| format!("failed to read ledger: {e}"))?;
                    if events.is_empty() {
                        return Err(format!("no events for record {id}"));
                    }
                    Ok(events
                        .iter()
                        .map(|e| {
                            format!(
                                "event={} action={:?} actor={} at={} digest={} | {}",
                                e.event_id,
                                e.action,
                                e.actor_id.as_str(),
                                e.recorded_at.0,
                                e.record_digest,
                                record_line(&e.record)
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n"))
                }
            }
        }
        _ => Err(format!(
            "unknown subcommand: {subcommand}. expected one of: verify, summary, inspect"
        )),
    }
}

fn open(path: &Path) -> Result<SlotStore, String> {
    SlotStore::open_journal(path)
        .map_err(|e| format!("failed to open journal '{}': {e}", path.display()))
}

fn record_line(r: &SlotRecord) -> String {
    let quantities = [
        Some(r.quantity_primary),
        r.quantity_secondary,
        r.quantity_tertiary,
    ]
    .into_iter()
    .flatten()
    .map(|q| q.value().to_string())
    .collect::<Vec<_>>()
    .join("/");
    format!(
        "#{} v{} {}/{}/{}/{} status={} counts={} final={} finalized={}",
        r.record_id.0,
        r.version,
        r.key.inventory_id.as_str(),
        r.key.location_code.as_str(),
        r.key.item_code.as_str(),
        r.key.lot.as_ref().map(|l| l.as_str()).unwrap_or("-"),
        r.status.as_str(),
        quantities,
        r.quantity_final
            .map(|q| q.value().to_string())
            .unwrap_or_else(|| "-".to_string()),
        r.finalized
    )
}

#[cfg(test)]
mod tests {
    use super::execute_journal_command;
    use recount_kernel_contracts::slot::{
        ActorId, InventoryId, ItemCode, LocationCode, Quantity, SlotKey, SlotLedgerAction,
        SlotMetadata, SlotRecord, SlotStatus,
    };
    use recount_kernel_contracts::MonotonicTimeNs;
    use recount_storage::slot_store::SlotStore;
    use rust_decimal::Decimal;
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_journal() -> PathBuf {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(1);
        std::env::temp_dir().join(format!("recount-journal-cli-test-{suffix}.jsonl"))
    }

    fn seeded_journal() -> PathBuf {
        let path = temp_journal();
        let store = SlotStore::open_journal(&path).unwrap();
        let op = ActorId::new("op_1").unwrap();
        let key = SlotKey::v1(
            InventoryId::new("inv_1").unwrap(),
            LocationCode::new("A-01").unwrap(),
            ItemCode::new("SKU-1").unwrap(),
            None,
        );
        let first = store
            .insert_if_absent(
                SlotRecord::new_primary_v1(
                    key,
                    Quantity::new(Decimal::from(100)).unwrap(),
                    op.clone(),
                    MonotonicTimeNs(1),
                    true,
                    SlotMetadata::default(),
                )
                .unwrap(),
                &op,
                MonotonicTimeNs(1),
            )
            .unwrap();
        let mut concluded = first.clone();
        concluded.quantity_secondary = Some(Quantity::new(Decimal::from(100)).unwrap());
        concluded.secondary_contributor = Some(ActorId::new("op_2").unwrap());
        concluded.secondary_counted_at = Some(MonotonicTimeNs(2));
        concluded.phase_count = 2;
        concluded.status = SlotStatus::Concluded;
        concluded.quantity_final = Some(Quantity::new(Decimal::from(100)).unwrap());
        concluded.may_advance = false;
        store
            .compare_and_swap(
                first.version,
                concluded,
                SlotLedgerAction::SecondaryAccepted,
                &op,
                MonotonicTimeNs(2),
            )
            .unwrap();
        path
    }

    #[test]
    fn at_journal_cli_01_verify_summary_inspect() {
        let path = seeded_journal();
        assert_eq!(
            execute_journal_command("verify", &path, None).unwrap(),
            "OK events=2 records=1"
        );
        let summary = execute_journal_command("summary", &path, None).unwrap();
        assert!(summary.contains("concluded=1"));
        assert!(summary.contains("total=1"));

        let listing = execute_journal_command("inspect", &path, None).unwrap();
        assert!(listing
            .contains("#1 v2 inv_1/A-01/SKU-1/- status=concluded counts=100/100 final=100"));
        let history = execute_journal_command("inspect", &path, Some("1")).unwrap();
        assert_eq!(history.lines().count(), 2);
        assert!(execute_journal_command("inspect", &path, Some("0")).is_err());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn at_journal_cli_02_verify_rejects_corruption_and_unknown_commands() {
        let path = seeded_journal();
        let text = fs::read_to_string(&path).unwrap();
        fs::write(
            &path,
            text.replacen("\"quantity_primary\":\"100\"", "\"quantity_primary\":\"900\"", 1),
        )
        .unwrap();
        let err = execute_journal_command("verify", &path, None).unwrap_err();
        assert!(err.contains("journal verify failed"));
        assert!(execute_journal_command("compact", &path, None).is_err());
        fs::remove_file(&path).unwrap();
        assert!(execute_journal_command("verify", &path, None).is_err());
    }
}
