//! End-to-end checks of the ledger, the verifier and the export path working
//! together on a real database file.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use charter_core::chain::GENESIS_HASH;
use charter_core::event::EventDraft;
use charter_core::ledger::{Ledger, LedgerError};
use charter_core::time::{Clock, ManualClock};
use charter_core::toolkit::{ExportFile, export_range};
use charter_core::verify::{BreakKind, ChainVerifier, GapRange};
use rusqlite::Connection;
use serde_json::json;
use tempfile::TempDir;

const T0: u64 = 1_700_000_000_000_000_000;

fn open(dir: &TempDir, clock: &Arc<ManualClock>) -> Ledger {
    Ledger::open(dir.path().join("charter.db"), clock.clone()).expect("failed to open ledger")
}

fn fill(ledger: &Ledger, clock: &ManualClock, count: u64) {
    for n in 0..count {
        clock.advance(Duration::from_millis(1));
        ledger
            .append(EventDraft::new(
                "resolution.recorded",
                json!({ "n": n, "text": "Résolution adoptée" }),
                clock,
            ))
            .expect("append failed");
    }
}

/// Raw connection with the immutability triggers dropped, standing in for
/// someone editing the database file directly.
fn tamper_connection(dir: &TempDir) -> Connection {
    let conn = Connection::open(dir.path().join("charter.db")).expect("raw connection");
    conn.execute_batch("DROP TRIGGER events_no_update;")
        .expect("failed to drop trigger");
    conn
}

#[test]
fn valid_run_verifies_clean() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let ledger = open(&dir, &clock);
    fill(&ledger, &clock, 50);

    let report = ChainVerifier::new()
        .with_page_size(8)
        .verify_range(&ledger, 1, u64::MAX)
        .unwrap();

    assert!(report.is_valid);
    assert!(report.gaps.is_empty());
    assert_eq!(report.events_checked, 50);
    assert_eq!(report.first_sequence, Some(1));
    assert_eq!(report.last_sequence, Some(50));
}

#[test]
fn edited_payload_is_located() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let ledger = open(&dir, &clock);
    fill(&ledger, &clock, 20);

    tamper_connection(&dir)
        .execute(
            "UPDATE events SET payload = '{\"n\":999}' WHERE sequence = 7",
            [],
        )
        .unwrap();

    let report = ChainVerifier::new().verify_range(&ledger, 1, u64::MAX).unwrap();
    assert!(!report.is_valid);
    assert_eq!(report.first_invalid_sequence(), Some(7));
    assert_eq!(
        report.first_break.as_ref().map(|b| b.kind),
        Some(BreakKind::ContentHashMismatch)
    );
    assert_eq!(
        report.actual_hash(),
        Some(ledger.read_one(7).unwrap().content_hash.as_str())
    );
    assert_eq!(report.events_checked, 20);
}

#[test]
fn rehashed_edit_breaks_the_next_link() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let ledger = open(&dir, &clock);
    fill(&ledger, &clock, 10);

    // Rewrite event 4 consistently so only the link from 5 betrays it.
    let mut forged = ledger.read_one(4).unwrap();
    forged.payload = json!({ "n": -1 });
    let forged_hash = forged.recompute_content_hash().unwrap();
    tamper_connection(&dir)
        .execute(
            "UPDATE events SET payload = '{\"n\":-1}', content_hash = ?1 WHERE sequence = 4",
            [&forged_hash],
        )
        .unwrap();

    let report = ChainVerifier::new().verify_range(&ledger, 1, u64::MAX).unwrap();
    assert_eq!(report.first_invalid_sequence(), Some(5));
    assert_eq!(
        report.first_break.as_ref().map(|b| b.kind),
        Some(BreakKind::ChainBreak)
    );
    assert_eq!(report.expected_hash(), Some(forged_hash.as_str()));
}

#[test]
fn sub_range_anchors_on_predecessor() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let ledger = open(&dir, &clock);
    fill(&ledger, &clock, 20);

    let clean = ChainVerifier::new().verify_range(&ledger, 11, 20).unwrap();
    assert!(clean.is_valid);
    assert!(clean.gaps.is_empty());
    assert_eq!(clean.events_checked, 10);

    tamper_connection(&dir)
        .execute(
            "UPDATE events SET payload = '{\"n\":0}' WHERE sequence = 10",
            [],
        )
        .unwrap();

    let report = ChainVerifier::new().verify_range(&ledger, 11, 20).unwrap();
    assert!(!report.is_valid);
    assert_eq!(report.first_invalid_sequence(), Some(11));
    assert_eq!(
        report.first_break.as_ref().map(|b| b.kind),
        Some(BreakKind::ChainBreak)
    );
}

#[test]
fn racing_writers_share_one_chain() {
    const WRITERS: usize = 4;
    const PER_WRITER: u64 = 25;

    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let handles: Vec<Ledger> = (0..WRITERS).map(|_| open(&dir, &clock)).collect();
    let barrier = Arc::new(Barrier::new(WRITERS));

    let threads: Vec<_> = handles
        .into_iter()
        .enumerate()
        .map(|(writer, ledger)| {
            let barrier = Arc::clone(&barrier);
            let clock = Arc::clone(&clock);
            thread::spawn(move || {
                barrier.wait();
                for n in 0..PER_WRITER {
                    ledger
                        .append(
                            EventDraft::new("vote.cast", json!({ "n": n }), &*clock)
                                .with_agent_id(format!("writer-{writer}")),
                        )
                        .expect("append failed");
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().expect("writer panicked");
    }

    let ledger = open(&dir, &clock);
    let report = ChainVerifier::new().verify_range(&ledger, 1, u64::MAX).unwrap();
    assert!(report.is_valid, "{:?}", report.first_break);
    assert!(report.gaps.is_empty());
    assert_eq!(report.events_checked, WRITERS as u64 * PER_WRITER);
    assert_eq!(ledger.tail().unwrap().next_sequence, WRITERS as u64 * PER_WRITER + 1);
}

#[test]
fn stale_link_from_second_handle_is_rejected() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let first = open(&dir, &clock);
    let second = open(&dir, &clock);
    fill(&first, &clock, 1);

    let head = second.tail().unwrap().head_hash;
    first
        .append(EventDraft::new("a", json!({}), &*clock).linked_to(head.clone()))
        .unwrap();

    let err = second
        .append(EventDraft::new("b", json!({}), &*clock).linked_to(head))
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::ChainContinuityViolation { sequence: 3, .. }
    ));
    assert_eq!(second.tail().unwrap().next_sequence, 3);
}

#[test]
fn logged_skip_is_reported_as_gap() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let ledger = open(&dir, &clock);
    fill(&ledger, &clock, 2);
    ledger.record_sequence_skip(1, "session adjourned").unwrap();
    fill(&ledger, &clock, 2);

    let sequences: Vec<u64> = ledger
        .read_range(1, u64::MAX, 10)
        .map(|e| e.unwrap().sequence)
        .collect();
    assert_eq!(sequences, vec![1, 2, 4, 5]);

    let report = ChainVerifier::new().verify_range(&ledger, 1, u64::MAX).unwrap();
    assert!(report.is_valid);
    assert_eq!(report.gaps, vec![GapRange { start: 3, end: 3 }]);
    assert_eq!(ledger.read_one(4).unwrap().prev_hash, ledger.read_one(2).unwrap().content_hash);
}

#[test]
fn drift_is_logged_without_blocking_the_write() {
    let dir = TempDir::new().unwrap();
    let authority = Arc::new(ManualClock::new(T0));
    let writer = ManualClock::new(T0 - 10_000_000_000);
    let ledger = open(&dir, &authority);

    let event = ledger
        .append(EventDraft::new("x", json!({}), &writer))
        .expect("drift must not block the append");
    assert_eq!(event.authority_timestamp_ns, authority.now_ns());

    let observations = ledger.drift_observations().unwrap();
    assert_eq!(observations.len(), 1);
    assert_eq!(observations[0].event_id, event.event_id);
    assert!((observations[0].drift_seconds - 10.0).abs() < 1e-9);

    ledger
        .append(EventDraft::new("y", json!({}), &*authority))
        .unwrap();
    assert_eq!(ledger.drift_observations().unwrap().len(), 1);
}

#[test]
fn export_verifies_like_the_live_ledger() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let ledger = open(&dir, &clock);
    fill(&ledger, &clock, 100);

    let path = dir.path().join("export.jsonl");
    let written = export_range(
        &ledger,
        1,
        u64::MAX,
        std::fs::File::create(&path).unwrap(),
    )
    .unwrap();
    assert_eq!(written, 100);

    let export = ExportFile::open(&path).unwrap();
    let live = ChainVerifier::new().verify_range(&ledger, 1, u64::MAX).unwrap();
    let offline = ChainVerifier::new()
        .with_page_size(7)
        .verify_range(&export, 1, u64::MAX)
        .unwrap();
    assert_eq!(live, offline);
    assert!(offline.is_valid);

    let paged: Vec<_> = ledger.read_range(1, u64::MAX, 9).map(Result::unwrap).collect();
    let exported: Vec<_> = export_events(&path);
    assert_eq!(paged, exported);
}

#[test]
fn sub_range_export_carries_its_anchor() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let ledger = open(&dir, &clock);
    fill(&ledger, &clock, 100);

    let path = dir.path().join("tail.jsonl");
    let written = export_range(&ledger, 51, 100, std::fs::File::create(&path).unwrap()).unwrap();
    assert_eq!(written, 50);

    let export = ExportFile::open(&path).unwrap();
    assert_eq!(export.len(), 50);
    assert_eq!(export.range_start(), 51);
    assert_eq!(export.anchor(), Some(&ledger.read_one(50).unwrap()));

    let live = ChainVerifier::new().verify_range(&ledger, 51, 100).unwrap();
    let offline = ChainVerifier::new()
        .with_page_size(7)
        .verify_range(&export, 51, 100)
        .unwrap();
    assert!(live.is_valid);
    assert_eq!(live, offline);
}

#[test]
fn sub_range_export_without_anchor_is_unanchored() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let ledger = open(&dir, &clock);
    fill(&ledger, &clock, 10);

    let path = dir.path().join("tail.jsonl");
    export_range(&ledger, 6, 10, std::fs::File::create(&path).unwrap()).unwrap();
    let events: Vec<String> = std::fs::read_to_string(&path)
        .unwrap()
        .lines()
        .skip(1)
        .map(str::to_owned)
        .collect();
    let stripped = dir.path().join("stripped.jsonl");
    std::fs::write(&stripped, events.join("\n")).unwrap();

    let export = ExportFile::open(&stripped).unwrap();
    assert_eq!(export.range_start(), 1);
    let report = ChainVerifier::new().verify_range(&export, 6, 10).unwrap();
    assert_eq!(report.first_invalid_sequence(), Some(6));
    assert_eq!(
        report.first_break.map(|b| b.kind),
        Some(BreakKind::Unanchored)
    );
}

fn export_events(path: &std::path::Path) -> Vec<charter_core::LedgerEvent> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn reader_sees_commits_while_writer_holds_handle() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let ledger = open(&dir, &clock);
    let reader = ledger.open_reader().unwrap();

    assert_eq!(reader.tail().unwrap().head_hash, GENESIS_HASH);
    fill(&ledger, &clock, 3);

    let tail = reader.tail().unwrap();
    assert_eq!(tail.last_sequence, Some(3));
    assert_eq!(tail.head_hash, ledger.read_one(3).unwrap().content_hash);
    assert_eq!(
        ChainVerifier::new()
            .verify_range(&reader, 1, 3)
            .unwrap()
            .events_checked,
        3
    );
}
