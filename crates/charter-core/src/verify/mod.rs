//! Chain verification.
//!
//! [`ChainVerifier`] walks a sequence range page by page and re-derives
//! everything it checks from raw event fields:
//!
//! - each event's `content_hash` is recomputed and compared with the stored
//!   value
//! - each event's `prev_hash` is compared with the recomputed hash of the
//!   nearest lower present event, or with genesis when there is none
//! - every hole in the sequence is collected as a [`GapRange`]
//!
//! The first failed check becomes [`VerificationReport::first_break`]. The
//! walk keeps going after a break so that the gap list is complete.
//! Gaps are reported separately and do not make a report invalid: a skipped
//! number may be a logged ceremonial skip that a human reconciles.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chain::{GENESIS_HASH, HASH_ALG_SHA256_CANONICAL, hashes_match, validate_hash};
use crate::event::LedgerEvent;
use crate::ledger::{DEFAULT_PAGE_SIZE, EventSource};

/// Errors that stop a verification walk.
///
/// Integrity findings are never errors; they are reported in
/// [`VerificationReport`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VerifyError {
    /// The event source failed.
    #[error("event source failed: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// `start > end`.
    #[error("invalid range: {start}..={end}")]
    InvalidRange {
        /// Range start.
        start: u64,
        /// Range end.
        end: u64,
    },
}

impl VerifyError {
    fn from_source<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Source(Box::new(error))
    }
}

/// What went wrong at a chain break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakKind {
    /// The first event of the ledger does not link to genesis.
    GenesisMismatch,
    /// `prev_hash` differs from the predecessor's recomputed hash.
    ChainBreak,
    /// Stored `content_hash` differs from the recomputed hash.
    ContentHashMismatch,
    /// A stored hash is not 64 lowercase hex characters.
    MalformedHash,
    /// The sequence was already seen or went backwards.
    DuplicateSequence,
    /// The raw fields cannot be canonicalized.
    Canonicalization,
    /// `hash_alg_version` is not a known scheme.
    UnsupportedHashAlgorithm,
    /// The range starts above 1, the source has nothing below it, and the
    /// first event does not link to genesis. Its link cannot be checked.
    Unanchored,
}

/// The first integrity failure found by a walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBreak {
    /// Sequence of the offending event.
    pub sequence: u64,
    /// Failure kind.
    pub kind: BreakKind,
    /// Value the verifier derived, where applicable.
    pub expected_hash: Option<String>,
    /// Value found on the event, where applicable.
    pub actual_hash: Option<String>,
}

/// An inclusive run of missing sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapRange {
    /// First missing sequence.
    pub start: u64,
    /// Last missing sequence.
    pub end: u64,
}

impl GapRange {
    /// Number of missing sequences.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always `false`; a gap covers at least one sequence.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }
}

/// Result of a verification walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// `true` when no chain break was found. Gaps do not affect this.
    pub is_valid: bool,
    /// First break, if any.
    pub first_break: Option<ChainBreak>,
    /// Every gap in the walked range, ascending.
    pub gaps: Vec<GapRange>,
    /// Number of events examined.
    pub events_checked: u64,
    /// Lowest sequence seen.
    pub first_sequence: Option<u64>,
    /// Highest sequence seen.
    pub last_sequence: Option<u64>,
}

impl VerificationReport {
    /// Sequence of the first break.
    #[must_use]
    pub fn first_invalid_sequence(&self) -> Option<u64> {
        self.first_break.as_ref().map(|b| b.sequence)
    }

    /// Hash the verifier expected at the first break.
    #[must_use]
    pub fn expected_hash(&self) -> Option<&str> {
        self.first_break.as_ref()?.expected_hash.as_deref()
    }

    /// Hash found at the first break.
    #[must_use]
    pub fn actual_hash(&self) -> Option<&str> {
        self.first_break.as_ref()?.actual_hash.as_deref()
    }

    /// Whether any sequence number is missing.
    #[must_use]
    pub fn has_gaps(&self) -> bool {
        !self.gaps.is_empty()
    }
}

/// Walks ledger ranges and reports breaks and gaps.
#[derive(Debug, Clone, Copy)]
pub struct ChainVerifier {
    page_size: usize,
}

impl Default for ChainVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainVerifier {
    /// Verifier reading [`DEFAULT_PAGE_SIZE`] events per page.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Overrides the page size. Zero is treated as one.
    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = if page_size == 0 { 1 } else { page_size };
        self
    }

    /// Page size used by range walks.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Verifies `start..=end` of `source`.
    ///
    /// If `start > 1`, the nearest event below `start` is fetched and its
    /// recomputed hash anchors the first link. When the source has nothing
    /// below `start`, a first event that links to genesis is accepted and
    /// any other link is reported as [`BreakKind::Unanchored`].
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError`] if the range is inverted or the source fails.
    pub fn verify_range<S>(
        &self,
        source: &S,
        start: u64,
        end: u64,
    ) -> Result<VerificationReport, VerifyError>
    where
        S: EventSource + ?Sized,
    {
        self.verify_range_with(source, start, end, |_| {})
    }

    /// Like [`verify_range`](Self::verify_range), calling `inspect` on every
    /// event in walk order.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError`] if the range is inverted or the source fails.
    pub fn verify_range_with<S, F>(
        &self,
        source: &S,
        start: u64,
        end: u64,
        mut inspect: F,
    ) -> Result<VerificationReport, VerifyError>
    where
        S: EventSource + ?Sized,
        F: FnMut(&LedgerEvent),
    {
        if start > end {
            return Err(VerifyError::InvalidRange { start, end });
        }

        let predecessor = if start > 1 {
            source.predecessor(start).map_err(VerifyError::from_source)?
        } else {
            None
        };
        let mut walk = ChainWalk::new(start, predecessor.as_ref());

        let mut next = start;
        loop {
            let mut page = source
                .get_events(next, end, self.page_size)
                .map_err(VerifyError::from_source)?;
            page.events.sort_by_key(|event| event.sequence);
            debug!(start = next, end, count = page.events.len(), "verifying page");

            for event in &page.events {
                inspect(event);
                walk.observe(event);
            }

            match page.events.last() {
                Some(last) if page.has_more && last.sequence >= next && last.sequence < end => {
                    next = last.sequence + 1;
                },
                _ => break,
            }
        }

        Ok(walk.finish())
    }

    /// Verifies an in-memory batch.
    ///
    /// `predecessor` is the event just below the batch. Without one, the
    /// batch is taken to start the ledger: its first event must link to
    /// genesis and missing sequences from 1 up are gaps.
    #[must_use]
    pub fn verify_events(
        events: &[LedgerEvent],
        predecessor: Option<&LedgerEvent>,
    ) -> VerificationReport {
        let mut sorted: Vec<&LedgerEvent> = events.iter().collect();
        sorted.sort_by_key(|event| event.sequence);

        let start = predecessor.map_or(1, |p| p.sequence.saturating_add(1));
        let mut walk = ChainWalk::new(start, predecessor);
        for event in sorted {
            walk.observe(event);
        }
        walk.finish()
    }
}

/// Incremental state of one verification pass.
struct ChainWalk {
    /// Lowest sequence a leading gap may start at.
    range_start: u64,
    /// Link the next event must carry.
    expected_link: String,
    /// Whether `expected_link` is genesis because nothing precedes.
    at_genesis: bool,
    /// Whether a missing predecessor proves the range starts the ledger.
    anchored: bool,
    last_sequence: Option<u64>,
    first_sequence: Option<u64>,
    first_break: Option<ChainBreak>,
    gaps: Vec<GapRange>,
    events_checked: u64,
}

impl ChainWalk {
    fn new(range_start: u64, predecessor: Option<&LedgerEvent>) -> Self {
        let (expected_link, at_genesis) = match predecessor {
            Some(event) => (
                event
                    .recompute_content_hash()
                    .unwrap_or_else(|_| event.content_hash.clone()),
                false,
            ),
            None => (GENESIS_HASH.to_owned(), true),
        };
        Self {
            range_start: range_start.max(1),
            expected_link,
            at_genesis,
            anchored: predecessor.is_some() || range_start <= 1,
            last_sequence: None,
            first_sequence: None,
            first_break: None,
            gaps: Vec::new(),
            events_checked: 0,
        }
    }

    fn record_break(
        &mut self,
        sequence: u64,
        kind: BreakKind,
        expected: Option<String>,
        actual: Option<String>,
    ) {
        if self.first_break.is_some() {
            return;
        }
        warn!(sequence, ?kind, ?expected, ?actual, "chain break detected");
        self.first_break = Some(ChainBreak {
            sequence,
            kind,
            expected_hash: expected,
            actual_hash: actual,
        });
    }

    fn observe(&mut self, event: &LedgerEvent) {
        let sequence = event.sequence;
        self.events_checked += 1;

        match self.last_sequence {
            Some(last) if sequence <= last => {
                self.record_break(sequence, BreakKind::DuplicateSequence, None, None);
                return;
            },
            Some(last) if sequence > last + 1 => self.gaps.push(GapRange {
                start: last + 1,
                end: sequence - 1,
            }),
            None if sequence > self.range_start => self.gaps.push(GapRange {
                start: self.range_start,
                end: sequence - 1,
            }),
            _ => {},
        }
        self.last_sequence = Some(sequence);
        self.first_sequence.get_or_insert(sequence);

        let recomputed = self.check_content(event);

        if let Err(e) = validate_hash(&event.prev_hash) {
            self.record_break(
                sequence,
                BreakKind::MalformedHash,
                None,
                Some(e.value),
            );
        } else if !hashes_match(&event.prev_hash, &self.expected_link) {
            let (kind, expected) = match (self.at_genesis, self.anchored) {
                (true, true) => (BreakKind::GenesisMismatch, Some(self.expected_link.clone())),
                (true, false) => (BreakKind::Unanchored, None),
                (false, _) => (BreakKind::ChainBreak, Some(self.expected_link.clone())),
            };
            self.record_break(sequence, kind, expected, Some(event.prev_hash.clone()));
        }

        // Later links are checked against what this event should hash to.
        self.expected_link = recomputed.unwrap_or_else(|| event.content_hash.clone());
        self.at_genesis = false;
    }

    /// Checks the stored content hash and returns the recomputed one.
    fn check_content(&mut self, event: &LedgerEvent) -> Option<String> {
        let sequence = event.sequence;
        if let Err(e) = validate_hash(&event.content_hash) {
            self.record_break(sequence, BreakKind::MalformedHash, None, Some(e.value));
        }
        if event.hash_alg_version != HASH_ALG_SHA256_CANONICAL {
            self.record_break(
                sequence,
                BreakKind::UnsupportedHashAlgorithm,
                None,
                Some(event.content_hash.clone()),
            );
            return None;
        }
        match event.recompute_content_hash() {
            Ok(recomputed) => {
                if !hashes_match(&recomputed, &event.content_hash) {
                    self.record_break(
                        sequence,
                        BreakKind::ContentHashMismatch,
                        Some(recomputed.clone()),
                        Some(event.content_hash.clone()),
                    );
                }
                Some(recomputed)
            },
            Err(error) => {
                debug!(sequence, %error, "event cannot be canonicalized");
                self.record_break(
                    sequence,
                    BreakKind::Canonicalization,
                    None,
                    Some(event.content_hash.clone()),
                );
                None
            },
        }
    }

    fn finish(self) -> VerificationReport {
        let report = VerificationReport {
            is_valid: self.first_break.is_none(),
            first_break: self.first_break,
            gaps: self.gaps,
            events_checked: self.events_checked,
            first_sequence: self.first_sequence,
            last_sequence: self.last_sequence,
        };
        info!(
            is_valid = report.is_valid,
            events_checked = report.events_checked,
            gaps = report.gaps.len(),
            first_invalid_sequence = ?report.first_invalid_sequence(),
            "chain verification finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::chain::sha256_hex;
    use crate::crypto::SIG_ALG_NONE;

    /// Builds a correctly linked chain over the given sequences.
    fn chain(sequences: &[u64]) -> Vec<LedgerEvent> {
        let mut prev = GENESIS_HASH.to_string();
        sequences
            .iter()
            .map(|&sequence| {
                let mut event = LedgerEvent {
                    event_id: format!("e-{sequence}"),
                    sequence,
                    event_type: "motion.filed".to_string(),
                    payload: json!({ "n": sequence }),
                    agent_id: None,
                    local_timestamp_ns: sequence,
                    authority_timestamp_ns: sequence,
                    content_hash: String::new(),
                    prev_hash: prev.clone(),
                    hash_alg_version: HASH_ALG_SHA256_CANONICAL,
                    sig_alg_version: SIG_ALG_NONE,
                    signature: None,
                    witness_id: None,
                    witness_signature: None,
                };
                event.content_hash = event.recompute_content_hash().unwrap();
                prev = event.content_hash.clone();
                event
            })
            .collect()
    }

    #[test]
    fn test_valid_chain() {
        let events = chain(&[1, 2, 3, 4]);
        let report = ChainVerifier::verify_events(&events, None);

        assert!(report.is_valid);
        assert!(report.gaps.is_empty());
        assert_eq!(report.events_checked, 4);
        assert_eq!(report.first_invalid_sequence(), None);
    }

    #[test]
    fn test_empty_batch_is_valid() {
        let report = ChainVerifier::verify_events(&[], None);
        assert!(report.is_valid);
        assert_eq!(report.events_checked, 0);
        assert!(report.gaps.is_empty());
    }

    #[test]
    fn test_unsorted_input_is_sorted() {
        let mut events = chain(&[1, 2, 3]);
        events.reverse();
        assert!(ChainVerifier::verify_events(&events, None).is_valid);
    }

    #[test]
    fn test_gap_is_reported_but_valid() {
        let events = chain(&[1, 2, 4, 5]);
        let report = ChainVerifier::verify_events(&events, None);

        assert!(report.is_valid);
        assert_eq!(report.gaps, vec![GapRange { start: 3, end: 3 }]);
    }

    #[test]
    fn test_leading_gap() {
        let events = chain(&[3, 4]);
        let report = ChainVerifier::verify_events(&events, None);

        assert!(report.is_valid);
        assert_eq!(report.gaps, vec![GapRange { start: 1, end: 2 }]);
    }

    #[test]
    fn test_genesis_mismatch() {
        let mut events = chain(&[1, 2]);
        events[0].prev_hash = sha256_hex(b"not genesis");
        events[0].content_hash = events[0].recompute_content_hash().unwrap();

        let report = ChainVerifier::verify_events(&events, None);
        let first_break = report.first_break.unwrap();
        assert_eq!(first_break.sequence, 1);
        assert_eq!(first_break.kind, BreakKind::GenesisMismatch);
        assert_eq!(first_break.expected_hash.as_deref(), Some(GENESIS_HASH));
    }

    #[test]
    fn test_tampered_payload_breaks_at_event() {
        let mut events = chain(&[1, 2, 3, 4]);
        events[2].payload = json!({"n": "forged"});

        let report = ChainVerifier::verify_events(&events, None);
        assert!(!report.is_valid);
        assert_eq!(report.first_invalid_sequence(), Some(3));
        assert_eq!(
            report.first_break.as_ref().unwrap().kind,
            BreakKind::ContentHashMismatch
        );
        assert_eq!(report.actual_hash(), Some(events[2].content_hash.as_str()));
    }

    #[test]
    fn test_rehashed_tamper_breaks_next_link() {
        let mut events = chain(&[1, 2, 3]);
        events[1].payload = json!({"n": "forged"});
        events[1].content_hash = events[1].recompute_content_hash().unwrap();

        let report = ChainVerifier::verify_events(&events, None);
        let first_break = report.first_break.unwrap();
        assert_eq!(first_break.sequence, 3);
        assert_eq!(first_break.kind, BreakKind::ChainBreak);
    }

    #[test]
    fn test_break_does_not_stop_gap_collection() {
        let mut events = chain(&[1, 2, 3, 5, 6, 9]);
        events[1].payload = json!(null);

        let report = ChainVerifier::verify_events(&events, None);
        assert_eq!(report.first_invalid_sequence(), Some(2));
        assert_eq!(
            report.gaps,
            vec![GapRange { start: 4, end: 4 }, GapRange { start: 7, end: 8 }]
        );
        assert_eq!(report.events_checked, 6);
    }

    #[test]
    fn test_malformed_stored_hash() {
        let mut events = chain(&[1, 2]);
        events[1].prev_hash = "XYZ".to_string();

        let report = ChainVerifier::verify_events(&events, None);
        let first_break = report.first_break.unwrap();
        assert_eq!(first_break.sequence, 2);
        assert_eq!(first_break.kind, BreakKind::MalformedHash);
    }

    #[test]
    fn test_duplicate_sequence() {
        let mut events = chain(&[1, 2]);
        events.push(events[1].clone());

        let report = ChainVerifier::verify_events(&events, None);
        let first_break = report.first_break.unwrap();
        assert_eq!(first_break.sequence, 2);
        assert_eq!(first_break.kind, BreakKind::DuplicateSequence);
    }

    #[test]
    fn test_unencodable_payload_is_canonicalization_break() {
        let mut events = chain(&[1]);
        let mut deep = json!(0);
        for _ in 0..200 {
            deep = json!([deep]);
        }
        events[0].payload = deep;

        let report = ChainVerifier::verify_events(&events, None);
        assert_eq!(
            report.first_break.unwrap().kind,
            BreakKind::Canonicalization
        );
    }

    #[test]
    fn test_unknown_hash_algorithm() {
        let mut events = chain(&[1]);
        events[0].hash_alg_version = 9;

        let report = ChainVerifier::verify_events(&events, None);
        assert_eq!(
            report.first_break.unwrap().kind,
            BreakKind::UnsupportedHashAlgorithm
        );
    }

    #[test]
    fn test_sub_batch_with_predecessor() {
        let events = chain(&[1, 2, 3, 4, 5]);

        let report = ChainVerifier::verify_events(&events[2..], Some(&events[1]));
        assert!(report.is_valid);
        assert!(report.gaps.is_empty());
        assert_eq!(report.first_sequence, Some(3));
    }

    #[test]
    fn test_tampered_predecessor_breaks_first_link() {
        let mut events = chain(&[1, 2, 3, 4]);
        events[1].payload = json!("forged");

        let report = ChainVerifier::verify_events(&events[2..], Some(&events[1]));
        let first_break = report.first_break.unwrap();
        assert_eq!(first_break.sequence, 3);
        assert_eq!(first_break.kind, BreakKind::ChainBreak);
    }

    /// Serves a slice of events with no history below it.
    struct Detached(Vec<LedgerEvent>);

    impl EventSource for Detached {
        type Error = std::io::Error;

        fn get_events(
            &self,
            start: u64,
            end: u64,
            page_size: usize,
        ) -> Result<crate::ledger::EventPage, std::io::Error> {
            let events: Vec<LedgerEvent> = self
                .0
                .iter()
                .filter(|e| (start..=end).contains(&e.sequence))
                .take(page_size)
                .cloned()
                .collect();
            Ok(crate::ledger::EventPage {
                has_more: false,
                events,
            })
        }

        fn predecessor(&self, sequence: u64) -> Result<Option<LedgerEvent>, std::io::Error> {
            Ok(self.0.iter().rev().find(|e| e.sequence < sequence).cloned())
        }
    }

    #[test]
    fn test_range_without_history_is_unanchored() {
        let events = chain(&[1, 2, 3, 4]);
        let source = Detached(events[2..].to_vec());

        let report = ChainVerifier::new().verify_range(&source, 3, 4).unwrap();
        let first_break = report.first_break.unwrap();
        assert_eq!(first_break.sequence, 3);
        assert_eq!(first_break.kind, BreakKind::Unanchored);
        assert_eq!(first_break.expected_hash, None);
    }

    #[test]
    fn test_range_after_skips_may_link_to_genesis() {
        let events = chain(&[3, 4]);
        let source = Detached(events);

        let report = ChainVerifier::new().verify_range(&source, 3, 4).unwrap();
        assert!(report.is_valid, "{report:?}");
        assert!(report.gaps.is_empty());
    }

    #[test]
    fn test_report_json_shape() {
        let events = chain(&[1, 3]);
        let report = ChainVerifier::verify_events(&events, None);
        let value = serde_json::to_value(&report).unwrap();

        assert_eq!(value["is_valid"], json!(true));
        assert_eq!(value["gaps"], json!([{"start": 2, "end": 2}]));
        assert_eq!(value["first_break"], serde_json::Value::Null);
    }

    #[test]
    fn test_page_size_floor() {
        assert_eq!(ChainVerifier::new().with_page_size(0).page_size(), 1);
        assert_eq!(ChainVerifier::default().page_size(), DEFAULT_PAGE_SIZE);
    }
}
