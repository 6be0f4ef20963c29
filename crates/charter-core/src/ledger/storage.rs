//! `SQLite`-backed ledger storage.
//!
//! Appends run in a single `IMMEDIATE` transaction: the chain tail is
//! re-derived, the declared link is checked, the next sequence is assigned,
//! the write-time guard re-checks the row and only then is it inserted.
//! Nothing is cached between appends, so separate handles and separate
//! processes on the same database file serialize correctly through
//! `SQLite`'s reserved lock.

// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(clippy::missing_panics_doc)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior, params};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::reader::{EventPage, EventSource, LedgerReader, RangeReader};
use crate::canonical::{CanonicalizationError, canonical_string};
use crate::chain::{
    GENESIS_HASH, HASH_ALG_SHA256_CANONICAL, MalformedHashError, derive_prev_hash, hashes_match,
    validate_hash,
};
use crate::crypto::SignerError;
use crate::event::{EventDraft, EventError, LedgerEvent};
use crate::time::{
    Clock, DEFAULT_DRIFT_THRESHOLD, DriftMonitor, DriftObservation, DriftSink, DriftSinkError,
};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Default wait for another writer's lock before giving up.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default number of events fetched per page by scans.
pub const DEFAULT_PAGE_SIZE: usize = 500;

const EVENT_COLUMNS: &str = "sequence, event_id, event_type, payload, agent_id, \
     local_timestamp_ns, authority_timestamp_ns, content_hash, prev_hash, \
     hash_alg_version, sig_alg_version, signature, witness_id, witness_signature";

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error during database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The payload has no canonical encoding.
    #[error("canonicalization failed: {0}")]
    Canonicalization(#[from] CanonicalizationError),

    /// A stored or declared hash is not a valid digest.
    #[error(transparent)]
    MalformedHash(#[from] MalformedHashError),

    /// The event does not link to the current chain tail.
    ///
    /// `expected` is the link the ledger requires. `actual` is the link the
    /// writer supplied. The writer must re-read the tail and retry.
    #[error("chain continuity violation at sequence {sequence}: expected prev_hash {expected}, got {actual}")]
    ChainContinuityViolation {
        /// Sequence the event would have taken.
        sequence: u64,
        /// Link required by the ledger.
        expected: String,
        /// Link supplied by the writer.
        actual: String,
    },

    /// The first event of the ledger does not link to genesis.
    #[error("genesis mismatch: expected {expected}, got {actual}")]
    GenesisMismatch {
        /// The genesis constant.
        expected: String,
        /// The supplied link.
        actual: String,
    },

    /// No event exists at the requested sequence.
    #[error("event not found: sequence={sequence}")]
    EventNotFound {
        /// The requested sequence.
        sequence: u64,
    },

    /// A range with `start > end` was requested.
    #[error("invalid range: {start}..={end}")]
    InvalidRange {
        /// Range start.
        start: u64,
        /// Range end.
        end: u64,
    },

    /// A sequence skip must cover at least one number and stay in range.
    #[error("invalid sequence skip of {count}")]
    InvalidSkip {
        /// Requested skip size.
        count: u64,
    },

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A signer failed while preparing a draft.
    #[error("signing failed: {0}")]
    Signing(#[from] SignerError),

    /// A sequence or timestamp does not fit `SQLite`'s signed 64-bit
    /// integers. The row is rejected, never clamped.
    #[error("{field} out of storable range: {value}")]
    ValueOutOfRange {
        /// Column that would overflow.
        field: &'static str,
        /// The rejected value.
        value: u64,
    },

    /// A stored row cannot be decoded.
    #[error("corrupt row at sequence {sequence}: {reason}")]
    CorruptRow {
        /// Sequence of the row.
        sequence: u64,
        /// What could not be decoded.
        reason: String,
    },
}

impl From<EventError> for LedgerError {
    fn from(error: EventError) -> Self {
        match error {
            EventError::Canonicalization(e) => Self::Canonicalization(e),
            EventError::Signing(e) => Self::Signing(e),
        }
    }
}

/// Tunables for a ledger handle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LedgerOptions {
    /// How long an append waits for another writer's lock.
    pub busy_timeout: Duration,
    /// Drift threshold for the built-in drift monitor.
    pub drift_threshold: Duration,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            drift_threshold: DEFAULT_DRIFT_THRESHOLD,
        }
    }
}

/// The current end of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainTail {
    /// Highest committed event sequence, if any.
    pub last_sequence: Option<u64>,
    /// Content hash of that event, or genesis when the ledger is empty.
    pub head_hash: String,
    /// Sequence the next append will receive.
    pub next_sequence: u64,
}

/// A logged ceremonial gap in the sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceSkip {
    /// First skipped sequence.
    pub start: u64,
    /// Last skipped sequence (inclusive).
    pub end: u64,
    /// Why the numbers were skipped.
    pub reason: String,
    /// Authority time when the skip was recorded.
    pub recorded_at_ns: u64,
}

/// Statistics about the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    /// Total number of events.
    pub event_count: u64,
    /// Highest event sequence (0 if empty).
    pub max_sequence: u64,
    /// Number of logged skips.
    pub skip_count: u64,
    /// Sequence numbers covered by skips.
    pub skipped_sequences: u64,
    /// Number of drift observations in the side table.
    pub drift_observation_count: u64,
    /// Database file size in bytes.
    pub db_size_bytes: u64,
}

/// The append-only, hash-chained event ledger backed by `SQLite`.
///
/// The database runs in WAL mode, so readers opened with
/// [`Ledger::open_reader`] never block appends and are never blocked by
/// them.
#[derive(Debug)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    drift: Option<DriftMonitor>,
    busy_timeout: Duration,
}

impl Ledger {
    /// Opens or creates a ledger with default options.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, LedgerError> {
        Self::open_with_options(path, clock, LedgerOptions::default())
    }

    /// Opens or creates a ledger at `path`.
    ///
    /// Drift observations go to the `drift_observations` table of the same
    /// database unless replaced with [`Ledger::with_drift_monitor`].
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open_with_options(
        path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
        options: LedgerOptions,
    ) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::initialize(conn, Some(path.to_path_buf()), clock, options)
    }

    /// Creates an in-memory ledger for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be initialized.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn, None, clock, LedgerOptions::default())
    }

    fn initialize(
        conn: Connection,
        path: Option<PathBuf>,
        clock: Arc<dyn Clock>,
        options: LedgerOptions,
    ) -> Result<Self, LedgerError> {
        conn.busy_timeout(options.busy_timeout)?;
        conn.execute_batch(SCHEMA_SQL)?;

        let conn = Arc::new(Mutex::new(conn));
        let sink: Arc<dyn DriftSink> = Arc::new(SqliteDriftSink {
            conn: Arc::clone(&conn),
        });
        let drift = DriftMonitor::new(options.drift_threshold, sink, Arc::clone(&clock));

        Ok(Self {
            conn,
            path,
            clock,
            drift: Some(drift),
            busy_timeout: options.busy_timeout,
        })
    }

    /// Replaces the drift monitor.
    #[must_use]
    pub fn with_drift_monitor(mut self, monitor: DriftMonitor) -> Self {
        self.drift = Some(monitor);
        self
    }

    /// Disables drift checks.
    #[must_use]
    pub fn without_drift_monitor(mut self) -> Self {
        self.drift = None;
        self
    }

    /// The authority clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Appends a draft to the chain.
    ///
    /// Sequence, authority timestamp, `prev_hash` and `content_hash` are
    /// fixed inside one `IMMEDIATE` transaction. If the draft was
    /// [`linked_to`](EventDraft::linked_to) a tail that is no longer current,
    /// the append fails with [`LedgerError::ChainContinuityViolation`] and
    /// nothing is written.
    ///
    /// The drift check runs after commit and never fails the append.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be canonicalized, the declared
    /// link is malformed or stale, the write-time guard rejects the row, or
    /// the database fails.
    pub fn append(&self, draft: EventDraft) -> Result<LedgerEvent, LedgerError> {
        if let Some(declared) = draft.expected_prev_hash() {
            validate_hash(declared)?;
        }
        let payload_text = canonical_string(&draft.payload)?;
        let payload: Value = serde_json::from_str(&payload_text)?;

        let event = {
            let mut conn = self.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let tail = select_tail(&tx)?;
            let prev_hash = derive_prev_hash(tail.last_sequence.map(|_| tail.head_hash.as_str()))?;

            if let Some(declared) = draft.expected_prev_hash() {
                if !hashes_match(declared, &prev_hash) {
                    warn!(
                        sequence = tail.next_sequence,
                        expected = %prev_hash,
                        declared,
                        "append rejected: stale chain tail"
                    );
                    return Err(LedgerError::ChainContinuityViolation {
                        sequence: tail.next_sequence,
                        expected: prev_hash,
                        actual: declared.to_owned(),
                    });
                }
            }

            let mut event = LedgerEvent {
                event_id: draft.event_id,
                sequence: tail.next_sequence,
                event_type: draft.event_type,
                payload,
                agent_id: draft.agent_id,
                local_timestamp_ns: draft.local_timestamp_ns,
                authority_timestamp_ns: self.clock.now_ns(),
                content_hash: String::new(),
                prev_hash,
                hash_alg_version: HASH_ALG_SHA256_CANONICAL,
                sig_alg_version: draft.sig_alg_version,
                signature: draft.signature,
                witness_id: draft.witness_id,
                witness_signature: draft.witness_signature,
            };
            event.content_hash = event.recompute_content_hash()?;

            check_write_guard(&tx, &event)?;
            insert_event(&tx, &event, &payload_text)?;
            check_stored_row(&tx, &event)?;
            tx.commit()?;
            event
        };

        info!(
            sequence = event.sequence,
            event_id = %event.event_id,
            event_type = %event.event_type,
            content_hash = %event.content_hash,
            "event appended"
        );

        if let Some(monitor) = &self.drift {
            monitor.check_drift(
                event.local_timestamp_ns,
                event.authority_timestamp_ns,
                &event.event_id,
            );
        }

        Ok(event)
    }

    /// Logs a ceremonial skip of `count` sequence numbers.
    ///
    /// The skipped numbers are never assigned to events and show up as a
    /// gap during verification.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidSkip`] if `count` is zero or the skip
    /// would overflow the sequence space.
    pub fn record_sequence_skip(
        &self,
        count: u64,
        reason: &str,
    ) -> Result<SequenceSkip, LedgerError> {
        if count == 0 {
            return Err(LedgerError::InvalidSkip { count });
        }

        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let start = select_tail(&tx)?.next_sequence;
        let end = start
            .checked_add(count - 1)
            .filter(|end| i64::try_from(*end).is_ok())
            .ok_or(LedgerError::InvalidSkip { count })?;

        let skip = SequenceSkip {
            start,
            end,
            reason: reason.to_owned(),
            recorded_at_ns: self.clock.now_ns(),
        };
        tx.execute(
            "INSERT INTO sequence_skips (start_sequence, end_sequence, reason, recorded_at_ns)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                sql_int("start_sequence", skip.start)?,
                sql_int("end_sequence", skip.end)?,
                skip.reason,
                sql_int("recorded_at_ns", skip.recorded_at_ns)?,
            ],
        )?;
        tx.commit()?;

        warn!(
            start = skip.start,
            end = skip.end,
            reason = %skip.reason,
            "sequence numbers skipped"
        );
        Ok(skip)
    }

    /// Reads a single event by sequence.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::EventNotFound`] if no event has that sequence.
    pub fn read_one(&self, sequence: u64) -> Result<LedgerEvent, LedgerError> {
        select_one(&self.lock(), sequence)
    }

    /// Iterates events with `start <= sequence <= end` in ascending order,
    /// `page_size` rows per query.
    #[must_use]
    pub fn read_range(&self, start: u64, end: u64, page_size: usize) -> RangeReader<'_, Self> {
        RangeReader::new(self, start, end, page_size)
    }

    /// Current chain tail.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn tail(&self) -> Result<ChainTail, LedgerError> {
        select_tail(&self.lock())
    }

    /// All logged sequence skips, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn sequence_skips(&self) -> Result<Vec<SequenceSkip>, LedgerError> {
        select_skips(&self.lock())
    }

    /// Drift observations recorded in this database.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn drift_observations(&self) -> Result<Vec<DriftObservation>, LedgerError> {
        select_drift_observations(&self.lock())
    }

    /// Gets statistics about the ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if statistics cannot be gathered.
    pub fn stats(&self) -> Result<LedgerStats, LedgerError> {
        select_stats(&self.lock())
    }

    /// Verifies that WAL mode is enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal mode cannot be queried.
    pub fn verify_wal_mode(&self) -> Result<bool, LedgerError> {
        let conn = self.lock();
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        Ok(mode.eq_ignore_ascii_case("wal"))
    }

    /// Opens a read-only connection for concurrent reads.
    ///
    /// The reader is a separate failure domain: it holds its own
    /// connection and never takes the writer's lock.
    ///
    /// # Errors
    ///
    /// Returns an error for in-memory ledgers or if the connection cannot be
    /// opened.
    pub fn open_reader(&self) -> Result<LedgerReader, LedgerError> {
        let path = self.path.as_ref().ok_or_else(|| {
            LedgerError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "cannot create reader for in-memory database",
            ))
        })?;
        LedgerReader::open(path, self.busy_timeout)
    }
}

impl EventSource for Ledger {
    type Error = LedgerError;

    fn get_events(&self, start: u64, end: u64, page_size: usize) -> Result<EventPage, LedgerError> {
        select_page(&self.lock(), start, end, page_size)
    }

    fn predecessor(&self, sequence: u64) -> Result<Option<LedgerEvent>, LedgerError> {
        select_predecessor(&self.lock(), sequence)
    }
}

/// Drift sink writing to the `drift_observations` table.
///
/// Shares the ledger's connection. Drift checks run after the append lock
/// is released.
pub struct SqliteDriftSink {
    conn: Arc<Mutex<Connection>>,
}

impl DriftSink for SqliteDriftSink {
    fn record(&self, observation: &DriftObservation) -> Result<(), DriftSinkError> {
        let sink_error = |e: &dyn std::fmt::Display| DriftSinkError {
            message: e.to_string(),
        };
        let local = sql_int("local_timestamp_ns", observation.local_timestamp_ns)
            .map_err(|e| sink_error(&e))?;
        let authority = sql_int("authority_timestamp_ns", observation.authority_timestamp_ns)
            .map_err(|e| sink_error(&e))?;
        let logged_at =
            sql_int("logged_at_ns", observation.logged_at_ns).map_err(|e| sink_error(&e))?;

        let conn = self.conn.lock().map_err(|e| sink_error(&e))?;
        conn.execute(
            "INSERT INTO drift_observations
                 (event_id, local_timestamp_ns, authority_timestamp_ns, drift_seconds, logged_at_ns)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                observation.event_id,
                local,
                authority,
                observation.drift_seconds,
                logged_at,
            ],
        )
        .map_err(|e| sink_error(&e))?;
        Ok(())
    }
}

/// Re-checks a row against the committed chain before it is inserted.
///
/// The predecessor is read again independently of the tail used to build
/// the row. A first event must link to genesis. Every other event must link
/// to the nearest lower committed event. The stored `content_hash` must
/// equal the hash recomputed from the row's own fields.
pub(crate) fn check_write_guard(conn: &Connection, event: &LedgerEvent) -> Result<(), LedgerError> {
    validate_hash(&event.prev_hash)?;

    let predecessor: Option<String> = conn
        .query_row(
            "SELECT content_hash FROM events WHERE sequence < ?1 ORDER BY sequence DESC LIMIT 1",
            params![sql_seq(event.sequence)],
            |row| row.get(0),
        )
        .optional()?;

    match predecessor {
        None if !hashes_match(&event.prev_hash, GENESIS_HASH) => {
            warn!(sequence = event.sequence, prev_hash = %event.prev_hash, "write guard: first event does not link to genesis");
            return Err(LedgerError::GenesisMismatch {
                expected: GENESIS_HASH.to_owned(),
                actual: event.prev_hash.clone(),
            });
        },
        Some(expected) if !hashes_match(&event.prev_hash, &expected) => {
            warn!(sequence = event.sequence, %expected, prev_hash = %event.prev_hash, "write guard: broken link");
            return Err(LedgerError::ChainContinuityViolation {
                sequence: event.sequence,
                expected,
                actual: event.prev_hash.clone(),
            });
        },
        _ => {},
    }

    let recomputed = event.recompute_content_hash()?;
    if !hashes_match(&recomputed, &event.content_hash) {
        warn!(sequence = event.sequence, %recomputed, stored = %event.content_hash, "write guard: content hash mismatch");
        return Err(LedgerError::ChainContinuityViolation {
            sequence: event.sequence,
            expected: recomputed,
            actual: event.content_hash.clone(),
        });
    }
    Ok(())
}

/// Reads the inserted row back inside the transaction and recomputes its
/// hash, so nothing the column types change can slip into the chain.
fn check_stored_row(conn: &Connection, event: &LedgerEvent) -> Result<(), LedgerError> {
    let stored = select_one(conn, event.sequence)?;
    let recomputed = stored.recompute_content_hash()?;
    if !hashes_match(&recomputed, &event.content_hash) || stored != *event {
        warn!(sequence = event.sequence, %recomputed, expected = %event.content_hash, "write guard: stored row differs from appended event");
        return Err(LedgerError::ChainContinuityViolation {
            sequence: event.sequence,
            expected: event.content_hash.clone(),
            actual: recomputed,
        });
    }
    Ok(())
}

fn insert_event(conn: &Connection, event: &LedgerEvent, payload_text: &str) -> Result<(), LedgerError> {
    conn.execute(
        &format!(
            "INSERT INTO events ({EVENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            sql_int("sequence", event.sequence)?,
            event.event_id,
            event.event_type,
            payload_text,
            event.agent_id,
            sql_int("local_timestamp_ns", event.local_timestamp_ns)?,
            sql_int("authority_timestamp_ns", event.authority_timestamp_ns)?,
            event.content_hash,
            event.prev_hash,
            event.hash_alg_version,
            event.sig_alg_version,
            event.signature,
            event.witness_id,
            event.witness_signature,
        ],
    )?;
    Ok(())
}

/// Clamps a query bound into `SQLite`'s signed integer range. Only used for
/// `WHERE` bounds, where `u64::MAX` means "to the end".
fn sql_seq(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Converts a value that is about to be stored.
fn sql_int(field: &'static str, value: u64) -> Result<i64, LedgerError> {
    i64::try_from(value).map_err(|_| LedgerError::ValueOutOfRange { field, value })
}

fn non_negative(sequence: u64, column: &str, value: i64) -> Result<u64, LedgerError> {
    u64::try_from(value).map_err(|_| LedgerError::CorruptRow {
        sequence,
        reason: format!("negative {column}: {value}"),
    })
}

/// Raw `events` row as stored.
struct StoredEvent {
    sequence: i64,
    event_id: String,
    event_type: String,
    payload: String,
    agent_id: Option<String>,
    local_timestamp_ns: i64,
    authority_timestamp_ns: i64,
    content_hash: String,
    prev_hash: String,
    hash_alg_version: i64,
    sig_alg_version: i64,
    signature: Option<Vec<u8>>,
    witness_id: Option<String>,
    witness_signature: Option<Vec<u8>>,
}

impl StoredEvent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sequence: row.get(0)?,
            event_id: row.get(1)?,
            event_type: row.get(2)?,
            payload: row.get(3)?,
            agent_id: row.get(4)?,
            local_timestamp_ns: row.get(5)?,
            authority_timestamp_ns: row.get(6)?,
            content_hash: row.get(7)?,
            prev_hash: row.get(8)?,
            hash_alg_version: row.get(9)?,
            sig_alg_version: row.get(10)?,
            signature: row.get(11)?,
            witness_id: row.get(12)?,
            witness_signature: row.get(13)?,
        })
    }

    /// Decodes the row. Hash fields are returned as stored, without format
    /// checks, so verifiers can report them.
    fn into_event(self) -> Result<LedgerEvent, LedgerError> {
        let sequence = u64::try_from(self.sequence).map_err(|_| LedgerError::CorruptRow {
            sequence: 0,
            reason: format!("negative sequence {}", self.sequence),
        })?;
        let payload = serde_json::from_str(&self.payload).map_err(|e| LedgerError::CorruptRow {
            sequence,
            reason: format!("payload is not JSON: {e}"),
        })?;
        let version = |column: &str, value: i64| {
            u16::try_from(value).map_err(|_| LedgerError::CorruptRow {
                sequence,
                reason: format!("{column} out of range: {value}"),
            })
        };

        Ok(LedgerEvent {
            event_id: self.event_id,
            sequence,
            event_type: self.event_type,
            payload,
            agent_id: self.agent_id,
            local_timestamp_ns: non_negative(sequence, "local_timestamp_ns", self.local_timestamp_ns)?,
            authority_timestamp_ns: non_negative(
                sequence,
                "authority_timestamp_ns",
                self.authority_timestamp_ns,
            )?,
            content_hash: self.content_hash,
            prev_hash: self.prev_hash,
            hash_alg_version: version("hash_alg_version", self.hash_alg_version)?,
            sig_alg_version: version("sig_alg_version", self.sig_alg_version)?,
            signature: self.signature,
            witness_id: self.witness_id,
            witness_signature: self.witness_signature,
        })
    }
}

pub(super) fn select_one(conn: &Connection, sequence: u64) -> Result<LedgerEvent, LedgerError> {
    conn.query_row(
        &format!("SELECT {EVENT_COLUMNS} FROM events WHERE sequence = ?1"),
        params![sql_seq(sequence)],
        StoredEvent::from_row,
    )
    .optional()?
    .ok_or(LedgerError::EventNotFound { sequence })?
    .into_event()
}

pub(super) fn select_predecessor(
    conn: &Connection,
    sequence: u64,
) -> Result<Option<LedgerEvent>, LedgerError> {
    conn.query_row(
        &format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE sequence < ?1
             ORDER BY sequence DESC
             LIMIT 1"
        ),
        params![sql_seq(sequence)],
        StoredEvent::from_row,
    )
    .optional()?
    .map(StoredEvent::into_event)
    .transpose()
}

pub(super) fn select_page(
    conn: &Connection,
    start: u64,
    end: u64,
    page_size: usize,
) -> Result<EventPage, LedgerError> {
    if start > end {
        return Err(LedgerError::InvalidRange { start, end });
    }
    let page_size = page_size.max(1);
    let limit = i64::try_from(page_size).unwrap_or(i64::MAX - 1) + 1;

    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM events
         WHERE sequence >= ?1 AND sequence <= ?2
         ORDER BY sequence ASC
         LIMIT ?3"
    ))?;
    let rows = stmt
        .query_map(params![sql_seq(start), sql_seq(end), limit], StoredEvent::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let has_more = rows.len() > page_size;
    let events = rows
        .into_iter()
        .take(page_size)
        .map(StoredEvent::into_event)
        .collect::<Result<Vec<_>, _>>()?;

    debug!(start, end, returned = events.len(), has_more, "read event page");
    Ok(EventPage { events, has_more })
}

pub(super) fn select_tail(conn: &Connection) -> Result<ChainTail, LedgerError> {
    let last: Option<(i64, String)> = conn
        .query_row(
            "SELECT sequence, content_hash FROM events ORDER BY sequence DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let max_skip_end: Option<i64> =
        conn.query_row("SELECT MAX(end_sequence) FROM sequence_skips", [], |row| {
            row.get(0)
        })?;

    let last_sequence = last
        .as_ref()
        .map(|(sequence, _)| non_negative(0, "sequence", *sequence))
        .transpose()?;
    let high_water = last_sequence
        .unwrap_or(0)
        .max(max_skip_end.and_then(|e| u64::try_from(e).ok()).unwrap_or(0));
    let next_sequence = high_water
        .checked_add(1)
        .ok_or(LedgerError::InvalidSkip { count: 1 })?;

    Ok(ChainTail {
        last_sequence,
        head_hash: last.map_or_else(|| GENESIS_HASH.to_owned(), |(_, hash)| hash),
        next_sequence,
    })
}

pub(super) fn select_drift_observations(
    conn: &Connection,
) -> Result<Vec<DriftObservation>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT event_id, local_timestamp_ns, authority_timestamp_ns, drift_seconds, logged_at_ns
         FROM drift_observations
         ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(event_id, local, authority, drift_seconds, logged_at)| {
            Ok(DriftObservation {
                event_id,
                local_timestamp_ns: non_negative(0, "local_timestamp_ns", local)?,
                authority_timestamp_ns: non_negative(0, "authority_timestamp_ns", authority)?,
                drift_seconds,
                logged_at_ns: non_negative(0, "logged_at_ns", logged_at)?,
            })
        })
        .collect()
}

pub(super) fn select_stats(conn: &Connection) -> Result<LedgerStats, LedgerError> {
    let (event_count, max_sequence): (i64, Option<i64>) = conn.query_row(
        "SELECT COUNT(*), MAX(sequence) FROM events",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let (skip_count, skipped): (i64, Option<i64>) = conn.query_row(
        "SELECT COUNT(*), SUM(end_sequence - start_sequence + 1) FROM sequence_skips",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let drift_count: i64 =
        conn.query_row("SELECT COUNT(*) FROM drift_observations", [], |row| {
            row.get(0)
        })?;
    let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

    Ok(LedgerStats {
        event_count: u64::try_from(event_count).unwrap_or(0),
        max_sequence: max_sequence.and_then(|m| u64::try_from(m).ok()).unwrap_or(0),
        skip_count: u64::try_from(skip_count).unwrap_or(0),
        skipped_sequences: skipped.and_then(|s| u64::try_from(s).ok()).unwrap_or(0),
        drift_observation_count: u64::try_from(drift_count).unwrap_or(0),
        db_size_bytes: u64::try_from(page_count.saturating_mul(page_size)).unwrap_or(0),
    })
}

pub(super) fn select_skips(conn: &Connection) -> Result<Vec<SequenceSkip>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT start_sequence, end_sequence, reason, recorded_at_ns
         FROM sequence_skips
         ORDER BY start_sequence ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(start, end, reason, recorded_at)| {
            let start = non_negative(0, "start_sequence", start)?;
            Ok(SequenceSkip {
                start,
                end: non_negative(start, "end_sequence", end)?,
                reason,
                recorded_at_ns: non_negative(start, "recorded_at_ns", recorded_at)?,
            })
        })
        .collect()
}
