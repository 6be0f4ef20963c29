//! Append-only, hash-chained ledger storage.
//!
//! This module provides the event store backed by `SQLite` in WAL mode. The
//! store is the single authority for sequence numbers, authority
//! timestamps and chain links:
//!
//! - **Append-only semantics**: triggers abort any `UPDATE` or `DELETE` on
//!   committed events and sequence skips
//! - **Chain continuity**: every append re-derives the tail inside an
//!   `IMMEDIATE` transaction and rejects stale links
//! - **Paged reads**: [`RangeReader`] walks a sequence range one page at a
//!   time and can be resumed from its cursor
//! - **Separate read path**: [`LedgerReader`] uses its own read-only
//!   connection
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use charter_core::event::EventDraft;
//! use charter_core::ledger::{Ledger, LedgerError};
//! use charter_core::time::SystemClock;
//! use serde_json::json;
//!
//! # fn example() -> Result<(), LedgerError> {
//! let ledger = Ledger::open("/path/to/ledger.db", Arc::new(SystemClock))?;
//!
//! let tail = ledger.tail()?;
//! let draft = EventDraft::new("motion.filed", json!({"motion": "quorum"}), &SystemClock)
//!     .linked_to(tail.head_hash);
//! let event = ledger.append(draft)?;
//!
//! for event in ledger.read_range(1, event.sequence, 100) {
//!     let event = event?;
//!     println!("{} {}", event.sequence, event.event_type);
//! }
//! # Ok(())
//! # }
//! ```

mod reader;
mod storage;


pub use reader::{EventPage, EventSource, LedgerReader, RangeReader};
pub use storage::{
    ChainTail, DEFAULT_BUSY_TIMEOUT, DEFAULT_PAGE_SIZE, Ledger, LedgerError, LedgerOptions,
    LedgerStats, SequenceSkip, SqliteDriftSink,
};
