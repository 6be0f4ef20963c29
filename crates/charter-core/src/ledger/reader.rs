//! Paged, restartable reads.

#![allow(clippy::missing_panics_doc)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use super::storage::{
    ChainTail, LedgerError, LedgerStats, SequenceSkip, select_drift_observations, select_one,
    select_page, select_predecessor, select_skips, select_stats, select_tail,
};
use crate::event::LedgerEvent;
use crate::time::DriftObservation;

/// One page of a range read.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPage {
    /// Events in ascending sequence order.
    pub events: Vec<LedgerEvent>,
    /// Whether more events exist in the requested range after this page.
    pub has_more: bool,
}

/// Anything that can serve ledger events by sequence range.
///
/// The ledger itself, a read-only [`LedgerReader`] and an offline export
/// file all implement this, so verification walks the same pages regardless
/// of where the events come from.
pub trait EventSource {
    /// Error raised by the underlying store.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Returns up to `page_size` events with `start <= sequence <= end` in
    /// ascending order. `end` is inclusive; pass `u64::MAX` to read to the
    /// tail.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read or `start > end`.
    fn get_events(&self, start: u64, end: u64, page_size: usize) -> Result<EventPage, Self::Error>;

    /// The event with the greatest sequence strictly below `sequence`.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read.
    fn predecessor(&self, sequence: u64) -> Result<Option<LedgerEvent>, Self::Error>;
}

impl<S: EventSource + ?Sized> EventSource for &S {
    type Error = S::Error;

    fn get_events(&self, start: u64, end: u64, page_size: usize) -> Result<EventPage, Self::Error> {
        (**self).get_events(start, end, page_size)
    }

    fn predecessor(&self, sequence: u64) -> Result<Option<LedgerEvent>, Self::Error> {
        (**self).predecessor(sequence)
    }
}

/// Iterator over a sequence range, fetching one page at a time.
///
/// Memory use is bounded by the page size. After an error, iteration stops;
/// a new reader started at [`RangeReader::cursor`] resumes where this one
/// left off.
#[derive(Debug)]
pub struct RangeReader<'a, S: EventSource + ?Sized> {
    source: &'a S,
    next: u64,
    end: u64,
    page_size: usize,
    buffer: VecDeque<LedgerEvent>,
    exhausted: bool,
}

impl<'a, S: EventSource + ?Sized> RangeReader<'a, S> {
    /// Reads `start..=end` from `source`.
    #[must_use]
    pub fn new(source: &'a S, start: u64, end: u64, page_size: usize) -> Self {
        Self {
            source,
            next: start,
            end,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            exhausted: start > end,
        }
    }

    /// Sequence to resume from: one past the last event yielded.
    #[must_use]
    pub const fn cursor(&self) -> u64 {
        self.next
    }

    fn fill(&mut self) -> Result<(), S::Error> {
        let page = self.source.get_events(self.next, self.end, self.page_size)?;
        match page.events.last() {
            Some(last) if page.has_more && last.sequence < self.end => {},
            _ => self.exhausted = true,
        }
        self.buffer.extend(page.events);
        Ok(())
    }
}

impl<S: EventSource + ?Sized> Iterator for RangeReader<'_, S> {
    type Item = Result<LedgerEvent, S::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(error) = self.fill() {
                self.exhausted = true;
                return Some(Err(error));
            }
        }
        let event = self.buffer.pop_front()?;
        // Never step back, even if a source returns out-of-order rows.
        self.next = self.next.max(event.sequence.saturating_add(1));
        Some(Ok(event))
    }
}

/// A read-only view of the ledger on its own connection.
#[derive(Debug)]
pub struct LedgerReader {
    conn: Mutex<Connection>,
}

impl LedgerReader {
    /// Opens an existing ledger file read-only.
    ///
    /// Auditors use this directly. It never creates or migrates a database.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be opened.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, LedgerError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(busy_timeout)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Reads a single event by sequence.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::EventNotFound`] if no event has that sequence.
    pub fn read_one(&self, sequence: u64) -> Result<LedgerEvent, LedgerError> {
        select_one(&self.conn.lock().unwrap(), sequence)
    }

    /// Iterates `start..=end` in pages of `page_size`.
    #[must_use]
    pub fn read_range(&self, start: u64, end: u64, page_size: usize) -> RangeReader<'_, Self> {
        RangeReader::new(self, start, end, page_size)
    }

    /// Current chain tail as seen by this reader.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn tail(&self) -> Result<ChainTail, LedgerError> {
        select_tail(&self.conn.lock().unwrap())
    }

    /// All logged sequence skips.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn sequence_skips(&self) -> Result<Vec<SequenceSkip>, LedgerError> {
        select_skips(&self.conn.lock().unwrap())
    }

    /// Recorded drift observations.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn drift_observations(&self) -> Result<Vec<DriftObservation>, LedgerError> {
        select_drift_observations(&self.conn.lock().unwrap())
    }

    /// Ledger statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn stats(&self) -> Result<LedgerStats, LedgerError> {
        select_stats(&self.conn.lock().unwrap())
    }
}

impl EventSource for LedgerReader {
    type Error = LedgerError;

    fn get_events(&self, start: u64, end: u64, page_size: usize) -> Result<EventPage, LedgerError> {
        select_page(&self.conn.lock().unwrap(), start, end, page_size)
    }

    fn predecessor(&self, sequence: u64) -> Result<Option<LedgerEvent>, LedgerError> {
        select_predecessor(&self.conn.lock().unwrap(), sequence)
    }
}
