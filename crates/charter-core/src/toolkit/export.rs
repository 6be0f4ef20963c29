//! Offline export files.
//!
//! An export is UTF-8 JSON Lines: one [`LedgerEvent`] object per line in
//! ascending sequence order, byte fields as lowercase hex. [`ExportFile`]
//! serves such a file through [`EventSource`], so an auditor can run the
//! exact same verification offline that they would run against a live
//! ledger.
//!
//! An export that starts above sequence 1 opens with one [`ExportHeader`]
//! line carrying the range start and the event just below it, so the first
//! exported link can be checked offline.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::event::LedgerEvent;
use crate::ledger::{DEFAULT_PAGE_SIZE, EventPage, EventSource, RangeReader};

/// Errors reading or writing export files.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExportError {
    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line is not a valid event record.
    #[error("invalid event record on line {line}: {source}")]
    InvalidRecord {
        /// 1-based line number.
        line: usize,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },

    /// An event could not be encoded.
    #[error("failed to encode event {sequence}: {source}")]
    Encode {
        /// Sequence of the event.
        sequence: u64,
        /// Encoder error.
        #[source]
        source: serde_json::Error,
    },

    /// The source being exported failed.
    #[error("event source failed: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A range with `start > end` was requested.
    #[error("invalid range: {start}..={end}")]
    InvalidRange {
        /// Range start.
        start: u64,
        /// Range end.
        end: u64,
    },
}

/// First line of a sub-range export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportHeader {
    /// First sequence requested by the export.
    pub range_start: u64,
    /// Nearest event below `range_start`, if the ledger has one.
    pub anchor: Option<LedgerEvent>,
}

/// Writes `start..=end` of `source` as JSON Lines.
///
/// Returns the number of events written.
///
/// # Errors
///
/// Returns [`ExportError`] if the source or the writer fails.
pub fn export_range<S, W>(source: &S, start: u64, end: u64, writer: W) -> Result<u64, ExportError>
where
    S: EventSource + ?Sized,
    W: Write,
{
    export_range_paged(source, start, end, DEFAULT_PAGE_SIZE, writer)
}

/// [`export_range`] with an explicit page size.
///
/// # Errors
///
/// Returns [`ExportError`] if the source or the writer fails.
pub fn export_range_paged<S, W>(
    source: &S,
    start: u64,
    end: u64,
    page_size: usize,
    writer: W,
) -> Result<u64, ExportError>
where
    S: EventSource + ?Sized,
    W: Write,
{
    if start > end {
        return Err(ExportError::InvalidRange { start, end });
    }

    let mut writer = BufWriter::new(writer);
    if start > 1 {
        let header = ExportHeader {
            range_start: start,
            anchor: source
                .predecessor(start)
                .map_err(|e| ExportError::Source(Box::new(e)))?,
        };
        serde_json::to_writer(&mut writer, &header).map_err(|source| ExportError::Encode {
            sequence: start,
            source,
        })?;
        writer.write_all(b"\n")?;
    }

    let mut written = 0u64;
    for event in RangeReader::new(source, start, end, page_size) {
        let event = event.map_err(|e| ExportError::Source(Box::new(e)))?;
        serde_json::to_writer(&mut writer, &event).map_err(|source| ExportError::Encode {
            sequence: event.sequence,
            source,
        })?;
        writer.write_all(b"\n")?;
        written += 1;
    }
    writer.flush()?;

    info!(start, end, written, "export finished");
    Ok(written)
}

/// A JSON Lines export opened for verification.
///
/// Opening scans the file once to build a sequence index. Events are then
/// read from disk page by page.
#[derive(Debug)]
pub struct ExportFile {
    reader: Mutex<BufReader<File>>,
    /// `(sequence, byte offset, line number)` sorted by sequence.
    index: Vec<(u64, u64, usize)>,
    header: Option<ExportHeader>,
}

impl ExportFile {
    /// Opens and indexes an export file.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::InvalidRecord`] for the first line that is not
    /// an event record, or an I/O error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ExportError> {
        let mut reader = BufReader::new(File::open(path.as_ref())?);
        let mut index = Vec::new();
        let mut offset = 0u64;
        let mut line = String::new();
        let mut line_no = 0usize;
        let mut header = None;

        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                break;
            }
            line_no += 1;
            if !line.trim().is_empty() {
                let first_record = index.is_empty() && header.is_none();
                match first_record
                    .then(|| serde_json::from_str::<ExportHeader>(&line).ok())
                    .flatten()
                {
                    Some(parsed) => header = Some(parsed),
                    None => {
                        let event: LedgerEvent = serde_json::from_str(&line).map_err(|source| {
                            ExportError::InvalidRecord {
                                line: line_no,
                                source,
                            }
                        })?;
                        index.push((event.sequence, offset, line_no));
                    },
                }
            }
            offset += read as u64;
        }
        // Stable, so duplicates keep file order for the verifier to flag.
        index.sort_by_key(|(sequence, _, _)| *sequence);

        debug!(path = %path.as_ref().display(), events = index.len(), "indexed export file");
        Ok(Self {
            reader: Mutex::new(reader),
            index,
            header,
        })
    }

    /// Number of event records in the file.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the file holds no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// First sequence the export was taken from: the header's range start,
    /// or 1 for a full export.
    #[must_use]
    pub fn range_start(&self) -> u64 {
        self.header.as_ref().map_or(1, |h| h.range_start)
    }

    /// Event recorded below the exported range, if any.
    #[must_use]
    pub fn anchor(&self) -> Option<&LedgerEvent> {
        self.header.as_ref()?.anchor.as_ref()
    }

    /// Lowest and highest sequence in the file.
    #[must_use]
    pub fn sequence_bounds(&self) -> Option<(u64, u64)> {
        Some((self.index.first()?.0, self.index.last()?.0))
    }

    #[allow(clippy::missing_panics_doc)]
    fn read_at(&self, offset: u64, line_no: usize) -> Result<LedgerEvent, ExportError> {
        // Mutex poisoning indicates a panic in another thread, which is
        // unrecoverable.
        let mut reader = self.reader.lock().unwrap();
        reader.seek(SeekFrom::Start(offset))?;
        let mut line = String::new();
        reader.read_line(&mut line)?;
        serde_json::from_str(&line).map_err(|source| ExportError::InvalidRecord {
            line: line_no,
            source,
        })
    }
}

impl EventSource for ExportFile {
    type Error = ExportError;

    fn get_events(&self, start: u64, end: u64, page_size: usize) -> Result<EventPage, ExportError> {
        if start > end {
            return Err(ExportError::InvalidRange { start, end });
        }
        let page_size = page_size.max(1);
        let first = self.index.partition_point(|(sequence, _, _)| *sequence < start);
        let in_range: Vec<(u64, usize)> = self.index[first..]
            .iter()
            .take_while(|(sequence, _, _)| *sequence <= end)
            .take(page_size + 1)
            .map(|(_, offset, line_no)| (*offset, *line_no))
            .collect();

        let has_more = in_range.len() > page_size;
        let events = in_range
            .into_iter()
            .take(page_size)
            .map(|(offset, line_no)| self.read_at(offset, line_no))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(EventPage { events, has_more })
    }

    fn predecessor(&self, sequence: u64) -> Result<Option<LedgerEvent>, ExportError> {
        let below = self.index.partition_point(|(s, _, _)| *s < sequence);
        if let Some(i) = below.checked_sub(1) {
            let (_, offset, line_no) = self.index[i];
            return self.read_at(offset, line_no).map(Some);
        }
        Ok(self
            .anchor()
            .filter(|anchor| anchor.sequence < sequence)
            .cloned())
    }
}
