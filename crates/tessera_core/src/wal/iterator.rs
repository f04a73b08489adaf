//! Streaming WAL record iterator.
//!
//! Reads one record at a time through the [`WalManager`], so replay of a
//! large log uses memory proportional to the largest record, not the log.
//!
//! The iterator does not hold the backend lock between records; appends
//! issued while iterating land after the size observed at each step.

use crate::error::CoreResult;
use crate::wal::record::WalRecord;
use crate::wal::writer::WalManager;

/// A streaming iterator over WAL records, yielding `(offset, record)`.
///
/// An incomplete record at the tail ends iteration cleanly; use
/// [`valid_end`](Self::valid_end) afterwards to find where the intact
/// prefix stops. Bad magic, unknown tags, future versions and CRC
/// mismatches are yielded as errors and end iteration.
pub struct WalRecordIterator<'a> {
    wal: &'a WalManager,
    offset: u64,
    finished: bool,
}

impl<'a> WalRecordIterator<'a> {
    /// Creates an iterator starting at `start_offset`.
    pub fn new(wal: &'a WalManager, start_offset: u64) -> Self {
        Self {
            wal,
            offset: start_offset,
            finished: false,
        }
    }

    /// Offset just past the last complete record yielded.
    pub fn valid_end(&self) -> u64 {
        self.offset
    }
}

impl Iterator for WalRecordIterator<'_> {
    type Item = CoreResult<(u64, WalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.wal.read_record_at(self.offset) {
            Ok(Some((record, next))) => {
                let offset = self.offset;
                self.offset = next;
                Some(Ok((offset, record)))
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
