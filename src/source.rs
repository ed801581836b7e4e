//! Call stream sources and bookmarks
//!
//! A [`CallSource`] yields call records in strictly increasing `no` order and
//! supports exactly one kind of seek: jumping back to a position captured
//! earlier with [`CallSource::get_bookmark`]. That is all loop playback needs.

use crate::call::Call;
use crate::error::{TraceError, TraceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Restorable cursor into a call stream
///
/// Restoring a bookmark reproduces the exact call sequence that followed the
/// point where it was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Bookmark {
    /// Byte offset of the next record
    pub offset: u64,
    /// Number of the call that will be produced next
    pub next_call_no: u64,
}

/// Ordered producer of call records
pub trait CallSource: Send {
    /// Open a trace container, validating its header
    fn open(&mut self, path: &Path) -> TraceResult<()>;

    fn close(&mut self);

    /// Capture the current position
    fn get_bookmark(&self) -> Bookmark;

    /// Reposition to a previously captured bookmark
    fn set_bookmark(&mut self, bookmark: &Bookmark) -> TraceResult<()>;

    /// Next call, or `None` at end of stream
    fn parse_call(&mut self) -> TraceResult<Option<Call>>;

    /// Percentage of the container consumed so far
    fn percent_read(&self) -> u8 {
        0
    }
}

/// In-memory call stream, addressed by record index
///
/// Useful for synthesized streams and for driving the scheduler without a
/// container on disk. Bookmark offsets are record indices.
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    calls: Vec<Call>,
    cursor: usize,
}

impl MemorySource {
    pub fn new(calls: Vec<Call>) -> Self {
        Self { calls, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

impl CallSource for MemorySource {
    fn open(&mut self, _path: &Path) -> TraceResult<()> {
        self.cursor = 0;
        Ok(())
    }

    fn close(&mut self) {
        self.cursor = self.calls.len();
    }

    fn get_bookmark(&self) -> Bookmark {
        let next_call_no = match self.calls.get(self.cursor) {
            Some(call) => call.no,
            None => self.calls.last().map(|c| c.no + 1).unwrap_or(0),
        };
        Bookmark {
            offset: self.cursor as u64,
            next_call_no,
        }
    }

    fn set_bookmark(&mut self, bookmark: &Bookmark) -> TraceResult<()> {
        if bookmark.offset as usize > self.calls.len() {
            return Err(TraceError::InvalidBookmark {
                offset: bookmark.offset,
            });
        }
        self.cursor = bookmark.offset as usize;
        Ok(())
    }

    fn parse_call(&mut self) -> TraceResult<Option<Call>> {
        let call = self.calls.get(self.cursor).cloned().map(|mut call| {
            call.offset = self.cursor as u64;
            call
        });
        if call.is_some() {
            self.cursor += 1;
        }
        Ok(call)
    }

    fn percent_read(&self) -> u8 {
        if self.calls.is_empty() {
            100
        } else {
            (self.cursor * 100 / self.calls.len()) as u8
        }
    }
}
