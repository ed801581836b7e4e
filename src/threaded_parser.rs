//! Prefetching call stream
//!
//! [`ThreadedParser`] offers the same open / bookmark / parse contract as a
//! [`CallSource`] but serves calls from a local queue that the shared
//! [`Prefetcher`] keeps topped up in the background.
//!
//! Calls live in an arena of shared records. Everything before `cursor` has
//! already been handed out; everything from `cursor` on is the live queue.
//! Handed-out records are passed to the reclaimer in bulk once more than a
//! batch of them has piled up, except those at or after the pinned
//! bookmark, which stay resident so loop playback can splice back to them
//! without touching the container. A pin holding more than
//! [`PINNED_BATCHES`] batches is released, and a later rewind to it seeks
//! the container instead.

use crate::call::CallRef;
use crate::error::TraceResult;
use crate::prefetch::{lock, ConsumerSlot, Prefetcher, SharedSource};
use crate::source::{Bookmark, CallSource};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// How long `open` waits for the first batch before returning
const PRIME_TIMEOUT: Duration = Duration::from_millis(100);

/// Batches a pinned bookmark may keep resident before the pin is released
pub const PINNED_BATCHES: usize = 2;

pub struct ThreadedParser {
    prefetcher: Arc<Prefetcher>,
    source: SharedSource,
    slot: Arc<ConsumerSlot>,
    calls: VecDeque<CallRef>,
    cursor: usize,
    /// Call number of the oldest record that must stay resident
    pinned: Option<u64>,
    batch_size: usize,
    low_water: usize,
}

impl ThreadedParser {
    pub fn new(prefetcher: Arc<Prefetcher>, source: Box<dyn CallSource>) -> Self {
        let slot = prefetcher.register();
        let config = prefetcher.config();
        let batch_size = config.batch_size.max(1);
        let low_water = config.low_water.min(batch_size - 1);
        Self {
            prefetcher,
            source: Arc::new(Mutex::new(source)),
            slot,
            calls: VecDeque::new(),
            cursor: 0,
            pinned: None,
            batch_size,
            low_water,
        }
    }

    /// Open a trace and prime the pipeline with a first fill
    pub fn open(&mut self, path: &Path) -> TraceResult<()> {
        self.discard_all();
        lock(&self.source).open(path)?;

        if self.prefetcher.request_fill(&self.slot, &self.source) {
            let deadline = Instant::now() + PRIME_TIMEOUT;
            let mut outbox = lock(&self.slot.outbox);
            while outbox.pending {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                outbox = self
                    .slot
                    .ready
                    .wait_timeout(outbox, deadline - now)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|e| e.into_inner().0);
            }
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.discard_all();
        self.pinned = None;
        lock(&self.source).close();
    }

    /// Next call, or `None` once the stream is exhausted
    pub fn parse_call(&mut self) -> TraceResult<Option<CallRef>> {
        if self.cursor >= self.calls.len() && !self.refill_blocking()? {
            return Ok(None);
        }

        let call = self.calls[self.cursor].clone();
        self.cursor += 1;

        let live = self.calls.len() - self.cursor;
        if live <= self.low_water || live == self.batch_size {
            self.take_ready();
            self.request_more();
        }
        if self.cursor > self.batch_size {
            self.reclaim();
        }
        Ok(Some(call))
    }

    /// Position of the next call [`parse_call`](Self::parse_call) will return
    pub fn get_bookmark(&self) -> Bookmark {
        if let Some(call) = self.calls.get(self.cursor) {
            return Bookmark {
                offset: call.offset,
                next_call_no: call.no,
            };
        }

        let outbox = self.slot.wait_idle(lock(&self.slot.outbox));
        if let Some(call) = outbox.batch.front() {
            return Bookmark {
                offset: call.offset,
                next_call_no: call.no,
            };
        }
        drop(outbox);
        lock(&self.source).get_bookmark()
    }

    /// Reposition to a bookmark taken on this stream
    ///
    /// A target still resident in the arena is spliced back in without
    /// touching the container. Anything else falls back to a container seek.
    pub fn set_bookmark(&mut self, bookmark: &Bookmark) -> TraceResult<()> {
        if let Ok(index) = self
            .calls
            .binary_search_by_key(&bookmark.next_call_no, |c| c.no)
        {
            if self.calls[index].offset == bookmark.offset {
                let before: Vec<CallRef> = self.calls.drain(..index).collect();
                self.prefetcher.retire(before);
                self.cursor = 0;
                self.pinned = Some(bookmark.next_call_no);
                tracing::trace!(call_no = bookmark.next_call_no, "bookmark spliced from arena");
                return Ok(());
            }
        }

        self.discard_all();
        let mut outbox = self.slot.wait_idle(lock(&self.slot.outbox));
        lock(&self.source).set_bookmark(bookmark)?;
        outbox.eof = false;
        outbox.error = None;
        drop(outbox);
        self.pinned = Some(bookmark.next_call_no);
        tracing::debug!(
            offset = bookmark.offset,
            call_no = bookmark.next_call_no,
            "bookmark restored from container"
        );
        Ok(())
    }

    /// Keep every call from `bookmark` on resident until the next pin
    pub fn retain_from(&mut self, bookmark: &Bookmark) {
        self.pinned = Some(bookmark.next_call_no);
    }

    pub fn percent_read(&self) -> u8 {
        lock(&self.source).percent_read()
    }

    /// Records currently held in the arena, consumed or not
    pub fn resident(&self) -> usize {
        self.calls.len()
    }

    /// Move whatever the producer has deposited into the local queue
    fn take_ready(&mut self) -> bool {
        let mut outbox = lock(&self.slot.outbox);
        if outbox.batch.is_empty() {
            return false;
        }
        self.calls
            .extend(outbox.batch.drain(..).map(Arc::new));
        true
    }

    fn request_more(&self) {
        let outbox = lock(&self.slot.outbox);
        if outbox.pending || outbox.eof || !outbox.batch.is_empty() {
            return;
        }
        drop(outbox);
        self.prefetcher.request_fill(&self.slot, &self.source);
    }

    /// Wait until the local queue is non-empty; `false` means end of stream
    fn refill_blocking(&mut self) -> TraceResult<bool> {
        let idle = self.prefetcher.config().idle_sleep();
        loop {
            {
                let mut outbox = self.slot.wait_idle(lock(&self.slot.outbox));
                if !outbox.batch.is_empty() {
                    self.calls.extend(outbox.batch.drain(..).map(Arc::new));
                    return Ok(true);
                }
                if let Some(error) = outbox.error.take() {
                    return Err(error);
                }
                if outbox.eof {
                    return Ok(false);
                }
            }
            if !self.prefetcher.request_fill(&self.slot, &self.source) {
                // Another consumer holds the inbox.
                thread::sleep(idle);
            }
        }
    }

    /// Hand consumed records below the pin to the reclaimer
    fn reclaim(&mut self) {
        let mut floor = self.cursor;
        if let Some(no) = self.pinned {
            let start = self.calls.partition_point(|c| c.no < no);
            if self.calls.len() - start > PINNED_BATCHES * self.batch_size {
                tracing::debug!(call_no = no, "pinned span too long, releasing pin");
                self.pinned = None;
            } else {
                floor = start.min(self.cursor);
            }
        }
        if floor == 0 {
            return;
        }
        let retired: Vec<CallRef> = self.calls.drain(..floor).collect();
        self.cursor -= floor;
        self.prefetcher.retire(retired);
    }

    /// Drop the arena and any in-flight batch
    fn discard_all(&mut self) {
        let arena: Vec<CallRef> = self.calls.drain(..).collect();
        self.cursor = 0;
        self.prefetcher.retire(arena);

        let mut outbox = self.slot.wait_idle(lock(&self.slot.outbox));
        let stale: Vec<CallRef> = outbox.batch.drain(..).map(Arc::new).collect();
        outbox.eof = false;
        outbox.error = None;
        drop(outbox);
        self.prefetcher.retire(stale);
    }
}

impl Drop for ThreadedParser {
    fn drop(&mut self) {
        // The producer may still be reading from our source.
        let _outbox = self.slot.wait_idle(lock(&self.slot.outbox));
    }
}

impl std::fmt::Debug for ThreadedParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedParser")
            .field("consumer", &self.slot.id())
            .field("resident", &self.calls.len())
            .field("cursor", &self.cursor)
            .field("pinned", &self.pinned)
            .finish()
    }
}
