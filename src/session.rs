//! Replay session: the state that travels with the relay baton
//!
//! A [`ReplaySession`] owns the prefetching parser, the dispatch table and
//! the replay state, and wraps every dispatched call with snapshot capture
//! and the state-dump stop condition.

use crate::call::{Call, CallRef};
use crate::callset::CallSet;
use crate::error::Result;
use crate::player::Player;
use crate::relay::RaceSession;
use crate::snapshot::Snapshotter;
use crate::source::Bookmark;
use crate::state::ReplayState;
use crate::threaded_parser::ThreadedParser;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of the call being dispatched, for the panic hook
static LAST_CALL_NO: AtomicU64 = AtomicU64::new(u64::MAX);

/// Report the call being replayed when a panic takes the process down
pub fn install_panic_handler() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let no = LAST_CALL_NO.load(Ordering::Relaxed);
        if no != u64::MAX {
            eprintln!("{}: error: caught an unhandled exception", no);
        }
        previous(info);
    }));
}

/// Snapshot selection plus the writer they go to
pub struct SnapshotPlan {
    pub calls: CallSet,
    pub snapshotter: Snapshotter,
}

pub struct ReplaySession {
    parser: ThreadedParser,
    player: Player,
    pub state: ReplayState,
    snapshots: Option<SnapshotPlan>,
    dump_state_at: Option<u64>,
    dump_out: Box<dyn Write + Send>,
    stopped: bool,
}

impl ReplaySession {
    pub fn new(parser: ThreadedParser, player: Player, state: ReplayState) -> Self {
        Self {
            parser,
            player,
            state,
            snapshots: None,
            dump_state_at: None,
            dump_out: Box::new(std::io::stdout()),
            stopped: false,
        }
    }

    pub fn with_snapshots(mut self, plan: SnapshotPlan) -> Self {
        self.snapshots = Some(plan);
        self
    }

    /// Dump the current state as JSON once call `no` has been replayed,
    /// then stop
    pub fn with_dump_state(mut self, no: u64, out: Box<dyn Write + Send>) -> Self {
        self.dump_state_at = Some(no);
        self.dump_out = out;
        self
    }

    pub fn player(&self) -> &Player {
        &self.player
    }

    pub fn snapshots_taken(&self) -> u64 {
        self.snapshots
            .as_ref()
            .map(|plan| plan.snapshotter.snapshots_taken())
            .unwrap_or(0)
    }

    /// Whether a state dump was written and replay stopped
    pub fn state_dumped(&self) -> bool {
        self.stopped
    }

    pub fn percent_read(&self) -> u8 {
        self.parser.percent_read()
    }

    pub fn close(&mut self) {
        self.parser.close();
    }

    fn take_snapshot(&mut self, call: &Call, no: u64) -> Result<()> {
        let Some(plan) = self.snapshots.as_mut() else {
            return Ok(());
        };
        if !plan.calls.contains(call) {
            return Ok(());
        }
        let image = self.state.snapshot();
        plan.snapshotter.take(image, no)
    }

    fn dump_state(&mut self, call: &Call) -> Result<()> {
        match self.state.dump_state() {
            Some(dump) => {
                serde_json::to_writer_pretty(&mut self.dump_out, &dump)
                    .map_err(std::io::Error::from)?;
                writeln!(self.dump_out)?;
                self.dump_out.flush()?;
                self.stopped = true;
            }
            // Inside glBegin/glEnd or nothing bound; try again on the next call.
            None => tracing::debug!(call_no = call.no, "state not dumpable yet"),
        }
        Ok(())
    }
}

impl RaceSession for ReplaySession {
    fn parse_call(&mut self) -> Result<Option<CallRef>> {
        Ok(self.parser.parse_call()?)
    }

    fn get_bookmark(&self) -> Bookmark {
        self.parser.get_bookmark()
    }

    fn set_bookmark(&mut self, bookmark: &Bookmark) -> Result<()> {
        Ok(self.parser.set_bookmark(bookmark)?)
    }

    fn retain_from(&mut self, bookmark: &Bookmark) {
        self.parser.retain_from(bookmark);
    }

    fn play_call(&mut self, call: &Call) -> Result<()> {
        LAST_CALL_NO.store(call.no, Ordering::Relaxed);

        // The frame being presented belongs to the calls before the swap.
        let swaps = call.swaps_render_target();
        if swaps {
            let no = if call.ends_frame() {
                call.no
            } else {
                call.no.saturating_sub(1)
            };
            self.take_snapshot(call, no)?;
        }

        self.player.play(&mut self.state, call)?;
        if call.ends_frame() {
            self.state.count_frame();
        }

        if !swaps {
            self.take_snapshot(call, call.no)?;
        }

        if self.dump_state_at.is_some_and(|at| call.no >= at) {
            self.dump_state(call)?;
        }
        Ok(())
    }

    fn flush_rendering(&mut self) -> Result<()> {
        self.state.flush_rendering()
    }

    fn should_stop(&self) -> bool {
        self.stopped
    }
}

impl std::fmt::Debug for ReplaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplaySession")
            .field("parser", &self.parser)
            .field("state", &self.state)
            .field("dump_state_at", &self.dump_state_at)
            .field("stopped", &self.stopped)
            .finish()
    }
}
