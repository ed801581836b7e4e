//! Top-level replay driver
//!
//! Opens one trace, assembles a [`ReplaySession`] from the configuration and
//! runs it through a [`RelayRace`]. Traces are replayed one at a time; the
//! prefetcher is shared between them.

use crate::config::ReplayConfig;
use crate::error::Result;
use crate::player::Player;
use crate::prefetch::Prefetcher;
use crate::profiling::CallProfiler;
use crate::relay::RelayRace;
use crate::session::{ReplaySession, SnapshotPlan};
use crate::snapshot::Snapshotter;
use crate::state::ReplayState;
use crate::threaded_parser::ThreadedParser;
use crate::trace_file::{validate_trace, TraceFile};
use crate::ws::WindowSystem;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// What one replayed trace amounted to
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub frames: u64,
    pub calls: u64,
    pub runners: usize,
    pub handoffs: u64,
    pub loops: u32,
    pub warnings: u64,
    pub snapshots: u64,
    pub seconds: f64,
    /// Replay stopped early after writing a state dump
    pub state_dumped: bool,
}

impl RunSummary {
    pub fn fps(&self) -> f64 {
        if self.seconds > 0.0 {
            self.frames as f64 / self.seconds
        } else {
            0.0
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rendered {} frames in {:.6} secs, average of {:.3} fps",
            self.frames,
            self.seconds,
            self.fps()
        )
    }
}

/// Replay the trace at `path` against `ws`
pub fn replay_trace(
    path: &Path,
    config: &ReplayConfig,
    prefetcher: &Arc<Prefetcher>,
    ws: Box<dyn WindowSystem>,
) -> Result<RunSummary> {
    validate_trace(path)?;

    let mut parser = ThreadedParser::new(Arc::clone(prefetcher), Box::new(TraceFile::new()));
    parser.open(path)?;

    let profiler = config
        .profiling
        .any()
        .then(|| CallProfiler::new(config.profiling));
    let state = ReplayState::new(ws, config.state_options(), profiler);
    let mut session = ReplaySession::new(parser, Player::with_all_apis(), state);

    if let Some(prefix) = config.snapshot.prefix.as_deref() {
        let plan = SnapshotPlan {
            calls: config.snapshot.call_set()?,
            snapshotter: Snapshotter::new(prefix, config.snapshot.format, config.snapshot.call_nos)
                .verbose(!config.benchmark),
        };
        session = session.with_snapshots(plan);
    }
    if let Some(no) = config.dump_state {
        session = session.with_dump_state(no, Box::new(std::io::stdout()));
    }

    tracing::info!(trace = %path.display(), "replay started");
    let start = Instant::now();
    let race = RelayRace::new(config.relay_options());
    let outcome = race.run(session);

    let mut session = outcome.session;
    let finished = outcome.result.and_then(|()| session.state.finish_rendering());
    let seconds = start.elapsed().as_secs_f64();

    let finished = finished.and_then(|()| {
        if config.wait {
            session.state.wait_for_input()
        } else {
            Ok(())
        }
    });
    session.state.tear_down();
    session.close();
    finished?;

    let summary = RunSummary {
        frames: session.state.frames(),
        calls: outcome.calls,
        runners: outcome.runners,
        handoffs: outcome.handoffs,
        loops: outcome.loops,
        warnings: session.state.warnings(),
        snapshots: session.snapshots_taken(),
        seconds,
        state_dumped: session.state_dumped(),
    };
    tracing::info!(
        frames = summary.frames,
        calls = summary.calls,
        runners = summary.runners,
        handoffs = summary.handoffs,
        "replay finished"
    );
    Ok(summary)
}
