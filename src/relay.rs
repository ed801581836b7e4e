//! Relay race scheduler
//!
//! Each thread of record in a trace gets a runner. A runner replays calls
//! for its leg until the stream produces a call for another leg, then hands
//! that call, together with everything needed to keep replaying, to the
//! runner that owns it. The bundle being handed over is the baton: exactly
//! one runner holds it at a time, so replayed calls never overlap even
//! though they are issued from different OS threads.
//!
//! The fore runner (leg 0) runs on the calling thread. It starts the race,
//! receives the baton back at the finish line and is the only runner that
//! stops the others. Every other runner gets a scoped worker thread the
//! first time the stream mentions its leg.
//!
//! ```text
//!   fore (caller)          leg 1 worker          leg 2 worker
//!   play 0..k   --baton-->  play k..m   --baton-->  play m..
//!   play ..     <--baton--------------------------  end of stream
//!   stop all
//! ```

use crate::call::{Call, CallRef};
use crate::error::{ReplayError, Result};
use crate::prefetch::lock;
use crate::source::Bookmark;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, Scope};

/// What the race needs from a replay session
///
/// The session travels with the baton; only the runner holding it calls
/// these methods.
pub trait RaceSession: Send {
    /// Next call in the shared stream
    fn parse_call(&mut self) -> Result<Option<CallRef>>;

    fn get_bookmark(&self) -> Bookmark;

    fn set_bookmark(&mut self, bookmark: &Bookmark) -> Result<()>;

    /// Hint that the stream will be rewound to `bookmark` later
    fn retain_from(&mut self, _bookmark: &Bookmark) {}

    fn play_call(&mut self, call: &Call) -> Result<()>;

    /// Push buffered rendering out before another leg takes over
    fn flush_rendering(&mut self) -> Result<()>;

    /// Request a clean stop after the current call
    fn should_stop(&self) -> bool {
        false
    }
}

/// Race behaviour switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayOptions {
    /// Replay every call on the fore runner regardless of thread id
    pub single_thread: bool,
    /// Rewind to the start of the last frame at end of stream
    pub loop_last_frame: bool,
    /// Cap on loop rewinds; unbounded when `None`
    pub loop_count: Option<u32>,
}

/// Result of a finished race
#[derive(Debug)]
pub struct RaceOutcome<S> {
    pub session: S,
    /// Runners created, the fore runner included
    pub runners: usize,
    pub handoffs: u64,
    pub loops: u32,
    pub calls: u64,
    /// First error that ended the race early
    pub result: Result<()>,
}

/// Session plus per-race bookkeeping; this is what the baton carries
struct Carrier<S> {
    session: S,
    last_frame_start: Option<Bookmark>,
    loops: u32,
    handoffs: u64,
    calls: u64,
    error: Option<ReplayError>,
}

impl<S: RaceSession> Carrier<S> {
    fn new(session: S) -> Self {
        Self {
            session,
            last_frame_start: None,
            loops: 0,
            handoffs: 0,
            calls: 0,
            error: None,
        }
    }

    fn fail(&mut self, error: ReplayError) {
        tracing::error!(%error, "race aborted");
        self.error.get_or_insert(error);
    }

    fn confirm_frame_start(&mut self, bookmark: Bookmark) {
        self.session.retain_from(&bookmark);
        self.last_frame_start = Some(bookmark);
    }

    /// Next call, rewinding to the last frame start at end of stream when
    /// looping
    fn next_call(&mut self, options: &RelayOptions) -> Option<CallRef> {
        match self.session.parse_call() {
            Ok(Some(call)) => Some(call),
            Ok(None) => self.rewind(options),
            Err(e) => {
                self.fail(e);
                None
            }
        }
    }

    fn rewind(&mut self, options: &RelayOptions) -> Option<CallRef> {
        if !options.loop_last_frame || self.calls == 0 {
            return None;
        }
        if options.loop_count.is_some_and(|max| self.loops >= max) {
            return None;
        }
        let bookmark = self.last_frame_start?;
        if let Err(e) = self.session.set_bookmark(&bookmark) {
            self.fail(e);
            return None;
        }
        self.loops += 1;
        tracing::debug!(
            call_no = bookmark.next_call_no,
            loops = self.loops,
            "looping last frame"
        );
        match self.session.parse_call() {
            Ok(call) => call,
            Err(e) => {
                self.fail(e);
                None
            }
        }
    }

    fn into_outcome(self, runners: usize) -> RaceOutcome<S> {
        RaceOutcome {
            session: self.session,
            runners,
            handoffs: self.handoffs,
            loops: self.loops,
            calls: self.calls,
            result: match self.error {
                Some(e) => Err(e),
                None => Ok(()),
            },
        }
    }
}

enum Baton<S> {
    /// Replay `call` and whatever follows it on this leg
    Run {
        call: CallRef,
        carrier: Box<Carrier<S>>,
    },
    /// The stream ended on another leg; only the fore runner gets this
    FinishLine(Box<Carrier<S>>),
    /// A worker panicked while holding the baton
    Aborted(Box<dyn Any + Send>),
}

struct Mailbox<S> {
    finished: bool,
    baton: Option<Baton<S>>,
}

/// One leg's execution unit
struct RelayRunner<S> {
    leg: u32,
    mailbox: Mutex<Mailbox<S>>,
    wake: Condvar,
}

impl<S> RelayRunner<S> {
    fn new(leg: u32) -> Self {
        Self {
            leg,
            mailbox: Mutex::new(Mailbox {
                finished: false,
                baton: None,
            }),
            wake: Condvar::new(),
        }
    }

    fn deliver(&self, baton: Baton<S>) {
        let mut mailbox = lock(&self.mailbox);
        assert!(
            mailbox.baton.is_none(),
            "leg {} handed a baton while already holding one",
            self.leg
        );
        mailbox.baton = Some(baton);
        drop(mailbox);
        self.wake.notify_one();
    }

    /// Block until a baton arrives; `None` once the race is over
    fn receive(&self) -> Option<Baton<S>> {
        let mut mailbox = lock(&self.mailbox);
        loop {
            if let Some(baton) = mailbox.baton.take() {
                return Some(baton);
            }
            if mailbox.finished {
                return None;
            }
            mailbox = self
                .wake
                .wait(mailbox)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn finish(&self) {
        lock(&self.mailbox).finished = true;
        self.wake.notify_all();
    }
}

/// One replay pass over a call stream
pub struct RelayRace<S> {
    options: RelayOptions,
    runners: Mutex<BTreeMap<u32, Arc<RelayRunner<S>>>>,
}

impl<S: RaceSession> RelayRace<S> {
    pub fn new(options: RelayOptions) -> Self {
        Self {
            options,
            runners: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    /// Runners created so far
    pub fn runner_count(&self) -> usize {
        lock(&self.runners).len()
    }

    /// Replay the whole stream; returns once every runner has stopped
    pub fn run(&self, session: S) -> RaceOutcome<S> {
        thread::scope(|scope| {
            let fore = self.runner(scope, 0);
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                self.fore_loop(scope, &fore, session)
            }));
            self.stop_runners();
            match result {
                Ok(carrier) => carrier.into_outcome(self.runner_count()),
                Err(payload) => panic::resume_unwind(payload),
            }
        })
    }

    fn leg_of(&self, call: &Call) -> u32 {
        if self.options.single_thread {
            0
        } else {
            call.thread_id
        }
    }

    /// Runner for `leg`, created on first reference
    fn runner<'scope, 'env>(
        &'scope self,
        scope: &'scope Scope<'scope, 'env>,
        leg: u32,
    ) -> Arc<RelayRunner<S>> {
        let mut runners = lock(&self.runners);
        if let Some(runner) = runners.get(&leg) {
            return runner.clone();
        }

        let runner = Arc::new(RelayRunner::new(leg));
        runners.insert(leg, runner.clone());
        drop(runners);

        if leg != 0 {
            let worker = runner.clone();
            thread::Builder::new()
                .name(format!("relay-leg-{}", leg))
                .spawn_scoped(scope, move || self.worker(scope, worker))
                .unwrap_or_else(|e| panic!("failed to spawn runner for leg {}: {}", leg, e));
        }
        tracing::debug!(leg, "runner created");
        runner
    }

    fn fore_loop<'scope, 'env>(
        &'scope self,
        scope: &'scope Scope<'scope, 'env>,
        fore: &Arc<RelayRunner<S>>,
        session: S,
    ) -> Box<Carrier<S>> {
        let mut carrier = Box::new(Carrier::new(session));
        if self.options.loop_last_frame {
            let start = carrier.session.get_bookmark();
            carrier.confirm_frame_start(start);
        }

        let mut finished = match carrier.next_call(&self.options) {
            None => Some(carrier),
            Some(call) if self.leg_of(&call) == 0 => self.run_leg(scope, fore, call, carrier),
            Some(call) => {
                self.pass_baton(scope, call, carrier);
                None
            }
        };

        loop {
            if let Some(carrier) = finished {
                return carrier;
            }
            finished = match fore.receive() {
                Some(Baton::Run { call, carrier }) => self.run_leg(scope, fore, call, carrier),
                Some(Baton::FinishLine(carrier)) => Some(carrier),
                Some(Baton::Aborted(payload)) => panic::resume_unwind(payload),
                None => unreachable!("fore runner stopped while the race was running"),
            };
        }
    }

    fn worker<'scope, 'env>(&'scope self, scope: &'scope Scope<'scope, 'env>, runner: Arc<RelayRunner<S>>) {
        while let Some(baton) = runner.receive() {
            let Baton::Run { call, carrier } = baton else {
                unreachable!("leg {} received a finish baton", runner.leg);
            };
            let leg = panic::catch_unwind(AssertUnwindSafe(|| {
                self.run_leg(scope, &runner, call, carrier)
            }));
            if let Err(payload) = leg {
                tracing::error!(leg = runner.leg, "runner panicked");
                self.runner(scope, 0).deliver(Baton::Aborted(payload));
            }
        }
        tracing::trace!(leg = runner.leg, "runner exited");
    }

    /// Replay calls on this runner's leg until the stream moves elsewhere
    ///
    /// Returns the carrier only when the fore runner reaches the end of the
    /// race itself; otherwise the baton has been passed on.
    fn run_leg<'scope, 'env>(
        &'scope self,
        scope: &'scope Scope<'scope, 'env>,
        runner: &RelayRunner<S>,
        mut call: CallRef,
        mut carrier: Box<Carrier<S>>,
    ) -> Option<Box<Carrier<S>>> {
        let next = loop {
            debug_assert_eq!(self.leg_of(&call), runner.leg);

            let frame_start = (self.options.loop_last_frame && call.ends_frame())
                .then(|| carrier.session.get_bookmark());

            if let Err(e) = carrier.session.play_call(&call) {
                carrier.fail(e);
                break None;
            }
            carrier.calls += 1;
            if carrier.session.should_stop() {
                break None;
            }

            let loops = carrier.loops;
            let next = carrier.next_call(&self.options);
            // A frame end only marks a loop point if more calls follow it.
            if let (Some(bookmark), Some(_)) = (frame_start, &next) {
                if carrier.loops == loops {
                    carrier.confirm_frame_start(bookmark);
                }
            }
            match next {
                Some(n) if self.leg_of(&n) == runner.leg => call = n,
                other => break other,
            }
        };

        match next {
            Some(call) => {
                if let Err(e) = carrier.session.flush_rendering() {
                    carrier.fail(e);
                    return self.cross_finish_line(scope, runner, carrier);
                }
                self.pass_baton(scope, call, carrier);
                None
            }
            None => self.cross_finish_line(scope, runner, carrier),
        }
    }

    fn pass_baton<'scope, 'env>(
        &'scope self,
        scope: &'scope Scope<'scope, 'env>,
        call: CallRef,
        mut carrier: Box<Carrier<S>>,
    ) {
        let leg = self.leg_of(&call);
        carrier.handoffs += 1;
        tracing::trace!(call_no = call.no, leg, "baton passed");
        self.runner(scope, leg).deliver(Baton::Run { call, carrier });
    }

    fn cross_finish_line<'scope, 'env>(
        &'scope self,
        scope: &'scope Scope<'scope, 'env>,
        runner: &RelayRunner<S>,
        carrier: Box<Carrier<S>>,
    ) -> Option<Box<Carrier<S>>> {
        if runner.leg == 0 {
            return Some(carrier);
        }
        tracing::debug!(leg = runner.leg, "finish line reached on worker leg");
        self.runner(scope, 0).deliver(Baton::FinishLine(carrier));
        None
    }

    fn stop_runners(&self) {
        let runners: Vec<_> = lock(&self.runners).values().cloned().collect();
        for runner in runners {
            runner.finish();
        }
    }
}

impl<S> std::fmt::Debug for RelayRace<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let legs: Vec<u32> = lock(&self.runners).keys().copied().collect();
        f.debug_struct("RelayRace")
            .field("options", &self.options)
            .field("legs", &legs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallFlags, FunctionSig};
    use crate::source::{CallSource, MemorySource};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// (call no, leg, thread name)
    type Played = (u64, u32, String);

    struct ScriptSession {
        source: MemorySource,
        played: Vec<Played>,
        flushes: u32,
        stop_after: Option<u64>,
        fail_at: Option<u64>,
        panic_at: Option<u64>,
        active: Arc<AtomicBool>,
    }

    impl ScriptSession {
        fn new(calls: Vec<Call>) -> Self {
            Self {
                source: MemorySource::new(calls),
                played: Vec::new(),
                flushes: 0,
                stop_after: None,
                fail_at: None,
                panic_at: None,
                active: Arc::new(AtomicBool::new(false)),
            }
        }

        fn order(&self) -> Vec<u64> {
            self.played.iter().map(|p| p.0).collect()
        }
    }

    impl RaceSession for ScriptSession {
        fn parse_call(&mut self) -> Result<Option<CallRef>> {
            Ok(self.source.parse_call()?.map(Arc::new))
        }

        fn get_bookmark(&self) -> Bookmark {
            self.source.get_bookmark()
        }

        fn set_bookmark(&mut self, bookmark: &Bookmark) -> Result<()> {
            Ok(self.source.set_bookmark(bookmark)?)
        }

        fn play_call(&mut self, call: &Call) -> Result<()> {
            assert!(!self.active.swap(true, Ordering::SeqCst), "calls overlapped");
            if self.panic_at == Some(call.no) {
                panic!("handler blew up");
            }
            let name = thread::current().name().unwrap_or("").to_string();
            self.played.push((call.no, call.thread_id, name));
            self.active.store(false, Ordering::SeqCst);
            if self.fail_at == Some(call.no) {
                return Err(ReplayError::WindowSystem("lost device".into()));
            }
            Ok(())
        }

        fn flush_rendering(&mut self) -> Result<()> {
            self.flushes += 1;
            Ok(())
        }

        fn should_stop(&self) -> bool {
            self.stop_after
                .is_some_and(|no| self.played.last().is_some_and(|p| p.0 >= no))
        }
    }

    fn script(threads: &[u32], frame_ends: &[u64]) -> Vec<Call> {
        let sig = Arc::new(FunctionSig::new(0, "glDrawArrays", &[]));
        threads
            .iter()
            .enumerate()
            .map(|(no, &thread_id)| Call {
                no: no as u64,
                thread_id,
                sig: sig.clone(),
                args: vec![],
                ret: None,
                flags: if frame_ends.contains(&(no as u64)) {
                    CallFlags::END_FRAME
                } else {
                    CallFlags::empty()
                },
                offset: 0,
            })
            .collect()
    }

    fn race(threads: &[u32], options: RelayOptions) -> RaceOutcome<ScriptSession> {
        RelayRace::new(options).run(ScriptSession::new(script(threads, &[])))
    }

    #[test]
    fn test_single_leg_preserves_order() {
        let outcome = race(&[0; 50], RelayOptions::default());
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.session.order(), (0..50).collect::<Vec<_>>());
        assert_eq!(outcome.runners, 1);
        assert_eq!(outcome.handoffs, 0);
    }

    #[test]
    fn test_handoff_and_return() {
        let outcome = race(&[0, 1, 0], RelayOptions::default());
        let played = &outcome.session.played;
        assert_eq!(outcome.session.order(), vec![0, 1, 2]);
        assert_eq!(played[1].2, "relay-leg-1");
        assert_ne!(played[0].2, "relay-leg-1");
        assert_eq!(played[0].2, played[2].2);
        assert_eq!(outcome.handoffs, 2);
        assert_eq!(outcome.session.flushes, 2);
    }

    #[test]
    fn test_runners_created_per_observed_leg() {
        let outcome = race(&[0, 3, 0, 7, 3, 0], RelayOptions::default());
        assert_eq!(outcome.runners, 3);
        assert_eq!(outcome.session.order(), (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn test_stream_may_start_and_end_off_the_fore_leg() {
        let outcome = race(&[2, 2, 0, 1], RelayOptions::default());
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.session.order(), vec![0, 1, 2, 3]);
        assert_eq!(outcome.runners, 3);
    }

    #[test]
    fn test_single_thread_mode_keeps_everything_on_fore_runner() {
        let options = RelayOptions {
            single_thread: true,
            ..Default::default()
        };
        let outcome = race(&[0, 1, 2, 1, 0], options);
        assert_eq!(outcome.runners, 1);
        assert_eq!(outcome.handoffs, 0);
        let names: Vec<_> = outcome.session.played.iter().map(|p| p.2.clone()).collect();
        assert!(names.iter().all(|n| n == &names[0]));
    }

    #[test]
    fn test_empty_stream() {
        let outcome = race(&[], RelayOptions::default());
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.calls, 0);
        assert_eq!(outcome.runners, 1);
    }

    #[test]
    fn test_loop_repeats_last_frame() {
        // frame 0: calls 0..=2, frame 1: calls 3..=5
        let calls = script(&[0, 1, 0, 0, 1, 0], &[2, 5]);
        let options = RelayOptions {
            loop_last_frame: true,
            loop_count: Some(3),
            ..Default::default()
        };
        let outcome = RelayRace::new(options).run(ScriptSession::new(calls));
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.loops, 3);
        assert_eq!(
            outcome.session.order(),
            vec![0, 1, 2, 3, 4, 5, 3, 4, 5, 3, 4, 5, 3, 4, 5]
        );
    }

    #[test]
    fn test_loop_without_frame_markers_repeats_whole_stream() {
        let options = RelayOptions {
            loop_last_frame: true,
            loop_count: Some(2),
            ..Default::default()
        };
        let outcome = race(&[0, 0], options);
        assert_eq!(outcome.session.order(), vec![0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn test_error_on_worker_leg_stops_race() {
        let mut session = ScriptSession::new(script(&[0, 1, 1, 0, 0], &[]));
        session.fail_at = Some(1);
        let outcome = RelayRace::new(RelayOptions::default()).run(session);
        assert!(matches!(outcome.result, Err(ReplayError::WindowSystem(_))));
        assert_eq!(outcome.session.order(), vec![0, 1]);
    }

    #[test]
    fn test_stop_request_ends_race_cleanly() {
        let mut session = ScriptSession::new(script(&[0, 1, 0, 1, 0], &[]));
        session.stop_after = Some(2);
        let outcome = RelayRace::new(RelayOptions::default()).run(session);
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.session.order(), vec![0, 1, 2]);
    }

    #[test]
    #[should_panic(expected = "handler blew up")]
    fn test_worker_panic_reaches_caller() {
        let mut session = ScriptSession::new(script(&[0, 1, 0], &[]));
        session.panic_at = Some(1);
        let _ = RelayRace::new(RelayOptions::default()).run(session);
    }
}
