//! End-to-end replay of synthesized trace files through the relay race

mod utils;

use std::sync::Arc;
use tracerelay::prefetch::{PrefetchConfig, Prefetcher};
use tracerelay::ws::{HeadlessWindowSystem, WsOp};
use tracerelay::{replay_trace, CallFlags, ReplayConfig, ReplayError, RunSummary, TraceError};
use utils::{int, ptr, two_thread_trace, TraceBuilder, SWAP};

fn quiet_config() -> ReplayConfig {
    ReplayConfig {
        benchmark: true,
        ..Default::default()
    }
}

fn replay(builder: &TraceBuilder, config: &ReplayConfig) -> (tracerelay::Result<RunSummary>, HeadlessWindowSystem) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.trace");
    builder.write(&path);
    let ws = HeadlessWindowSystem::new();
    let prefetcher = Arc::new(Prefetcher::new(config.prefetch.clone()));
    let result = replay_trace(&path, config, &prefetcher, Box::new(ws.clone()));
    (result, ws)
}

#[test]
fn test_fore_worker_fore_replay() {
    let builder = two_thread_trace(3);
    let (summary, ws) = replay(&builder, &quiet_config());
    let summary = summary.unwrap();

    assert_eq!(summary.frames, 3);
    assert_eq!(summary.calls, builder.len() as u64);
    assert_eq!(summary.runners, 2);
    assert_eq!(summary.handoffs, 6);
    assert_eq!(summary.loops, 0);
    assert_eq!(ws.swap_count(), 3);

    let draws = ws
        .ops()
        .into_iter()
        .filter(|op| matches!(op, WsOp::Execute(name) if name == "glDrawArrays"))
        .count();
    assert_eq!(draws, 9);
}

#[test]
fn test_one_runner_per_traced_thread() {
    let mut builder = TraceBuilder::new();
    builder.glx_setup(0);
    for thread in [3, 1, 4, 1, 5] {
        builder.draw(thread);
    }
    builder.swap(0);

    let (summary, _ws) = replay(&builder, &quiet_config());
    let summary = summary.unwrap();
    assert_eq!(summary.runners, 5);
    assert_eq!(summary.handoffs, 6);
    assert_eq!(summary.frames, 1);
}

#[test]
fn test_single_thread_mode() {
    let config = ReplayConfig {
        single_thread: true,
        ..quiet_config()
    };
    let (summary, _ws) = replay(&two_thread_trace(2), &config);
    let summary = summary.unwrap();
    assert_eq!(summary.runners, 1);
    assert_eq!(summary.handoffs, 0);
    assert_eq!(summary.frames, 2);
}

#[test]
fn test_loop_last_frame_three_times() {
    let builder = two_thread_trace(3);
    let config = ReplayConfig {
        loop_last_frame: true,
        loop_count: Some(3),
        ..quiet_config()
    };
    let (summary, ws) = replay(&builder, &config);
    let summary = summary.unwrap();

    assert_eq!(summary.loops, 3);
    assert_eq!(summary.frames, 6);
    assert_eq!(summary.calls, builder.len() as u64 + 3 * 4);
    assert_eq!(ws.swap_count(), 6);
}

#[test]
fn test_loop_with_small_prefetch_batches() {
    let builder = two_thread_trace(20);
    let mut config = ReplayConfig {
        loop_last_frame: true,
        loop_count: Some(4),
        ..quiet_config()
    };
    config.prefetch = PrefetchConfig {
        batch_size: 4,
        low_water: 1,
        idle_sleep_us: 100,
    };
    let (summary, _ws) = replay(&builder, &config);
    let summary = summary.unwrap();
    assert_eq!(summary.frames, 24);
    assert_eq!(summary.calls, builder.len() as u64 + 4 * 4);
}

#[test]
fn test_frames_follow_end_frame_flag() {
    let mut builder = TraceBuilder::new();
    builder
        .glx_setup(0)
        .draw(0)
        .call(1, "vkQueuePresentKHR", vec![ptr(1)], None, CallFlags::END_FRAME)
        .draw(0)
        .call(
            0,
            "glXSwapBuffers",
            vec![ptr(1), ptr(0x10)],
            None,
            CallFlags::SWAP_RENDERTARGET,
        )
        .call(0, "glFlush", vec![], None, CallFlags::empty());

    let (summary, ws) = replay(&builder, &quiet_config());
    let summary = summary.unwrap();
    assert_eq!(summary.frames, 1);
    assert_eq!(summary.runners, 2);
    assert_eq!(ws.swap_count(), 1);
}

#[test]
fn test_trace_without_fore_leg_is_rejected() {
    let mut builder = TraceBuilder::new();
    builder.draw(1).draw(2);
    let (result, _ws) = replay(&builder, &quiet_config());
    assert!(matches!(
        result,
        Err(ReplayError::Trace(TraceError::NoForeRunnerLeg))
    ));
}

#[test]
fn test_empty_trace_replays_nothing() {
    let (summary, _ws) = replay(&TraceBuilder::new(), &quiet_config());
    let summary = summary.unwrap();
    assert_eq!(summary.calls, 0);
    assert_eq!(summary.frames, 0);
    assert_eq!(summary.runners, 1);
}

#[test]
fn test_stream_ending_on_worker_leg() {
    let mut builder = two_thread_trace(1);
    builder.draw(2);
    let (summary, _ws) = replay(&builder, &quiet_config());
    let summary = summary.unwrap();
    assert_eq!(summary.calls, builder.len() as u64);
    assert_eq!(summary.runners, 3);
}

#[test]
fn test_snapshots_written_to_files() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = format!("{}/snap_", dir.path().display());
    let mut config = quiet_config();
    config.snapshot.prefix = Some(prefix.clone());

    let builder = two_thread_trace(2);
    let (summary, _ws) = replay(&builder, &config);
    assert_eq!(summary.unwrap().snapshots, 2);

    // Frame-ending swaps are calls 6 and 10.
    assert!(std::path::Path::new(&format!("{}{:010}.png", prefix, 6)).exists());
    assert!(std::path::Path::new(&format!("{}{:010}.png", prefix, 10)).exists());
}

#[test]
fn test_sequential_snapshot_numbering() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = format!("{}/seq_", dir.path().display());
    let mut config = quiet_config();
    config.snapshot.prefix = Some(prefix.clone());
    config.snapshot.calls = Some("draw".to_string());
    config.snapshot.call_nos = false;

    let (summary, _ws) = replay(&two_thread_trace(1), &config);
    assert_eq!(summary.unwrap().snapshots, 3);
    for no in 0..3 {
        assert!(std::path::Path::new(&format!("{}{:010}.png", prefix, no)).exists());
    }
}

#[test]
fn test_egl_context_destroyed_while_current() {
    let mut builder = TraceBuilder::new();
    builder
        .call(
            0,
            "eglCreateWindowSurface",
            vec![ptr(1), ptr(2), ptr(3), ptr(0)],
            Some(ptr(0x40)),
            CallFlags::empty(),
        )
        .call(
            0,
            "eglCreateContext",
            vec![ptr(1), ptr(2), ptr(0), tracerelay::Value::Array(vec![int(0x3098), int(2), int(0x3038)])],
            Some(ptr(0x50)),
            CallFlags::empty(),
        )
        .call(
            0,
            "eglMakeCurrent",
            vec![ptr(1), ptr(0x40), ptr(0x40), ptr(0x50)],
            Some(tracerelay::Value::Bool(true)),
            CallFlags::SWAP_RENDERTARGET,
        )
        .call(0, "glViewport", vec![int(0), int(0), int(16), int(16)], None, CallFlags::empty())
        .call(0, "eglDestroyContext", vec![ptr(1), ptr(0x50)], None, CallFlags::empty())
        .draw(1)
        .call(0, "eglSwapBuffers", vec![ptr(1), ptr(0x40)], None, SWAP)
        .call(
            0,
            "eglMakeCurrent",
            vec![ptr(1), ptr(0), ptr(0), ptr(0)],
            Some(tracerelay::Value::Bool(true)),
            CallFlags::SWAP_RENDERTARGET,
        );

    let (summary, ws) = replay(&builder, &quiet_config());
    let summary = summary.unwrap();
    assert_eq!(summary.frames, 1);

    let ops = ws.ops();
    let destroy = ops
        .iter()
        .position(|op| matches!(op, WsOp::DestroyContext(_)))
        .unwrap();
    let unbind = ops
        .iter()
        .position(|op| matches!(op, WsOp::MakeCurrent { context: None, .. }))
        .unwrap();
    let draw = ops
        .iter()
        .position(|op| matches!(op, WsOp::Execute(name) if name == "glDrawArrays"))
        .unwrap();
    assert!(draw < destroy);
    assert!(unbind < destroy);
    assert!(ws.live_contexts().is_empty());
}

#[test]
fn test_dump_state_stops_replay() {
    let mut config = quiet_config();
    config.dump_state = Some(2);
    let builder = two_thread_trace(2);
    let (summary, _ws) = replay(&builder, &config);
    let summary = summary.unwrap();
    assert_eq!(summary.calls, 3);
    assert_eq!(summary.frames, 0);
    assert!(summary.state_dumped);
}

#[test]
fn test_full_replay_reports_no_state_dump() {
    let (summary, _ws) = replay(&two_thread_trace(1), &quiet_config());
    assert!(!summary.unwrap().state_dumped);
}
