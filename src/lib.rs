//! tracerelay - multi-threaded graphics API trace replayer
//!
//! A trace is a flat stream of recorded API calls, each tagged with the
//! thread that issued it. Replay feeds the stream through a background
//! prefetcher and a relay race: one runner thread per traced thread, with a
//! single baton (the replay session) handed between them so calls execute in
//! trace order while each one lands on a thread matching its original.

pub mod apis;
pub mod call;
pub mod callset;
pub mod cli;
pub mod config;
pub mod error;
pub mod player;
pub mod prefetch;
pub mod profiling;
pub mod registry;
pub mod relay;
pub mod replay;
pub mod session;
pub mod snapshot;
pub mod source;
pub mod state;
pub mod threaded_parser;
pub mod trace_file;
pub mod ws;

pub use call::{Call, CallFlags, CallRef, FunctionSig, Value};
pub use config::ReplayConfig;
pub use error::{ReplayError, Result, TraceError, TraceResult};
pub use relay::{RaceOutcome, RaceSession, RelayOptions, RelayRace};
pub use replay::{replay_trace, RunSummary};
pub use source::{Bookmark, CallSource, MemorySource};
pub use trace_file::{TraceFile, TraceWriter};
