//! Error types for trace access and replay

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading or writing trace containers
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Failed to open trace {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid trace header in {0}")]
    InvalidHeader(PathBuf),

    #[error("Unsupported trace version: expected {expected}, found {found}")]
    UnsupportedVersion { expected: u32, found: u32 },

    #[error("Trace is not open")]
    NotOpen,

    #[error("Truncated record at offset {0}")]
    Truncated(u64),

    #[error("Failed to decode call at offset {offset}: {message}")]
    Decode { offset: u64, message: String },

    #[error("Call {no} references unknown signature {sig_id}")]
    UnknownSignature { no: u64, sig_id: u32 },

    #[error("Failed to encode call {no}: {message}")]
    Encode { no: u64, message: String },

    #[error("Bookmark offset {offset} is outside the trace body")]
    InvalidBookmark { offset: u64 },

    #[error("Trace has no calls on thread 0; the fore runner would never be reached")]
    NoForeRunnerLeg,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the replay engine and its API handlers
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error("Cannot run profile, {0} is not supported")]
    UnsupportedProfiling(String),

    #[error("Failed to create {profile} context")]
    ContextCreation { profile: String },

    #[error("Window system error: {0}")]
    WindowSystem(String),

    #[error("Invalid snapshot call set: {0}")]
    InvalidCallSet(String),

    #[error("Failed to write snapshot: {0}")]
    Snapshot(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for trace container operations
pub type TraceResult<T> = std::result::Result<T, TraceError>;

/// Result type for replay operations
pub type Result<T> = std::result::Result<T, ReplayError>;
