//! Run-time configuration
//!
//! [`ReplayConfig`] is what the engine consumes. The binary builds one from
//! an optional TOML file and then lets command-line flags override it.

use crate::callset::CallSet;
use crate::error::{ReplayError, Result};
use crate::prefetch::PrefetchConfig;
use crate::profiling::ProfilingOptions;
use crate::relay::RelayOptions;
use crate::snapshot::SnapshotFormat;
use crate::state::StateOptions;
use crate::ws::Profile;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// File name prefix, or `-` for stdout; snapshots are off when unset
    pub prefix: Option<String>,
    /// Call-set expression; every frame when unset
    pub calls: Option<String>,
    pub format: SnapshotFormat,
    /// Number snapshots by call number rather than sequentially
    pub call_nos: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            calls: None,
            format: SnapshotFormat::Pnm,
            call_nos: true,
        }
    }
}

impl SnapshotConfig {
    pub fn enabled(&self) -> bool {
        self.prefix.is_some()
    }

    pub fn call_set(&self) -> Result<CallSet> {
        match self.calls.as_deref() {
            Some(expr) => CallSet::parse(expr),
            None => Ok(CallSet::frames()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Quiet run: no warnings, no summary unless profiling
    pub benchmark: bool,
    pub debug: bool,
    pub double_buffer: bool,
    /// Create core-profile contexts for implicit drawables
    pub core: bool,
    pub single_thread: bool,
    pub loop_last_frame: bool,
    pub loop_count: Option<u32>,
    pub wait: bool,
    pub dump_state: Option<u64>,
    pub verbosity: u8,
    pub prefetch: PrefetchConfig,
    pub profiling: ProfilingOptions,
    pub snapshot: SnapshotConfig,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            benchmark: false,
            debug: false,
            double_buffer: true,
            core: false,
            single_thread: false,
            loop_last_frame: false,
            loop_count: None,
            wait: false,
            dump_state: None,
            verbosity: 0,
            prefetch: PrefetchConfig::default(),
            profiling: ProfilingOptions::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl ReplayConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| ReplayError::InvalidConfig(format!("{}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<()> {
        self.prefetch.validate()?;
        if let Some(expr) = self.snapshot.calls.as_deref() {
            CallSet::parse(expr)?;
        }
        if self.loop_count.is_some() && !self.loop_last_frame {
            return Err(ReplayError::InvalidConfig(
                "loop_count requires loop_last_frame".to_string(),
            ));
        }
        if self.snapshot.prefix.as_deref().is_some_and(str::is_empty) {
            return Err(ReplayError::InvalidConfig("snapshot prefix is empty".to_string()));
        }
        Ok(())
    }

    pub fn state_options(&self) -> StateOptions {
        StateOptions {
            double_buffer: self.double_buffer,
            debug: !self.benchmark,
            default_profile: if self.core {
                Profile::CORE_3_2
            } else {
                Profile::Compat
            },
        }
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            single_thread: self.single_thread,
            loop_last_frame: self.loop_last_frame,
            loop_count: self.loop_count,
        }
    }
}
