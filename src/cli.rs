//! CLI argument parsing for tracerelay

use crate::config::ReplayConfig;
use crate::snapshot::SnapshotFormat;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tracerelay")]
#[command(version)]
#[command(about = "Replay graphics API traces, one runner thread per traced thread", long_about = None)]
pub struct Cli {
    /// Trace files to replay, one after another
    #[arg(required = true, value_name = "TRACE")]
    pub traces: Vec<PathBuf>,

    /// Benchmark mode: no error checking or warning messages
    #[arg(short = 'b', long = "benchmark")]
    pub benchmark: bool,

    /// CPU profiling (CPU times per call)
    #[arg(long = "pcpu")]
    pub profile_cpu: bool,

    /// GPU profiling (GPU times per draw call)
    #[arg(long = "pgpu")]
    pub profile_gpu: bool,

    /// Pixels drawn profiling (pixels drawn per draw call)
    #[arg(long = "ppd")]
    pub profile_pixels: bool,

    /// Memory usage profiling (vsize rss per call)
    #[arg(long = "pmem")]
    pub profile_memory: bool,

    /// Number snapshots by call number; `--call-nos=false` numbers them sequentially
    #[arg(long = "call-nos", value_name = "BOOL", num_args = 0..=1, default_missing_value = "true")]
    pub call_nos: Option<bool>,

    /// Use core profile for implicitly created contexts
    #[arg(long = "core")]
    pub core: bool,

    /// Use a single-buffered visual
    #[arg(long = "sb", conflicts_with = "double_buffer")]
    pub single_buffer: bool,

    /// Use a double-buffered visual (default)
    #[arg(long = "db")]
    pub double_buffer: bool,

    /// Take snapshots; PREFIX of `-` writes them to stdout
    #[arg(short = 's', long = "snapshot-prefix", value_name = "PREFIX")]
    pub snapshot_prefix: Option<String>,

    /// Calls to snapshot (default is every frame)
    #[arg(short = 'S', long = "snapshot", value_name = "CALLSET")]
    pub snapshot: Option<String>,

    /// Encoding of snapshots written to stdout
    #[arg(long = "snapshot-format", value_enum, value_name = "FMT")]
    pub snapshot_format: Option<SnapshotFormat>,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Dump state as JSON once this call has been replayed, then stop
    #[arg(short = 'D', long = "dump-state", value_name = "CALL")]
    pub dump_state: Option<u64>,

    /// Keep the window open after replay finishes
    #[arg(short = 'w', long = "wait")]
    pub wait: bool,

    /// Loop replaying the final frame
    #[arg(long = "loop")]
    pub loop_last_frame: bool,

    /// Stop looping after N repetitions of the final frame (requires --loop)
    #[arg(long = "loop-count", value_name = "N", requires = "loop_last_frame")]
    pub loop_count: Option<u32>,

    /// Replay every call on a single thread
    #[arg(long = "singlethread")]
    pub single_thread: bool,

    /// Enable debug tracing output
    #[arg(long = "debug")]
    pub debug: bool,

    /// Load settings from a TOML file; flags override it
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Calls decoded per prefetch request
    #[arg(long = "batch-size", value_name = "CALLS")]
    pub batch_size: Option<usize>,
}

impl Cli {
    /// Apply command-line flags on top of `config`
    pub fn apply(&self, config: &mut ReplayConfig) {
        config.benchmark |= self.benchmark;
        config.debug |= self.debug;
        config.core |= self.core;
        config.single_thread |= self.single_thread;
        config.loop_last_frame |= self.loop_last_frame;
        config.wait |= self.wait;
        config.verbosity = config.verbosity.max(self.verbose);

        if self.single_buffer {
            config.double_buffer = false;
        } else if self.double_buffer {
            config.double_buffer = true;
        }

        config.profiling.cpu |= self.profile_cpu;
        config.profiling.gpu |= self.profile_gpu;
        config.profiling.pixels |= self.profile_pixels;
        config.profiling.memory |= self.profile_memory;

        if self.loop_count.is_some() {
            config.loop_count = self.loop_count;
        }
        if self.dump_state.is_some() {
            config.dump_state = self.dump_state;
        }
        if let Some(batch_size) = self.batch_size {
            config.prefetch.batch_size = batch_size;
        }

        if let Some(prefix) = &self.snapshot_prefix {
            config.snapshot.prefix = Some(prefix.clone());
        }
        if let Some(calls) = &self.snapshot {
            config.snapshot.calls = Some(calls.clone());
        }
        if let Some(format) = self.snapshot_format {
            config.snapshot.format = format;
        }
        if let Some(call_nos) = self.call_nos {
            config.snapshot.call_nos = call_nos;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_traces() {
        let cli = Cli::parse_from(["tracerelay", "a.trace", "b.trace"]);
        assert_eq!(cli.traces, vec![PathBuf::from("a.trace"), PathBuf::from("b.trace")]);
        assert!(!cli.benchmark);
    }

    #[test]
    fn test_cli_requires_trace() {
        assert!(Cli::try_parse_from(["tracerelay"]).is_err());
    }

    #[test]
    fn test_cli_profiling_flags() {
        let cli = Cli::parse_from(["tracerelay", "--pcpu", "--pgpu", "--ppd", "--pmem", "t"]);
        let mut config = ReplayConfig::default();
        cli.apply(&mut config);
        assert!(config.profiling.cpu && config.profiling.gpu);
        assert!(config.profiling.pixels && config.profiling.memory);
    }

    #[test]
    fn test_cli_snapshot_flags() {
        let cli = Cli::parse_from([
            "tracerelay",
            "-s",
            "-",
            "-S",
            "frame,10-20/2",
            "--snapshot-format",
            "md5",
            "--call-nos=false",
            "t",
        ]);
        let mut config = ReplayConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.snapshot.prefix.as_deref(), Some("-"));
        assert_eq!(config.snapshot.calls.as_deref(), Some("frame,10-20/2"));
        assert_eq!(config.snapshot.format, SnapshotFormat::Hash);
        assert!(!config.snapshot.call_nos);
    }

    #[test]
    fn test_cli_call_nos_bare_flag() {
        let cli = Cli::parse_from(["tracerelay", "--call-nos", "t"]);
        assert_eq!(cli.call_nos, Some(true));
    }

    #[test]
    fn test_cli_loop_count_requires_loop() {
        assert!(Cli::try_parse_from(["tracerelay", "--loop-count", "3", "t"]).is_err());
        let cli = Cli::parse_from(["tracerelay", "--loop", "--loop-count", "3", "t"]);
        let mut config = ReplayConfig::default();
        cli.apply(&mut config);
        assert!(config.loop_last_frame);
        assert_eq!(config.loop_count, Some(3));
    }

    #[test]
    fn test_cli_buffering() {
        let mut config = ReplayConfig::default();
        Cli::parse_from(["tracerelay", "--sb", "t"]).apply(&mut config);
        assert!(!config.double_buffer);
        Cli::parse_from(["tracerelay", "--db", "t"]).apply(&mut config);
        assert!(config.double_buffer);
        assert!(Cli::try_parse_from(["tracerelay", "--sb", "--db", "t"]).is_err());
    }

    #[test]
    fn test_cli_flags_override_file_settings() {
        let mut config = ReplayConfig::default();
        config.prefetch.batch_size = 50;
        config.snapshot.prefix = Some("out/".to_string());
        Cli::parse_from(["tracerelay", "--batch-size", "500", "-v", "-v", "t"]).apply(&mut config);
        assert_eq!(config.prefetch.batch_size, 500);
        assert_eq!(config.verbosity, 2);
        assert_eq!(config.snapshot.prefix.as_deref(), Some("out/"));
    }

    #[test]
    fn test_cli_dump_state_and_modes() {
        let cli = Cli::parse_from(["tracerelay", "-D", "42", "-w", "--singlethread", "--core", "t"]);
        let mut config = ReplayConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.dump_state, Some(42));
        assert!(config.wait && config.single_thread && config.core);
    }
}
