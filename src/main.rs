use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracerelay::{
    cli::Cli, config::ReplayConfig, prefetch::Prefetcher, replay, session, ws::HeadlessWindowSystem,
};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for diagnostics on stderr
fn init_tracing(config: &ReplayConfig) {
    let level = if config.debug {
        tracing::Level::TRACE
    } else if config.benchmark {
        tracing::Level::ERROR
    } else {
        match config.verbosity {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    };
    let filter = if config.debug {
        EnvFilter::from_default_env().add_directive(level.into())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::default().add_directive(level.into()))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Parse arguments; help and version exit 0, usage errors exit 1
fn parse_args() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            std::process::exit(code);
        }
    }
}

fn load_config(args: &Cli) -> Result<ReplayConfig> {
    let mut config = match &args.config {
        Some(path) => ReplayConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ReplayConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

/// The summary line would corrupt snapshot and state streams on stdout
fn show_summary(config: &ReplayConfig) -> bool {
    let stdout_busy = config.snapshot.prefix.as_deref() == Some("-") || config.dump_state.is_some();
    !stdout_busy && (!config.benchmark || config.profiling.any())
}

fn main() -> Result<()> {
    let args = parse_args();
    let config = load_config(&args)?;
    init_tracing(&config);
    session::install_panic_handler();

    let prefetcher = Arc::new(Prefetcher::new(config.prefetch.clone()));
    for trace in &args.traces {
        if !trace.exists() {
            anyhow::bail!("Failed to open trace {}", trace.display());
        }
        let ws = Box::new(HeadlessWindowSystem::new());
        let summary = replay::replay_trace(trace, &config, &prefetcher, ws)
            .with_context(|| format!("Replay of {} failed", trace.display()))?;

        if show_summary(&config) {
            println!("{}", summary);
        }
        if summary.state_dumped {
            tracing::debug!(trace = %trace.display(), "state dumped, skipping remaining traces");
            break;
        }
    }

    Ok(())
}
