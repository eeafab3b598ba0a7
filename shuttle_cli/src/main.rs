use shuttle_core::config::ShuttleConfig;
use shuttle_core::coverage::GLOBAL_COVERAGE;
#[cfg(feature = "fuzzir")]
use shuttle_core::embedded::{EmbeddedEngine, LinkedFuzzir};
#[cfg(not(feature = "fuzzir"))]
use shuttle_core::engine::CommandEngine;
use shuttle_core::engine::Engine;
use shuttle_core::harness::Harness;
use shuttle_core::input::FixedBuffer;
use shuttle_core::protocol::{Channels, PersistentLoop};
use shuttle_core::single_shot::{SingleShotInput, run_once};
use shuttle_core::FATAL_EXIT_CODE;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
    /// Replaces the interpreter binary of the configured engine command.
    #[clap(long)]
    engine_command: Option<String>,
    /// Trace every normalized program before it runs.
    #[clap(long)]
    debug: bool,
    #[clap(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Serve executions over the inherited protocol descriptors.
    Persistent,
    /// Run a single input from a file, or stdin when no file is given.
    Run { input: Option<PathBuf> },
}

fn load_config(cli: &Cli) -> Result<ShuttleConfig, anyhow::Error> {
    let mut config = match &cli.config {
        Some(config_path) => ShuttleConfig::load_from_file(config_path)?,
        None => {
            let default_config_path = PathBuf::from("shuttle.toml");
            if default_config_path.exists() {
                ShuttleConfig::load_from_file(&default_config_path)?
            } else {
                ShuttleConfig::default()
            }
        }
    };

    config.apply_env(|key| std::env::var(key).ok());
    if cli.debug {
        config.debug = true;
    }
    if let Some(program) = &cli.engine_command {
        match config.engine.command.first_mut() {
            Some(first) => *first = program.clone(),
            None => config.engine.command.push(program.clone()),
        }
    }
    Ok(config)
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // A subscriber may already be installed when running under tests.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn report_coverage() {
    match GLOBAL_COVERAGE.tracker() {
        Some(tracker) => tracing::info!(
            edges = tracker.edge_count(),
            tracked = tracker.tracked_edges(),
            shared = ?tracker.map().shared_key(),
            "coverage attached"
        ),
        None => tracing::debug!("no instrumented modules attached"),
    }
    let rejected = GLOBAL_COVERAGE.rejected_modules();
    if rejected > 0 {
        tracing::warn!(rejected, "additional instrumented modules were skipped");
    }
}

/// The interpreter linked into this binary, running in process.
#[cfg(feature = "fuzzir")]
fn build_engine(_config: &ShuttleConfig) -> Result<EmbeddedEngine<LinkedFuzzir>, anyhow::Error> {
    let program = std::env::args().next().unwrap_or_else(|| "shuttle".to_string());
    let interpreter = LinkedFuzzir::claim(&program)
        .ok_or_else(|| anyhow::anyhow!("linked interpreter is already in use"))?;
    Ok(EmbeddedEngine::new(interpreter))
}

/// The configured interpreter command, spawned once per program.
#[cfg(not(feature = "fuzzir"))]
fn build_engine(config: &ShuttleConfig) -> Result<CommandEngine, anyhow::Error> {
    if config.engine.command.is_empty() {
        anyhow::bail!("engine command is empty");
    }
    Ok(CommandEngine::new(config.engine.clone().into()))
}

fn serve<E: Engine>(harness: Harness<E>, config: &ShuttleConfig) -> i32 {
    let channels = match unsafe { Channels::from_fds(&config.protocol) } {
        Ok(channels) => channels,
        Err(e) => {
            tracing::error!("{e}");
            return FATAL_EXIT_CODE;
        }
    };
    let mut persistent = PersistentLoop::new(
        channels,
        harness,
        &GLOBAL_COVERAGE,
        config.protocol.input_capacity,
    );
    let Err(e) = persistent.run();
    tracing::error!(
        executions = persistent.executions(),
        state = ?persistent.state(),
        "protocol failure: {e}"
    );
    FATAL_EXIT_CODE
}

fn run_single<E: Engine>(
    mut harness: Harness<E>,
    config: &ShuttleConfig,
    input: Option<PathBuf>,
) -> i32 {
    let mut buffer = FixedBuffer::with_capacity(config.protocol.input_capacity);
    match run_once(
        &mut harness,
        &SingleShotInput::from(input),
        std::io::stdin().lock(),
        &mut buffer,
        Some(&GLOBAL_COVERAGE),
    ) {
        Ok(status) => status,
        Err(e) => {
            tracing::error!("{e}");
            FATAL_EXIT_CODE
        }
    }
}

/// Runs the selected mode and returns the process exit code. The engine is
/// dropped before this returns.
fn run(cli: Cli) -> i32 {
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(cli.debug);
            tracing::error!("{e:#}");
            return FATAL_EXIT_CODE;
        }
    };
    init_tracing(config.debug);
    tracing::debug!("effective configuration: {config:#?}");

    let engine = match build_engine(&config) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("{e:#}");
            return FATAL_EXIT_CODE;
        }
    };
    report_coverage();
    let harness = Harness::new(engine, &config.transform).with_trace(config.debug);

    match cli.mode.unwrap_or(Mode::Persistent) {
        Mode::Persistent => serve(harness, &config),
        Mode::Run { input } => run_single(harness, &config, input),
    }
}

fn main() {
    let status = run(Cli::parse());
    std::process::exit(status);
}
