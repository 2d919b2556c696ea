use crete_core::config::{DEFAULT_PRELOAD_LIBRARY, RUN_LOG_FILE};
use crete_core::runner::DEFAULT_HOST_IP;
use crete_core::{JournalBridge, ProcessLauncher, Runner, RunnerOptions};

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Guest-side driver for concolic test campaigns", long_about = None)]
struct Cli {
    /// Run configuration of the target; required unless the host runs in
    /// distributed mode.
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
    /// Host address.
    #[clap(short, long, default_value = DEFAULT_HOST_IP)]
    ip: String,
    /// Startup-hook library injected into the target.
    #[clap(long, value_parser, default_value = DEFAULT_PRELOAD_LIBRARY)]
    preload: PathBuf,
    /// Directory holding run.log.
    #[clap(short, long, value_parser, default_value = ".")]
    workspace: PathBuf,
}

/// Copies every log record to stderr and to the campaign's run.log.
struct RunLog {
    file: File,
}

impl Write for RunLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn init_logging(workspace: &Path) -> anyhow::Result<()> {
    let path = workspace.join(RUN_LOG_FILE);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {path:?}"))?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(RunLog { file })))
        .init();
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(config) = &cli.config {
        if !config.is_file() {
            anyhow::bail!("configuration file {config:?} does not exist");
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        if handler_stop.swap(true, Ordering::SeqCst) {
            // Second request while blocked on the host or the target.
            std::process::exit(130);
        }
        warn!("Stop requested, finishing the current transition");
    })
    .context("Failed to install the signal handler")?;

    // Bare names are left to the dynamic loader's search path.
    let preload = std::fs::canonicalize(&cli.preload).unwrap_or(cli.preload);
    info!("Startup hook: {:?}", preload);

    let options = RunnerOptions {
        host_ip: cli.ip,
        config_path: cli.config,
        workspace: cli.workspace,
        ..RunnerOptions::default()
    };
    let bridge = JournalBridge::from_env().context("Failed to open the instrumentation bridge")?;
    let launcher = ProcessLauncher::new(&preload);

    let mut runner = Runner::new(options, bridge, launcher);
    runner
        .run(&stop)
        .with_context(|| format!("Campaign aborted in state {}", runner.state()))?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.workspace) {
        eprintln!("ERROR: {e:#}");
        std::process::exit(1);
    }

    if let Err(e) = run(cli) {
        error!("{e:#}");
        std::process::exit(1);
    }
}
