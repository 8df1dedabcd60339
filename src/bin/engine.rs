//! `engine`: the long-running scheduler process (spec.md §4.1). Ticks on a
//! fixed interval, spawning and reaping the `vm-worker`/`task-worker`
//! children that do all of the actual VM and guest I/O.

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::Parser;

use winci::config::Config;
use winci::engine::{BinaryPaths, Engine};
use winci::notify::{lettre_smtp::LettreSmtp, NullSmtp, Smtp};
use winci::reporter::LogReporter;
use winci::store::SqliteStore;

#[derive(Debug, Parser)]
#[command(name = "engine", about = "Schedules and dispatches Wine conformance test jobs")]
struct Cli {
    #[arg(short, long, value_name = "PATH", default_value = "/etc/winci/winci.toml")]
    config: PathBuf,

    /// Path to the `vm-worker` binary, defaulting to the directory this
    /// binary was launched from.
    #[arg(long)]
    vm_worker: Option<PathBuf>,

    /// Path to the `task-worker` binary, defaulting alongside `vm-worker`.
    #[arg(long)]
    task_worker: Option<PathBuf>,

    /// Seconds to sleep between scheduling passes.
    #[arg(long, default_value_t = 5)]
    tick_interval_secs: u64,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("engine failed: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

fn run(cli: Cli) -> winci::Result<()> {
    let config = Config::load(&cli.config)?;
    let store = SqliteStore::open(&config.db_path)?;

    let sibling_dir = std::env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."));

    let paths = BinaryPaths {
        vm_worker: cli.vm_worker.unwrap_or_else(|| sibling_dir.join("vm-worker")),
        task_worker: cli.task_worker.unwrap_or_else(|| sibling_dir.join("task-worker")),
    };

    let smtp = build_smtp(&config);
    let mut engine = Engine::with_smtp(&config, &store, paths, smtp.as_ref());
    let mut reporter = LogReporter;
    let interval = Duration::from_secs(cli.tick_interval_secs);

    log::info!("engine starting, tick_interval={}s", cli.tick_interval_secs);
    loop {
        if let Err(err) = engine.tick(&mut reporter) {
            log::error!("tick failed: {err}");
        }
        thread::sleep(interval);
    }
}

fn build_smtp(config: &Config) -> Box<dyn Smtp> {
    match LettreSmtp::new(&config.smtp) {
        Ok(smtp) => Box::new(smtp),
        Err(_) => Box::new(NullSmtp),
    }
}
