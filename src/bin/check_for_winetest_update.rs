//! `check-for-winetest-update`: one periodic-trigger (PT) poll (spec.md
//! §4.5). An external scheduler (cron, systemd timer) invokes this on a
//! cadence; the binary itself runs exactly one check and exits.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;

use winci::config::Config;
use winci::periodic::{self, ureq_source::UreqUpdateSource, UpdateOutcome};
use winci::store::SqliteStore;

#[derive(Debug, Parser)]
#[command(name = "check-for-winetest-update", about = "Polls for a new winetest build and composes its test Job")]
struct Cli {
    #[arg(short, long, value_name = "PATH", default_value = "/etc/winci/winci.toml")]
    config: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("check-for-winetest-update failed: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

fn run(cli: Cli) -> winci::Result<()> {
    let config = Config::load(&cli.config)?;
    let store = SqliteStore::open(&config.db_path)?;
    let source = UreqUpdateSource;
    let cache_path = config.data_dir.join("winetest-update.etag");
    let now = now_unix();

    match periodic::check_for_winetest_update(&config, &store, &source, &cache_path, now)? {
        UpdateOutcome::NotModified => log::info!("winetest build unchanged, nothing to do"),
        UpdateOutcome::Updated { downloaded_path, job_id } => {
            log::info!(
                "staged new winetest build at {} and queued job {job_id}",
                downloaded_path.display()
            );
        }
    }
    Ok(())
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}
