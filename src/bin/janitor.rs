//! `janitor`: one garbage-collection pass (spec.md §4.6). An external
//! scheduler invokes this on a cadence (typically daily); the binary runs
//! every GC operation once and exits.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;

use winci::config::Config;
use winci::janitor;
use winci::store::SqliteStore;

#[derive(Debug, Parser)]
#[command(name = "janitor", about = "Purges expired jobs, stale patches, and abandoned staging files")]
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
            log::error!("janitor failed: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

fn run(cli: Cli) -> winci::Result<()> {
    let config = Config::load(&cli.config)?;
    let store = SqliteStore::open(&config.db_path)?;
    let now = now_unix();

    let report = janitor::run(&config, &store, now)?;
    log::info!(
        "janitor pass complete: jobs_deleted={} jobs_archived={} patches_deleted={} \
         pending_patch_sets_discarded={} vms_purged={} staging_files_removed={} \
         staging_files_unknown={} record_groups_deleted={}",
        report.jobs_deleted,
        report.jobs_archived,
        report.patches_deleted,
        report.pending_patch_sets_discarded,
        report.vms_purged,
        report.staging_files_removed,
        report.staging_files_unknown,
        report.record_groups_deleted,
    );
    Ok(())
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}
