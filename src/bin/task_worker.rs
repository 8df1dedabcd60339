//! `task-worker`: the entire lifetime of one VM-side task invocation
//! (spec.md §4.3). The engine spawns one of these per `(job, step, task)`
//! triple and reaps it.

use std::collections::HashMap;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use winci::agent::TcpAgentDialer;
use winci::config::Config;
use winci::model::VmStatus;
use winci::notify::{self, lettre_smtp::LettreSmtp, NullSmtp, Smtp};
use winci::reporter::LogReporter;
use winci::store::{RecordStore, SqliteStore};
use winci::task_worker;
use winci::vmdriver::LibvirtDriver;

/// `task-worker JobId StepNo TaskNo [--debug] [--log-only]` (spec.md §6).
#[derive(Debug, Parser)]
#[command(name = "task-worker", about = "Runs one Task to completion on its assigned VM")]
struct Cli {
    #[arg(short, long, value_name = "PATH", default_value = "/etc/winci/winci.toml")]
    config: std::path::PathBuf,

    job: i64,
    step: i64,
    task: i64,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("task-worker failed: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

fn run(cli: Cli) -> winci::Result<()> {
    let config = Config::load(&cli.config)?;
    let store = SqliteStore::open(&config.db_path)?;
    let driver = LibvirtDriver::new(
        config.virsh_path.clone().unwrap_or_else(|| "virsh".to_string()),
        config.libvirt_connect_uri.clone(),
    );

    let task = store
        .get_task(cli.task)?
        .ok_or_else(|| winci::Error::NotFound { kind: "task", key: cli.task.to_string() })?;
    let vm_name = task.vm.clone().ok_or_else(|| winci::Error::PreflightFailed {
        message: format!("task {} has no VM assigned", cli.task),
    })?;
    let mut addresses = HashMap::new();
    addresses.insert(vm_name.clone(), (vm_name.clone(), config.agent_port));
    let dialer = TcpAgentDialer::new(addresses, Duration::from_secs(config.wait_for_tools_in_vm_secs));

    let mut reporter = LogReporter;
    let was_offline_before = store
        .get_vm(&vm_name)
        .ok()
        .flatten()
        .map(|vm| vm.status == VmStatus::Offline)
        .unwrap_or(false);
    task_worker::run(&config, &store, &dialer, &driver, cli.job, cli.step, cli.task, &mut reporter)?;

    if !was_offline_before {
        if let Some(vm) = store.get_vm(&vm_name)? {
            if vm.status == VmStatus::Offline {
                notify_offline(&config, &vm_name);
            }
        }
    }
    Ok(())
}

fn notify_offline(config: &Config, vm: &str) {
    let smtp: Box<dyn Smtp> = match LettreSmtp::new(&config.smtp) {
        Ok(smtp) => Box::new(smtp),
        Err(_) => Box::new(NullSmtp),
    };
    match notify::vm_offline_notification(&config.smtp, vm, "host unreachable while running a task") {
        Ok(notification) => {
            if let Err(err) = smtp.send(&notification) {
                log::warn!("vm={vm} failed to send offline notification: {err}");
            }
        }
        Err(err) => log::warn!("vm={vm} could not compose offline notification: {err}"),
    }
}
