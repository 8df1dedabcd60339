//! `vm-worker`: the entire body of one VM lifecycle worker invocation
//! (spec.md §4.2, §5). The engine spawns one of these per VM action and
//! reaps it; this binary never loops or watches more than the one VM
//! named on its command line.

use std::collections::HashMap;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

use winci::agent::TcpAgentDialer;
use winci::config::Config;
use winci::notify::{self, lettre_smtp::LettreSmtp, NullSmtp, Smtp};
use winci::reporter::LogReporter;
use winci::store::SqliteStore;
use winci::vlw;
use winci::vmdriver::LibvirtDriver;

#[derive(Debug, Parser)]
#[command(name = "vm-worker", about = "Runs one VM lifecycle action to completion")]
struct Cli {
    #[arg(short, long, value_name = "PATH", default_value = "/etc/winci/winci.toml")]
    config: std::path::PathBuf,

    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Power off, revert to the idle snapshot, and wait for the guest agent.
    Revert { vm: String },
    /// Force the VM off regardless of its current state.
    Poweroff { vm: String },
    /// Check whether a `dirty` VM has settled back onto its idle snapshot.
    Checkidle { vm: String },
    /// Force a `dirty` VM off so the next revert has a known starting point.
    Checkoff { vm: String },
    /// Poll an `offline` VM for reachability.
    Monitor { vm: String },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("vm-worker failed: {err}");
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
    let mut reporter = LogReporter;
    let smtp = build_smtp(&config);

    match cli.action {
        Action::Revert { vm } => {
            let dialer = single_vm_dialer(&vm, config.agent_port);
            let outcome = vlw::revert(&config, &store, &driver, &dialer, &vm, &mut reporter);
            if let Err(err) = &outcome {
                notify_offline(smtp.as_ref(), &config, &vm, &err.to_string());
            }
            outcome
        }
        Action::Poweroff { vm } => vlw::poweroff(&store, &driver, &vm),
        Action::Checkidle { vm } => vlw::checkidle(&store, &driver, &vm).map(|_| ()),
        Action::Checkoff { vm } => vlw::checkoff(&store, &driver, &vm).map(|_| ()),
        Action::Monitor { vm } => {
            let recovered = vlw::monitor(&store, &driver, &vm)?;
            if recovered {
                notify_recovered(smtp.as_ref(), &config, &vm);
            }
            Ok(())
        }
    }
}

fn single_vm_dialer(vm: &str, agent_port: u16) -> TcpAgentDialer {
    let mut addresses = HashMap::new();
    addresses.insert(vm.to_string(), (vm.to_string(), agent_port));
    TcpAgentDialer::new(addresses, Duration::from_secs(10))
}

fn build_smtp(config: &Config) -> Box<dyn Smtp> {
    match LettreSmtp::new(&config.smtp) {
        Ok(smtp) => Box::new(smtp),
        Err(_) => Box::new(NullSmtp),
    }
}

fn notify_offline(smtp: &dyn Smtp, config: &Config, vm: &str, cause: &str) {
    match notify::vm_offline_notification(&config.smtp, vm, cause) {
        Ok(notification) => {
            if let Err(err) = smtp.send(&notification) {
                log::warn!("vm={vm} failed to send offline notification: {err}");
            }
        }
        Err(err) => log::warn!("vm={vm} could not compose offline notification: {err}"),
    }
}

fn notify_recovered(smtp: &dyn Smtp, config: &Config, vm: &str) {
    match notify::vm_recovered_notification(&config.smtp, vm) {
        Ok(notification) => {
            if let Err(err) = smtp.send(&notification) {
                log::warn!("vm={vm} failed to send recovered notification: {err}");
            }
        }
        Err(err) => log::warn!("vm={vm} could not compose recovered notification: {err}"),
    }
}
