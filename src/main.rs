#[macro_use]
extern crate tracing;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use xenserver_vm_create::capacity::plan;
use xenserver_vm_create::load_settings;
use xenserver_vm_create::options::parse_extra_vdis;
use xenserver_vm_create::readiness::ReadinessPoller;
use xenserver_vm_create::snapshot::PoolSnapshot;
use xenserver_vm_create::structs::{PollOutcome, StorageRequest, MIB};

#[derive(Parser)]
#[command(
    name = "xenserver_vm_create",
    about = "Admission checks and sshd readiness for XenServer VM provisioning",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a VM fits a pool snapshot (TOML) without creating it
    Check {
        /// Pool snapshot with [[hosts]], [[repositories]] and default_repository
        #[arg(long)]
        snapshot: PathBuf,
        /// VM memory in MB
        #[arg(long, default_value_t = 512)]
        vm_memory: u64,
        /// Template disks as "SR name":sizeMB, comma separated or repeated
        #[arg(long)]
        template_disks: Vec<String>,
        /// Extra VDIs as [SR:]sizeMB, comma separated or repeated
        #[arg(long)]
        extra_vdis: Vec<String>,
    },
    /// Wait until sshd answers on an address
    WaitSsh {
        #[arg(long)]
        address: String,
        /// Give up after this many seconds (overrides readiness.ssh_wait_timeout_secs)
        #[arg(long)]
        timeout: Option<u64>,
    },
}

fn parse_specs(specs: &[String]) -> Result<Vec<StorageRequest>> {
    let mut requests = vec![];
    for spec in specs {
        requests.extend(parse_extra_vdis(spec)?);
    }
    Ok(requests)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    let cli = Cli::parse();
    let settings = load_settings()?;
    env::set_var("RUST_LOG", &settings.log_level);
    tracing_subscriber::fmt::init();

    info!(
        "xenserver_vm_create {} {}",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );

    match cli.command {
        Commands::Check {
            snapshot,
            vm_memory,
            template_disks,
            extra_vdis,
        } => {
            let snapshot = PoolSnapshot::from_file(&snapshot)?;
            let template_disks = parse_specs(&template_disks)?;
            let extra_vdis = parse_specs(&extra_vdis)?;
            let memory = match vm_memory.checked_mul(MIB) {
                Some(m) if m > 0 => m,
                _ => bail!("Invalid memory size (--vm-memory)"),
            };
            let placement = plan(
                &snapshot,
                memory,
                &template_disks,
                &extra_vdis,
                &settings.planner,
            )?;
            info!("Admitted on {}", placement.host.name);
            println!("{}", placement.host.name);
        }
        Commands::WaitSsh { address, timeout } => {
            let mut poller = ReadinessPoller::from_settings(&settings.readiness);
            if let Some(secs) = timeout {
                poller.overall_timeout = Some(Duration::from_secs(secs));
            }
            match poller
                .poll_fixed(&address, |a| info!("sshd on {a} is up"))
                .await?
            {
                PollOutcome::Success { address } => println!("{address}"),
                PollOutcome::Failure { .. } => bail!("Timeout waiting for sshd on {address}"),
            }
        }
    }
    Ok(())
}
