//! vmemd: dynamic memory controller for a QEMU guest.
//!
//! `vmemd run` drives one VM until SIGINT/SIGTERM or until the hypervisor
//! exits. `status` and `decommission` inspect and discard persisted state.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use tracing::{error, info, warn};
use vmem_core::config::MIB;
use vmem_core::paths::DEFAULT_VM_NAME;
use vmem_core::{
    host, init_observability, Controller, ControllerConfig, ControllerSetup, ControllerState,
    InstanceLock, LockOwner, QmpConnector, SlotState, StateStore, VmPaths, VmemError,
};

mod shutdown;

#[derive(Parser)]
#[command(name = "vmemd")]
#[command(about = "Dynamic memory controller for QEMU guests", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller for a VM
    Run(RunArgs),

    /// Show persisted state and whether a controller is running
    Status {
        /// VM name
        #[arg(long, default_value = DEFAULT_VM_NAME)]
        vm: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Discard persisted state for a VM that has been removed
    Decommission {
        /// VM name
        #[arg(long)]
        vm: String,
    },
}

#[derive(Args)]
struct RunArgs {
    /// VM name
    #[arg(long, default_value = DEFAULT_VM_NAME)]
    vm: String,

    /// Configuration file (defaults to <config_dir>/vmem.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Boot-time memory in MiB
    #[arg(long)]
    initial_mb: Option<u64>,

    /// Lowest memory target in MiB
    #[arg(long)]
    min_mb: Option<u64>,

    /// Highest memory target in MiB
    #[arg(long)]
    max_mb: Option<u64>,

    /// Grow/shrink step in MiB
    #[arg(long)]
    chunk_mb: Option<u64>,

    /// Number of hot-pluggable DIMM slots
    #[arg(long)]
    max_slots: Option<usize>,

    /// Seconds between control cycles
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Serve Prometheus metrics on 127.0.0.1:PORT
    #[arg(long)]
    metrics_port: Option<u16>,

    /// QMP monitor socket
    #[arg(long)]
    monitor_socket: Option<PathBuf>,

    /// Guest memory status file
    #[arg(long)]
    status_file: Option<PathBuf>,
}

impl RunArgs {
    fn apply(&self, config: &mut ControllerConfig) {
        if let Some(mb) = self.initial_mb {
            config.initial_memory_mb = mb;
        }
        if let Some(mb) = self.min_mb {
            config.min_memory_mb = mb;
        }
        if let Some(mb) = self.max_mb {
            config.max_memory_mb = Some(mb);
        }
        if let Some(mb) = self.chunk_mb {
            config.chunk_size_mb = mb;
        }
        if let Some(slots) = self.max_slots {
            config.max_slots = slots;
        }
        if let Some(secs) = self.poll_interval {
            config.poll_interval_secs = secs;
        }
        if self.metrics_port.is_some() {
            config.metrics_port = self.metrics_port;
        }
        if let Some(socket) = &self.monitor_socket {
            config.monitor_socket = Some(socket.clone());
        }
        if let Some(file) = &self.status_file {
            config.status_file = Some(file.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Status { vm, json } => {
            init_logging(None)?;
            status(&vm, json).await
        }
        Commands::Decommission { vm } => {
            init_logging(None)?;
            decommission(&vm).await
        }
    }
}

fn init_logging(metrics_port: Option<u16>) -> Result<()> {
    init_observability(metrics_port).map_err(|e| anyhow!("failed to initialise logging: {}", e))
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ControllerConfig::load_from(path)?,
        None => ControllerConfig::load()?,
    };
    args.apply(&mut config);
    init_logging(config.metrics_port)?;

    let paths = VmPaths::for_vm(args.vm.clone());
    let host_total_bytes = host::total_memory_bytes()?;
    let socket = config.monitor_socket(&paths);
    info!(
        vm = %args.vm,
        socket = %socket.display(),
        host_total_mib = host_total_bytes / MIB,
        "vmemd starting"
    );

    let connector = QmpConnector::new(socket, config.command_timeout());
    let setup =
        ControllerSetup { paths, config, host_total_bytes, connector: Box::new(connector) };
    let mut controller = Controller::start(setup)
        .await
        .with_context(|| format!("memory controller for VM '{}' failed to start", args.vm))?;

    if args.once {
        let report = controller.run_once().await?;
        info!(decision = %report.decision, outcome = ?report.outcome, "Single cycle complete");
        if let Some(e) = report.error {
            warn!("Cycle finished with error: {}", e);
        }
        return Ok(());
    }

    if let Err(e) = controller.run(shutdown::shutdown_signal()).await {
        error!("Memory controller failed: {}", e);
        if let Err(stop_err) = controller.stop().await {
            error!("Final state not persisted: {}", stop_err);
        }
        return Err(e.into());
    }

    info!("vmemd stopped");
    Ok(())
}

async fn status(vm: &str, as_json: bool) -> Result<()> {
    let paths = VmPaths::for_vm(vm);
    let owner = InstanceLock::live_owner(&paths.lock_file());
    let state = if paths.state_db().exists() {
        StateStore::new(paths.state_db()).await?.load(vm).await?
    } else {
        None
    };

    if as_json {
        let report = json!({
            "vm": vm,
            "running": owner.is_some(),
            "owner": owner,
            "state": state,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_status(vm, owner.as_ref(), state.as_ref());
    }
    Ok(())
}

fn print_status(vm: &str, owner: Option<&LockOwner>, state: Option<&ControllerState>) {
    println!("VM:          {}", vm);
    match owner {
        Some(owner) => println!("Controller:  running (PID {}, v{})", owner.pid, owner.version),
        None => println!("Controller:  not running"),
    }

    let Some(state) = state else {
        println!("State:       none saved");
        return;
    };

    let budget = &state.budget;
    println!(
        "Target:      {} MiB (min {}, initial {}, max {})",
        budget.current_target_bytes / MIB,
        budget.min_bytes / MIB,
        budget.initial_bytes / MIB,
        budget.max_bytes / MIB
    );
    println!("Physical:    {} MiB", state.physical_bytes() / MIB);
    println!(
        "Slots:       {} of {} in use",
        state.ledger.capacity() - state.ledger.count(SlotState::Empty),
        state.ledger.capacity()
    );

    let occupied: Vec<_> =
        state.ledger.slots().iter().filter(|s| s.state != SlotState::Empty).collect();
    if !occupied.is_empty() {
        println!();
        println!("{:<6} {:<10} {:>10}", "SLOT", "STATE", "SIZE");
        for slot in occupied {
            println!(
                "{:<6} {:<10} {:>6} MiB",
                slot.id,
                slot.state.as_str(),
                slot.size_bytes / MIB
            );
        }
    }
}

async fn decommission(vm: &str) -> Result<()> {
    let paths = VmPaths::for_vm(vm);
    if !paths.state_db().exists() {
        println!("No saved state for VM '{}'", vm);
        return Ok(());
    }

    // Holding the lock keeps a controller from starting mid-discard.
    let _lock = match InstanceLock::acquire(paths.lock_file(), vm) {
        Ok(lock) => lock,
        Err(VmemError::AlreadyRunning { pid, .. }) => {
            bail!("memory controller for VM '{}' is running (PID {}), stop it first", vm, pid)
        }
        Err(e) => return Err(e.into()),
    };

    let store = StateStore::new(paths.state_db()).await?;
    if store.discard(vm).await? {
        info!(vm, "Persisted controller state discarded");
        println!("Discarded saved state for VM '{}'", vm);
    } else {
        println!("No saved state for VM '{}'", vm);
    }
    Ok(())
}
