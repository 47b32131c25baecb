//! Controller daemon: the per-VM control loop.
//!
//! ```text
//! Stopped ──start──► Starting ──► Running ──shutdown / VM gone──► Stopping ──► Stopped
//! ```
//!
//! Each cycle drains monitor events, resolves in-flight slots, reads one
//! telemetry sample, decides, and applies at most one action. A cycle runs
//! to completion before shutdown is looked at again.

use crate::config::{ControllerConfig, MIB};
use crate::decision::{Decision, DecisionEngine};
use crate::error::{Result, VmemError};
use crate::host;
use crate::hotplug::{HotplugExecutor, HotplugOutcome, ReconcileReport};
use crate::ledger::{ControllerState, MemoryBudget, SlotLedger, SlotState};
use crate::lock::InstanceLock;
use crate::observability::health::{
    HealthCheck, HealthChecker, HealthStatus, SUBSYSTEM_MONITOR, SUBSYSTEM_STATE,
    SUBSYSTEM_TELEMETRY,
};
use crate::observability::metrics as vmem_metrics;
use crate::paths::VmPaths;
use crate::qmp::{MonitorConnector, MonitorSession};
use crate::state::StateStore;
use crate::telemetry::TelemetryReader;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle phase of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ControllerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Everything needed to start a controller.
pub struct ControllerSetup {
    pub paths: VmPaths,
    pub config: ControllerConfig,
    pub host_total_bytes: u64,
    pub connector: Box<dyn MonitorConnector>,
}

/// Result of one control cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub decision: Decision,
    /// Set when the decision was handed to the executor and succeeded.
    pub outcome: Option<HotplugOutcome>,
    /// Error absorbed during the cycle.
    pub error: Option<VmemError>,
    /// The hypervisor process is gone; the controller should stop.
    pub vm_gone: bool,
}

impl CycleReport {
    fn new(decision: Decision) -> Self {
        Self { decision, outcome: None, error: None, vm_gone: false }
    }
}

/// Capped exponential backoff for monitor reconnects.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    next_attempt: Option<Instant>,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, current: initial, next_attempt: None }
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.next_attempt.map_or(true, |at| now >= at)
    }

    /// Record a failed attempt; returns the wait before the next one.
    pub fn failed(&mut self, now: Instant) -> Duration {
        let delay = self.current;
        self.next_attempt = Some(now + delay);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.next_attempt = None;
    }
}

/// Dynamic memory controller for one VM.
pub struct Controller {
    paths: VmPaths,
    config: ControllerConfig,
    store: StateStore,
    state: ControllerState,
    telemetry: TelemetryReader,
    engine: DecisionEngine,
    executor: HotplugExecutor,
    connector: Box<dyn MonitorConnector>,
    session: Option<Box<dyn MonitorSession>>,
    backoff: ReconnectBackoff,
    health: HealthChecker,
    phase: ControllerPhase,
    ticks: u64,
    vm_pid_file: Option<PathBuf>,
    lock: Option<InstanceLock>,
}

impl Controller {
    /// Acquire the lock, restore state and connect to the monitor.
    ///
    /// Fails on a held lock, an invalid configuration or a failed QMP
    /// handshake. An unreachable monitor is not fatal; the loop keeps
    /// reconnecting.
    #[instrument(skip_all, fields(vm = %setup.paths.name()))]
    pub async fn start(setup: ControllerSetup) -> Result<Self> {
        let ControllerSetup { paths, config, host_total_bytes, connector } = setup;
        let vm = paths.name().to_string();
        info!(phase = %ControllerPhase::Starting, "Starting memory controller");

        let budget = config.validate(host_total_bytes)?;
        let lock = InstanceLock::acquire(paths.lock_file(), &vm)?;
        let store = StateStore::new(paths.state_db()).await?;

        let state = match store.load(&vm).await? {
            Some(saved) => restore_state(saved, &budget, config.max_slots)?,
            None => {
                info!("No saved state, starting with all slots empty");
                ControllerState::new(&vm, budget, config.max_slots)
            }
        };
        store.save(&state).await?;

        let vm_pid_file = config.vm_pid_file(&paths);
        let vm_pid_file = if config.vm_check_every_polls == 0 {
            None
        } else if vm_pid_file.exists() {
            Some(vm_pid_file)
        } else {
            warn!(path = %vm_pid_file.display(), "VM pid file not found, liveness check disabled");
            None
        };

        let telemetry = TelemetryReader::new(config.status_file(&paths), config.stale_after());
        let backoff = ReconnectBackoff::new(
            Duration::from_millis(config.reconnect_initial_backoff_ms),
            Duration::from_millis(config.reconnect_max_backoff_ms),
        );

        let mut controller = Self {
            engine: DecisionEngine::from_config(&config),
            executor: HotplugExecutor::new(config.command_timeout()),
            health: HealthChecker::for_controller().await,
            paths,
            config,
            store,
            state,
            telemetry,
            connector,
            session: None,
            backoff,
            phase: ControllerPhase::Starting,
            ticks: 0,
            vm_pid_file,
            lock: Some(lock),
        };

        controller.ensure_session().await?;
        if controller.session.is_some() {
            controller.check_hypervisor().await;
        }

        controller.phase = ControllerPhase::Running;
        info!(
            target_mib = controller.state.budget.current_target_bytes / MIB,
            max_mib = controller.state.budget.max_bytes / MIB,
            attached = controller.state.ledger.count(SlotState::Attached),
            "Memory controller running"
        );
        Ok(controller)
    }

    pub fn phase(&self) -> ControllerPhase {
        self.phase
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub async fn health(&self) -> HealthCheck {
        self.health.get_health().await
    }

    /// Run cycles until shutdown is signalled or the VM disappears.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick().await?;
                    if report.vm_gone {
                        info!(vm = %self.paths.name(), "VM is no longer running, stopping");
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.stop().await
    }

    /// Run exactly one cycle, then stop.
    pub async fn run_once(&mut self) -> Result<CycleReport> {
        let report = self.tick().await?;
        self.stop().await?;
        Ok(report)
    }

    /// One poll-decide-apply cycle.
    ///
    /// Only fatal errors are returned; everything else is recorded in the
    /// report and absorbed.
    #[instrument(skip(self), fields(vm = %self.paths.name(), tick = self.ticks + 1))]
    pub async fn tick(&mut self) -> Result<CycleReport> {
        self.ticks += 1;

        if self.vm_gone() {
            let mut report = CycleReport::new(Decision::Hold);
            report.vm_gone = true;
            return Ok(report);
        }

        self.ensure_session().await?;
        let mut absorbed = None;
        if let Err(e) = self.sync_with_monitor().await {
            absorbed = Some(self.absorb(e).await?);
        }

        let reading = self.telemetry.read().await;
        match &reading {
            Ok(status) => vmem_metrics::set_free_ratio(status.free_ratio(self.config.memory_source)),
            Err(reason) => vmem_metrics::record_telemetry_unavailable(unavailable_label(reason)),
        }
        let decision = self.engine.observe(&reading, &self.state);
        self.update_telemetry_health(&reading).await;
        vmem_metrics::record_decision(decision.label());

        let mut report = CycleReport::new(decision);
        report.error = absorbed;

        if !decision.is_hold() {
            match self.apply(decision).await {
                Ok(outcome) => {
                    if outcome.is_change() {
                        self.engine.note_applied();
                    }
                    report.outcome = Some(outcome);
                }
                Err(e) => report.error = Some(self.absorb(e).await?),
            }
        }

        if report.error.is_none() {
            self.health.mark_healthy(SUBSYSTEM_STATE).await;
        }
        self.publish_gauges();
        Ok(report)
    }

    /// Persist final state and release the lock.
    pub async fn stop(&mut self) -> Result<()> {
        if self.phase == ControllerPhase::Stopped {
            return Ok(());
        }
        self.phase = ControllerPhase::Stopping;
        info!(phase = %self.phase, "Stopping memory controller");

        self.session = None;
        let saved = self.store.save(&self.state).await;
        self.lock = None;
        self.phase = ControllerPhase::Stopped;

        saved?;
        info!(phase = %self.phase, "Memory controller stopped");
        Ok(())
    }

    async fn apply(&mut self, decision: Decision) -> Result<HotplugOutcome> {
        let Some(session) = self.session.as_deref_mut() else {
            debug!(%decision, "No monitor session, decision not applied");
            return Err(VmemError::NotConnected);
        };
        self.executor.apply(session, &self.store, &mut self.state, decision).await
    }

    /// Connect if there is no session and the backoff allows it.
    async fn ensure_session(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let now = Instant::now();
        if !self.backoff.ready(now) {
            return Ok(());
        }

        vmem_metrics::record_reconnect();
        match self.connector.connect().await {
            Ok(session) => {
                info!("Monitor session established");
                self.session = Some(session);
                self.backoff.reset();
                self.health.mark_healthy(SUBSYSTEM_MONITOR).await;
                if let Err(e) = self.reconcile().await {
                    self.absorb(e).await?;
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                error!("Monitor handshake failed: {}", e);
                self.health
                    .update_subsystem(SUBSYSTEM_MONITOR, HealthStatus::Unhealthy, Some(e.to_string()))
                    .await;
                Err(e)
            }
            Err(e) => {
                let delay = self.backoff.failed(now);
                warn!(retry_in_ms = delay.as_millis() as u64, "Monitor unavailable: {}", e);
                self.health
                    .update_subsystem(SUBSYSTEM_MONITOR, HealthStatus::Degraded, Some(e.to_string()))
                    .await;
                Ok(())
            }
        }
    }

    /// Drain events and resolve any in-flight slot.
    async fn sync_with_monitor(&mut self) -> Result<()> {
        let Some(session) = self.session.as_deref_mut() else {
            return Ok(());
        };

        let events = session.drain_events().await?;
        if !events.is_empty() {
            self.executor.handle_events(session, &self.store, &mut self.state, events).await?;
        }

        if self.state.ledger.in_flight().is_some() {
            self.reconcile().await?;
        }
        Ok(())
    }

    async fn reconcile(&mut self) -> Result<ReconcileReport> {
        let Some(session) = self.session.as_deref_mut() else {
            return Err(VmemError::NotConnected);
        };
        self.executor.reconcile(session, &self.store, &mut self.state).await
    }

    /// Compare the hypervisor's view of memory with the saved state.
    ///
    /// Mismatches are logged only; reconciliation already fixed the ledger.
    async fn check_hypervisor(&mut self) {
        let timeout = self.config.command_timeout();
        let initial = self.state.budget.initial_bytes;
        let plugged = self.state.ledger.plugged_bytes();
        let target = self.state.budget.current_target_bytes;
        let Some(session) = self.session.as_deref_mut() else {
            return;
        };

        let checked = async {
            let summary = session.query_memory_size_summary(timeout).await?;
            if summary.base_memory != initial {
                warn!(
                    base_mib = summary.base_memory / MIB,
                    initial_mib = initial / MIB,
                    "Hypervisor boot memory differs from configured initial size"
                );
            }
            if summary.plugged_memory != plugged {
                warn!(
                    plugged_mib = summary.plugged_memory / MIB,
                    ledger_mib = plugged / MIB,
                    "Hotplugged memory differs from the slot ledger"
                );
            }
            let balloon = session.query_balloon(timeout).await?;
            if balloon.actual != target {
                warn!(
                    actual_mib = balloon.actual / MIB,
                    target_mib = target / MIB,
                    "Balloon size differs from saved target"
                );
            }
            Ok::<_, VmemError>(())
        }
        .await;

        if let Err(e) = checked {
            debug!("Hypervisor memory not checked: {}", e);
            if e.poisons_session() {
                self.drop_session(&e).await;
            }
        }
    }

    /// Classify an error raised during a cycle.
    ///
    /// Fatal errors propagate. Everything else is logged, drops the session
    /// when the stream can no longer be trusted, and is handed back.
    async fn absorb(&mut self, e: VmemError) -> Result<VmemError> {
        if e.is_fatal() {
            return Err(e);
        }

        if e.is_policy_refusal() {
            warn!("Decision not applied: {}", e);
        } else if e.poisons_session() {
            self.drop_session(&e).await;
        } else if matches!(e, VmemError::DatabaseError(_)) {
            error!("Persisting controller state failed: {}", e);
            self.health
                .update_subsystem(SUBSYSTEM_STATE, HealthStatus::Unhealthy, Some(e.to_string()))
                .await;
        } else {
            warn!("Cycle error: {}", e);
        }
        Ok(e)
    }

    /// Drop a live session and schedule the reconnect.
    ///
    /// Without a session there is nothing to drop and the pending reconnect
    /// keeps its schedule.
    async fn drop_session(&mut self, e: &VmemError) {
        if self.session.take().is_none() {
            return;
        }
        warn!("Dropping monitor session: {}", e);
        let delay = self.backoff.failed(Instant::now());
        debug!(retry_in_ms = delay.as_millis() as u64, "Monitor reconnect scheduled");
        self.health
            .update_subsystem(SUBSYSTEM_MONITOR, HealthStatus::Degraded, Some(e.to_string()))
            .await;
    }

    fn vm_gone(&self) -> bool {
        let every = u64::from(self.config.vm_check_every_polls);
        match &self.vm_pid_file {
            Some(pid_file) if every > 0 && self.ticks % every == 0 => {
                !host::pid_file_alive(pid_file)
            }
            _ => false,
        }
    }

    async fn update_telemetry_health(
        &self,
        reading: &std::result::Result<crate::telemetry::MemoryStatus, crate::telemetry::Unavailable>,
    ) {
        if self.engine.is_stale() {
            let reason = reading.as_ref().err().map(|r| r.to_string());
            warn!(
                polls = self.engine.unavailable_streak(),
                reason = reason.as_deref().unwrap_or("unknown"),
                "Guest telemetry is stale"
            );
            self.health.update_subsystem(SUBSYSTEM_TELEMETRY, HealthStatus::Degraded, reason).await;
        } else if reading.is_ok() {
            self.health.mark_healthy(SUBSYSTEM_TELEMETRY).await;
        }
    }

    fn publish_gauges(&self) {
        vmem_metrics::set_memory(self.state.budget.current_target_bytes, self.state.physical_bytes());
        for slot_state in
            [SlotState::Empty, SlotState::Pending, SlotState::Attached, SlotState::Detaching]
        {
            vmem_metrics::set_slot_count(slot_state.as_str(), self.state.ledger.count(slot_state));
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if self.phase == ControllerPhase::Running {
            warn!(vm = %self.paths.name(), "Controller dropped without stop(), state may lag");
        }
    }
}

/// Bring saved state in line with the current configuration.
///
/// Bounds follow the configuration. The slot array may grow; it may only
/// shrink if no occupied slot would fall off the end.
fn restore_state(
    saved: ControllerState,
    bounds: &MemoryBudget,
    max_slots: usize,
) -> Result<ControllerState> {
    let ControllerState { vm_name, mut budget, ledger } = saved;
    budget.rebound(bounds);

    let ledger = if ledger.capacity() == max_slots {
        ledger
    } else {
        if let Some(slot) = ledger.slots().iter().find(|s| s.id >= max_slots && s.state != SlotState::Empty) {
            return Err(VmemError::InvalidConfig {
                reason: format!(
                    "max_slots = {} but slot {} is {}",
                    max_slots, slot.id, slot.state
                ),
            });
        }
        let kept = ledger.slots().iter().filter(|s| s.id < max_slots).cloned().collect();
        SlotLedger::from_slots(max_slots, kept)?
    };

    info!(
        target_mib = budget.current_target_bytes / MIB,
        attached = ledger.count(SlotState::Attached),
        in_flight = ledger.in_flight().map(|s| s.id),
        "Restored saved state"
    );
    Ok(ControllerState { vm_name, budget, ledger })
}

fn unavailable_label(reason: &crate::telemetry::Unavailable) -> &'static str {
    use crate::telemetry::Unavailable;
    match reason {
        Unavailable::Missing => "missing",
        Unavailable::Unreadable(_) => "unreadable",
        Unavailable::Malformed(_) => "malformed",
        Unavailable::Inconsistent(_) => "inconsistent",
        Unavailable::Stale { .. } => "stale",
    }
}
