//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration
//! - `_bytes` suffix for gauges measuring size

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Register all core metrics with descriptions.
///
/// This ensures metrics appear in `/metrics` with proper metadata.
pub fn register_core_metrics() {
    // Monitor protocol
    describe_counter!("vmem_qmp_commands_total", "QMP commands issued (by command, outcome)");
    describe_histogram!("vmem_qmp_command_duration_seconds", "QMP round trip time (by command)");
    describe_counter!("vmem_qmp_reconnects_total", "Monitor session (re)connections attempted");
    describe_counter!("vmem_qmp_events_total", "Asynchronous QMP events received (by event)");

    // Control loop
    describe_counter!("vmem_decisions_total", "Decisions taken (by decision: hold, grow, shrink)");
    describe_counter!(
        "vmem_telemetry_unavailable_total",
        "Polls without a usable guest sample (by reason)"
    );
    describe_gauge!("vmem_guest_free_ratio", "Last observed guest free memory ratio");

    // Hotplug
    describe_counter!(
        "vmem_hotplug_total",
        "Hotplug operations (by operation: attach, detach, balloon; outcome)"
    );
    describe_gauge!("vmem_target_bytes", "Current balloon target");
    describe_gauge!("vmem_physical_bytes", "Boot memory plus plugged DIMMs");
    describe_gauge!("vmem_slots", "Ledger slots (by state)");

    // Persistence
    describe_counter!("vmem_db_errors_total", "State database failures (by operation)");
}

pub fn record_qmp_command(command: &str, outcome: &str, duration_secs: f64) {
    counter!("vmem_qmp_commands_total", "command" => command.to_string(), "outcome" => outcome.to_string())
        .increment(1);
    histogram!("vmem_qmp_command_duration_seconds", "command" => command.to_string())
        .record(duration_secs);
}

pub fn record_qmp_event(event: &str) {
    counter!("vmem_qmp_events_total", "event" => event.to_string()).increment(1);
}

pub fn record_reconnect() {
    counter!("vmem_qmp_reconnects_total").increment(1);
}

pub fn record_decision(decision: &str) {
    counter!("vmem_decisions_total", "decision" => decision.to_string()).increment(1);
}

pub fn record_telemetry_unavailable(reason: &str) {
    counter!("vmem_telemetry_unavailable_total", "reason" => reason.to_string()).increment(1);
}

pub fn set_free_ratio(ratio: f64) {
    gauge!("vmem_guest_free_ratio").set(ratio);
}

pub fn record_hotplug(operation: &str, outcome: &str) {
    counter!("vmem_hotplug_total", "operation" => operation.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

pub fn set_memory(target_bytes: u64, physical_bytes: u64) {
    gauge!("vmem_target_bytes").set(target_bytes as f64);
    gauge!("vmem_physical_bytes").set(physical_bytes as f64);
}

pub fn set_slot_count(state: &str, count: usize) {
    gauge!("vmem_slots", "state" => state.to_string()).set(count as f64);
}

pub fn record_db_error(operation: &str) {
    counter!("vmem_db_errors_total", "operation" => operation.to_string()).increment(1);
}
