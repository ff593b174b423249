//! Prometheus text exposition of the operational counters.
//!
//! The HTTP surface that actually serves `/metrics` is an external
//! collaborator; the core produces the exposition-format body from the
//! status snapshot, so the web layer stays a dumb byte pipe.

use crate::status::SystemStatus;
use crate::supervisor::{HealthStatus, SystemState};
use std::fmt::Write;

/// Render the exposition body. Deterministic ordering, one trailing
/// newline, no timestamps (the scraper applies its own).
pub fn render(status: &SystemStatus) -> String {
    let mut out = String::with_capacity(2048);

    gauge(
        &mut out,
        "gnssntpd_up",
        "Whether the system reached its main loop",
        1,
    );
    gauge(
        &mut out,
        "gnssntpd_uptime_seconds",
        "Seconds since boot",
        status.uptime_secs,
    );
    gauge(
        &mut out,
        "gnssntpd_system_state",
        "System state (0=Initializing 1=Startup 2=Running 3=Degraded 4=Error 5=Recovery 6=Shutdown)",
        state_code(status.state),
    );
    gauge(
        &mut out,
        "gnssntpd_composite_health",
        "Composite health score 0-100",
        status.composite_health as u64,
    );
    gauge(
        &mut out,
        "gnssntpd_safe_mode",
        "1 while the system is pinned in safe mode",
        status.safe_mode as u64,
    );

    gauge(
        &mut out,
        "gnssntpd_clock_stratum",
        "NTP stratum currently served",
        status.stratum as u64,
    );
    counter(
        &mut out,
        "gnssntpd_pps_edges_total",
        "PPS edges observed since boot",
        status.pps_edge_count,
    );
    signed_gauge(
        &mut out,
        "gnssntpd_clock_drift_ppb",
        "Smoothed local oscillator drift estimate",
        status.drift_ppb,
    );

    counter(
        &mut out,
        "gnssntpd_ntp_requests_total",
        "Datagrams received on the NTP port",
        status.ntp.requests_total,
    );
    counter(
        &mut out,
        "gnssntpd_ntp_requests_invalid_total",
        "Datagrams dropped for size or header policy",
        status.ntp.requests_invalid,
    );
    counter(
        &mut out,
        "gnssntpd_ntp_responses_total",
        "Responses handed to the transport",
        status.ntp.responses_sent,
    );
    counter(
        &mut out,
        "gnssntpd_ntp_rate_limited_total",
        "Requests denied by the per-source token bucket",
        status.ntp.rate_limited,
    );
    counter(
        &mut out,
        "gnssntpd_ntp_send_failed_total",
        "Responses the transport could not take",
        status.ntp.send_failed,
    );
    float_gauge(
        &mut out,
        "gnssntpd_ntp_processing_seconds",
        "Moving average of receive-to-transmit processing time",
        status.ntp.avg_processing_us / 1_000_000.0,
    );

    counter(
        &mut out,
        "gnssntpd_config_commits_total",
        "Configuration commit counter (resets on factory reset)",
        status.config_commit_counter as u64,
    );

    // One labelled series per service, mirroring the health weights.
    let _ = writeln!(
        out,
        "# HELP gnssntpd_service_health Service health (4=Healthy 2=Warning 1=Unknown 0=Critical)"
    );
    let _ = writeln!(out, "# TYPE gnssntpd_service_health gauge");
    for record in &status.services {
        let _ = writeln!(
            out,
            "gnssntpd_service_health{{service=\"{}\"}} {}",
            record.id.name(),
            health_weight(record.status)
        );
    }

    out
}

fn state_code(state: SystemState) -> u64 {
    match state {
        SystemState::Initializing => 0,
        SystemState::Startup => 1,
        SystemState::Running => 2,
        SystemState::Degraded => 3,
        SystemState::Error => 4,
        SystemState::Recovery => 5,
        SystemState::Shutdown => 6,
    }
}

fn health_weight(status: HealthStatus) -> u64 {
    match status {
        HealthStatus::Healthy => 4,
        HealthStatus::Warning => 2,
        HealthStatus::Unknown => 1,
        HealthStatus::Critical => 0,
    }
}

fn gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
    let _ = writeln!(out, "{} {}", name, value);
}

fn signed_gauge(out: &mut String, name: &str, help: &str, value: i64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
    let _ = writeln!(out, "{} {}", name, value);
}

fn float_gauge(out: &mut String, name: &str, help: &str, value: f64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
    let _ = writeln!(out, "{} {}", name, value);
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} counter", name);
    let _ = writeln!(out, "{} {}", name, value);
}

// ============================================================================
// TESTS
// ============================================================================
