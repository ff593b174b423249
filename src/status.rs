//! Shared status snapshot.
//!
//! The controller refreshes one `SystemStatus` behind an `Arc<RwLock>`;
//! the admin HTTP surface and the display renderer read it. Everything in
//! here serializes, so the snapshot doubles as the IPC payload.

use crate::server::ServerCounters;
use crate::supervisor::{ServiceRecord, SystemState};
use serde::{Deserialize, Serialize};

/// Front-panel display pages, rotated by short button presses.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisplayMode {
    Time,
    GnssStatus,
    NetworkStatus,
    Health,
    Version,
}

impl DisplayMode {
    pub fn next(self) -> DisplayMode {
        match self {
            DisplayMode::Time => DisplayMode::GnssStatus,
            DisplayMode::GnssStatus => DisplayMode::NetworkStatus,
            DisplayMode::NetworkStatus => DisplayMode::Health,
            DisplayMode::Health => DisplayMode::Version,
            DisplayMode::Version => DisplayMode::Time,
        }
    }
}

/// NTP counter mirror for the snapshot.
#[derive(Debug, Default, Copy, Clone, Serialize, Deserialize)]
pub struct NtpStatusCounters {
    pub requests_total: u64,
    pub requests_valid: u64,
    pub requests_invalid: u64,
    pub responses_sent: u64,
    pub rate_limited: u64,
    pub send_failed: u64,
    pub avg_processing_us: f64,
}

impl From<ServerCounters> for NtpStatusCounters {
    fn from(counters: ServerCounters) -> Self {
        NtpStatusCounters {
            requests_total: counters.requests_total,
            requests_valid: counters.requests_valid,
            requests_invalid: counters.requests_invalid(),
            responses_sent: counters.responses_sent,
            rate_limited: counters.rate_limited,
            send_failed: counters.send_failed,
            avg_processing_us: counters.avg_processing_us,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub state: SystemState,
    pub composite_health: u8,
    pub safe_mode: bool,
    pub uptime_secs: u64,
    /// Seconds spent in the current system state.
    pub state_secs: u64,

    /// Human-readable UTC of the last refresh (empty until synchronized).
    pub utc: String,
    pub pps_state: String,
    pub stratum: u8,
    pub drift_ppb: i64,
    pub pps_edge_count: u64,

    pub ntp: NtpStatusCounters,

    pub config_commit_counter: u32,
    pub config_valid: bool,

    pub display_mode: DisplayMode,
    pub services: Vec<ServiceRecord>,
}

impl Default for SystemStatus {
    fn default() -> Self {
        SystemStatus {
            state: SystemState::Initializing,
            composite_health: 0,
            safe_mode: false,
            uptime_secs: 0,
            state_secs: 0,
            utc: String::new(),
            pps_state: "Unknown".to_string(),
            stratum: 16,
            drift_ppb: 0,
            pps_edge_count: 0,
            ntp: NtpStatusCounters::default(),
            config_commit_counter: 0,
            config_valid: false,
            display_mode: DisplayMode::Time,
            services: Vec::new(),
        }
    }
}
