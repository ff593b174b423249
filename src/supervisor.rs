//! Health supervision.
//!
//! Eight fixed services are sampled on a slow cadence; their statuses fold
//! into a composite score that drives the system state machine. Recovery is
//! command-based: the supervisor never holds mutable references into the
//! services, it emits bounded `RecoveryAction`s for the controller to
//! execute.

use crate::time_types::MonotonicInstant;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Composite score below which Running degrades.
const DEGRADED_THRESHOLD: u8 = 70;
/// Composite score below which the system is in Error.
const ERROR_THRESHOLD: u8 = 30;
/// Minimum spacing between automatic recovery attempts.
const RECOVERY_RETRY_SECS: u64 = 30;
/// Per-service recovery attempts before downgrading to log-only.
const MAX_RECOVERY_RETRIES: u32 = 3;

pub const SERVICE_COUNT: usize = 8;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceId {
    Gnss,
    Network,
    Ntp,
    Display,
    Config,
    Logging,
    Metrics,
    Hardware,
}

impl ServiceId {
    pub const ALL: [ServiceId; SERVICE_COUNT] = [
        ServiceId::Gnss,
        ServiceId::Network,
        ServiceId::Ntp,
        ServiceId::Display,
        ServiceId::Config,
        ServiceId::Logging,
        ServiceId::Metrics,
        ServiceId::Hardware,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ServiceId::Gnss => "gnss",
            ServiceId::Network => "network",
            ServiceId::Ntp => "ntp",
            ServiceId::Display => "display",
            ServiceId::Config => "config",
            ServiceId::Logging => "logging",
            ServiceId::Metrics => "metrics",
            ServiceId::Hardware => "hardware",
        }
    }

    fn index(&self) -> usize {
        Self::ALL.iter().position(|id| id == self).unwrap()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

impl HealthStatus {
    fn weight(&self) -> u32 {
        match self {
            HealthStatus::Healthy => 4,
            HealthStatus::Warning => 2,
            HealthStatus::Unknown => 1,
            HealthStatus::Critical => 0,
        }
    }

    fn at_least_warning(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Warning)
    }
}

/// Per-service bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: ServiceId,
    pub status: HealthStatus,
    pub last_sample_ticks: Option<u64>,
    pub error_count: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemState {
    Initializing,
    Startup,
    Running,
    Degraded,
    Error,
    Recovery,
    Shutdown,
}

/// One sampling round: the controller derives each status from the
/// component it owns and hands the batch over.
#[derive(Debug, Copy, Clone)]
pub struct HealthSample {
    pub gnss: HealthStatus,
    pub network: HealthStatus,
    pub ntp: HealthStatus,
    pub display: HealthStatus,
    pub config: HealthStatus,
    pub logging: HealthStatus,
    pub metrics: HealthStatus,
    pub hardware: HealthStatus,
}

impl HealthSample {
    pub fn all_healthy() -> Self {
        HealthSample {
            gnss: HealthStatus::Healthy,
            network: HealthStatus::Healthy,
            ntp: HealthStatus::Healthy,
            display: HealthStatus::Healthy,
            config: HealthStatus::Healthy,
            logging: HealthStatus::Healthy,
            metrics: HealthStatus::Healthy,
            hardware: HealthStatus::Healthy,
        }
    }

    fn get(&self, id: ServiceId) -> HealthStatus {
        match id {
            ServiceId::Gnss => self.gnss,
            ServiceId::Network => self.network,
            ServiceId::Ntp => self.ntp,
            ServiceId::Display => self.display,
            ServiceId::Config => self.config,
            ServiceId::Logging => self.logging,
            ServiceId::Metrics => self.metrics,
            ServiceId::Hardware => self.hardware,
        }
    }
}

/// Bounded recovery commands, executed by the controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Re-initialize the GNSS UART/UBX subscriptions.
    ReinitGnss,
    /// Re-run DHCP / link negotiation.
    RenegotiateNetwork,
    /// Reset the NTP service (clears counters).
    RestartNtp,
    /// Load factory defaults and re-commit the configuration.
    ReloadConfigDefaults,
    /// Ask the platform supervisor for a restart.
    RequestRestart,
    /// Retries exhausted; only log from now on.
    LogOnly(ServiceId),
}

// ============================================================================
// SUPERVISOR
// ============================================================================

pub struct HealthSupervisor {
    services: [ServiceRecord; SERVICE_COUNT],
    state: SystemState,
    composite: u8,
    tick_rate: u64,
    state_entered: Option<MonotonicInstant>,
    last_recovery_attempt: Option<MonotonicInstant>,
    recovery_counts: [u32; SERVICE_COUNT],
    auto_recovery: bool,
    safe_mode: bool,
    safe_mode_reason: Option<String>,
}

impl HealthSupervisor {
    pub fn new(tick_rate_hz: u64, auto_recovery: bool) -> Self {
        let services = ServiceId::ALL.map(|id| ServiceRecord {
            id,
            status: HealthStatus::Unknown,
            last_sample_ticks: None,
            error_count: 0,
            last_error: None,
        });
        HealthSupervisor {
            services,
            state: SystemState::Initializing,
            composite: 0,
            tick_rate: tick_rate_hz,
            state_entered: None,
            last_recovery_attempt: None,
            recovery_counts: [0; SERVICE_COUNT],
            auto_recovery,
            safe_mode: false,
            safe_mode_reason: None,
        }
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn composite_health(&self) -> u8 {
        self.composite
    }

    pub fn services(&self) -> &[ServiceRecord; SERVICE_COUNT] {
        &self.services
    }

    pub fn in_safe_mode(&self) -> bool {
        self.safe_mode
    }

    /// Instant of the last state transition, for state-duration stats.
    pub fn state_entered(&self) -> Option<MonotonicInstant> {
        self.state_entered
    }

    pub fn safe_mode_reason(&self) -> Option<&str> {
        self.safe_mode_reason.as_deref()
    }

    pub fn set_auto_recovery(&mut self, enabled: bool) {
        self.auto_recovery = enabled;
    }

    /// Initialization finished; begin startup integrity checking.
    pub fn init_complete(&mut self, now: MonotonicInstant) {
        if self.state == SystemState::Initializing {
            self.transition(SystemState::Startup, now);
        }
    }

    pub fn request_shutdown(&mut self, now: MonotonicInstant) {
        self.transition(SystemState::Shutdown, now);
    }

    /// Record a component error against a service (keeps the last message).
    pub fn report_error(&mut self, id: ServiceId, message: &str) {
        let record = &mut self.services[id.index()];
        record.error_count += 1;
        record.last_error = Some(message.to_string());
        warn!("[Health] {} error: {}", id.name(), message);
    }

    /// A FATAL condition: enter safe mode. The controller stops the NTP
    /// responder and makes configuration read-only; only a restart leaves
    /// this state.
    pub fn fatal(&mut self, now: MonotonicInstant, reason: &str) {
        error!("[Health] FATAL: {} - entering safe mode", reason);
        self.safe_mode = true;
        self.safe_mode_reason = Some(reason.to_string());
        self.transition(SystemState::Error, now);
    }

    /// One sampling round. Returns the recovery commands the controller
    /// should execute, possibly empty.
    pub fn poll(&mut self, now: MonotonicInstant, sample: &HealthSample) -> Vec<RecoveryAction> {
        for record in self.services.iter_mut() {
            record.status = sample.get(record.id);
            record.last_sample_ticks = Some(now.ticks());
        }
        self.composite = composite_score(&self.services);

        if self.safe_mode {
            // Pinned to Error; no recovery, no transitions.
            return Vec::new();
        }

        match self.state {
            SystemState::Initializing | SystemState::Shutdown => Vec::new(),
            SystemState::Startup => {
                if self.integrity_check() {
                    self.transition(SystemState::Running, now);
                }
                Vec::new()
            }
            SystemState::Running => {
                if self.composite < ERROR_THRESHOLD {
                    self.transition(SystemState::Error, now);
                } else if self.composite < DEGRADED_THRESHOLD {
                    self.transition(SystemState::Degraded, now);
                }
                Vec::new()
            }
            SystemState::Degraded => {
                if self.composite < ERROR_THRESHOLD {
                    self.transition(SystemState::Error, now);
                } else if self.composite >= DEGRADED_THRESHOLD {
                    self.transition(SystemState::Running, now);
                }
                Vec::new()
            }
            SystemState::Error => {
                if self.auto_recovery && self.recovery_due(now) {
                    self.last_recovery_attempt = Some(now);
                    self.transition(SystemState::Recovery, now);
                    return self.plan_recovery();
                }
                Vec::new()
            }
            SystemState::Recovery => {
                if self.integrity_check() {
                    info!("[Health] recovery succeeded");
                    self.transition(SystemState::Running, now);
                } else {
                    self.transition(SystemState::Error, now);
                }
                Vec::new()
            }
        }
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    /// Startup/recovery gate: network and config healthy, GNSS at least
    /// degraded-but-present.
    fn integrity_check(&self) -> bool {
        let get = |id: ServiceId| self.services[id.index()].status;
        get(ServiceId::Network) == HealthStatus::Healthy
            && get(ServiceId::Config) == HealthStatus::Healthy
            && get(ServiceId::Gnss).at_least_warning()
    }

    fn recovery_due(&self, now: MonotonicInstant) -> bool {
        match self.last_recovery_attempt {
            None => true,
            Some(last) => now.ticks_since(last) / self.tick_rate >= RECOVERY_RETRY_SECS,
        }
    }

    /// One action per critical service, bounded by the per-service retry
    /// budget.
    fn plan_recovery(&mut self) -> Vec<RecoveryAction> {
        let mut actions = Vec::new();
        for index in 0..SERVICE_COUNT {
            if self.services[index].status != HealthStatus::Critical {
                continue;
            }
            let id = self.services[index].id;
            let action = match id {
                ServiceId::Gnss => Some(RecoveryAction::ReinitGnss),
                ServiceId::Network => Some(RecoveryAction::RenegotiateNetwork),
                ServiceId::Ntp => Some(RecoveryAction::RestartNtp),
                ServiceId::Config => Some(RecoveryAction::ReloadConfigDefaults),
                ServiceId::Hardware => Some(RecoveryAction::RequestRestart),
                // Display/logging/metrics trouble is never worth a reset
                // cascade, and low memory is already too late to fix.
                ServiceId::Display | ServiceId::Logging | ServiceId::Metrics => None,
            };
            let Some(action) = action else { continue };

            if self.recovery_counts[index] >= MAX_RECOVERY_RETRIES {
                actions.push(RecoveryAction::LogOnly(id));
                continue;
            }
            self.recovery_counts[index] += 1;
            info!(
                "[Health] recovery attempt {}/{} for {}: {:?}",
                self.recovery_counts[index],
                MAX_RECOVERY_RETRIES,
                id.name(),
                action
            );
            actions.push(action);
        }
        actions
    }

    fn transition(&mut self, next: SystemState, now: MonotonicInstant) {
        if self.state == next {
            return;
        }
        info!(
            "[Health] {:?} -> {:?} (composite {})",
            self.state, next, self.composite
        );
        self.state = next;
        self.state_entered = Some(now);
    }
}

/// Weighted composite: Healthy=4, Warning=2, Unknown=1, Critical=0, scaled
/// to 0..=100 over the eight services.
fn composite_score(services: &[ServiceRecord; SERVICE_COUNT]) -> u8 {
    let sum: u32 = services.iter().map(|record| record.status.weight()).sum();
    ((sum * 100) / (SERVICE_COUNT as u32 * 4)) as u8
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u64 = 1_000_000;

    fn mono(secs: u64) -> MonotonicInstant {
        MonotonicInstant::from_ticks(secs * RATE)
    }

    fn supervisor() -> HealthSupervisor {
        HealthSupervisor::new(RATE, true)
    }

    fn running_supervisor() -> HealthSupervisor {
        let mut sup = supervisor();
        sup.init_complete(mono(1));
        sup.poll(mono(2), &HealthSample::all_healthy());
        assert_eq!(sup.state(), SystemState::Running);
        sup
    }

    #[test]
    fn test_composite_all_healthy_is_100() {
        let mut sup = running_supervisor();
        sup.poll(mono(3), &HealthSample::all_healthy());
        assert_eq!(sup.composite_health(), 100);
    }

    #[test]
    fn test_composite_weights() {
        let mut sup = running_supervisor();
        let mut sample = HealthSample::all_healthy();
        sample.gnss = HealthStatus::Warning; // 2
        sample.display = HealthStatus::Unknown; // 1
        sample.metrics = HealthStatus::Critical; // 0
        sup.poll(mono(3), &sample);
        // 5 * 4 + 2 + 1 + 0 = 23 -> 23 * 100 / 32 = 71
        assert_eq!(sup.composite_health(), 71);
        assert_eq!(sup.state(), SystemState::Running);
    }

    #[test]
    fn test_startup_waits_for_integrity() {
        let mut sup = supervisor();
        sup.init_complete(mono(1));
        assert_eq!(sup.state(), SystemState::Startup);

        // Network not up yet: stay in startup.
        let mut sample = HealthSample::all_healthy();
        sample.network = HealthStatus::Warning;
        sup.poll(mono(2), &sample);
        assert_eq!(sup.state(), SystemState::Startup);

        // GNSS merely warming still passes (>= Warning), network healthy.
        let mut sample = HealthSample::all_healthy();
        sample.gnss = HealthStatus::Warning;
        sup.poll(mono(3), &sample);
        assert_eq!(sup.state(), SystemState::Running);
    }

    #[test]
    fn test_running_degraded_hysteresis() {
        let mut sup = running_supervisor();

        // Composite 68: 4 services warning, one unknown.
        let mut sample = HealthSample::all_healthy();
        sample.gnss = HealthStatus::Warning;
        sample.ntp = HealthStatus::Warning;
        sample.display = HealthStatus::Warning;
        sample.logging = HealthStatus::Warning;
        sample.metrics = HealthStatus::Unknown;
        sup.poll(mono(3), &sample);
        // 3*4 + 4*2 + 1 = 21 -> 65
        assert_eq!(sup.composite_health(), 65);
        assert_eq!(sup.state(), SystemState::Degraded);

        // Back above the threshold.
        sup.poll(mono(4), &HealthSample::all_healthy());
        assert_eq!(sup.state(), SystemState::Running);
    }

    #[test]
    fn test_error_below_30() {
        let mut sup = running_supervisor();
        let mut sample = HealthSample::all_healthy();
        sample.gnss = HealthStatus::Critical;
        sample.network = HealthStatus::Critical;
        sample.ntp = HealthStatus::Critical;
        sample.config = HealthStatus::Critical;
        sample.hardware = HealthStatus::Critical;
        sample.display = HealthStatus::Critical;
        sup.poll(mono(3), &sample);
        // 2 * 4 = 8 -> 25
        assert_eq!(sup.composite_health(), 25);
        assert_eq!(sup.state(), SystemState::Error);
    }

    #[test]
    fn test_recovery_cycle_and_retry_spacing() {
        let mut sup = running_supervisor();
        let mut bad = HealthSample::all_healthy();
        bad.gnss = HealthStatus::Critical;
        bad.network = HealthStatus::Critical;
        bad.ntp = HealthStatus::Critical;
        bad.config = HealthStatus::Critical;
        bad.display = HealthStatus::Critical;
        bad.hardware = HealthStatus::Critical;

        sup.poll(mono(10), &bad);
        assert_eq!(sup.state(), SystemState::Error);

        // First recovery attempt fires immediately.
        let actions = sup.poll(mono(11), &bad);
        assert_eq!(sup.state(), SystemState::Recovery);
        assert!(actions.contains(&RecoveryAction::ReinitGnss));
        assert!(actions.contains(&RecoveryAction::RenegotiateNetwork));
        assert!(actions.contains(&RecoveryAction::ReloadConfigDefaults));
        assert!(actions.contains(&RecoveryAction::RequestRestart));

        // Still bad: recovery fails back to Error.
        sup.poll(mono(12), &bad);
        assert_eq!(sup.state(), SystemState::Error);

        // A retry 10 s later is too soon.
        let actions = sup.poll(mono(21), &bad);
        assert!(actions.is_empty());
        assert_eq!(sup.state(), SystemState::Error);

        // 30 s after the first attempt it fires again.
        let actions = sup.poll(mono(41), &bad);
        assert_eq!(sup.state(), SystemState::Recovery);
        assert!(!actions.is_empty());
    }

    #[test]
    fn test_recovery_success_returns_to_running() {
        let mut sup = running_supervisor();
        let mut bad = HealthSample::all_healthy();
        bad.gnss = HealthStatus::Critical;
        bad.network = HealthStatus::Critical;
        bad.config = HealthStatus::Critical;
        bad.ntp = HealthStatus::Critical;
        bad.display = HealthStatus::Critical;
        bad.hardware = HealthStatus::Critical;

        sup.poll(mono(10), &bad);
        sup.poll(mono(11), &bad); // -> Recovery
        assert_eq!(sup.state(), SystemState::Recovery);

        // The recovery actions worked; next poll sees health restored.
        sup.poll(mono(12), &HealthSample::all_healthy());
        assert_eq!(sup.state(), SystemState::Running);
    }

    #[test]
    fn test_recovery_retries_bounded() {
        let mut sup = running_supervisor();
        let mut bad = HealthSample::all_healthy();
        bad.gnss = HealthStatus::Critical;
        bad.network = HealthStatus::Critical;
        bad.config = HealthStatus::Critical;
        bad.ntp = HealthStatus::Critical;
        bad.display = HealthStatus::Critical;
        bad.hardware = HealthStatus::Critical;

        // Poll once per second for four minutes of persistent failure and
        // collect every emitted action.
        let mut reinit_count = 0;
        let mut log_only_seen = false;
        for t in 10..250u64 {
            for action in sup.poll(mono(t), &bad) {
                match action {
                    RecoveryAction::ReinitGnss => {
                        assert!(!log_only_seen, "real action after LogOnly downgrade");
                        reinit_count += 1;
                    }
                    RecoveryAction::LogOnly(ServiceId::Gnss) => log_only_seen = true,
                    _ => {}
                }
            }
        }
        assert_eq!(reinit_count, MAX_RECOVERY_RETRIES);
        assert!(
            log_only_seen,
            "after {} attempts the gnss action must downgrade to LogOnly",
            MAX_RECOVERY_RETRIES
        );
    }

    #[test]
    fn test_no_auto_recovery_stays_in_error() {
        let mut sup = HealthSupervisor::new(RATE, false);
        sup.init_complete(mono(1));
        sup.poll(mono(2), &HealthSample::all_healthy());

        let mut bad = HealthSample::all_healthy();
        bad.gnss = HealthStatus::Critical;
        bad.network = HealthStatus::Critical;
        bad.config = HealthStatus::Critical;
        bad.ntp = HealthStatus::Critical;
        bad.display = HealthStatus::Critical;
        bad.hardware = HealthStatus::Critical;
        sup.poll(mono(10), &bad);
        for t in 11..100 {
            assert!(sup.poll(mono(t), &bad).is_empty());
            assert_eq!(sup.state(), SystemState::Error);
        }
    }

    #[test]
    fn test_fatal_pins_error_state() {
        let mut sup = running_supervisor();
        sup.fatal(mono(5), "flash controller dead");
        assert!(sup.in_safe_mode());
        assert_eq!(sup.state(), SystemState::Error);
        assert_eq!(sup.safe_mode_reason(), Some("flash controller dead"));

        // Even perfect health cannot leave safe mode.
        let actions = sup.poll(mono(60), &HealthSample::all_healthy());
        assert!(actions.is_empty());
        assert_eq!(sup.state(), SystemState::Error);
    }

    #[test]
    fn test_report_error_tracks_counts() {
        let mut sup = supervisor();
        sup.report_error(ServiceId::Ntp, "send queue wedged");
        sup.report_error(ServiceId::Ntp, "send queue wedged again");
        let record = &sup.services()[ServiceId::Ntp.index()];
        assert_eq!(record.error_count, 2);
        assert_eq!(
            record.last_error.as_deref(),
            Some("send queue wedged again")
        );
    }
}
