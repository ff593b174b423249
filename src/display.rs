//! Front-panel page composition.
//!
//! The OLED driver itself is an external collaborator; the core only
//! decides WHAT is on each page. Pages are plain text lines sized for a
//! 128x64 panel with a 6x8 font (21 columns, 6 rows); the renderer draws
//! them verbatim.

use crate::status::{DisplayMode, SystemStatus};
use crate::supervisor::HealthStatus;

pub const DISPLAY_COLS: usize = 21;
pub const DISPLAY_ROWS: usize = 6;

/// One rendered page: at most [`DISPLAY_ROWS`] lines, each clipped to
/// [`DISPLAY_COLS`] characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayPage {
    pub title: &'static str,
    pub lines: Vec<String>,
}

/// Compose the page for `mode` from the current status snapshot.
pub fn compose(status: &SystemStatus, mode: DisplayMode) -> DisplayPage {
    let mut page = match mode {
        DisplayMode::Time => page_time(status),
        DisplayMode::GnssStatus => page_gnss(status),
        DisplayMode::NetworkStatus => page_network(status),
        DisplayMode::Health => page_health(status),
        DisplayMode::Version => page_version(status),
    };
    clip(&mut page);
    page
}

fn page_time(status: &SystemStatus) -> DisplayPage {
    let mut lines = Vec::new();
    if status.utc.is_empty() {
        lines.push("-- not synced --".to_string());
    } else {
        // "2023-11-14 22:13:20 UTC" splits into date and time rows.
        let mut parts = status.utc.split(' ');
        let date = parts.next().unwrap_or("");
        let time = parts.next().unwrap_or("");
        lines.push(time.to_string());
        lines.push(date.to_string());
    }
    lines.push(format!("stratum {}", status.stratum));
    lines.push(format!("pps {}", status.pps_state));
    DisplayPage {
        title: "TIME",
        lines,
    }
}

fn page_gnss(status: &SystemStatus) -> DisplayPage {
    DisplayPage {
        title: "GNSS",
        lines: vec![
            format!("state {}", status.pps_state),
            format!("edges {}", status.pps_edge_count),
            format!("drift {:+} ppb", status.drift_ppb),
        ],
    }
}

fn page_network(status: &SystemStatus) -> DisplayPage {
    DisplayPage {
        title: "NTP",
        lines: vec![
            format!("req   {}", status.ntp.requests_total),
            format!("sent  {}", status.ntp.responses_sent),
            format!("limit {}", status.ntp.rate_limited),
            format!("fail  {}", status.ntp.send_failed),
            format!("avg {:.0} us", status.ntp.avg_processing_us),
        ],
    }
}

fn page_health(status: &SystemStatus) -> DisplayPage {
    let mut lines = vec![
        format!("{:?} {}%", status.state, status.composite_health),
    ];
    if status.safe_mode {
        lines.push("!! SAFE MODE !!".to_string());
    }
    // Only the services that need attention fit on a panel.
    for record in &status.services {
        if record.status == HealthStatus::Healthy {
            continue;
        }
        lines.push(format!("{:?} {}", record.status, record.id.name()));
    }
    if lines.len() == 1 {
        lines.push("all services ok".to_string());
    }
    DisplayPage {
        title: "HEALTH",
        lines,
    }
}

fn page_version(status: &SystemStatus) -> DisplayPage {
    DisplayPage {
        title: "ABOUT",
        lines: vec![
            format!("gnssntpd {}", env!("CARGO_PKG_VERSION")),
            format!("up {}", format_uptime(status.uptime_secs)),
            format!("cfg commit {}", status.config_commit_counter),
        ],
    }
}

fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    if days > 0 {
        format!("{}d {:02}h{:02}m", days, hours, minutes)
    } else {
        format!("{:02}h{:02}m{:02}s", hours, minutes, secs % 60)
    }
}

fn clip(page: &mut DisplayPage) {
    page.lines.truncate(DISPLAY_ROWS - 1); // row 0 is the title
    for line in page.lines.iter_mut() {
        if line.len() > DISPLAY_COLS {
            line.truncate(DISPLAY_COLS);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::SystemStatus;
    use crate::supervisor::{ServiceId, ServiceRecord, SystemState};

    fn locked_status() -> SystemStatus {
        let mut status = SystemStatus::default();
        status.state = SystemState::Running;
        status.composite_health = 93;
        status.stratum = 1;
        status.pps_state = "Locked".to_string();
        status.utc = "2023-11-14 22:13:20 UTC".to_string();
        status.pps_edge_count = 1234;
        status.drift_ppb = -8500;
        status.ntp.requests_total = 100;
        status.ntp.responses_sent = 98;
        status
    }

    #[test]
    fn test_time_page_synced() {
        let page = compose(&locked_status(), DisplayMode::Time);
        assert_eq!(page.title, "TIME");
        assert_eq!(page.lines[0], "22:13:20");
        assert_eq!(page.lines[1], "2023-11-14");
        assert_eq!(page.lines[2], "stratum 1");
    }

    #[test]
    fn test_time_page_unsynced() {
        let page = compose(&SystemStatus::default(), DisplayMode::Time);
        assert_eq!(page.lines[0], "-- not synced --");
        assert_eq!(page.lines[1], "stratum 16");
    }

    #[test]
    fn test_gnss_page_shows_drift_sign() {
        let page = compose(&locked_status(), DisplayMode::GnssStatus);
        assert!(page.lines.iter().any(|line| line.contains("-8500")));
        assert!(page.lines.iter().any(|line| line.contains("1234")));
    }

    #[test]
    fn test_health_page_lists_only_unhealthy() {
        let mut status = locked_status();
        status.services = vec![
            ServiceRecord {
                id: ServiceId::Gnss,
                status: HealthStatus::Healthy,
                last_sample_ticks: None,
                error_count: 0,
                last_error: None,
            },
            ServiceRecord {
                id: ServiceId::Network,
                status: HealthStatus::Warning,
                last_sample_ticks: None,
                error_count: 1,
                last_error: None,
            },
        ];
        let page = compose(&status, DisplayMode::Health);
        assert!(page.lines.iter().any(|line| line.contains("network")));
        assert!(!page.lines.iter().any(|line| line.contains("gnss")));
    }

    #[test]
    fn test_health_page_all_ok() {
        let page = compose(&locked_status(), DisplayMode::Health);
        assert!(page.lines.iter().any(|line| line == "all services ok"));
    }

    #[test]
    fn test_safe_mode_banner() {
        let mut status = locked_status();
        status.safe_mode = true;
        let page = compose(&status, DisplayMode::Health);
        assert!(page.lines.iter().any(|line| line.contains("SAFE MODE")));
    }

    #[test]
    fn test_lines_fit_panel() {
        let mut status = locked_status();
        status.pps_state = "x".repeat(60);
        status.services = (0..8)
            .map(|_| ServiceRecord {
                id: ServiceId::Hardware,
                status: HealthStatus::Critical,
                last_sample_ticks: None,
                error_count: 0,
                last_error: None,
            })
            .collect();
        for mode in [
            DisplayMode::Time,
            DisplayMode::GnssStatus,
            DisplayMode::NetworkStatus,
            DisplayMode::Health,
            DisplayMode::Version,
        ] {
            let page = compose(&status, mode);
            assert!(page.lines.len() <= DISPLAY_ROWS - 1, "{:?}", mode);
            for line in &page.lines {
                assert!(line.len() <= DISPLAY_COLS, "{:?}: {}", mode, line);
            }
        }
    }

    #[test]
    fn test_uptime_formatting() {
        assert_eq!(format_uptime(59), "00h00m59s");
        assert_eq!(format_uptime(3_661), "01h01m01s");
        assert_eq!(format_uptime(90_061), "1d 01h01m");
    }
}
