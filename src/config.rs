//! Persistent configuration.
//!
//! One typed record in RAM, two slots on flash. Commits ping-pong between
//! the slots and write the header last, so a power cut at any instant
//! leaves exactly one authoritative record: the old one until the new
//! header is fully on flash, the new one after.

use crate::clock::ClockParams;
use crate::crc32::crc32;
use crate::server::ServerPolicy;
use crate::traits::{FlashStorage, PowerMonitor, StorageError};
use byteorder::{ByteOrder, LittleEndian};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use thiserror::Error;

// ============================================================================
// FLASH GEOMETRY
// ============================================================================

/// Whole reserved region: a single erase sector.
pub const SECTOR_SIZE: u32 = 4096;
/// On-flash header length for each slot.
pub const HEADER_LEN: u32 = 32;
/// Maximum serialized body size; two slots plus headers fill the sector.
pub const BODY_MAX: u32 = (SECTOR_SIZE - 2 * HEADER_LEN) / 2;
/// "GPSA" — GPS NTP server configuration.
pub const MAGIC: u32 = 0x4750_5341;

const SLOT_A_HEADER: u32 = 0;
const SLOT_A_BODY: u32 = HEADER_LEN;
const SLOT_B_HEADER: u32 = BODY_MAX + HEADER_LEN;
const SLOT_B_BODY: u32 = BODY_MAX + 2 * HEADER_LEN;

/// Current record schema version.
pub const CONFIG_VERSION: u32 = 1;

// ============================================================================
// RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub hostname: String,
    pub dhcp: bool,
    pub ip_address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns_server: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub syslog_server: String,
    pub syslog_port: u16,
    /// 0..=7, syslog severity scale.
    pub log_level: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GnssConfig {
    pub gps_enabled: bool,
    pub glonass_enabled: bool,
    pub galileo_enabled: bool,
    pub beidou_enabled: bool,
    pub qzss_enabled: bool,
    /// QZSS L1S disaster/crisis report reception.
    pub qzss_l1s_enabled: bool,
    /// Navigation solution rate, 1..=10 Hz.
    pub update_rate_hz: u8,
    /// 0=low, 1=medium, 2=high.
    pub disaster_alert_priority: u8,
    /// PPS edge to UBX second matching window.
    pub pps_match_tolerance_ms: u32,
    /// How long holdover may extrapolate before sync is abandoned.
    pub holdover_max_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NtpSectionConfig {
    pub enabled: bool,
    pub port: u16,
    /// See [`ServerPolicy::respond_unsynchronized`].
    pub respond_unsynchronized: bool,
    pub rate_limit_capacity: u32,
    pub rate_limit_refill_per_sec: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSectionConfig {
    pub auto_restart_enabled: bool,
    pub restart_interval_hours: u32,
    pub debug_enabled: bool,
    pub metrics_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub config_version: u32,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
    pub gnss: GnssConfig,
    pub ntp: NtpSectionConfig,
    pub system: SystemSectionConfig,
}

impl Default for ConfigRecord {
    fn default() -> Self {
        ConfigRecord {
            config_version: CONFIG_VERSION,
            network: NetworkConfig {
                hostname: "gps-ntp".to_string(),
                dhcp: true,
                ip_address: Ipv4Addr::UNSPECIFIED,
                netmask: Ipv4Addr::UNSPECIFIED,
                gateway: Ipv4Addr::UNSPECIFIED,
                dns_server: Ipv4Addr::UNSPECIFIED,
            },
            logging: LoggingConfig {
                syslog_server: String::new(),
                syslog_port: 514,
                log_level: 6,
            },
            gnss: GnssConfig {
                gps_enabled: true,
                glonass_enabled: true,
                galileo_enabled: true,
                beidou_enabled: false,
                qzss_enabled: true,
                qzss_l1s_enabled: false,
                update_rate_hz: 1,
                disaster_alert_priority: 1,
                pps_match_tolerance_ms: 50,
                holdover_max_secs: 600,
            },
            ntp: NtpSectionConfig {
                enabled: true,
                port: 123,
                respond_unsynchronized: true,
                rate_limit_capacity: 8,
                rate_limit_refill_per_sec: 1,
            },
            system: SystemSectionConfig {
                auto_restart_enabled: true,
                restart_interval_hours: 0,
                debug_enabled: false,
                metrics_enabled: true,
            },
        }
    }
}

impl ConfigRecord {
    /// Whole-record validation, applied to externally supplied records
    /// before they may be committed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_hostname(&self.network.hostname)?;
        validate_log_level(self.logging.log_level)?;
        validate_update_rate(self.gnss.update_rate_hz)?;
        validate_ntp_port(self.ntp.port)?;
        validate_alert_priority(self.gnss.disaster_alert_priority)?;
        if self.logging.syslog_server.len() > 63 {
            return Err(ConfigError::Validation("syslog server name too long"));
        }
        if self.ntp.rate_limit_capacity == 0 || self.ntp.rate_limit_refill_per_sec == 0 {
            return Err(ConfigError::Validation("rate limit parameters must be nonzero"));
        }
        Ok(())
    }

    pub fn clock_params(&self) -> ClockParams {
        ClockParams {
            pps_match_tolerance_ns: self.gnss.pps_match_tolerance_ms as u64 * 1_000_000,
            holdover_max_secs: self.gnss.holdover_max_secs as u64,
            ..ClockParams::default()
        }
    }

    pub fn server_policy(&self) -> ServerPolicy {
        ServerPolicy {
            respond_unsynchronized: self.ntp.respond_unsynchronized,
        }
    }
}

fn validate_hostname(hostname: &str) -> Result<(), ConfigError> {
    if hostname.is_empty() || hostname.len() > 31 {
        return Err(ConfigError::Validation("hostname must be 1..=31 characters"));
    }
    Ok(())
}

fn validate_log_level(level: u8) -> Result<(), ConfigError> {
    if level > 7 {
        return Err(ConfigError::Validation("log level must be 0..=7"));
    }
    Ok(())
}

fn validate_update_rate(rate: u8) -> Result<(), ConfigError> {
    if !(1..=10).contains(&rate) {
        return Err(ConfigError::Validation("gnss update rate must be 1..=10 Hz"));
    }
    Ok(())
}

fn validate_ntp_port(port: u16) -> Result<(), ConfigError> {
    if port == 0 {
        return Err(ConfigError::Validation("ntp port must be nonzero"));
    }
    Ok(())
}

fn validate_alert_priority(priority: u8) -> Result<(), ConfigError> {
    if priority > 2 {
        return Err(ConfigError::Validation("disaster alert priority must be 0..=2"));
    }
    Ok(())
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value: {0}")]
    Validation(&'static str),
    #[error("serialized record is {0} bytes, limit {BODY_MAX}")]
    TooLarge(usize),
    #[error("a commit is already in flight")]
    Busy,
    #[error("configuration is read-only in safe mode")]
    ReadOnly,
    #[error("power unstable, refusing flash write")]
    PowerUnstable,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

// ============================================================================
// SLOT HEADER
// ============================================================================

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct SlotHeader {
    magic: u32,
    size: u32,
    version: u32,
    crc32: u32,
    timestamp: u32,
}

impl SlotHeader {
    fn encode(&self) -> [u8; HEADER_LEN as usize] {
        let mut bytes = [0u8; HEADER_LEN as usize];
        LittleEndian::write_u32(&mut bytes[0..4], self.magic);
        LittleEndian::write_u32(&mut bytes[4..8], self.size);
        LittleEndian::write_u32(&mut bytes[8..12], self.version);
        LittleEndian::write_u32(&mut bytes[12..16], self.crc32);
        LittleEndian::write_u32(&mut bytes[16..20], self.timestamp);
        // Remaining 12 bytes stay reserved (zero).
        bytes
    }

    fn decode(bytes: &[u8; HEADER_LEN as usize]) -> SlotHeader {
        SlotHeader {
            magic: LittleEndian::read_u32(&bytes[0..4]),
            size: LittleEndian::read_u32(&bytes[4..8]),
            version: LittleEndian::read_u32(&bytes[8..12]),
            crc32: LittleEndian::read_u32(&bytes[12..16]),
            timestamp: LittleEndian::read_u32(&bytes[16..20]),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Slot {
    A,
    B,
}

impl Slot {
    fn header_offset(self) -> u32 {
        match self {
            Slot::A => SLOT_A_HEADER,
            Slot::B => SLOT_B_HEADER,
        }
    }

    fn body_offset(self) -> u32 {
        match self {
            Slot::A => SLOT_A_BODY,
            Slot::B => SLOT_B_BODY,
        }
    }

    fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }
}

// ============================================================================
// STORE
// ============================================================================

/// Health facts the supervisor samples from the store.
#[derive(Debug, Default, Copy, Clone)]
pub struct ConfigHealth {
    pub record_valid: bool,
    pub last_commit_failed: bool,
    pub corruption_detected: bool,
}

pub struct ConfigStore<F, P> {
    flash: F,
    power: P,
    record: ConfigRecord,
    commit_counter: u32,
    active_slot: Slot,
    pending: Option<ConfigRecord>,
    health: ConfigHealth,
}

impl<F: FlashStorage, P: PowerMonitor> ConfigStore<F, P> {
    /// Boot-time load: arbitrate the two slots, fall back to factory
    /// defaults (persisting them) when neither is usable.
    pub fn load(flash: F, power: P) -> Self {
        let mut store = ConfigStore {
            flash,
            power,
            record: ConfigRecord::default(),
            commit_counter: 0,
            active_slot: Slot::A,
            pending: None,
            health: ConfigHealth {
                record_valid: true,
                ..ConfigHealth::default()
            },
        };

        let slot_a = store.read_slot(Slot::A);
        let slot_b = store.read_slot(Slot::B);

        // Both valid: the greater commit counter wins, ties go to A.
        let winner = match (slot_a, slot_b) {
            (Some(a), Some(b)) => {
                if a.0.timestamp >= b.0.timestamp {
                    Some((Slot::A, a))
                } else {
                    Some((Slot::B, b))
                }
            }
            (Some(a), None) => Some((Slot::A, a)),
            (None, Some(b)) => Some((Slot::B, b)),
            (None, None) => None,
        };

        match winner {
            Some((slot, (header, record))) => {
                info!(
                    "[Config] loaded slot {:?}, commit {} (schema v{})",
                    slot, header.timestamp, header.version
                );
                store.record = record;
                store.commit_counter = header.timestamp;
                store.active_slot = slot;
            }
            None => {
                warn!("[Config] no valid slot, loading factory defaults");
                store.health.corruption_detected = true;
                store.record = ConfigRecord::default();
                store.commit_counter = 0;
                store.active_slot = Slot::A;
                if let Err(e) = store.persist_defaults() {
                    error!("[Config] persisting defaults failed: {}", e);
                    store.health.last_commit_failed = true;
                }
            }
        }
        store
    }

    pub fn record(&self) -> &ConfigRecord {
        &self.record
    }

    /// Cheap copy for external readers (admin surface, supervisor).
    pub fn snapshot(&self) -> ConfigRecord {
        self.record.clone()
    }

    pub fn health(&self) -> ConfigHealth {
        self.health
    }

    /// Cheap readback used as the hardware self-test: fetch slot A's
    /// header and report nothing but success or failure. The caller times
    /// the call to derive a response-time health probe.
    pub fn probe(&self) -> Result<(), StorageError> {
        let mut buf = [0u8; HEADER_LEN as usize];
        self.flash.read(SLOT_A_HEADER, &mut buf)
    }

    pub fn commit_counter(&self) -> u32 {
        self.commit_counter
    }

    // ========================================================================
    // FIELD SETTERS
    // ========================================================================
    //
    // Each validates first and leaves the in-memory record untouched on
    // failure. None of these touch flash; call `commit_current` (or queue a
    // deferred commit) to persist.

    pub fn set_hostname(&mut self, hostname: &str) -> Result<(), ConfigError> {
        validate_hostname(hostname)?;
        self.record.network.hostname = hostname.to_string();
        Ok(())
    }

    pub fn set_log_level(&mut self, level: u8) -> Result<(), ConfigError> {
        validate_log_level(level)?;
        self.record.logging.log_level = level;
        Ok(())
    }

    pub fn set_gnss_update_rate(&mut self, rate_hz: u8) -> Result<(), ConfigError> {
        validate_update_rate(rate_hz)?;
        self.record.gnss.update_rate_hz = rate_hz;
        Ok(())
    }

    pub fn set_ntp_port(&mut self, port: u16) -> Result<(), ConfigError> {
        validate_ntp_port(port)?;
        self.record.ntp.port = port;
        Ok(())
    }

    pub fn set_disaster_alert_priority(&mut self, priority: u8) -> Result<(), ConfigError> {
        validate_alert_priority(priority)?;
        self.record.gnss.disaster_alert_priority = priority;
        Ok(())
    }

    // ========================================================================
    // COMMIT
    // ========================================================================

    /// Queue a record for the next deferred commit pass. At most one may be
    /// in flight.
    pub fn request_commit(&mut self, record: ConfigRecord) -> Result<(), ConfigError> {
        if self.pending.is_some() {
            return Err(ConfigError::Busy);
        }
        record.validate()?;
        self.pending = Some(record);
        Ok(())
    }

    pub fn has_pending_commit(&self) -> bool {
        self.pending.is_some()
    }

    /// Run one queued commit, if any. Called from the low-priority band,
    /// where a tens-of-milliseconds flash stall is acceptable.
    pub fn process_pending(&mut self) -> Option<Result<(), ConfigError>> {
        let record = self.pending.take()?;
        Some(self.commit(record))
    }

    /// Atomically persist `record` and make it the in-memory state.
    pub fn commit(&mut self, record: ConfigRecord) -> Result<(), ConfigError> {
        record.validate()?;
        if self.power.brownout_flag() {
            warn!("[Config] brownout flagged, commit refused");
            return Err(ConfigError::PowerUnstable);
        }

        let body = serde_json::to_vec(&record)?;
        if body.len() > BODY_MAX as usize {
            return Err(ConfigError::TooLarge(body.len()));
        }

        let target = self.active_slot.other();
        let next_counter = self.commit_counter.wrapping_add(1);
        let header = SlotHeader {
            magic: MAGIC,
            size: body.len() as u32,
            version: CONFIG_VERSION,
            crc32: crc32(&body),
            timestamp: next_counter,
        };

        match self.write_slot(target, &header, &body) {
            Ok(()) => {
                // Only now does the new record become visible.
                self.record = record;
                self.commit_counter = next_counter;
                self.active_slot = target;
                self.health.last_commit_failed = false;
                self.health.record_valid = true;
                info!(
                    "[Config] commit {} written to slot {:?} ({} bytes)",
                    next_counter,
                    target,
                    body.len()
                );
                Ok(())
            }
            Err(e) => {
                // Old slot untouched and still authoritative.
                error!("[Config] commit failed, keeping previous record: {}", e);
                self.health.last_commit_failed = true;
                Err(ConfigError::Storage(e))
            }
        }
    }

    /// Persist the current in-memory record (after setter mutations).
    pub fn commit_current(&mut self) -> Result<(), ConfigError> {
        let record = self.record.clone();
        self.commit(record)
    }

    /// Erase both slots and persist factory defaults to slot A. The commit
    /// counter restarts at zero.
    pub fn factory_reset(&mut self) -> Result<(), ConfigError> {
        if self.power.brownout_flag() {
            return Err(ConfigError::PowerUnstable);
        }
        info!("[Config] factory reset");
        self.flash.erase(0, SECTOR_SIZE)?;
        self.record = ConfigRecord::default();
        self.commit_counter = 0;
        self.active_slot = Slot::A;
        self.pending = None;
        self.health = ConfigHealth {
            record_valid: true,
            ..ConfigHealth::default()
        };
        self.persist_defaults()
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn persist_defaults(&mut self) -> Result<(), ConfigError> {
        let body = serde_json::to_vec(&self.record)?;
        let header = SlotHeader {
            magic: MAGIC,
            size: body.len() as u32,
            version: CONFIG_VERSION,
            crc32: crc32(&body),
            timestamp: 0,
        };
        self.write_slot(Slot::A, &header, &body)?;
        self.active_slot = Slot::A;
        Ok(())
    }

    fn write_slot(
        &mut self,
        slot: Slot,
        header: &SlotHeader,
        body: &[u8],
    ) -> Result<(), StorageError> {
        // Body first, header last: a torn write never advertises a body
        // that is not fully on flash.
        self.flash
            .erase(slot.header_offset(), HEADER_LEN + BODY_MAX)?;
        self.flash.write(slot.body_offset(), body)?;
        self.flash.write(slot.header_offset(), &header.encode())?;
        Ok(())
    }

    /// Read and validate one slot. Any failure (I/O after one retry, bad
    /// magic, bad size, CRC mismatch, undecodable body) rejects the slot.
    fn read_slot(&mut self, slot: Slot) -> Option<(SlotHeader, ConfigRecord)> {
        let mut header_bytes = [0u8; HEADER_LEN as usize];
        self.read_with_retry(slot.header_offset(), &mut header_bytes)
            .ok()?;
        let header = SlotHeader::decode(&header_bytes);

        if header.magic != MAGIC {
            return None;
        }
        if header.size == 0 || header.size > BODY_MAX {
            warn!("[Config] slot {:?} header has bad size {}", slot, header.size);
            return None;
        }

        let mut body = vec![0u8; header.size as usize];
        self.read_with_retry(slot.body_offset(), &mut body).ok()?;

        if crc32(&body) != header.crc32 {
            warn!("[Config] slot {:?} CRC mismatch", slot);
            self.health.corruption_detected = true;
            return None;
        }

        match serde_json::from_slice::<ConfigRecord>(&body) {
            Ok(record) => Some((header, record)),
            Err(e) => {
                warn!("[Config] slot {:?} body undecodable: {}", slot, e);
                self.health.corruption_detected = true;
                None
            }
        }
    }

    fn read_with_retry(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        match self.flash.read(offset, buf) {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!("[Config] flash read at {} failed ({}), retrying", offset, first);
                self.flash.read(offset, buf)
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
