//! Platform abstraction seams. The core is generic over these traits so the
//! same state machines run against real hardware, the host bench platform,
//! or mocks in tests.

use crate::time_types::MonotonicInstant;
use std::net::SocketAddrV4;
use thiserror::Error;

/// One received UDP datagram.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub src: SocketAddrV4,
    pub bytes: Vec<u8>,
}

/// Outcome of a non-blocking send. `Busy` means the MAC/socket could not
/// take the frame right now; NTP clients retransmit, so nothing is retried.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Busy,
    Error,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not ready: {0}")]
    NotReady(String),
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("flash read failed")]
    Read,
    #[error("flash write failed")]
    Write,
    #[error("flash erase failed")]
    Erase,
    #[error("access outside the reserved region")]
    OutOfBounds,
}

/// The free-running monotonic counter. Readable from any context; never
/// steered, never reset.
#[cfg_attr(test, mockall::automock)]
pub trait MonotonicSource {
    fn now_mono(&self) -> MonotonicInstant;

    /// Counter frequency in ticks per second. Constant for the lifetime of
    /// the source.
    fn tick_rate_hz(&self) -> u64;
}

/// Non-blocking UDP endpoint for the NTP service.
#[cfg_attr(test, mockall::automock)]
pub trait UdpTransport {
    /// Returns `Ok(None)` when no datagram is pending.
    fn recv(&mut self) -> Result<Option<Datagram>, TransportError>;

    fn send(&mut self, dst: SocketAddrV4, bytes: &[u8]) -> SendOutcome;
}

/// Byte-addressed flash region reserved for the configuration store.
/// Erase and write block for tens of milliseconds; only the config commit
/// path calls them.
#[cfg_attr(test, mockall::automock)]
pub trait FlashStorage {
    fn erase(&mut self, offset: u32, len: u32) -> Result<(), StorageError>;
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), StorageError>;
    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError>;
}

/// Supply-voltage supervisor. Consulted before every flash mutation so a
/// brownout never tears a commit.
#[cfg_attr(test, mockall::automock)]
pub trait PowerMonitor {
    fn brownout_flag(&self) -> bool;
}

/// Power monitor for platforms without brownout detection.
#[derive(Debug, Default, Copy, Clone)]
pub struct AlwaysStablePower;

impl PowerMonitor for AlwaysStablePower {
    fn brownout_flag(&self) -> bool {
        false
    }
}
