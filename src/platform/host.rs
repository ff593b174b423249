//! Host bench platform: real UDP socket, file-backed flash image, the
//! process monotonic clock as the tick counter, and a GNSS simulator that
//! derives PPS edges and time fixes from the operating system clock.

use crate::clock::WallTimeFix;
use crate::controller::InputEvent;
use crate::time_types::MonotonicInstant;
use crate::traits::{
    Datagram, FlashStorage, MonotonicSource, SendOutcome, StorageError, TransportError,
    UdpTransport,
};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Host counter resolution: one tick per microsecond.
pub const HOST_TICK_RATE_HZ: u64 = 1_000_000;

// ============================================================================
// MONOTONIC SOURCE
// ============================================================================

#[derive(Copy, Clone)]
pub struct HostMonotonic {
    origin: Instant,
}

impl HostMonotonic {
    pub fn new() -> Self {
        HostMonotonic {
            origin: Instant::now(),
        }
    }
}

impl Default for HostMonotonic {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicSource for HostMonotonic {
    fn now_mono(&self) -> MonotonicInstant {
        MonotonicInstant::from_ticks(self.origin.elapsed().as_micros() as u64)
    }

    fn tick_rate_hz(&self) -> u64 {
        HOST_TICK_RATE_HZ
    }
}

// ============================================================================
// UDP TRANSPORT
// ============================================================================

pub struct HostUdpTransport {
    socket: UdpSocket,
    buf: [u8; 2048],
}

impl HostUdpTransport {
    /// Bind a nonblocking reusable UDP socket on `bind_addr:port`.
    pub fn bind(bind_addr: Ipv4Addr, port: u16) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("creating UDP socket")?;
        socket.set_reuse_address(true)?;
        let addr = SocketAddrV4::new(bind_addr, port);
        socket
            .bind(&addr.into())
            .with_context(|| format!("binding {} (port 123 needs privileges)", addr))?;
        socket.set_nonblocking(true)?;
        let socket: UdpSocket = socket.into();
        info!("[Net] NTP socket bound on {}", addr);
        Ok(HostUdpTransport {
            socket,
            buf: [0u8; 2048],
        })
    }
}

impl UdpTransport for HostUdpTransport {
    fn recv(&mut self) -> Result<Option<Datagram>, TransportError> {
        match self.socket.recv_from(&mut self.buf) {
            Ok((size, SocketAddr::V4(src))) => Ok(Some(Datagram {
                src,
                bytes: self.buf[..size].to_vec(),
            })),
            Ok((_, SocketAddr::V6(src))) => {
                debug!("[Net] ignoring IPv6 datagram from {}", src);
                Ok(None)
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(TransportError::Socket(e)),
        }
    }

    fn send(&mut self, dst: SocketAddrV4, bytes: &[u8]) -> SendOutcome {
        match self.socket.send_to(bytes, dst) {
            Ok(_) => SendOutcome::Sent,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => SendOutcome::Busy,
            Err(e) => {
                warn!("[Net] send_to {} failed: {}", dst, e);
                SendOutcome::Error
            }
        }
    }
}

// ============================================================================
// FLASH IMAGE
// ============================================================================

/// A sector-sized file standing in for the reserved flash region. Writes
/// go through to disk immediately, mirroring flash's blocking semantics.
pub struct FileFlash {
    file: File,
    path: PathBuf,
    size: u32,
}

impl FileFlash {
    pub fn open(path: &Path, size: u32) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .with_context(|| format!("opening flash image {}", path.display()))?;

        // A fresh image starts fully erased.
        let current_len = file.metadata()?.len();
        if current_len < size as u64 {
            file.seek(SeekFrom::Start(current_len))?;
            let fill = vec![0xFFu8; (size as u64 - current_len) as usize];
            file.write_all(&fill)?;
            file.flush()?;
        }
        info!("[Flash] image {} ({} bytes)", path.display(), size);
        Ok(FileFlash {
            file,
            path: path.to_path_buf(),
            size,
        })
    }

    fn check_bounds(&self, offset: u32, len: usize) -> Result<(), StorageError> {
        if offset as usize + len > self.size as usize {
            return Err(StorageError::OutOfBounds);
        }
        Ok(())
    }
}

impl FlashStorage for FileFlash {
    fn erase(&mut self, offset: u32, len: u32) -> Result<(), StorageError> {
        self.check_bounds(offset, len as usize)?;
        let fill = vec![0xFFu8; len as usize];
        self.file
            .seek(SeekFrom::Start(offset as u64))
            .and_then(|_| self.file.write_all(&fill))
            .and_then(|_| self.file.flush())
            .map_err(|e| {
                warn!("[Flash] erase on {} failed: {}", self.path.display(), e);
                StorageError::Erase
            })
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), StorageError> {
        self.check_bounds(offset, bytes.len())?;
        self.file
            .seek(SeekFrom::Start(offset as u64))
            .and_then(|_| self.file.write_all(bytes))
            .and_then(|_| self.file.flush())
            .map_err(|e| {
                warn!("[Flash] write on {} failed: {}", self.path.display(), e);
                StorageError::Write
            })
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        self.check_bounds(offset, buf.len())?;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset as u64))
            .and_then(|_| file.read_exact(buf))
            .map_err(|e| {
                warn!("[Flash] read on {} failed: {}", self.path.display(), e);
                StorageError::Read
            })
    }
}

// ============================================================================
// GNSS SIMULATOR
// ============================================================================

/// Bench-mode GNSS: every OS-clock second boundary becomes a PPS edge, and
/// a time fix follows a few hundred microseconds later, like a receiver
/// delivering NAV-PVT after the pulse.
pub struct GnssSimulator {
    last_second: u64,
    link_reported: bool,
}

impl GnssSimulator {
    pub fn new() -> Self {
        GnssSimulator {
            last_second: 0,
            link_reported: false,
        }
    }

    /// Emit pending events; call once per loop iteration.
    pub fn pump(&mut self, mono: &HostMonotonic, events: &Sender<InputEvent>) {
        if !self.link_reported {
            self.link_reported = true;
            let _ = events.send(InputEvent::LinkStatus {
                link_up: true,
                ip_assigned: true,
            });
        }

        let Ok(wall) = SystemTime::now().duration_since(UNIX_EPOCH) else {
            return;
        };
        let second = wall.as_secs();
        if second == self.last_second {
            return;
        }
        self.last_second = second;

        // The edge instant is "now minus how far we are into the second".
        let now = mono.now_mono();
        let into_second_us = wall.subsec_micros() as u64;
        let edge = MonotonicInstant::from_ticks(now.ticks().wrapping_sub(into_second_us));
        let _ = events.send(InputEvent::PpsEdge(edge));
        let _ = events.send(InputEvent::UbxTime(WallTimeFix {
            unix_seconds: second,
            nanos: wall.subsec_nanos(),
            time_valid: true,
            date_valid: true,
            leap_hint: 0,
            stratum_source: 0,
            mono: now,
        }));
    }
}

impl Default for GnssSimulator {
    fn default() -> Self {
        Self::new()
    }
}
