//! RFC 5905 packet codec. Fixed 48-byte header, all words big-endian.
//!
//! The codec is deliberately permissive: every 48-byte buffer decodes to a
//! packet and re-serializes to the identical bytes. Policy (which versions
//! and modes we answer) lives in the server, not here.

use crate::time_types::{NtpShortDuration, NtpTimestamp};
use thiserror::Error;

/// Wire size of an NTP packet without extensions.
pub const PACKET_SIZE: usize = 48;

/// Reference ID of a GPS-disciplined primary server: ASCII "GPS\0".
pub const REFERENCE_ID_GPS: u32 = u32::from_be_bytes(*b"GPS\0");

#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("datagram is {0} bytes, expected exactly 48")]
    WrongLength(usize),
}

/// The two-bit leap indicator. `Alarm` doubles as the "unsynchronized"
/// marker clients must honor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LeapIndicator {
    NoWarning,
    Leap61,
    Leap59,
    Alarm,
}

impl LeapIndicator {
    // Callers pass two-bit values only (masked by the packet parser).
    fn from_bits(bits: u8) -> LeapIndicator {
        match bits {
            0 => LeapIndicator::NoWarning,
            1 => LeapIndicator::Leap61,
            2 => LeapIndicator::Leap59,
            3 => LeapIndicator::Alarm,
            _ => unreachable!(),
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            LeapIndicator::NoWarning => 0,
            LeapIndicator::Leap61 => 1,
            LeapIndicator::Leap59 => 2,
            LeapIndicator::Alarm => 3,
        }
    }

    /// Map the two-bit GNSS leap hint straight onto the wire encoding.
    pub fn from_gnss_hint(hint: u8) -> LeapIndicator {
        LeapIndicator::from_bits(hint & 0x03)
    }
}

/// The three-bit association mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketMode {
    Reserved,
    SymmetricActive,
    SymmetricPassive,
    Client,
    Server,
    Broadcast,
    Control,
    Private,
}

impl PacketMode {
    // Callers pass three-bit values only (masked by the packet parser).
    fn from_bits(bits: u8) -> PacketMode {
        match bits {
            0 => PacketMode::Reserved,
            1 => PacketMode::SymmetricActive,
            2 => PacketMode::SymmetricPassive,
            3 => PacketMode::Client,
            4 => PacketMode::Server,
            5 => PacketMode::Broadcast,
            6 => PacketMode::Control,
            7 => PacketMode::Private,
            _ => unreachable!(),
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            PacketMode::Reserved => 0,
            PacketMode::SymmetricActive => 1,
            PacketMode::SymmetricPassive => 2,
            PacketMode::Client => 3,
            PacketMode::Server => 4,
            PacketMode::Broadcast => 5,
            PacketMode::Control => 6,
            PacketMode::Private => 7,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NtpPacket {
    pub leap: LeapIndicator,
    pub version: u8,
    pub mode: PacketMode,
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: NtpShortDuration,
    pub root_dispersion: NtpShortDuration,
    pub reference_id: u32,
    pub reference_timestamp: NtpTimestamp,
    pub origin_timestamp: NtpTimestamp,
    pub receive_timestamp: NtpTimestamp,
    pub transmit_timestamp: NtpTimestamp,
}

impl NtpPacket {
    /// Decode a datagram, rejecting anything that is not exactly 48 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<NtpPacket, PacketError> {
        let fixed: &[u8; PACKET_SIZE] = bytes
            .try_into()
            .map_err(|_| PacketError::WrongLength(bytes.len()))?;
        Ok(Self::deserialize(fixed))
    }

    pub fn deserialize(data: &[u8; PACKET_SIZE]) -> NtpPacket {
        NtpPacket {
            leap: LeapIndicator::from_bits((data[0] & 0xC0) >> 6),
            version: (data[0] & 0x38) >> 3,
            mode: PacketMode::from_bits(data[0] & 0x07),
            stratum: data[1],
            poll: data[2] as i8,
            precision: data[3] as i8,
            root_delay: NtpShortDuration::from_bits_short(data[4..8].try_into().unwrap()),
            root_dispersion: NtpShortDuration::from_bits_short(data[8..12].try_into().unwrap()),
            reference_id: u32::from_be_bytes(data[12..16].try_into().unwrap()),
            reference_timestamp: NtpTimestamp::from_bits(data[16..24].try_into().unwrap()),
            origin_timestamp: NtpTimestamp::from_bits(data[24..32].try_into().unwrap()),
            receive_timestamp: NtpTimestamp::from_bits(data[32..40].try_into().unwrap()),
            transmit_timestamp: NtpTimestamp::from_bits(data[40..48].try_into().unwrap()),
        }
    }

    pub fn serialize(&self) -> [u8; PACKET_SIZE] {
        // Version is always set from a decoded packet or our own constant,
        // never from unvalidated input.
        assert!(self.version < 8);

        let mut out = [0u8; PACKET_SIZE];
        out[0] = (self.leap.to_bits() << 6) | ((self.version & 0x07) << 3) | self.mode.to_bits();
        out[1] = self.stratum;
        out[2] = self.poll as u8;
        out[3] = self.precision as u8;
        out[4..8].copy_from_slice(&self.root_delay.to_bits_short());
        out[8..12].copy_from_slice(&self.root_dispersion.to_bits_short());
        out[12..16].copy_from_slice(&self.reference_id.to_be_bytes());
        out[16..24].copy_from_slice(&self.reference_timestamp.to_bits());
        out[24..32].copy_from_slice(&self.origin_timestamp.to_bits());
        out[32..40].copy_from_slice(&self.receive_timestamp.to_bits());
        out[40..48].copy_from_slice(&self.transmit_timestamp.to_bits());
        out
    }
}

// ============================================================================
// TESTS
// ============================================================================
