//! Wire framing for bootloader packets.
//!
//! Both directions share one shape:
//!
//! ```text
//! 0x01 | opcode/status(1) | length(2 LE) | payload(length) | checksum(2 LE) | 0x17
//! ```
//!
//! The checksum covers everything from the start byte through the last
//! payload byte. Responses carry a status byte where commands carry the
//! opcode; a nonzero status selects one of the [`Status`] variants.

use thiserror::Error;

use crate::Error;
use crate::checksum::ChecksumKind;

/// Start-of-packet marker.
pub const SOP: u8 = 0x01;
/// End-of-packet marker.
pub const EOP: u8 = 0x17;
/// Framing bytes around a payload: marker, opcode, length, checksum, marker.
pub const OVERHEAD: usize = 7;

/// Structural defects in a received packet, and the transport timeouts that
/// stand in for one. These are assumed transient and are covered by the
/// session retry budget, unlike [`Status`] responses.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    #[error("response of {len} bytes is shorter than a minimal packet")]
    Runt { len: usize },
    #[error("bad start-of-packet byte 0x{0:02X}")]
    BadSop(u8),
    #[error("bad end-of-packet byte 0x{0:02X}")]
    BadEop(u8),
    #[error("declared payload length {declared} does not match received {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("packet checksum 0x{received:04X} does not match computed 0x{computed:04X}")]
    ChecksumMismatch { received: u16, computed: u16 },
    #[error("unknown status byte 0x{0:02X}")]
    UnknownStatus(u8),
    #[error("response payload of {actual} bytes does not fit a {expected} byte record")]
    PayloadSize { expected: usize, actual: usize },
    #[error("timed out waiting for a bootloader response")]
    Timeout,
    #[error("timed out waiting for a CAN frame echo")]
    EchoTimeout,
}

/// Nonzero status codes the bootloader can answer with.
///
/// These are deterministic verdicts from the device, never retried.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    #[error("the provided security key was incorrect")]
    BadKey,
    #[error("flash verification failed")]
    VerifyFailed,
    #[error("the transferred length was incorrect")]
    IncorrectLength,
    #[error("the packet data was invalid")]
    InvalidData,
    #[error("the command was not recognized")]
    InvalidCommand,
    #[error("the device is not the one expected")]
    UnexpectedDevice,
    #[error("the bootloader version is unsupported")]
    UnsupportedBootloaderVersion,
    #[error("the packet checksum was invalid")]
    InvalidChecksum,
    #[error("the flash array id was invalid")]
    InvalidArray,
    #[error("the flash row number was invalid")]
    InvalidFlashRow,
    #[error("the flash row is protected")]
    ProtectedFlash,
    #[error("no valid application is present")]
    InvalidApp,
    #[error("the target application is currently active")]
    TargetAppActive,
    #[error("the callback was invalid")]
    CallbackInvalid,
    #[error("an unknown error occurred")]
    Unknown,
}

impl Status {
    pub fn from_code(code: u8) -> Option<Self> {
        use Status::*;
        Some(match code {
            0x01 => BadKey,
            0x02 => VerifyFailed,
            0x03 => IncorrectLength,
            0x04 => InvalidData,
            0x05 => InvalidCommand,
            0x06 => UnexpectedDevice,
            0x07 => UnsupportedBootloaderVersion,
            0x08 => InvalidChecksum,
            0x09 => InvalidArray,
            0x0A => InvalidFlashRow,
            0x0B => ProtectedFlash,
            0x0C => InvalidApp,
            0x0D => TargetAppActive,
            0x0E => CallbackInvalid,
            0x0F => Unknown,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        use Status::*;
        match self {
            BadKey => 0x01,
            VerifyFailed => 0x02,
            IncorrectLength => 0x03,
            InvalidData => 0x04,
            InvalidCommand => 0x05,
            UnexpectedDevice => 0x06,
            UnsupportedBootloaderVersion => 0x07,
            InvalidChecksum => 0x08,
            InvalidArray => 0x09,
            InvalidFlashRow => 0x0A,
            ProtectedFlash => 0x0B,
            InvalidApp => 0x0C,
            TargetAppActive => 0x0D,
            CallbackInvalid => 0x0E,
            Unknown => 0x0F,
        }
    }
}

/// Assemble a fully framed command packet.
pub fn encode(opcode: u8, payload: &[u8], checksum: ChecksumKind) -> Vec<u8> {
    let mut packet = Vec::with_capacity(payload.len() + OVERHEAD);
    packet.push(SOP);
    packet.push(opcode);
    packet.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    packet.extend_from_slice(payload);
    let sum = checksum.compute(&packet);
    packet.extend_from_slice(&sum.to_le_bytes());
    packet.push(EOP);
    packet
}

/// Validate a received response packet and return its payload slice.
///
/// Structural defects come back as [`FramingError`]; a well-formed packet
/// with a nonzero status byte becomes the matching [`Status`] error. A
/// status byte outside the table is a framing error as well, since it means
/// the link corrupted the packet in a way the checksum missed.
pub fn decode(raw: &[u8], checksum: ChecksumKind) -> Result<&[u8], Error> {
    if raw.len() < OVERHEAD {
        return Err(FramingError::Runt { len: raw.len() }.into());
    }
    if raw[0] != SOP {
        return Err(FramingError::BadSop(raw[0]).into());
    }
    let declared = usize::from(u16::from_le_bytes([raw[2], raw[3]]));
    let actual = raw.len() - OVERHEAD;
    if declared != actual {
        return Err(FramingError::LengthMismatch { declared, actual }.into());
    }
    let eop = raw[raw.len() - 1];
    if eop != EOP {
        return Err(FramingError::BadEop(eop).into());
    }
    let received = u16::from_le_bytes([raw[raw.len() - 3], raw[raw.len() - 2]]);
    let computed = checksum.compute(&raw[..declared + 4]);
    if received != computed {
        return Err(FramingError::ChecksumMismatch { received, computed }.into());
    }
    match raw[1] {
        0x00 => Ok(&raw[4..4 + declared]),
        code => match Status::from_code(code) {
            Some(status) => Err(Error::Status(status)),
            None => Err(FramingError::UnknownStatus(code).into()),
        },
    }
}
