//! The fixed catalogue of bootloader commands and their response records.
//!
//! Each [`Command`] variant carries the request payload for one opcode; the
//! fixed-layout responses are plain `zerocopy` records read straight off
//! the decoded payload. The dual-application opcodes (0x33 get app status,
//! 0x36 set active app) are not part of the catalogue.

mod metadata;

pub use metadata::{ApplicationMetadata, MetadataLayout};

use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::checksum::ChecksumKind;
use crate::packet::{self, FramingError};

/// A bootloader request, keyed by opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    /// 0x31: ask the device to validate the whole application checksum.
    VerifyChecksum,
    /// 0x32: query the programmable row range of a flash array.
    GetFlashSize { array_id: u8 },
    /// 0x34: erase a single flash row.
    EraseRow { array_id: u8, row_id: u16 },
    /// 0x35: resynchronize a bootloader left mid-transfer.
    SyncBootloader,
    /// 0x37: stage a chunk of row data ahead of `ProgramRow`.
    SendData { data: &'a [u8] },
    /// 0x38: open a bootloader session, optionally presenting a security key.
    EnterBootloader { key: Option<&'a [u8; 6]> },
    /// 0x39: commit the final chunk of a row to flash.
    ProgramRow {
        array_id: u8,
        row_id: u16,
        data: &'a [u8],
    },
    /// 0x3A: read back the digest of a programmed row.
    VerifyRow { array_id: u8, row_id: u16 },
    /// 0x3B: leave the bootloader and reset into the application.
    ExitBootloader,
    /// 0x3C: read the application metadata block.
    GetMetadata { application_id: u8 },
}

impl Command<'_> {
    pub fn opcode(&self) -> u8 {
        match self {
            Command::VerifyChecksum => 0x31,
            Command::GetFlashSize { .. } => 0x32,
            Command::EraseRow { .. } => 0x34,
            Command::SyncBootloader => 0x35,
            Command::SendData { .. } => 0x37,
            Command::EnterBootloader { .. } => 0x38,
            Command::ProgramRow { .. } => 0x39,
            Command::VerifyRow { .. } => 0x3A,
            Command::ExitBootloader => 0x3B,
            Command::GetMetadata { .. } => 0x3C,
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        match self {
            Command::VerifyChecksum
            | Command::SyncBootloader
            | Command::ExitBootloader => Vec::new(),
            Command::GetFlashSize { array_id } => vec![*array_id],
            Command::EraseRow { array_id, row_id }
            | Command::VerifyRow { array_id, row_id } => {
                let mut payload = vec![*array_id];
                payload.extend_from_slice(&row_id.to_le_bytes());
                payload
            }
            Command::SendData { data } => data.to_vec(),
            Command::EnterBootloader { key } => {
                key.map(|k| k.to_vec()).unwrap_or_default()
            }
            Command::ProgramRow {
                array_id,
                row_id,
                data,
            } => {
                let mut payload = Vec::with_capacity(3 + data.len());
                payload.push(*array_id);
                payload.extend_from_slice(&row_id.to_le_bytes());
                payload.extend_from_slice(data);
                payload
            }
            Command::GetMetadata { application_id } => vec![*application_id],
        }
    }

    /// The fully framed wire packet for this command.
    pub fn encode(&self, checksum: ChecksumKind) -> Vec<u8> {
        packet::encode(self.opcode(), &self.payload(), checksum)
    }
}

/// Response to `EnterBootloader`.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct BootloaderInfo {
    pub silicon_id: U32,
    pub silicon_rev: u8,
    pub bl_version: U16,
    pub bl_version_2: u8,
}

impl BootloaderInfo {
    /// The two version fields folded into one number, low word first.
    pub fn version(&self) -> u32 {
        u32::from(self.bl_version.get()) | u32::from(self.bl_version_2) << 16
    }
}

/// Response to `GetFlashSize`: the programmable row range of one array.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FlashSpan {
    pub first_row: U16,
    pub last_row: U16,
}

/// Read a fixed-layout response record out of a decoded payload.
pub(crate) fn read_record<T: FromBytes>(payload: &[u8]) -> Result<T, FramingError> {
    T::read_from_bytes(payload).map_err(|_| FramingError::PayloadSize {
        expected: size_of::<T>(),
        actual: payload.len(),
    })
}

/// Read a single-byte response payload.
pub(crate) fn read_byte(payload: &[u8]) -> Result<u8, FramingError> {
    match payload {
        [byte] => Ok(*byte),
        _ => Err(FramingError::PayloadSize {
            expected: 1,
            actual: payload.len(),
        }),
    }
}
