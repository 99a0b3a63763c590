//! The application metadata block.
//!
//! The same 56-byte record is reported by `GetMetadata` and embedded inside
//! the image's last flash row; only the offset within the row differs
//! between device families.

use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::packet::FramingError;

/// Response to `GetMetadata`, and the layout of the metadata window inside
/// the last flash row.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ApplicationMetadata {
    pub checksum: u8,
    pub bootloadable_addr: U32,
    pub bootloader_last_row: U32,
    pub bootloadable_len: U32,
    reserved_a: [u8; 7],
    pub active: u8,
    pub verified: u8,
    pub app_version: U16,
    pub app_id: U16,
    pub custom_id: U16,
    reserved_b: [u8; 28],
}

impl ApplicationMetadata {
    pub fn parse(payload: &[u8]) -> Result<Self, FramingError> {
        super::read_record(payload)
    }

    /// Application version split into its major/minor bytes.
    pub fn version_parts(&self) -> (u8, u8) {
        let version = self.app_version.get();
        ((version >> 8) as u8, (version & 0xFF) as u8)
    }
}

/// Where the metadata window sits inside the last flash row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetadataLayout {
    /// PSoC 3 / PSoC 4 family layout.
    #[default]
    Standard,
    /// PSoC 5 keeps the same record 192 bytes into the row.
    Psoc5,
}

impl MetadataLayout {
    pub fn row_offset(self) -> usize {
        match self {
            MetadataLayout::Standard => 64,
            MetadataLayout::Psoc5 => 192,
        }
    }

    /// The metadata window of a row payload, when the row is long enough to
    /// contain one.
    pub fn slice(self, row: &[u8]) -> Option<&[u8]> {
        let start = self.row_offset();
        row.get(start..start + size_of::<ApplicationMetadata>())
    }
}
