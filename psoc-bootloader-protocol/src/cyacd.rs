//! Decoder for the `.cyacd` firmware container.
//!
//! The container is line oriented ASCII hex. The first non-empty line is a
//! 6-byte header (silicon id, silicon revision, checksum type); every
//! following line is one flash row:
//!
//! ```text
//! :array_id(1) row_number(2 BE) data_length(2 BE) data(N) record_checksum(1)
//! ```
//!
//! The trailing byte is the two's complement of the byte sum of everything
//! before it, so a corrupted record is rejected at parse time with the
//! 1-based line number it came from.

use std::collections::BTreeMap;
use std::io::BufRead;

use thiserror::Error;

use crate::checksum::ChecksumKind;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image file contains no header line")]
    MissingHeader,
    #[error("line {line}: invalid hex record: {source}")]
    Hex {
        line: usize,
        #[source]
        source: hex::FromHexError,
    },
    #[error("line {line}: header must encode 6 bytes, got {len}")]
    HeaderLength { line: usize, len: usize },
    #[error("line {line}: unknown checksum type {code}")]
    UnknownChecksumKind { line: usize, code: u8 },
    #[error("line {line}: flash rows must start with ':'")]
    MissingColon { line: usize },
    #[error("line {line}: row record too short")]
    Truncated { line: usize },
    #[error("line {line}: row declares {declared} data bytes but carries {actual}")]
    DataLength {
        line: usize,
        declared: usize,
        actual: usize,
    },
    #[error("line {line}: computed record checksum 0x{computed:02X}, expected 0x{expected:02X}")]
    RecordChecksum {
        line: usize,
        computed: u8,
        expected: u8,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One programmable flash row from the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub array_id: u8,
    pub row_number: u16,
    pub data: Vec<u8>,
}

impl Row {
    /// Digest of the row payload as the bootloader reports it back from
    /// `VerifyRow`: two's complement of the byte sum, modulo 256.
    pub fn checksum(&self) -> u8 {
        self.data
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b))
            .wrapping_neg()
    }
}

/// A fully decoded firmware image.
#[derive(Debug, Clone)]
pub struct Image {
    pub silicon_id: u32,
    pub silicon_rev: u8,
    pub checksum_kind: ChecksumKind,
    /// Rows keyed by array id, then row number, in ascending order.
    pub arrays: BTreeMap<u8, BTreeMap<u16, Row>>,
}

impl Image {
    /// Decode an image from a line-oriented reader.
    ///
    /// Blank lines are skipped; later duplicates of an `(array, row)` pair
    /// replace earlier ones.
    pub fn read<R: BufRead>(reader: R) -> Result<Self, ImageError> {
        let mut header: Option<(u32, u8, ChecksumKind)> = None;
        let mut arrays: BTreeMap<u8, BTreeMap<u16, Row>> = BTreeMap::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let record = line.trim();
            let number = index + 1;
            if record.is_empty() {
                continue;
            }
            match header {
                None => header = Some(parse_header(record, number)?),
                Some(_) => {
                    let row = parse_row(record, number)?;
                    arrays
                        .entry(row.array_id)
                        .or_default()
                        .insert(row.row_number, row);
                }
            }
        }

        let (silicon_id, silicon_rev, checksum_kind) =
            header.ok_or(ImageError::MissingHeader)?;
        Ok(Image {
            silicon_id,
            silicon_rev,
            checksum_kind,
            arrays,
        })
    }

    /// The last row of the last array, which carries the application
    /// metadata block.
    pub fn last_row(&self) -> Option<&Row> {
        self.arrays.values().next_back()?.values().next_back()
    }

    pub fn total_rows(&self) -> usize {
        self.arrays.values().map(BTreeMap::len).sum()
    }
}

fn decode_hex(record: &str, line: usize) -> Result<Vec<u8>, ImageError> {
    hex::decode(record).map_err(|source| ImageError::Hex { line, source })
}

fn parse_header(record: &str, line: usize) -> Result<(u32, u8, ChecksumKind), ImageError> {
    let bytes = decode_hex(record, line)?;
    if bytes.len() != 6 {
        return Err(ImageError::HeaderLength {
            line,
            len: bytes.len(),
        });
    }
    let silicon_id = u32::from_be_bytes(bytes[..4].try_into().unwrap());
    let silicon_rev = bytes[4];
    let checksum_kind = ChecksumKind::from_code(bytes[5]).ok_or(
        ImageError::UnknownChecksumKind {
            line,
            code: bytes[5],
        },
    )?;
    Ok((silicon_id, silicon_rev, checksum_kind))
}

fn parse_row(record: &str, line: usize) -> Result<Row, ImageError> {
    let Some(body) = record.strip_prefix(':') else {
        return Err(ImageError::MissingColon { line });
    };
    let bytes = decode_hex(body, line)?;
    if bytes.len() < 6 {
        return Err(ImageError::Truncated { line });
    }

    let array_id = bytes[0];
    let row_number = u16::from_be_bytes([bytes[1], bytes[2]]);
    let declared = usize::from(u16::from_be_bytes([bytes[3], bytes[4]]));
    let actual = bytes.len() - 6;
    if declared != actual {
        return Err(ImageError::DataLength {
            line,
            declared,
            actual,
        });
    }

    let expected = bytes[bytes.len() - 1];
    let computed = bytes[..bytes.len() - 1]
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
        .wrapping_neg();
    if computed != expected {
        return Err(ImageError::RecordChecksum {
            line,
            computed,
            expected,
        });
    }

    Ok(Row {
        array_id,
        row_number,
        data: bytes[5..bytes.len() - 1].to_vec(),
    })
}
