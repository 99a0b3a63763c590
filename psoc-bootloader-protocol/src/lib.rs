//! Host-side programming of Cypress PSoC microcontrollers through their
//! resident bootloader.
//!
//! The crate decodes `.cyacd` firmware images ([`cyacd`]), speaks the
//! framed bootloader command protocol ([`packet`], [`commands`]) over a
//! serial or CAN link ([`transport`]), and drives the whole programming
//! flow ([`session`], [`host`]). Physical device handles stay outside: the
//! embedding binary implements [`SerialLink`] or [`CanBus`] over whatever
//! it opened and hands it in.

pub mod checksum;
pub mod commands;
pub mod cyacd;
pub mod host;
pub mod packet;
pub mod session;
pub mod transport;

pub use checksum::{ChecksumKind, crc16, sum_twos_complement};
pub use commands::{ApplicationMetadata, BootloaderInfo, Command, FlashSpan, MetadataLayout};
pub use cyacd::{Image, ImageError, Row};
pub use host::{BootloadOptions, BootloaderHost, Decider};
pub use packet::{FramingError, Status};
pub use session::{DEFAULT_CHUNK_SIZE, Session, SessionConfig};
pub use transport::{
    BusFrame, CanBus, CanTransport, SerialLink, SerialTransport, SyncMode, Transport,
};

use thiserror::Error as ThisError;

/// Everything that can go wrong between an image file and a rebooted
/// device.
///
/// [`Error::Framing`] is the transient class the session retries;
/// [`Error::Status`] is a deterministic device verdict and never retried.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("firmware image: {0}")]
    Image(#[from] ImageError),

    #[error("bootloader error: {0}")]
    Status(Status),

    #[error("invalid packet: {0}")]
    Framing(#[from] FramingError),

    #[error("giving up after {tries} invalid packets; check parity, cabling and termination")]
    LinkUnreliable { tries: u32 },

    #[error("a {len} byte row does not divide into {chunk} byte chunks")]
    IndivisibleRow { len: usize, chunk: usize },

    #[error("silicon id of device (0x{device:08X}) does not match the image (0x{image:08X})")]
    SiliconIdMismatch { device: u32, image: u32 },

    #[error("silicon revision of device (0x{device:02X}) does not match the image (0x{image:02X})")]
    SiliconRevMismatch { device: u8, image: u8 },

    #[error("row {row} in array {array} is outside the device range {first}..={last}")]
    RowOutOfRange {
        array: u8,
        row: u16,
        first: u16,
        last: u16,
    },

    #[error("device application version {device} is newer than the image's {image}")]
    DowngradeRejected { device: u16, image: u16 },

    #[error("device application id {device} differs from the image's {image}")]
    NewAppRejected { device: u16, image: u16 },

    #[error(
        "array {array} row {row}: device digest 0x{actual:02X} does not match the image's 0x{expected:02X}"
    )]
    RowChecksumMismatch {
        array: u8,
        row: u16,
        expected: u8,
        actual: u8,
    },

    #[error("flash checksum does not verify")]
    ChecksumVerifyFailed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
