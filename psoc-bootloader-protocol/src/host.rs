//! The programming driver: the flow from entering the bootloader to
//! rebooting into the freshly flashed application.
//!
//! ```text
//! enter → verify row ranges → check metadata → (erase) → write rows
//!       → verify checksum → exit
//! ```
//!
//! Any failure aborts in place without issuing `ExitBootloader`, so the
//! device stays in its bootloader and a later run can try again.

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::Error;
use crate::commands::{ApplicationMetadata, MetadataLayout};
use crate::cyacd::{Image, Row};
use crate::packet::Status;
use crate::session::Session;
use crate::transport::Transport;

/// Resolves an upload conflict. Called with the device's value and the
/// image's value; returns whether to keep going.
pub type Decider<'a> = Box<dyn FnMut(u16, u16) -> bool + 'a>;

/// Attempts at programming a row whose read-back digest keeps disagreeing.
const WRITE_ATTEMPTS: u32 = 3;
/// Settle time after a full-flash erase pass.
const ERASE_SETTLE: Duration = Duration::from_millis(500);

/// Per-run policy for the programming flow.
pub struct BootloadOptions<'a> {
    /// Erase every row the device reports before writing.
    pub erase: bool,
    /// Where the metadata block sits in the image's last row.
    pub metadata_layout: MetadataLayout,
    /// Consulted when the device already runs a newer application version.
    pub downgrade: Decider<'a>,
    /// Consulted when the device application id differs from the image's.
    pub newapp: Decider<'a>,
}

impl Default for BootloadOptions<'_> {
    fn default() -> Self {
        BootloadOptions {
            erase: false,
            metadata_layout: MetadataLayout::Standard,
            downgrade: Box::new(|_, _| true),
            newapp: Box::new(|_, _| true),
        }
    }
}

/// Drives one device through the whole programming state machine.
pub struct BootloaderHost<'a, T> {
    session: Session<T>,
    image: &'a Image,
    row_ranges: BTreeMap<u8, (u16, u16)>,
}

impl<'a, T: Transport> BootloaderHost<'a, T> {
    pub fn new(session: Session<T>, image: &'a Image) -> Self {
        BootloaderHost {
            session,
            image,
            row_ranges: BTreeMap::new(),
        }
    }

    /// Tear the host down and recover its session.
    pub fn into_session(self) -> Session<T> {
        self.session
    }

    /// Run the full flow. `ExitBootloader` is only ever sent after the
    /// device has verified the complete image.
    pub fn bootload(&mut self, mut options: BootloadOptions<'_>) -> Result<(), Error> {
        info!("entering bootload");
        self.enter()?;
        info!("verifying row ranges");
        self.verify_row_ranges()?;
        info!("checking metadata");
        self.check_metadata(&mut options)?;
        if options.erase {
            info!("erasing flash");
            self.erase_all()?;
        }
        info!("starting flash operation");
        self.write_rows()?;
        if !self.session.verify_checksum()? {
            return Err(Error::ChecksumVerifyFailed);
        }
        info!("device checksum verifies OK");
        info!("rebooting device");
        self.session.exit_bootloader()
    }

    fn enter(&mut self) -> Result<(), Error> {
        let device = self.session.enter_bootloader()?;
        let silicon_id = device.silicon_id.get();
        info!(
            "silicon id 0x{silicon_id:08X}, revision {}, bootloader version 0x{:06X}",
            device.silicon_rev,
            device.version()
        );
        if silicon_id != self.image.silicon_id {
            return Err(Error::SiliconIdMismatch {
                device: silicon_id,
                image: self.image.silicon_id,
            });
        }
        if device.silicon_rev != self.image.silicon_rev {
            return Err(Error::SiliconRevMismatch {
                device: device.silicon_rev,
                image: self.image.silicon_rev,
            });
        }
        Ok(())
    }

    fn verify_row_ranges(&mut self) -> Result<(), Error> {
        let image = self.image;
        for (&array_id, rows) in &image.arrays {
            let (first, last) = self.session.get_flash_size(array_id)?;
            info!("array {array_id}: first row {first}, last row {last}");
            self.row_ranges.insert(array_id, (first, last));
            for &row in rows.keys() {
                if row < first || row > last {
                    return Err(Error::RowOutOfRange {
                        array: array_id,
                        row,
                        first,
                        last,
                    });
                }
            }
        }
        Ok(())
    }

    /// Compare the device's application metadata against the image's.
    ///
    /// A device without readable metadata is normal: factory-fresh parts
    /// answer `InvalidApp`, older bootloaders answer `InvalidCommand`.
    /// Either way there is nothing to compare, so the flow continues.
    fn check_metadata(&mut self, options: &mut BootloadOptions<'_>) -> Result<(), Error> {
        let device = match self.session.get_metadata(0) {
            Ok(metadata) => metadata,
            Err(Error::Status(Status::InvalidApp)) => {
                info!("no valid application on device");
                return Ok(());
            }
            Err(Error::Status(Status::InvalidCommand)) => {
                info!("device does not support reading metadata");
                return Ok(());
            }
            Err(e) => {
                warn!("cannot read metadata from device: {e}");
                return Ok(());
            }
        };
        info!(
            "device application id {}, version {}",
            device.app_id.get(),
            device.app_version.get()
        );

        let Some(local) = self.local_metadata(options.metadata_layout) else {
            warn!("image carries no readable metadata block, skipping version checks");
            return Ok(());
        };

        let device_version = device.app_version.get();
        let image_version = local.app_version.get();
        if device_version > image_version {
            let (d_major, d_minor) = device.version_parts();
            let (i_major, i_minor) = local.version_parts();
            warn!(
                "device application v{d_major}.{d_minor} is newer than the image's v{i_major}.{i_minor}"
            );
            if !(options.downgrade)(device_version, image_version) {
                return Err(Error::DowngradeRejected {
                    device: device_version,
                    image: image_version,
                });
            }
        }

        let device_id = device.app_id.get();
        let image_id = local.app_id.get();
        if device_id != image_id {
            warn!("device application id {device_id} differs from the image's {image_id}");
            if !(options.newapp)(device_id, image_id) {
                return Err(Error::NewAppRejected {
                    device: device_id,
                    image: image_id,
                });
            }
        }
        Ok(())
    }

    fn local_metadata(&self, layout: MetadataLayout) -> Option<ApplicationMetadata> {
        let row = self.image.last_row()?;
        let window = layout.slice(&row.data)?;
        ApplicationMetadata::parse(window).ok()
    }

    /// Wipe every row of every array the device reports, probing array ids
    /// upward until the device runs out of arrays.
    fn erase_all(&mut self) -> Result<(), Error> {
        for array_id in 0..=u8::MAX {
            let (first, last) = match self.session.get_flash_size(array_id) {
                Ok(span) => span,
                Err(Error::Status(Status::InvalidArray | Status::InvalidData)) => break,
                Err(e) => return Err(e),
            };
            debug!("erasing array {array_id}, rows {first}..={last}");
            for row in first..=last {
                self.session.erase_row(array_id, row)?;
            }
        }
        // Give the device a moment before the first program command.
        thread::sleep(ERASE_SETTLE);
        Ok(())
    }

    fn write_rows(&mut self) -> Result<(), Error> {
        let image = self.image;
        let total = image.total_rows();
        let mut uploaded = 0usize;
        for (&array_id, rows) in &image.arrays {
            for row in rows.values() {
                self.write_row(array_id, row)?;
                uploaded += 1;
                debug!(
                    "uploaded row {uploaded}/{total} ({} bytes)",
                    row.data.len()
                );
            }
        }
        info!(
            "uploaded {uploaded} rows, {} link errors absorbed",
            self.session.errors()
        );
        Ok(())
    }

    /// Program one row and read its digest back, reprogramming from
    /// scratch when the device disagrees with the image.
    fn write_row(&mut self, array_id: u8, row: &Row) -> Result<(), Error> {
        let expected = row.checksum();
        let mut attempt = 1;
        loop {
            self.session
                .program_row(array_id, row.row_number, &row.data)?;
            let actual = self.session.row_checksum(array_id, row.row_number)?;
            if actual == expected {
                return Ok(());
            }
            warn!(
                "array {array_id} row {}: device digest 0x{actual:02X}, expected 0x{expected:02X} (attempt {attempt}/{WRITE_ATTEMPTS})",
                row.row_number
            );
            if attempt == WRITE_ATTEMPTS {
                return Err(Error::RowChecksumMismatch {
                    array: array_id,
                    row: row.row_number,
                    expected,
                    actual,
                });
            }
            attempt += 1;
        }
    }
}
