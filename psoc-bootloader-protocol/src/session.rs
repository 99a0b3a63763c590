//! The bootloader session: framed command dispatch with a retry budget,
//! plus the typed operations the programming driver is written against.

use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::Error;
use crate::checksum::ChecksumKind;
use crate::commands::{self, ApplicationMetadata, BootloaderInfo, Command, FlashSpan};
use crate::packet;
use crate::transport::Transport;

/// Default payload size per transfer chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 25;

/// Timeout used while probing for the bootloader's reset window.
const INIT_PROBE_TIMEOUT: Duration = Duration::from_millis(100);
/// Pause between the sync command and the authoritative enter.
const SYNC_SETTLE: Duration = Duration::from_millis(100);

/// Tunables for one programming session.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Largest payload sent in one `SendData`/`ProgramRow` packet. Rows
    /// must divide evenly into chunks of this size.
    pub chunk_size: usize,
    /// Transmissions attempted per command before the link is declared
    /// unreliable.
    pub retry_budget: u32,
    /// Seconds to keep probing `EnterBootloader` while the target is held
    /// in reset; 0 skips the probe phase, negative probes forever.
    pub repeat_init_seconds: i32,
    /// Six-byte security key presented on entry, when the bootloader was
    /// built to demand one.
    pub key: Option<[u8; 6]>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry_budget: 5,
            repeat_init_seconds: 0,
            key: None,
        }
    }
}

/// A live link to one bootloader.
pub struct Session<T> {
    transport: T,
    checksum: ChecksumKind,
    config: SessionConfig,
    errors: u32,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, checksum: ChecksumKind, config: SessionConfig) -> Self {
        Session {
            transport,
            checksum,
            config,
            errors: 0,
        }
    }

    /// Link errors absorbed by retries so far.
    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Give the transport back to the caller that supplied it.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Transmit one command and decode its response.
    ///
    /// Framing trouble (corrupt packets, timeouts) is assumed transient:
    /// the same packet is retransmitted up to the retry budget before a
    /// terminal link-unreliable error surfaces. A nonzero device status is
    /// a deterministic answer and is returned on the first transmission.
    pub fn send(&mut self, command: &Command<'_>, expect_response: bool) -> Result<Vec<u8>, Error> {
        let packet = command.encode(self.checksum);
        let budget = self.config.retry_budget.max(1);
        let mut remaining = budget;
        loop {
            match self.transact(&packet, expect_response) {
                Err(Error::Framing(e)) => {
                    remaining -= 1;
                    self.errors += 1;
                    warn!(
                        "command 0x{:02X}: {e} ({remaining} attempts left)",
                        command.opcode()
                    );
                    if remaining == 0 {
                        return Err(Error::LinkUnreliable { tries: budget });
                    }
                }
                other => return other,
            }
        }
    }

    /// One transmission, no retries.
    fn transact(&mut self, packet: &[u8], expect_response: bool) -> Result<Vec<u8>, Error> {
        self.transport.send(packet)?;
        if !expect_response {
            return Ok(Vec::new());
        }
        let raw = self.transport.recv()?;
        Ok(packet::decode(&raw, self.checksum)?.to_vec())
    }

    /// Open the bootloader session and identify the silicon behind it.
    ///
    /// With a repeat window configured, the first phase probes single-shot
    /// enters under a 100 ms timeout so a target still being held in reset
    /// is caught the moment its bootloader starts listening. A
    /// fire-and-forget sync and a final authoritative enter always follow;
    /// the sync clears any half-finished transfer a previous run left
    /// behind.
    pub fn enter_bootloader(&mut self) -> Result<BootloaderInfo, Error> {
        let key = self.config.key;
        let enter = Command::EnterBootloader {
            key: key.as_ref(),
        };
        let saved_timeout = self.transport.timeout();

        if self.config.repeat_init_seconds != 0 {
            self.transport.set_timeout(INIT_PROBE_TIMEOUT)?;
            let probe = enter.encode(self.checksum);
            // Counting down from a negative value never reaches zero,
            // which is exactly the unbounded case.
            let mut probes = i64::from(self.config.repeat_init_seconds) * 10;
            while probes != 0 {
                match self.transact(&probe, true) {
                    Ok(_) => break,
                    Err(e) => debug!("enter probe: {e}"),
                }
                probes -= 1;
            }
        }

        self.send(&Command::SyncBootloader, false)?;
        thread::sleep(SYNC_SETTLE);
        let result = self.send(&enter, true);
        self.transport.set_timeout(saved_timeout)?;
        let payload = result?;

        self.errors = 0;
        Ok(commands::read_record::<BootloaderInfo>(&payload)?)
    }

    /// Reboot into the application. The device resets without answering.
    pub fn exit_bootloader(&mut self) -> Result<(), Error> {
        self.send(&Command::ExitBootloader, false).map(drop)
    }

    /// Programmable row range of a flash array.
    pub fn get_flash_size(&mut self, array_id: u8) -> Result<(u16, u16), Error> {
        let payload = self.send(&Command::GetFlashSize { array_id }, true)?;
        let span = commands::read_record::<FlashSpan>(&payload)?;
        Ok((span.first_row.get(), span.last_row.get()))
    }

    /// Whether the device considers the programmed application checksum
    /// valid.
    pub fn verify_checksum(&mut self) -> Result<bool, Error> {
        let payload = self.send(&Command::VerifyChecksum, true)?;
        Ok(commands::read_byte(&payload)? != 0)
    }

    /// The application metadata block for `application_id`.
    pub fn get_metadata(&mut self, application_id: u8) -> Result<ApplicationMetadata, Error> {
        let payload = self.send(&Command::GetMetadata { application_id }, true)?;
        Ok(ApplicationMetadata::parse(&payload)?)
    }

    pub fn erase_row(&mut self, array_id: u8, row_id: u16) -> Result<(), Error> {
        self.send(&Command::EraseRow { array_id, row_id }, true)
            .map(drop)
    }

    /// Device-computed digest of a programmed row.
    pub fn row_checksum(&mut self, array_id: u8, row_id: u16) -> Result<u8, Error> {
        let payload = self.send(&Command::VerifyRow { array_id, row_id }, true)?;
        Ok(commands::read_byte(&payload)?)
    }

    /// Upload one row, staging all but the last chunk with `SendData` and
    /// committing the remainder with `ProgramRow`.
    pub fn program_row(&mut self, array_id: u8, row_id: u16, data: &[u8]) -> Result<(), Error> {
        let chunk = self.config.chunk_size;
        if data.is_empty() {
            return self
                .send(&Command::ProgramRow { array_id, row_id, data }, true)
                .map(drop);
        }
        if chunk == 0 || data.len() % chunk != 0 {
            return Err(Error::IndivisibleRow {
                len: data.len(),
                chunk,
            });
        }
        let count = data.len() / chunk;
        for (index, piece) in data.chunks(chunk).enumerate() {
            if index + 1 == count {
                self.send(
                    &Command::ProgramRow {
                        array_id,
                        row_id,
                        data: piece,
                    },
                    true,
                )?;
            } else {
                self.send(&Command::SendData { data: piece }, true)?;
            }
        }
        Ok(())
    }
}
