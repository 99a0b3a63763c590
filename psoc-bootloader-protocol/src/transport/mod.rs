//! Link-level transports carrying framed packets to and from the device.

mod can;
mod serial;

pub use can::{BusFrame, CanBus, CanTransport, FRAME_DATA_LEN, SyncMode};
pub use serial::{SerialLink, SerialTransport};

use std::time::Duration;

use crate::Error;

/// A packet link to the bootloader.
///
/// `send` writes one fully framed command; `recv` blocks for one complete
/// response packet and returns it unparsed. The read timeout is adjustable
/// at runtime because the session shortens it to 100 ms while probing for
/// the bootloader's reset window.
pub trait Transport {
    fn send(&mut self, packet: &[u8]) -> Result<(), Error>;
    fn recv(&mut self) -> Result<Vec<u8>, Error>;
    fn timeout(&self) -> Duration;
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error>;
}
