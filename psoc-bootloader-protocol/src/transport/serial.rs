//! Serial UART transport.

use std::io::{self, Read, Write};
use std::time::Duration;

use log::trace;

use super::Transport;
use crate::Error;
use crate::packet::FramingError;

/// Contract of the underlying serial handle.
///
/// A `serialport::SerialPort` satisfies this with trivial glue; tests use
/// an in-memory fake.
pub trait SerialLink: Read + Write {
    fn timeout(&self) -> Duration;
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;
    /// Discard anything queued in the OS buffers, both directions.
    fn clear_buffers(&mut self) -> io::Result<()>;
}

/// Length-prefixed packet reads over a byte stream.
pub struct SerialTransport<L> {
    link: L,
}

impl<L: SerialLink> SerialTransport<L> {
    /// Wrap a link, clearing any garbage out of its buffers first.
    pub fn new(mut link: L) -> Result<Self, Error> {
        link.clear_buffers()?;
        Ok(SerialTransport { link })
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.link.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::UnexpectedEof => FramingError::Timeout.into(),
            _ => Error::Io(e),
        })
    }
}

impl<L: SerialLink> Transport for SerialTransport<L> {
    fn send(&mut self, packet: &[u8]) -> Result<(), Error> {
        trace!("serial tx {:02X?}", packet);
        self.link.write_all(packet)?;
        self.link.flush()?;
        Ok(())
    }

    fn recv(&mut self) -> Result<Vec<u8>, Error> {
        // Start byte, status, and the two length bytes tell us how much
        // more is coming: payload plus checksum and end marker.
        let mut header = [0u8; 4];
        self.read_exact(&mut header)?;
        let length = usize::from(u16::from_le_bytes([header[2], header[3]]));
        let mut packet = vec![0u8; 4 + length + 3];
        packet[..4].copy_from_slice(&header);
        self.read_exact(&mut packet[4..])?;
        trace!("serial rx {:02X?}", packet);
        Ok(packet)
    }

    fn timeout(&self) -> Duration {
        self.link.timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.link.set_timeout(timeout)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct FakeLink {
        rx: Cursor<Vec<u8>>,
        tx: Vec<u8>,
        timeout: Duration,
        cleared: bool,
    }

    impl FakeLink {
        fn with_rx(rx: Vec<u8>) -> Self {
            FakeLink {
                rx: Cursor::new(rx),
                tx: Vec::new(),
                timeout: Duration::from_secs(5),
                cleared: false,
            }
        }
    }

    impl Read for FakeLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.rx.read(buf)
        }
    }

    impl Write for FakeLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SerialLink for FakeLink {
        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
            self.timeout = timeout;
            Ok(())
        }

        fn clear_buffers(&mut self) -> io::Result<()> {
            self.cleared = true;
            Ok(())
        }
    }

    #[test]
    fn buffers_are_cleared_on_construction() {
        let transport = SerialTransport::new(FakeLink::with_rx(Vec::new())).unwrap();
        assert!(transport.link.cleared);
    }

    #[test]
    fn recv_reads_header_then_remainder() {
        // Two payload bytes declared; the transport does not validate the rest.
        let raw = vec![0x01, 0x00, 0x02, 0x00, 0xAA, 0xBB, 0x11, 0x22, 0x17];
        let mut transport = SerialTransport::new(FakeLink::with_rx(raw.clone())).unwrap();
        assert_eq!(transport.recv().unwrap(), raw);
    }

    #[test]
    fn short_header_is_a_timeout() {
        let mut transport =
            SerialTransport::new(FakeLink::with_rx(vec![0x01, 0x00])).unwrap();
        assert!(matches!(
            transport.recv(),
            Err(Error::Framing(FramingError::Timeout))
        ));
    }

    #[test]
    fn short_body_is_a_timeout() {
        // Declares 4 payload bytes but the stream dries up after one.
        let mut transport = SerialTransport::new(FakeLink::with_rx(vec![
            0x01, 0x00, 0x04, 0x00, 0xAA,
        ]))
        .unwrap();
        assert!(matches!(
            transport.recv(),
            Err(Error::Framing(FramingError::Timeout))
        ));
    }

    #[test]
    fn send_writes_the_whole_packet() {
        let mut transport = SerialTransport::new(FakeLink::with_rx(Vec::new())).unwrap();
        transport.send(&[0x01, 0x38, 0x00, 0x00, 0xC7, 0xFF, 0x17]).unwrap();
        assert_eq!(
            transport.link.tx,
            [0x01, 0x38, 0x00, 0x00, 0xC7, 0xFF, 0x17]
        );
    }
}
