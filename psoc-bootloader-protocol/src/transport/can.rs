//! CAN bus transport.
//!
//! The bootloader speaks the same framed byte protocol over CAN, cut into
//! classic 8-byte data frames under a single 11-bit arbitration id. The
//! host has no flow control, so consecutive frames are paced either by
//! waiting for the interface to echo each frame back or by a fixed dwell
//! between sends.

use std::io;
use std::thread;
use std::time::Duration;

use log::trace;

use super::Transport;
use crate::Error;
use crate::packet::{FramingError, SOP};

/// Payload capacity of a classic CAN data frame.
pub const FRAME_DATA_LEN: usize = 8;

/// One classic CAN data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusFrame {
    /// 11-bit arbitration id, non-extended.
    pub id: u32,
    pub data: Vec<u8>,
}

/// Contract of the underlying CAN socket.
///
/// A socketcan socket satisfies this with trivial glue; tests use an
/// in-memory fake.
pub trait CanBus {
    fn send(&mut self, frame: &BusFrame) -> io::Result<()>;
    /// Wait up to `timeout` for the next frame; `None` on expiry. A zero
    /// timeout polls without blocking.
    fn recv(&mut self, timeout: Duration) -> io::Result<Option<BusFrame>>;
}

/// How the host paces itself between frames of one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Wait for each frame to be echoed back before sending the next.
    Echo,
    /// Sleep a fixed interval between frames.
    Dwell(Duration),
}

/// Fragmentation and reassembly of packets over a [`CanBus`].
pub struct CanTransport<B> {
    bus: B,
    frame_id: u32,
    timeout: Duration,
    sync: SyncMode,
}

impl<B: CanBus> CanTransport<B> {
    pub fn new(bus: B, frame_id: u32, timeout: Duration, sync: SyncMode) -> Self {
        CanTransport {
            bus,
            frame_id,
            timeout,
            sync,
        }
    }

    /// Throw away anything already queued on the socket.
    fn drain(&mut self) -> Result<(), Error> {
        while self.bus.recv(Duration::ZERO)?.is_some() {}
        Ok(())
    }

    fn wait_for_echo(&mut self, sent: &[u8]) -> Result<(), Error> {
        loop {
            match self.bus.recv(self.timeout)? {
                // The arbitration id is ignored here; only the payload
                // identifies our own frame coming back.
                Some(frame) if frame.data == sent => return Ok(()),
                Some(_) => continue,
                None => return Err(FramingError::EchoTimeout.into()),
            }
        }
    }

    fn next_frame(&mut self) -> Result<BusFrame, Error> {
        loop {
            let Some(frame) = self.bus.recv(self.timeout)? else {
                return Err(FramingError::Timeout.into());
            };
            // With echoes on, unrelated traffic shares the socket; keep
            // only frames carrying our arbitration id.
            if matches!(self.sync, SyncMode::Echo) && frame.id != self.frame_id {
                continue;
            }
            return Ok(frame);
        }
    }
}

impl<B: CanBus> Transport for CanTransport<B> {
    fn send(&mut self, packet: &[u8]) -> Result<(), Error> {
        for chunk in packet.chunks(FRAME_DATA_LEN) {
            self.drain()?;
            let frame = BusFrame {
                id: self.frame_id,
                data: chunk.to_vec(),
            };
            trace!("can tx id=0x{:03X} {:02X?}", frame.id, frame.data);
            self.bus.send(&frame)?;
            match self.sync {
                SyncMode::Echo => self.wait_for_echo(chunk)?,
                SyncMode::Dwell(dwell) => thread::sleep(dwell),
            }
        }
        Ok(())
    }

    fn recv(&mut self) -> Result<Vec<u8>, Error> {
        let first = self.next_frame()?;
        if first.data.len() < 4 {
            return Err(FramingError::Runt {
                len: first.data.len(),
            }
            .into());
        }
        if first.data[0] != SOP {
            return Err(FramingError::BadSop(first.data[0]).into());
        }
        let length = usize::from(u16::from_le_bytes([first.data[2], first.data[3]]));
        let total = 4 + length + 3;
        let mut packet = first.data;
        while packet.len() < total {
            packet.extend_from_slice(&self.next_frame()?.data);
        }
        // The final frame may be padded past the declared length.
        packet.truncate(total);
        trace!("can rx {:02X?}", packet);
        Ok(packet)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.timeout = timeout;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct FakeBus {
        sent: Vec<BusFrame>,
        queue: VecDeque<BusFrame>,
        echo: bool,
    }

    impl FakeBus {
        fn new(echo: bool) -> Self {
            FakeBus {
                sent: Vec::new(),
                queue: VecDeque::new(),
                echo,
            }
        }
    }

    impl CanBus for FakeBus {
        fn send(&mut self, frame: &BusFrame) -> io::Result<()> {
            self.sent.push(frame.clone());
            if self.echo {
                self.queue.push_back(frame.clone());
            }
            Ok(())
        }

        fn recv(&mut self, _timeout: Duration) -> io::Result<Option<BusFrame>> {
            Ok(self.queue.pop_front())
        }
    }

    fn transport(bus: FakeBus, sync: SyncMode) -> CanTransport<FakeBus> {
        CanTransport::new(bus, 0x123, Duration::from_millis(100), sync)
    }

    #[test]
    fn packets_fragment_into_eight_byte_frames() {
        let packet: Vec<u8> = (0u8..17).collect();
        let mut t = transport(FakeBus::new(false), SyncMode::Dwell(Duration::ZERO));
        t.send(&packet).unwrap();

        let frames = &t.bus.sent;
        assert_eq!(frames.len(), packet.len().div_ceil(FRAME_DATA_LEN));
        assert!(frames.iter().all(|f| f.id == 0x123));
        assert!(frames.iter().all(|f| f.data.len() <= FRAME_DATA_LEN));
        let rejoined: Vec<u8> = frames.iter().flat_map(|f| f.data.clone()).collect();
        assert_eq!(rejoined, packet);
    }

    #[test]
    fn echo_mode_consumes_each_echo() {
        let packet: Vec<u8> = (0u8..10).collect();
        let mut t = transport(FakeBus::new(true), SyncMode::Echo);
        t.send(&packet).unwrap();
        assert_eq!(t.bus.sent.len(), 2);
        // Every echo was consumed while pacing.
        assert!(t.bus.queue.is_empty());
    }

    #[test]
    fn missing_echo_times_out() {
        let mut t = transport(FakeBus::new(false), SyncMode::Echo);
        assert!(matches!(
            t.send(&[0x01]),
            Err(Error::Framing(FramingError::EchoTimeout))
        ));
    }

    #[test]
    fn stale_frames_are_drained_before_sending() {
        let mut bus = FakeBus::new(true);
        bus.queue.push_back(BusFrame {
            id: 0x7FF,
            data: vec![0xEE; 8],
        });
        let mut t = transport(bus, SyncMode::Echo);
        t.send(&[0x01, 0x02]).unwrap();
        assert_eq!(t.bus.sent.len(), 1);
    }

    #[test]
    fn recv_reassembles_across_frames() {
        // 6-byte payload: total packet is 13 bytes over two frames, the
        // second padded to the full 8 bytes.
        let mut bus = FakeBus::new(false);
        bus.queue.push_back(BusFrame {
            id: 0x123,
            data: vec![0x01, 0x00, 0x06, 0x00, 0xAA, 0xBB, 0xCC, 0xDD],
        });
        bus.queue.push_back(BusFrame {
            id: 0x123,
            data: vec![0xEE, 0xFF, 0x12, 0x34, 0x17, 0x00, 0x00, 0x00],
        });
        let mut t = transport(bus, SyncMode::Dwell(Duration::ZERO));
        let packet = t.recv().unwrap();
        assert_eq!(packet.len(), 13);
        assert_eq!(packet[0], 0x01);
        assert_eq!(packet[12], 0x17);
    }

    #[test]
    fn recv_in_echo_mode_skips_foreign_ids() {
        let mut bus = FakeBus::new(false);
        bus.queue.push_back(BusFrame {
            id: 0x456,
            data: vec![0xDE, 0xAD, 0xBE, 0xEF],
        });
        bus.queue.push_back(BusFrame {
            id: 0x123,
            data: vec![0x01, 0x00, 0x00, 0x00, 0x99, 0x66, 0x17],
        });
        let mut t = transport(bus, SyncMode::Echo);
        let packet = t.recv().unwrap();
        assert_eq!(packet.len(), 7);
        assert_eq!(packet[0], 0x01);
    }

    #[test]
    fn recv_rejects_a_runt_first_frame() {
        let mut bus = FakeBus::new(false);
        bus.queue.push_back(BusFrame {
            id: 0x123,
            data: vec![0x01, 0x00],
        });
        let mut t = transport(bus, SyncMode::Dwell(Duration::ZERO));
        assert!(matches!(
            t.recv(),
            Err(Error::Framing(FramingError::Runt { len: 2 }))
        ));
    }

    #[test]
    fn recv_rejects_a_bad_start_byte() {
        let mut bus = FakeBus::new(false);
        bus.queue.push_back(BusFrame {
            id: 0x123,
            data: vec![0x02, 0x00, 0x00, 0x00],
        });
        let mut t = transport(bus, SyncMode::Dwell(Duration::ZERO));
        assert!(matches!(
            t.recv(),
            Err(Error::Framing(FramingError::BadSop(0x02)))
        ));
    }

    #[test]
    fn missing_response_times_out() {
        let mut t = transport(FakeBus::new(false), SyncMode::Dwell(Duration::ZERO));
        assert!(matches!(
            t.recv(),
            Err(Error::Framing(FramingError::Timeout))
        ));
    }
}
