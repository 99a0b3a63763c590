//! Command line flasher for Cypress PSoC bootloaders.

use std::fs::File;
use std::io::{self, BufReader, Write as _};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use clap::{ArgGroup, Parser, ValueEnum};
use log::LevelFilter;
use socketcan::{CanSocket, EmbeddedFrame, Id, Socket, StandardId};

use psoc_bootloader_protocol::{
    BootloadOptions, BootloaderHost, BusFrame, CanBus, CanTransport, DEFAULT_CHUNK_SIZE, Decider,
    Image, MetadataLayout, SerialLink, SerialTransport, Session, SessionConfig, SyncMode,
    Transport,
};

/// Bootloader tool for Cypress PSoC devices
#[derive(Parser)]
#[command(version, about, long_about = None)]
#[command(group(ArgGroup::new("link").required(true).args(["serial", "canbus"])))]
#[command(group(ArgGroup::new("pacing").args(["canbus_echo", "canbus_wait"])))]
#[command(group(ArgGroup::new("downgrade_policy").args(["downgrade", "nodowngrade"])))]
#[command(group(ArgGroup::new("newapp_policy").args(["newapp", "nonewapp"])))]
struct Args {
    /// Use a serial interface on this port
    #[arg(long, value_name = "PORT")]
    serial: Option<String>,

    /// Use a CAN bus interface of this type ("socketcan")
    #[arg(long, value_name = "BUSTYPE")]
    canbus: Option<String>,

    /// Baud rate to use when flashing using serial
    #[arg(long = "serial_baudrate", value_name = "BAUD", default_value_t = 115_200)]
    serial_baudrate: u32,

    /// Serial parity
    #[arg(long, value_enum, default_value = "none")]
    parity: ParityArg,

    /// Serial stop bits
    #[arg(long, value_enum, default_value = "1")]
    stopbits: StopBitsArg,

    /// Bit rate to use when flashing using CAN (advisory on socketcan,
    /// where the interface bit rate is configured with `ip link`)
    #[arg(long = "canbus_baudrate", value_name = "BAUD", default_value_t = 125_000)]
    canbus_baudrate: u32,

    /// CAN channel to be used
    #[arg(long = "canbus_channel", value_name = "CHANNEL", default_value = "can0")]
    canbus_channel: String,

    /// CAN frame id to be used
    #[arg(long = "canbus_id", value_name = "ID", default_value = "0", value_parser = parse_int_auto)]
    canbus_id: u32,

    /// Use echoed back CAN frames to keep the host in sync
    #[arg(long = "canbus_echo")]
    canbus_echo: bool,

    /// Wait this many milliseconds after sending a frame instead of using
    /// echo frames to keep the host in sync
    #[arg(long = "canbus_wait", value_name = "MS", default_value_t = 5)]
    canbus_wait: u64,

    /// Time to wait for a bootloader response
    #[arg(long, value_name = "SECS", default_value_t = 5.0)]
    timeout: f64,

    /// Don't prompt before flashing old firmware over newer
    #[arg(long)]
    downgrade: bool,

    /// Fail instead of prompting when device firmware is newer
    #[arg(long)]
    nodowngrade: bool,

    /// Don't prompt before flashing an image with a different application id
    #[arg(long)]
    newapp: bool,

    /// Fail instead of flashing an image with a different application id
    #[arg(long)]
    nonewapp: bool,

    /// Erase the whole flash before writing
    #[arg(long)]
    erase: bool,

    /// Chunk size to use for transfers
    #[arg(long = "chunk-size", value_name = "BYTES", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Keep probing the initial enter command for this many seconds while
    /// the target is reset externally (negative keeps probing forever)
    #[arg(
        long = "repetitive-init-sec",
        value_name = "SECS",
        default_value_t = 0,
        allow_negative_numbers = true
    )]
    repetitive_init_sec: i32,

    /// Parse the metadata at the PSoC5 row offset
    #[arg(long)]
    psoc5: bool,

    /// Optional security key, twelve hex digits (0x prefix accepted)
    #[arg(long, value_name = "KEY", value_parser = parse_key)]
    key: Option<[u8; 6]>,

    /// Enable verbose debug output
    #[arg(short, long)]
    verbose: bool,

    /// Image to read flash data from
    image: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum ParityArg {
    None,
    Even,
    Odd,
}

impl From<ParityArg> for serialport::Parity {
    fn from(parity: ParityArg) -> Self {
        match parity {
            ParityArg::None => serialport::Parity::None,
            ParityArg::Even => serialport::Parity::Even,
            ParityArg::Odd => serialport::Parity::Odd,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StopBitsArg {
    #[value(name = "1")]
    One,
    #[value(name = "2")]
    Two,
}

impl From<StopBitsArg> for serialport::StopBits {
    fn from(bits: StopBitsArg) -> Self {
        match bits {
            StopBitsArg::One => serialport::StopBits::One,
            StopBitsArg::Two => serialport::StopBits::Two,
        }
    }
}

fn parse_int_auto(input: &str) -> Result<u32, String> {
    let (digits, radix) = match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (input, 10),
    };
    u32::from_str_radix(digits, radix).map_err(|e| e.to_string())
}

fn parse_key(input: &str) -> Result<[u8; 6], String> {
    let digits = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .unwrap_or(input);
    if digits.len() != 12 {
        return Err("key must be twelve hex digits".into());
    }
    let mut key = [0u8; 6];
    for (index, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&digits[2 * index..2 * index + 2], 16)
            .map_err(|e| e.to_string())?;
    }
    Ok(key)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp(None)
        .init();

    let started = Instant::now();
    match run(&args) {
        Ok(()) => {
            println!("Total running time {:.2}s", started.elapsed().as_secs_f64());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let file = File::open(&args.image)
        .with_context(|| format!("cannot open {}", args.image.display()))?;
    let image = Image::read(BufReader::new(file))?;

    let timeout = Duration::from_secs_f64(args.timeout);

    if let Some(port_name) = &args.serial {
        let port = serialport::new(port_name.as_str(), args.serial_baudrate)
            .parity(args.parity.into())
            .stop_bits(args.stopbits.into())
            .timeout(timeout)
            .open()
            .with_context(|| format!("cannot open serial port {port_name}"))?;
        let transport = SerialTransport::new(PortLink(port))?;
        flash(transport, &image, args)
    } else if let Some(bustype) = &args.canbus {
        if bustype != "socketcan" {
            bail!("unsupported CAN bus type {bustype:?}, only \"socketcan\" is available");
        }
        if args.canbus_id > 0x7FF {
            bail!("CAN frame id 0x{:X} does not fit 11 bits", args.canbus_id);
        }
        let socket = CanSocket::open(&args.canbus_channel)
            .with_context(|| format!("cannot open CAN channel {}", args.canbus_channel))?;
        let sync = if args.canbus_echo {
            SyncMode::Echo
        } else {
            SyncMode::Dwell(Duration::from_millis(args.canbus_wait))
        };
        let transport = CanTransport::new(SocketBus(socket), args.canbus_id, timeout, sync);
        flash(transport, &image, args)
    } else {
        unreachable!("clap enforces the link group");
    }
}

fn flash<T: Transport>(transport: T, image: &Image, args: &Args) -> anyhow::Result<()> {
    let config = SessionConfig {
        chunk_size: args.chunk_size,
        repeat_init_seconds: args.repetitive_init_sec,
        key: args.key,
        ..SessionConfig::default()
    };
    let session = Session::new(transport, image.checksum_kind, config);
    let mut host = BootloaderHost::new(session, image);

    let options = BootloadOptions {
        erase: args.erase,
        metadata_layout: if args.psoc5 {
            MetadataLayout::Psoc5
        } else {
            MetadataLayout::Standard
        },
        downgrade: decider(
            args.downgrade,
            args.nodowngrade,
            "Device version {device} is greater than local version {local}. Flash anyway?",
        ),
        newapp: decider(
            args.newapp,
            args.nonewapp,
            "Device app id {device} is different from local app id {local}. Flash anyway?",
        ),
    };

    host.bootload(options)?;
    Ok(())
}

/// Turn a `--flag`/`--noflag` pair into a conflict decider, falling back
/// to an interactive prompt when neither was given.
fn decider(always: bool, never: bool, prompt: &'static str) -> Decider<'static> {
    if always {
        return Box::new(|_, _| true);
    }
    if never {
        return Box::new(|_, _| false);
    }
    Box::new(move |device, local| {
        let question = prompt
            .replace("{device}", &device.to_string())
            .replace("{local}", &local.to_string());
        loop {
            print!("{question} (Y/N) ");
            let _ = io::stdout().flush();
            let mut line = String::new();
            if io::stdin().read_line(&mut line).is_err() {
                return false;
            }
            match line.trim().chars().next() {
                Some('y') | Some('Y') => return true,
                Some('n') | Some('N') => return false,
                _ => continue,
            }
        }
    })
}

/// `serialport` handle behind the library's serial seam.
struct PortLink(Box<dyn serialport::SerialPort>);

impl io::Read for PortLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl io::Write for PortLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl SerialLink for PortLink {
    fn timeout(&self) -> Duration {
        self.0.timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.0.set_timeout(timeout).map_err(io::Error::from)
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        self.0
            .clear(serialport::ClearBuffer::All)
            .map_err(io::Error::from)
    }
}

/// socketcan socket behind the library's CAN seam.
struct SocketBus(CanSocket);

impl CanBus for SocketBus {
    fn send(&mut self, frame: &BusFrame) -> io::Result<()> {
        let id = StandardId::new(frame.id as u16).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "frame id does not fit 11 bits")
        })?;
        let frame = socketcan::CanFrame::new(id, &frame.data).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "frame payload exceeds 8 bytes")
        })?;
        self.0.write_frame(&frame)
    }

    fn recv(&mut self, timeout: Duration) -> io::Result<Option<BusFrame>> {
        match self.0.read_frame_timeout(timeout) {
            Ok(frame) => {
                // Extended ids never match the configured 11-bit frame id,
                // so the transport's own filtering discards them.
                let id = match frame.id() {
                    Id::Standard(id) => u32::from(id.as_raw()),
                    Id::Extended(id) => id.as_raw(),
                };
                Ok(Some(BusFrame {
                    id,
                    data: frame.data().to_vec(),
                }))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
