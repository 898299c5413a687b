use clap::{Parser, Subcommand, ValueEnum};
use serial_transport::config::{Config, ConfigLoader};
use serial_transport::logging::init_logging;
use serial_transport::{
    EventMask, EventWaiter, PortRegistry, ReadMode, SerialConfiguration, TimeoutDescriptor,
    WriteMode,
};
use std::time::{Duration, Instant};
use tracing::warn;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    name = "serialctl",
    version,
    about = "List, read, write and watch serial ports."
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached serial ports
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Read from a port and print what arrives
    Read {
        /// Device path or configured alias
        path: String,
        /// Maximum number of bytes to read
        #[arg(short, long, default_value_t = 256)]
        bytes: usize,
        /// Read timeout mode (defaults to the configured mode)
        #[arg(short, long, value_enum)]
        mode: Option<ModeArg>,
        /// Read timeout in milliseconds (0 waits indefinitely)
        #[arg(short, long)]
        timeout: Option<u32>,
        /// Baud rate (defaults to the configured rate)
        #[arg(long)]
        baud: Option<u32>,
        /// Print the bytes as hex
        #[arg(long)]
        hex: bool,
    },
    /// Write data to a port and wait for it to be sent
    Write {
        /// Device path or configured alias
        path: String,
        /// Data to send
        data: String,
        /// Interpret data as hex, e.g. "de ad be ef"
        #[arg(long)]
        hex: bool,
        /// Baud rate (defaults to the configured rate)
        #[arg(long)]
        baud: Option<u32>,
    },
    /// Print events as they happen
    Watch {
        /// Device path or configured alias
        path: String,
        /// Stop after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,
        /// Baud rate (defaults to the configured rate)
        #[arg(long)]
        baud: Option<u32>,
    },
    /// Show modem line levels
    Lines {
        /// Device path or configured alias
        path: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Nonblocking,
    SemiBlocking,
    Blocking,
    Scanner,
}

impl From<ModeArg> for ReadMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Nonblocking => ReadMode::NonBlocking,
            ModeArg::SemiBlocking => ReadMode::SemiBlocking,
            ModeArg::Blocking => ReadMode::Blocking,
            ModeArg::Scanner => ReadMode::Scanner,
        }
    }
}

fn main() -> CliResult<()> {
    let args = Args::parse();
    let (config, load_error) = match ConfigLoader::load() {
        Ok(loader) => (loader.into_config(), None),
        Err(e) => (ConfigLoader::with_defaults().into_config(), Some(e)),
    };
    init_logging(&config.logging);
    if let Some(e) = load_error {
        warn!("Ignoring configuration: {}", e);
    }

    let registry = PortRegistry::system()
        .with_aliases(config.registry.aliases.clone())
        .with_excluded(config.registry.exclude.clone());

    match args.command {
        Command::List { json } => list(&registry, json),
        Command::Read {
            path,
            bytes,
            mode,
            timeout,
            baud,
            hex,
        } => {
            let mut timeouts = config.timeouts.descriptor();
            if let Some(mode) = mode {
                timeouts.read_mode = mode.into();
            }
            if let Some(timeout) = timeout {
                timeouts.read_timeout_ms = timeout;
            }
            let session = registry.open(&path, line_settings(&config, baud), timeouts)?;
            let data = session.read(bytes)?;
            if hex {
                println!("{}", to_hex(&data));
            } else {
                print!("{}", String::from_utf8_lossy(&data));
            }
            Ok(())
        }
        Command::Write {
            path,
            data,
            hex,
            baud,
        } => {
            let bytes = if hex {
                parse_hex(&data)?
            } else {
                data.into_bytes()
            };
            let timeouts = config
                .timeouts
                .descriptor()
                .with_write(WriteMode::Blocking, config.timeouts.write_timeout_ms);
            let session = registry.open(&path, line_settings(&config, baud), timeouts)?;
            let written = session.write(&bytes)?;
            println!("Wrote {} of {} byte(s)", written, bytes.len());
            Ok(())
        }
        Command::Watch {
            path,
            seconds,
            baud,
        } => {
            let timeouts = TimeoutDescriptor::nonblocking().with_events(EventMask::all());
            let session = registry.open(&path, line_settings(&config, baud), timeouts)?;
            let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
            session.set_listening(true);
            let mut waiter = EventWaiter::new(&session).with_tick(config.events.tick());
            loop {
                let events = waiter.wait_for_event(deadline);
                if events.is_empty() {
                    break;
                }
                if events.contains(EventMask::DATA_AVAILABLE) {
                    let pending = session.bytes_available().max(0) as usize;
                    let data = session.read(pending)?;
                    println!("{:?}: {}", events, to_hex(&data));
                } else {
                    println!("{:?}", events);
                }
                if events.contains(EventMask::PORT_DISCONNECTED) {
                    break;
                }
            }
            Ok(())
        }
        Command::Lines { path } => {
            let session = registry.open(
                &path,
                config.serial.configuration(),
                TimeoutDescriptor::nonblocking(),
            )?;
            let status = session.line_status()?;
            println!(
                "CTS={} DSR={} DCD={} RI={} RTS={} DTR={}",
                status.cts as u8,
                status.dsr as u8,
                status.dcd as u8,
                status.ri as u8,
                status.rts as u8,
                status.dtr as u8
            );
            Ok(())
        }
    }
}

fn list(registry: &PortRegistry, json: bool) -> CliResult<()> {
    let ports = registry.enumerate()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let ids = match (port.vendor_id, port.product_id) {
            (Some(vid), Some(pid)) => format!(" [{:04x}:{:04x}]", vid, pid),
            _ => String::new(),
        };
        println!(
            "{:<20} {:<10} {}{}",
            port.path, port.location, port.description, ids
        );
    }
    Ok(())
}

fn line_settings(config: &Config, baud: Option<u32>) -> SerialConfiguration {
    config
        .serial
        .configuration_at(baud.unwrap_or(config.serial.default_baud))
}

fn to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_hex(text: &str) -> Result<Vec<u8>, String> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if !digits.is_ascii() {
        return Err(format!("invalid hex in {:?}", text));
    }
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in {:?}", text));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| format!("invalid hex byte {:?}", &digits[i..i + 2]))
        })
        .collect()
}
