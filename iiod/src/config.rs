//! Daemon command line and carrier configuration.

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;

/// Default TCP port of the network carrier.
pub const DEFAULT_PORT: u16 = 30431;

/// IIO daemon command line.
#[derive(Parser, Debug, Clone)]
#[command(name = "iiod", version, about = "Daemon to access IIO devices over the network")]
pub struct Args {
    /// Verbose (debug-level) logging
    #[arg(short, long)]
    pub debug: bool,

    /// Demultiplex RX samples down to each client's channel mask
    #[arg(short = 'D', long)]
    pub demux: bool,

    /// TCP port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// URI of the IIO context to expose (resolved by the access layer)
    #[arg(short, long)]
    pub uri: Option<String>,

    /// Mounted FunctionFS directory for the USB carrier
    #[arg(short = 'F', long)]
    pub ffs: Option<PathBuf>,

    /// Number of USB endpoint pairs (concurrent USB sessions)
    #[arg(short = 'n', long, default_value_t = 3)]
    pub nb_pipes: usize,

    /// Serial carrier: PATH[,baud[,bits[,parity[,stop[,flow]]]]]
    #[arg(short, long)]
    pub serial: Option<SerialParams>,
}

/// Parity setting of the serial carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
    Mark,
    Space,
}

/// Flow control setting of the serial carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    Disabled,
    XonXoff,
    RtsCts,
    DtrDsr,
}

/// Parsed `--serial` parameters. Defaults to 57600 8N1, no flow control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialParams {
    pub path: PathBuf,
    pub baud: u32,
    pub bits: u8,
    pub parity: Parity,
    pub stop: u8,
    pub flow: FlowControl,
}

impl FromStr for SerialParams {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split(',');
        let path = fields.next().filter(|p| !p.is_empty()).ok_or("missing device path")?;

        let mut params = Self {
            path: PathBuf::from(path),
            baud: 57600,
            bits: 8,
            parity: Parity::None,
            stop: 1,
            flow: FlowControl::Disabled,
        };

        if let Some(baud) = fields.next() {
            params.baud = baud.parse().map_err(|_| format!("bad baud rate {baud:?}"))?;
        }
        if let Some(bits) = fields.next() {
            params.bits = match bits.parse() {
                Ok(b @ 5..=8) => b,
                _ => return Err(format!("bad character size {bits:?}")),
            };
        }
        if let Some(parity) = fields.next() {
            params.parity = match parity {
                "n" | "N" => Parity::None,
                "e" | "E" => Parity::Even,
                "o" | "O" => Parity::Odd,
                "m" | "M" => Parity::Mark,
                "s" | "S" => Parity::Space,
                _ => return Err(format!("bad parity {parity:?}")),
            };
        }
        if let Some(stop) = fields.next() {
            params.stop = match stop.parse() {
                Ok(b @ 1..=2) => b,
                _ => return Err(format!("bad stop bit count {stop:?}")),
            };
        }
        if let Some(flow) = fields.next() {
            params.flow = match flow {
                "x" | "X" => FlowControl::XonXoff,
                "r" | "R" => FlowControl::RtsCts,
                "d" | "D" => FlowControl::DtrDsr,
                _ => return Err(format!("bad flow control {flow:?}")),
            };
        }
        if fields.next().is_some() {
            return Err("trailing serial parameters".to_string());
        }
        Ok(params)
    }
}
