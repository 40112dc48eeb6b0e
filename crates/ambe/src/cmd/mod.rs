use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::exit::CliResult;

pub mod info;
pub mod serve;
pub mod transcode;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compress and decompress audio through an AMBE device.
    Transcode(TranscodeArgs),
    /// Share a local AMBE chip with network clients.
    Serve(ServeArgs),
    /// Probe a device and print its identity.
    Info(InfoArgs),
}

pub fn run(command: Command) -> CliResult<i32> {
    match command {
        Command::Transcode(args) => transcode::run(args),
        Command::Serve(args) => serve::run(args),
        Command::Info(args) => info::run(args),
    }
}

#[derive(Args, Debug)]
pub struct TranscodeArgs {
    /// Device URI (usb:/dev/ttyUSB0 or tcp:host:port).
    #[arg(long, short = 'u')]
    pub uri: String,

    /// AMBE rate: a table index, or six comma-separated rate control words.
    #[arg(long, short = 'x', default_value = "33")]
    pub rate: String,

    /// Number of channels to use simultaneously (default: all available).
    #[arg(long, short = 'c')]
    pub channels: Option<usize>,

    /// Run compression and decompression concurrently on every channel.
    #[arg(long, short = 't')]
    pub concurrent: bool,

    /// In-flight requests per channel in concurrent mode.
    #[arg(long, short = 'p', default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..))]
    pub pipeline: u32,

    /// Input audio: raw signed 16-bit little-endian PCM, 8 kHz, mono.
    pub input: PathBuf,

    /// Output file for decompressed audio; with several channels the
    /// channel index is inserted before the extension.
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Serial port with the AMBE chip.
    #[arg(long, short = 's')]
    pub serial: String,

    /// Address to listen on.
    #[arg(long, short = 'l', default_value = "0.0.0.0:50051")]
    pub listen: String,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Device URI (usb:/dev/ttyUSB0 or tcp:host:port).
    #[arg(long, short = 'u')]
    pub uri: String,
}
