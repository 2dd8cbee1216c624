use clap::{Args, Subcommand};

use crate::exit::CliResult;

pub mod bridge;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the session manager and poll registered devices.
    Serve(ServeArgs),
    /// Bridge a local serial device onto a remote session manager.
    Bridge(BridgeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::Bridge(args) => bridge::run(args),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on for bridge connections.
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0:4210")]
    pub listen: String,
}

#[derive(Args, Debug)]
pub struct BridgeArgs {
    /// Serial port of the device link (e.g. /dev/ttyUSB0).
    #[arg(long, value_name = "PORT")]
    pub serial: String,
    /// Serial baud rate.
    #[arg(long, default_value = "115200")]
    pub baud: u32,
    /// Session manager address to connect to.
    #[arg(long, value_name = "ADDR")]
    pub connect: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
