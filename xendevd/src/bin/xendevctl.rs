//! Command-line client for the xendevd device-management socket.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use xendevd_proto::{client, ProtoError, DEFAULT_SOCKET_PATH};

/// xendevctl - Manage loop-backed block devices through xendevd
#[derive(Parser, Debug)]
#[command(name = "xendevctl")]
#[command(version)]
struct Args {
    /// xendevd protocol socket
    #[arg(short, long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bind a file to a free loop device and print its major:minor
    Add {
        file: String,
        /// Access mode (r or w)
        #[arg(short, long, default_value = "w")]
        mode: String,
        /// Device subtype tag
        #[arg(short = 't', long = "type", default_value = "file")]
        subtype: String,
    },
    /// Unbind a loop device
    Remove { major: u32, minor: u32 },
    /// Print the backing file of a device, or its node
    Query { major: u32, minor: u32 },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let result = match &args.command {
        Command::Add { file, mode, subtype } => client::add(&args.socket, file, subtype, mode)
            .await
            .map(|(major, minor)| println!("{}:{}", major, minor)),
        Command::Remove { major, minor } => client::remove(&args.socket, *major, *minor).await,
        Command::Query { major, minor } => client::query(&args.socket, *major, *minor)
            .await
            .map(|filename| println!("{}", filename)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("xendevctl: {}", describe(&e));
            ExitCode::from(u8::try_from(e.errno()).ok().filter(|c| *c != 0).unwrap_or(1))
        }
    }
}

fn describe(err: &ProtoError) -> String {
    match err {
        ProtoError::Rejected(code) => std::io::Error::from_raw_os_error(*code).to_string(),
        other => other.to_string(),
    }
}
