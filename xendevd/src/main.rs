//! # xendevd
//!
//! Host-side device hotplug daemon for Xen backends. Reacts to kernel
//! uevents for virtual network and block devices, performs the host side
//! of attaching them (bridge membership, loop devices) and reports the
//! outcome through xenstore. Also serves out-of-band loop device requests
//! from the toolstack over a local socket.
//!
//! ## Usage
//! ```bash
//! xendevd -D --pid-file /var/run/xendevd.pid
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};

mod cli;
mod config;
mod daemon;
mod dispatcher;
mod protocol_server;
mod uevent;

use cli::Args;
use config::Config;
use daemon::PidFile;
use dispatcher::{Dispatcher, Resources};

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() { ExitCode::FAILURE } else { ExitCode::SUCCESS };
        }
    };

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "xendevd failed");
            eprintln!("xendevd: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let config = Config::resolve(args)?;

    let mut pid_file = if config.daemon.write_pid_file {
        Some(PidFile::create(&config.daemon.pid_file)?)
    } else {
        None
    };

    if config.daemon.daemonize {
        daemon::daemonize()?;
    }

    if let Some(pid_file) = pid_file.as_mut() {
        pid_file.write_pid()?;
    }

    // After the fork: the file appender runs its own writer thread.
    let _log_guard = xendevd_common::init_logging_with(
        &config.logging.level,
        config.logging.format.into(),
        config.logging.file.as_deref(),
    )?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        daemon = config.daemon.daemonize,
        pid_file = ?pid_file.as_ref().map(|p| p.path().display().to_string()),
        "Starting xendevd"
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    runtime.block_on(async {
        let resources = Resources::acquire(&config).await?;
        Dispatcher::new(resources).run().await
    })?;

    info!("xendevd stopped");
    Ok(())
}

/// OS error code of the first I/O failure in the chain, else 1.
fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<std::io::Error>())
        .and_then(std::io::Error::raw_os_error)
        .and_then(|code| u8::try_from(code).ok())
        .filter(|code| *code != 0)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use xendevd_hotplug::HotplugError;

    #[test]
    fn test_exit_code_from_os_error() {
        let err = anyhow::Error::new(HotplugError::resource(
            "Failed to open /dev/loop-control",
            std::io::Error::from_raw_os_error(libc::EACCES),
        ))
        .context("startup");
        assert_eq!(exit_code(&err), libc::EACCES as u8);

        let err = anyhow::anyhow!("Config file not valid");
        assert_eq!(exit_code(&err), 1);
    }
}
