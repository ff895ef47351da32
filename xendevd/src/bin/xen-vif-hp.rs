//! One-shot VIF hotplug helper for toolstacks that run a script per
//! event instead of relying on xendevd.
//!
//! ## Usage
//! ```bash
//! vif=vif3.0 XENBUS_PATH=backend/vif/3/0 xen-vif-hp online
//! ```
//!
//! The bridge is read from the device's store directory and the outcome
//! written back there. The exit code is the errno of the failure, if any.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::error;

use xendevd_hotplug::{
    IoctlNetwork, NetworkOps, Store, StoreDevice, Transition, VifHotplug, XenStore,
    DEFAULT_XENSTORED_SOCKET,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Action {
    Online,
    Offline,
}

impl From<Action> for Transition {
    fn from(action: Action) -> Self {
        match action {
            Action::Online => Transition::Online,
            Action::Offline => Transition::Offline,
        }
    }
}

/// xen-vif-hp - Attach or detach one virtual interface
#[derive(Parser, Debug)]
#[command(name = "xen-vif-hp")]
#[command(version)]
struct Args {
    #[arg(value_enum)]
    action: Action,

    /// Interface name
    #[arg(long, env = "vif")]
    vif: String,

    /// Device directory in xenstore
    #[arg(long, env = "XENBUS_PATH")]
    xenbus_path: String,

    /// xenstored control socket
    #[arg(long, default_value = DEFAULT_XENSTORED_SOCKET)]
    store_socket: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(libc::EINVAL as u8)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(&args) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{:#}", e), "xen-vif-hp failed");
            eprintln!("xen-vif-hp: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn run(args: &Args) -> Result<u8> {
    xendevd_common::init_logging(&args.log_level)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    runtime.block_on(async {
        let store = Arc::new(XenStore::connect(&args.store_socket).await?);
        hotplug(store, Arc::new(IoctlNetwork::new()), args).await
    })
}

/// Run the transition and turn a reported failure into its errno.
async fn hotplug(store: Arc<dyn Store>, network: Arc<dyn NetworkOps>, args: &Args) -> Result<u8> {
    let device = StoreDevice::new(store, args.xenbus_path.as_str());
    let failure = VifHotplug::new(network)
        .apply(args.action.into(), &device, Some(args.vif.as_str()))
        .await?;

    Ok(failure.map_or(0, |e| errno_code(e.errno())))
}

fn errno_code(errno: i32) -> u8 {
    u8::try_from(errno).ok().filter(|code| *code != 0).unwrap_or(1)
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<xendevd_hotplug::HotplugError>())
        .map_or(1, |e| errno_code(e.errno()))
}
