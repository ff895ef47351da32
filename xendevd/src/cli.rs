//! Command-line argument parsing.

use clap::Parser;
use std::path::PathBuf;

/// xendevd - Xen backend device hotplug daemon
#[derive(Parser, Debug)]
#[command(name = "xendevd")]
#[command(about = "xendevd - Xen backend device hotplug daemon")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Run in background (implies writing the pid file)
    #[arg(short = 'D', long)]
    pub daemon: bool,

    /// Write process pid to file [default: /var/run/xendevd.pid]
    #[arg(long, value_name = "FILE")]
    pub pid_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let args = Args::try_parse_from(["xendevd", "-D", "--pid-file", "/run/x.pid"]).unwrap();
        assert!(args.daemon);
        assert_eq!(args.pid_file, Some(PathBuf::from("/run/x.pid")));
        assert!(args.config.is_none());

        assert!(Args::try_parse_from(["xendevd", "stray"]).is_err());
    }
}
