//! # xendevd Common
//!
//! Shared utilities for the xendevd binaries.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use xendevd_common::{init_logging, LogFormat};
//!
//! init_logging("info").unwrap();
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, init_logging_with, LogFormat};
