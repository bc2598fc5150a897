//! # hostman Common
//!
//! Shared utilities for the hostman agent components.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use hostman_common::{init_logging, LogFormat};
//!
//! init_logging("info", LogFormat::Pretty).unwrap();
//! tracing::info!(pool = "/data/pool0", "Storage pool ready");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, init_logging_pretty, LogFormat};
