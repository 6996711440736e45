//! # limiquantix Common
//!
//! Shared utilities for the limiquantix block job components.
//!
//! ## Logging
//!
//! ```no_run
//! use limiquantix_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(domain = "vm1", "Block job registered");
//! ```

pub mod logging;

pub use logging::{init, init_logging, init_logging_json, LogFormat};
