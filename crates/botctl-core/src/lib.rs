//! botctl core library
//!
//! Process supervision for the automation services:
//! - Service registry and launch specifications
//! - Filesystem-backed pid store with stale-handle reclamation
//! - Graceful-then-forced termination and the stop-all sweep
//! - Status aggregation, listener ports and log access
//! - Typed interface to the external application's diagnostics

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod logs;
pub mod pidfile;
pub mod ports;
pub mod preflight;
pub mod process;
pub mod registry;
pub mod supervisor;
pub mod tracing_init;

pub use config::{Overrides, Settings, Timing};
pub use error::{Error, Result};
pub use registry::{LaunchSpec, Registry, Service};
pub use supervisor::{ServiceStatus, StopAllReport, StopOutcome, Supervisor};
