//! Opreq controller: reconciles OperandRequests against the operand registry, drives
//! installation through the installation subsystem, aggregates status, and tears
//! shared components down once nothing references them.

#![forbid(unsafe_code)]

use opreq_store::Records;

pub mod catalog;
pub mod config;
pub mod error;
pub mod install;
pub mod operand;
pub mod poll;
pub mod queue;
pub mod reconcile;
pub mod resolve;
pub mod status;
pub mod teardown;

pub use config::ControllerConfig;
pub use error::{Error, Result};
pub use queue::WorkQueue;
pub use reconcile::{reconcile, Action};
pub use resolve::{ConsumerIndex, Resolution, ResolvedComponent};

/// Shared, read-only state handed to every reconcile.
pub struct Context {
    pub records: Records,
    pub config: ControllerConfig,
}

impl Context {
    pub fn new(records: Records, config: ControllerConfig) -> Self { Self { records, config } }
}
