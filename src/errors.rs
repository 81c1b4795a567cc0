//! Error taxonomy for the aggregation core.
//!
//! Only topology errors are fatal: the service is expected to exit and let
//! its supervisor restart it rather than attempt in-process failover.
//! Missed telemetry reads and refused state transitions are absorbed
//! locally and never surface here.

use crate::bus::ServiceClass;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PackError {
    /// Discovered bank count does not match the configured count at
    /// startup.
    #[error("discovered {found} battery bank(s), configured for {expected}")]
    ConfigurationMismatch { expected: usize, found: usize },

    /// A service class the control law depends on has no peers at startup.
    #[error("no {0:?} peers present on the value bus")]
    MissingPeers(ServiceClass),

    /// A bank appeared after startup. Topology is fixed for the process
    /// lifetime; recovery is an external restart.
    #[error("battery bank {0} appeared after startup")]
    BankAppeared(String),

    /// A previously discovered bank disappeared after startup.
    #[error("battery bank {0} disappeared after startup")]
    BankDisappeared(String),

    #[error("failed to read config file: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ConfigParse(#[from] serde_json::Error),
}
