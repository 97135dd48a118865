//! nodeqa - Common Library
//!
//! Command channels, out-of-band controller stubs, and the node-management
//! scenarios driven by the `nodeqa` binary.

#![deny(unsafe_code)]

pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod logging;
pub mod node;
pub mod oob;
#[cfg(test)]
mod proptest_tests;
pub mod simulated;
pub mod types;

pub use config::{ConfigError, NodeEntry, QaConfig, QaSettings};
pub use context::{NodeReservation, QaContext};
pub use error::{QaError, QaResult};
pub use exec::{
    CommandExecutor, CommandResult, KnownHostsPolicy, LocalExecutor, SshExecutor, SshOptions,
};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use oob::{
    ControllerStub, InProcessStub, OutOfBandScenario, RemoteStub, RemoteStubFactory,
    ScenarioReport, StubFactory,
};
pub use simulated::{ManagerQuirk, SimulatedCluster};
pub use types::{Outcome, Payload, PowerAction};
