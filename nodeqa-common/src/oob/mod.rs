//! Out-of-band power-control contract tests.
//!
//! The cluster manager delegates power actions to an external "OOB program".
//! These modules replace that program with a controller stub whose exit code
//! and payload the harness controls, then verify two contracts for every
//! `gnt-node power` call: the stub was invoked with exactly
//! `power-<action> <node>`, and the caller saw the outcome the protocol rules
//! prescribe for the injected state.

pub mod controller;
pub mod report;
pub mod rules;
pub mod scenario;
pub mod stub;
pub mod verify;

pub use controller::{Controller, ControllerOutput, ControllerStub, InProcessStub, StubFactory};
pub use report::{ScenarioRecorder, ScenarioReport, StepRecord};
pub use rules::{Fixture, expected_outcome, interpret_reply, scenario_fixtures};
pub use scenario::OutOfBandScenario;
pub use stub::{RemoteStub, RemoteStubFactory, StubScript};
pub use verify::{CheckedCall, assert_call, assert_call_log, check_call};
