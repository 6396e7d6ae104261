//! Core library for the ReactIR reaction-monitoring application.
//!
//! A syringe pump moves solvent and sample through an IR flow cell while the
//! spectrometer acquires on a timed schedule. The library provides the pump
//! actuator, the spectrometer session, and the orchestrator that ties them
//! into one experiment run. It is used by the `reactir` binary and by tests.

pub mod config;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod instrument;
pub mod pump;
pub mod tracing_setup;
