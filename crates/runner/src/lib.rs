//! Wires reservation entities to in-memory downstream services.
//!
//! The binary loads [`config::Config`] from the environment, installs
//! tracing and the Prometheus recorder, and runs [`demo::run`].

pub mod config;
pub mod demo;
pub mod error;

pub use error::{Result, RunnerError};
