//! Test doubles for collectors.
//!
//! - [`MockCollector`] replays a script of batches or errors.
//! - [`MockCollectorFactory`] hands out scripted or synthetic collectors per class.
//! - [`MockFs`] is an in-memory filesystem for the procfs backend.
//!
//! The synthetic system (see `scenarios`) also backs the daemon's `--mock` mode.

mod collector;
mod filesystem;
mod scenarios;

pub use collector::{MockCollector, MockCollectorFactory};
pub use filesystem::MockFs;
