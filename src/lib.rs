//! video-tracking - records video playback sessions through a
//! single-connection SQL command executor.
//!
//! This library exposes the core modules for the binary and integration tests.

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod tracking;
