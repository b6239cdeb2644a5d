//! Foundation module - Core utilities shared by the execution core
//!
//! - Logging setup
//! - Time management (stopwatch and frame-rate gating)

pub mod logging;
pub mod time;
