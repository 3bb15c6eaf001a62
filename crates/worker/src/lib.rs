//! Worker process: wiring and command-line surface.

pub mod app;
pub mod cli;
