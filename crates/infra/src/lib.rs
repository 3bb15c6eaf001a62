//! Infrastructure layer: job storage, artifacts, the phase pipeline and the
//! background loops that drive it.

pub mod artifacts;
pub mod audit;
pub mod config;
pub mod dispatcher;
pub mod jobs;
pub mod pipeline;
pub mod queue;
pub mod reaper;
