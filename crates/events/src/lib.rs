//! Job lifecycle events and the audit sink boundary.
//!
//! Events are a one-way observability trail: the engine appends them and
//! never reads them back as state.

pub mod event;
pub mod sink;

pub use event::{EventKind, JobEvent};
pub use sink::{AuditSink, FanoutAuditSink, InMemoryAuditSink, TracingAuditSink};
