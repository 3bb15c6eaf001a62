//! Audit sink abstraction (fire-and-forget).
//!
//! `append` has no error channel. A sink that cannot persist an event logs the
//! failure and moves on; job processing never fails because of the audit trail.

use std::sync::{Arc, Mutex};

use scriptorium_core::JobId;
use tracing::{info, warn};

use crate::event::{EventKind, JobEvent};

/// Append-only destination for lifecycle events.
pub trait AuditSink: Send + Sync {
    fn append(&self, event: JobEvent);
}

impl<S> AuditSink for Arc<S>
where
    S: AuditSink + ?Sized,
{
    fn append(&self, event: JobEvent) {
        (**self).append(event)
    }
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<JobEvent>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<JobEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn for_job(&self, job_id: JobId) -> Vec<JobEvent> {
        self.all()
            .into_iter()
            .filter(|e| e.job_id == Some(job_id))
            .collect()
    }

    pub fn kinds_for_job(&self, job_id: JobId) -> Vec<EventKind> {
        self.for_job(job_id).into_iter().map(|e| e.kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.all().iter().filter(|e| e.kind == kind).count()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn append(&self, event: JobEvent) {
        // A poisoned lock only loses the event; never panic on the audit path.
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Mirrors every event into the structured log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn append(&self, event: JobEvent) {
        let job_id = event.job_id.map(|id| id.get());
        if event.kind.is_error() {
            warn!(event = %event.kind, job_id = ?job_id, data = %event.data, "audit");
        } else {
            info!(event = %event.kind, job_id = ?job_id, data = %event.data, "audit");
        }
    }
}

/// Forwards each event to every inner sink.
#[derive(Default, Clone)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl core::fmt::Debug for FanoutAuditSink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FanoutAuditSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl AuditSink for FanoutAuditSink {
    fn append(&self, event: JobEvent) {
        for sink in &self.sinks {
            sink.append(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_sink_filters_by_job() {
        let sink = InMemoryAuditSink::new();
        sink.append(JobEvent::new(EventKind::JobQueued, JobId::new(1)));
        sink.append(JobEvent::new(EventKind::JobQueued, JobId::new(2)));
        sink.append(JobEvent::new(EventKind::JobStarted, JobId::new(1)));

        assert_eq!(
            sink.kinds_for_job(JobId::new(1)),
            vec![EventKind::JobQueued, EventKind::JobStarted]
        );
        assert_eq!(sink.count(EventKind::JobQueued), 2);
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(InMemoryAuditSink::new());
        let b = Arc::new(InMemoryAuditSink::new());
        let fanout = FanoutAuditSink::new()
            .with(a.clone())
            .with(b.clone())
            .with(Arc::new(TracingAuditSink));

        fanout.append(JobEvent::system(EventKind::SystemError));

        assert_eq!(a.all().len(), 1);
        assert_eq!(b.all().len(), 1);
    }
}
