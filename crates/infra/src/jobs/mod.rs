//! Job storage.
//!
//! ## Components
//!
//! - `JobStore`: the single source of truth for job state. Every transition is a
//!   conditional update checked against `JobStatus::can_transition_to`.
//! - `InMemoryJobStore`: tests/dev; one write lock makes each operation atomic.
//! - `PostgresJobStore`: durable store; claims with `FOR UPDATE SKIP LOCKED`.

pub mod postgres;
pub mod store;

pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError, ReapAction, StatusUpdate};
