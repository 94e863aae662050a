//! Durable job scheduler.
//!
//! Jobs are descriptors plus a trigger held in a [`JobStore`]. The scheduler loop runs
//! on the async runtime and hands each due execution to the blocking pool, so job bodies
//! may open thread-bound transactions and take thread-owned locks.

mod job;
pub mod jobs;
mod service;
mod store;
mod trigger;

pub use job::{JobContent, JobContext, JobDescriptor, JobEnvironment};
pub use service::SchedulerService;
pub use store::{JobState, JobStore, MemJobStore, ScheduledJob};
pub use trigger::{MisfirePolicy, Trigger};
