//! Progress relay between the provisioning pipeline and its callers.
//!
//! Synchronous callers buffer lines with [`BufferSink`]; streaming callers
//! run the pipeline through [`spawn_streaming`] and relay the resulting
//! [`ProgressEvent`]s to an external channel.

mod event;
mod milestones;
mod sink;
mod stream;

pub use event::ProgressEvent;
pub use milestones::{MILESTONES, milestone_for, milestone_in};
pub use sink::{BufferSink, NullSink, ProgressSink};
pub use stream::{
    DEFAULT_RELAY_POLL, DeploymentStream, QueueSink, StreamOutcome, spawn_streaming,
};
