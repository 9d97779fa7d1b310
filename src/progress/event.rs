//! Events relayed to streaming consumers.

use serde::{Deserialize, Serialize};

use crate::pipeline::ProvisionedInstance;

use super::milestones::milestone_for;

/// One entry of the external progress stream.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A log line produced by the pipeline.
    Log {
        /// Line text.
        text: String,
    },
    /// A milestone percentage derived from the preceding log line.
    Milestone {
        /// Completion percentage.
        percent: u8,
    },
    /// Terminal success event.
    Complete {
        /// The provisioned instance.
        instance: ProvisionedInstance,
    },
    /// Terminal failure event.
    Error {
        /// Human readable failure description.
        message: String,
    },
}

impl ProgressEvent {
    /// Returns `true` for `complete` and `error` events.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// Translates a log line into its log event and, when the line matches
    /// the milestone table, a milestone event.
    #[must_use]
    pub fn from_line(line: &str) -> Vec<Self> {
        let mut events = vec![Self::Log {
            text: line.to_owned(),
        }];
        if let Some(percent) = milestone_for(line) {
            events.push(Self::Milestone { percent });
        }
        events
    }
}
