//! Shared domain enumerations aligned with persisted column values.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a queued render job.
///
/// `Failed` is a terminal failure that was never retried; `Killed` is a job
/// that exhausted its attempts and now sits in the dead-letter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
    Killed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "Pending",
            JobState::Running => "Running",
            JobState::Done => "Done",
            JobState::Failed => "Failed",
            JobState::Killed => "Killed",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Killed)
    }
}

impl TryFrom<&str> for JobState {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "Pending" => Ok(JobState::Pending),
            "Running" => Ok(JobState::Running),
            "Done" => Ok(JobState::Done),
            "Failed" => Ok(JobState::Failed),
            "Killed" => Ok(JobState::Killed),
            _ => Err(()),
        }
    }
}

/// How the upstream ingestion step classified the email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderRoute {
    AutoNoAttachments,
    AutoWithAttachments,
    Manual,
}

impl RenderRoute {
    pub const ALL: [RenderRoute; 3] = [
        RenderRoute::AutoNoAttachments,
        RenderRoute::AutoWithAttachments,
        RenderRoute::Manual,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RenderRoute::AutoNoAttachments => "auto_no_attachments",
            RenderRoute::AutoWithAttachments => "auto_with_attachments",
            RenderRoute::Manual => "manual",
        }
    }

    /// Advisory dequeue priority used when the caller does not supply one.
    /// Manually forwarded mail is the least urgent.
    pub fn default_priority(self) -> i32 {
        match self {
            RenderRoute::AutoWithAttachments => 10,
            RenderRoute::AutoNoAttachments => 5,
            RenderRoute::Manual => 0,
        }
    }
}

impl fmt::Display for RenderRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for RenderRoute {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "auto_no_attachments" => Ok(RenderRoute::AutoNoAttachments),
            "auto_with_attachments" => Ok(RenderRoute::AutoWithAttachments),
            "manual" => Ok(RenderRoute::Manual),
            _ => Err(()),
        }
    }
}
