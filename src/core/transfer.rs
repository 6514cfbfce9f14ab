use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Content-item id (SOP instance uid) to the file holding it.
pub type FileSet = BTreeMap<String, PathBuf>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Queued,
    Claimed,
    Sending,
    Completed,
    Cancelled,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Queued => "queued",
            SessionStatus::Claimed => "claimed",
            SessionStatus::Sending => "sending",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Failed => "failed",
        }
    }

    /// Unknown strings map to `Failed` so a row written by a newer schema
    /// never looks dispatchable.
    pub fn parse(s: &str) -> Self {
        match s {
            "queued" => SessionStatus::Queued,
            "claimed" => SessionStatus::Claimed,
            "sending" => SessionStatus::Sending,
            "completed" => SessionStatus::Completed,
            "cancelled" => SessionStatus::Cancelled,
            _ => SessionStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Failed
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub files_sent: usize,
    pub files_total: usize,
    pub bytes_sent: u64,
}

impl ProgressInfo {
    pub fn percent(&self) -> f64 {
        if self.files_total == 0 {
            return 100.0;
        }
        (self.files_sent as f64 / self.files_total as f64) * 100.0
    }
}
