use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task reference carried through the trigger topic. The authoritative task
/// row lives in the task store; this is only what the triggering path needs
/// to route and hand off. Unknown wire fields are tolerated so nodes on
/// different versions can share a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseTask {
    pub id: Uuid,
    pub version: i64,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub status: String,
}

impl BaseTask {
    /// `id:version`, the form used in log lines.
    pub fn version_id(&self) -> String {
        format!("{}:{}", self.id, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Error,
    Unknown,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Error => "ERROR",
            TaskStatus::Unknown => "UNKNOWN",
        }
    }
}
