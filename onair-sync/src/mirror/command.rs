//! Mirror command types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One idempotent statement to apply against the legacy store
///
/// Callers must make the statement safe to replay (upserts, guarded deletes):
/// the queue delivers at least once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorStatement {
    /// SQL text with `?` placeholders
    pub sql: String,
    /// Positional parameters bound in order
    #[serde(default)]
    pub params: Vec<Value>,
}

impl MirrorStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Command lifecycle status
///
/// Transitions only move forward, except the retry cycle
/// `InProgress -> InProgressRetrying -> Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    InProgress,
    InProgressRetrying,
    Completed,
    Failed,
}

/// Result of a successful execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    pub rows_affected: u64,
}

/// A statement owned by the mirror queue, with its delivery bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorCommand {
    pub id: Uuid,
    pub payload: MirrorStatement,
    pub enqueued_at: DateTime<Utc>,
    /// Execution attempts so far; incremented once per attempt
    pub attempts: u32,
    pub status: CommandStatus,
    pub last_result: Option<CommandOutcome>,
    pub last_error: Option<String>,
}

impl MirrorCommand {
    /// Wrap a statement as a fresh pending command
    pub fn new(payload: MirrorStatement) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            enqueued_at: Utc::now(),
            attempts: 0,
            status: CommandStatus::Pending,
            last_result: None,
            last_error: None,
        }
    }
}

/// Read-only queue snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueState {
    /// False once the queue has stopped permanently
    pub alive: bool,
    /// True while a worker is draining (including backoff waits)
    pub working: bool,
    /// Commands waiting to run
    pub depth: usize,
    pub max_attempts: u32,
    /// Whether the fatal snapshot reached disk; `None` until the queue dies
    pub snapshot_persisted: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_command_is_pending() {
        let cmd = MirrorCommand::new(MirrorStatement::new("DELETE FROM plays WHERE id = 1"));
        assert_eq!(cmd.status, CommandStatus::Pending);
        assert_eq!(cmd.attempts, 0);
        assert!(cmd.last_result.is_none());
        assert!(cmd.last_error.is_none());
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_value(CommandStatus::InProgressRetrying).unwrap(),
            "in_progress_retrying"
        );
        assert_eq!(serde_json::to_value(CommandStatus::Pending).unwrap(), "pending");
    }

    #[test]
    fn test_statement_params_default_to_empty() {
        let stmt: MirrorStatement =
            serde_json::from_value(json!({"sql": "UPDATE songs SET plays = plays"})).unwrap();
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_command_json_is_camel_case() {
        let cmd = MirrorCommand::new(MirrorStatement::with_params(
            "REPLACE INTO requests (id, title) VALUES (?, ?)",
            vec![json!(7), json!("Blue Monday")],
        ));
        let value = serde_json::to_value(&cmd).unwrap();
        assert!(value.get("enqueuedAt").is_some());
        assert!(value.get("lastError").is_some());
        assert_eq!(value["payload"]["params"][1], "Blue Monday");
    }
}
