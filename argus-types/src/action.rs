//! Action approval requests: the human-in-the-loop gate for risky tools.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::id::{ActionId, RunId};

/// Ordinal risk classification for tools and commands.
///
/// Anything above `Low` must pass the approval protocol before executing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Pure reads; never gated.
    #[default]
    ReadOnly,
    /// Harmless mutations (e.g. writing a scratch file).
    Low,
    /// Mutations an operator should see first.
    Medium,
    /// Destructive or service-affecting.
    High,
    /// Irreversible or credential-bearing; needs a fresh authorization
    /// marker on top of approval.
    Critical,
}

impl RiskLevel {
    /// Whether executing at this level requires an approved response.
    pub fn requires_approval(&self) -> bool {
        *self > RiskLevel::Low
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::ReadOnly => "read_only",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// The command an action will execute, as the client should display it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionCommand {
    /// An argv vector, executed without a shell.
    Argv(Vec<String>),
    /// A shell command line.
    Shell(String),
}

impl ActionCommand {
    /// Render the command as one display string (for audit and UI).
    pub fn display(&self) -> String {
        match self {
            ActionCommand::Argv(argv) => argv.join(" "),
            ActionCommand::Shell(line) => line.clone(),
        }
    }
}

/// Terminal state of an action request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Awaiting an operator response.
    Pending,
    /// Operator approved; command executed (or executing).
    Approved,
    /// Operator rejected.
    Rejected,
    /// No response within the approval window.
    TimedOut,
}

/// A pending request for permission to run a side-effecting command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Unique, unguessable id used to correlate the response.
    pub id: ActionId,
    /// Tool that asked for the action.
    pub tool: String,
    /// One-line human description of what will happen.
    pub description: String,
    /// The command to run on approval.
    pub command: ActionCommand,
    /// Risk classification.
    pub risk: RiskLevel,
    /// Whether the effect can be undone.
    pub reversible: bool,
    /// Whether the UI should re-prompt for the operator password.
    pub requires_password: bool,
    /// The run that initiated the request.
    pub run_id: RunId,
    /// When the request entered `pending`.
    pub pending_since: DateTime<Utc>,
}

/// An operator's answer to an [`ActionRequest`], correlated by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    /// The request being answered.
    pub action_id: ActionId,
    /// Approve or reject.
    pub approved: bool,
    /// Fresh authorization marker; required for `Critical` risk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
}

/// Captured output of an executed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutput {
    /// Process exit code (`-1` when the process was killed).
    pub exit_code: i32,
    /// Captured standard output (truncated at the guard limit).
    pub stdout: String,
    /// Captured standard error (truncated at the guard limit).
    pub stderr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_ordering_gates_above_low() {
        assert!(!RiskLevel::ReadOnly.requires_approval());
        assert!(!RiskLevel::Low.requires_approval());
        assert!(RiskLevel::Medium.requires_approval());
        assert!(RiskLevel::High.requires_approval());
        assert!(RiskLevel::Critical.requires_approval());
    }

    #[test]
    fn command_serializes_untagged() {
        let argv = ActionCommand::Argv(vec!["kill".into(), "-TERM".into(), "1234".into()]);
        assert_eq!(
            serde_json::to_value(&argv).unwrap(),
            serde_json::json!(["kill", "-TERM", "1234"])
        );
        let shell: ActionCommand = serde_json::from_value(serde_json::json!("ls -la")).unwrap();
        assert_eq!(shell, ActionCommand::Shell("ls -la".into()));
    }

    #[test]
    fn command_display() {
        let argv = ActionCommand::Argv(vec!["kill".into(), "1234".into()]);
        assert_eq!(argv.display(), "kill 1234");
    }
}
