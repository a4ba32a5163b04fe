use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one task record.
///
/// Transitions form a DAG: `Waiting -> Pending -> Running -> {Succeeded,
/// Failed, Killed}`. `Unknown` is reachable from `Running` only, when a
/// worker's liveness is lost. Retry re-enters `Pending` from a terminal
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Waiting,
    Pending,
    Running,
    Succeeded,
    Failed,
    Killed,
    Unknown,
}

impl TaskState {
    pub const ALL: [TaskState; 7] = [
        TaskState::Waiting,
        TaskState::Pending,
        TaskState::Running,
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::Killed,
        TaskState::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "WAITING" => Self::Waiting,
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            "KILLED" => Self::Killed,
            "UNKNOWN" => Self::Unknown,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Killed | Self::Unknown
        )
    }

    /// State-machine constraint checked by the store on every transition.
    pub fn ok_transition(self, to: Self) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Waiting, Pending)
                | (Pending, Running)
                | (Running, Succeeded | Failed | Killed | Unknown)
                // retry: terminal states re-enter the queue
                | (Failed | Killed | Unknown | Succeeded, Pending)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue-level state: paused queues stop handing out work but keep
/// accepting records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    Active,
    Paused,
}

impl QueueState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "ACTIVE" => Self::Active,
            "PAUSED" => Self::Paused,
            _ => return None,
        })
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_states() {
        for state in TaskState::ALL {
            assert_eq!(TaskState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TaskState::parse("BOGUS"), None);
    }

    #[test]
    fn transition_dag() {
        assert!(TaskState::Waiting.ok_transition(TaskState::Pending));
        assert!(TaskState::Pending.ok_transition(TaskState::Running));
        assert!(TaskState::Running.ok_transition(TaskState::Succeeded));
        assert!(TaskState::Running.ok_transition(TaskState::Unknown));
        assert!(!TaskState::Waiting.ok_transition(TaskState::Running));
        assert!(!TaskState::Pending.ok_transition(TaskState::Unknown));
        // retry path
        assert!(TaskState::Failed.ok_transition(TaskState::Pending));
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Unknown.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }
}
