//! Core type definitions for brood orchestration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Global helper identity within one director tree
pub type HelperId = u64;

/// The director always holds identity 0
pub const DIRECTOR: HelperId = 0;

/// Default spawn depth for a director without configuration
pub const DEFAULT_DEPTH: u32 = 4;

/// Default spawn breadth for a director without configuration
pub const DEFAULT_BREADTH: u32 = 4;

/// Spawn limits for a helper. Written once at spawn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpawnBudget {
    /// Further spawn levels permitted below this helper
    pub depth: u32,
    /// Direct children this helper may have alive at once
    pub breadth: u32,
}

impl SpawnBudget {
    pub fn new(depth: u32, breadth: u32) -> Self {
        Self { depth, breadth }
    }

    /// True when this helper may not spawn at all
    pub fn is_exhausted(&self) -> bool {
        self.depth == 0 || self.breadth == 0
    }
}

impl Default for SpawnBudget {
    fn default() -> Self {
        Self::new(DEFAULT_DEPTH, DEFAULT_BREADTH)
    }
}

impl std::fmt::Display for SpawnBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "depth={} breadth={}", self.depth, self.breadth)
    }
}

/// Lifecycle status of a helper record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelperStatus {
    /// Identity allocated, process launch requested
    #[default]
    Pending,
    /// Helper process registered with the hub
    Registered,
    /// Agent command has started inside the helper
    Running,
    /// Process torn down; directories kept
    Stopped,
    /// Directories and registry entry removed
    Cleaned,
}

impl HelperStatus {
    /// Statuses that count as a live helper for descendant checks
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Cleaned)
    }

    /// Statuses in which the helper process is expected to be up
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Registered | Self::Running)
    }
}

impl std::fmt::Display for HelperStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Registered => write!(f, "registered"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Cleaned => write!(f, "cleaned"),
        }
    }
}

impl std::str::FromStr for HelperStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "registered" => Ok(Self::Registered),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "cleaned" => Ok(Self::Cleaned),
            _ => Err(format!("Invalid helper status: {}", s)),
        }
    }
}

/// Recipients of a log record: an explicit list, or every helper (`"*"`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "RecipientsRepr", try_from = "RecipientsRepr")]
pub enum Recipients {
    Helpers(Vec<HelperId>),
    All,
}

impl Recipients {
    pub fn one(id: HelperId) -> Self {
        Self::Helpers(vec![id])
    }

    pub fn none() -> Self {
        Self::Helpers(Vec::new())
    }

    /// Check whether a helper is addressed by these recipients
    pub fn includes(&self, id: HelperId) -> bool {
        match self {
            Self::All => true,
            Self::Helpers(ids) => ids.contains(&id),
        }
    }
}

impl std::fmt::Display for Recipients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "*"),
            Self::Helpers(ids) => {
                let parts: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RecipientsRepr {
    Wildcard(String),
    List(Vec<HelperId>),
}

impl From<Recipients> for RecipientsRepr {
    fn from(r: Recipients) -> Self {
        match r {
            Recipients::All => Self::Wildcard("*".to_string()),
            Recipients::Helpers(ids) => Self::List(ids),
        }
    }
}

impl TryFrom<RecipientsRepr> for Recipients {
    type Error = String;

    fn try_from(r: RecipientsRepr) -> Result<Self, Self::Error> {
        match r {
            RecipientsRepr::Wildcard(s) if s == "*" => Ok(Self::All),
            RecipientsRepr::Wildcard(s) => Err(format!("Invalid recipients: {}", s)),
            RecipientsRepr::List(ids) => Ok(Self::Helpers(ids)),
        }
    }
}

/// Kind of log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Inter-agent message (send or broadcast)
    Message,
    /// Lifecycle event; `content` names the event
    Control,
}

/// One durable entry of the message log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Assigned at append time, strictly increasing
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: RecordKind,
    pub sender: HelperId,
    pub recipients: Recipients,
    pub content: String,
}

impl LogRecord {
    pub fn is_message(&self) -> bool {
        self.kind == RecordKind::Message
    }

    /// Short human-readable form used by `helper log`
    pub fn display_line(&self) -> String {
        let time = self.timestamp.format("%H:%M:%S");
        match self.kind {
            RecordKind::Message => format!(
                "{:>6}  {}  [{} -> {}]  {}",
                self.sequence, time, self.sender, self.recipients, self.content
            ),
            RecordKind::Control => format!(
                "{:>6}  {}  [{}] helper {}",
                self.sequence, time, self.content, self.sender
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            HelperStatus::Pending,
            HelperStatus::Registered,
            HelperStatus::Running,
            HelperStatus::Stopped,
            HelperStatus::Cleaned,
        ] {
            let parsed: HelperStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("zombie".parse::<HelperStatus>().is_err());
    }

    #[test]
    fn test_recipients_wire_format() {
        let all = serde_json::to_string(&Recipients::All).unwrap();
        assert_eq!(all, "\"*\"");

        let list = serde_json::to_string(&Recipients::one(3)).unwrap();
        assert_eq!(list, "[3]");

        let parsed: Recipients = serde_json::from_str("\"*\"").unwrap();
        assert_eq!(parsed, Recipients::All);
        assert!(serde_json::from_str::<Recipients>("\"all\"").is_err());
    }

    #[test]
    fn test_recipients_includes() {
        assert!(Recipients::All.includes(42));
        assert!(Recipients::one(1).includes(1));
        assert!(!Recipients::one(1).includes(2));
        assert!(!Recipients::none().includes(0));
    }

    #[test]
    fn test_budget_exhaustion() {
        assert!(SpawnBudget::new(0, 3).is_exhausted());
        assert!(!SpawnBudget::new(1, 3).is_exhausted());
        assert_eq!(SpawnBudget::default(), SpawnBudget::new(4, 4));
    }
}
