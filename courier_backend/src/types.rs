use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a messaging-platform conversation (user, group or channel).
///
/// Telegram uses signed 64-bit ids; groups and channels are negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(i64);

impl ConversationId {
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for ConversationId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConversationId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message unit in a dialogue. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    role: Role,
    text: String,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Broadcast target list and the message sent to each target.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BroadcastSettings {
    pub targets: Vec<ConversationId>,
    pub start_message: String,
}

impl BroadcastSettings {
    /// Canonical persisted form of the target list.
    pub fn targets_string(&self) -> String {
        self.targets
            .iter()
            .map(ConversationId::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Immutable snapshot of the operator-editable agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub system_instructions: String,
    pub broadcast: BroadcastSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    User,
    Group,
    Channel,
    Unknown,
}

impl TargetKind {
    pub fn as_db_str(self) -> &'static str {
        match self {
            TargetKind::User => "user",
            TargetKind::Group => "group",
            TargetKind::Channel => "channel",
            TargetKind::Unknown => "unknown",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => TargetKind::User,
            "group" => TargetKind::Group,
            "channel" => TargetKind::Channel,
            _ => TargetKind::Unknown,
        }
    }
}

/// Display metadata for a conversation, as resolved by the messaging gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub id: ConversationId,
    pub kind: TargetKind,
    pub display_name: String,
}

impl ConversationInfo {
    /// Placeholder used when a lookup fails.
    pub fn unknown(id: ConversationId) -> Self {
        Self {
            id,
            kind: TargetKind::Unknown,
            display_name: "unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

impl AttemptOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, AttemptOutcome::Success)
    }
}

/// Audit record of one broadcast send. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastAttempt {
    pub run_id: String,
    pub target: ConversationId,
    pub target_kind: TargetKind,
    pub target_name: String,
    pub message_text: String,
    pub outcome: AttemptOutcome,
    pub error_detail: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// Aggregate result of one broadcast run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastSummary {
    pub run_id: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Attempts whose audit record could not be written.
    pub log_failures: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_id_parses_trimmed_signed_values() {
        assert_eq!(
            " -1002222333444 ".parse::<ConversationId>().unwrap(),
            ConversationId::new(-1002222333444)
        );
        assert!("abc".parse::<ConversationId>().is_err());
    }

    #[test]
    fn targets_string_joins_in_order() {
        let settings = BroadcastSettings {
            targets: vec![ConversationId::new(3), ConversationId::new(-1)],
            start_message: "hi".to_string(),
        };
        assert_eq!(settings.targets_string(), "3,-1");
    }

    #[test]
    fn target_kind_db_round_trip_falls_back_to_unknown() {
        assert_eq!(TargetKind::from_db("Group"), TargetKind::Group);
        assert_eq!(TargetKind::from_db(TargetKind::Channel.as_db_str()), TargetKind::Channel);
        assert_eq!(TargetKind::from_db("supergroup"), TargetKind::Unknown);
    }

    #[test]
    fn turn_serializes_lowercase_role() {
        let json = serde_json::to_value(Turn::assistant("ok")).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["text"], "ok");
    }
}
