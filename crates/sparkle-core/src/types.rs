use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Structured intent returned by the assistant for every turn.
///
/// The model is instructed to answer with exactly one of these; anything it
/// invents beyond the set parses to [`Action::Continue`] upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    CollectInfo,
    CheckAvailability,
    BookAppointment,
    Escalate,
    #[serde(rename = "continue")]
    Continue,
    Confirm,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::CollectInfo => "collect_info",
            Action::CheckAvailability => "check_availability",
            Action::BookAppointment => "book_appointment",
            Action::Escalate => "escalate",
            Action::Continue => "continue",
            Action::Confirm => "confirm",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "collect_info" => Ok(Action::CollectInfo),
            "check_availability" => Ok(Action::CheckAvailability),
            "book_appointment" => Ok(Action::BookAppointment),
            "escalate" => Ok(Action::Escalate),
            "continue" => Ok(Action::Continue),
            "confirm" => Ok(Action::Confirm),
            _ => Err(()),
        }
    }
}

/// A single message in a conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
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
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(()),
        }
    }
}

/// Model tier selected by the cost router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Fast,
    Balanced,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Balanced => "balanced",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_serde_round_trip() {
        let json = serde_json::to_string(&Action::Continue).unwrap();
        assert_eq!(json, "\"continue\"");
        let back: Action = serde_json::from_str("\"book_appointment\"").unwrap();
        assert_eq!(back, Action::BookAppointment);
    }

    #[test]
    fn action_parse_rejects_unknown() {
        assert!("delete_everything".parse::<Action>().is_err());
        assert_eq!("escalate".parse::<Action>(), Ok(Action::Escalate));
    }

    #[test]
    fn role_round_trip() {
        assert_eq!("assistant".parse::<Role>(), Ok(Role::Assistant));
        assert_eq!(Role::System.as_str(), "system");
    }
}
