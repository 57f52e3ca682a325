//! Conversation descriptors (channels, private groups, DMs, group DMs)

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Conversation type filter accepted by `conversations.list`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationType {
    PublicChannel,
    PrivateChannel,
    Mpim,
    Im,
}

impl ConversationType {
    pub const ALL: [ConversationType; 4] = [
        ConversationType::PublicChannel,
        ConversationType::PrivateChannel,
        ConversationType::Mpim,
        ConversationType::Im,
    ];

    /// Private conversations only
    pub const PRIVATE: [ConversationType; 3] = [
        ConversationType::PrivateChannel,
        ConversationType::Mpim,
        ConversationType::Im,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationType::PublicChannel => "public_channel",
            ConversationType::PrivateChannel => "private_channel",
            ConversationType::Mpim => "mpim",
            ConversationType::Im => "im",
        }
    }

    /// Comma-joined form used as the `types` query parameter
    pub fn join(types: &[ConversationType]) -> String {
        types.iter().map(ConversationType::as_str).collect::<Vec<_>>().join(",")
    }
}

/// The fields of a conversation descriptor the archiver acts on
///
/// The full descriptor is kept verbatim in the conversations snapshot;
/// this view is parsed from it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Other party of a direct message
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub is_channel: bool,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_im: bool,
    #[serde(default)]
    pub is_mpim: bool,
    #[serde(default)]
    pub is_member: bool,
    #[serde(default)]
    pub is_archived: bool,
}

impl Conversation {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// A channel anyone in the workspace can read
    pub fn is_public_channel(&self) -> bool {
        self.is_channel && !self.is_private && !self.is_im && !self.is_mpim
    }

    pub fn kind(&self) -> ConversationType {
        if self.is_im {
            ConversationType::Im
        } else if self.is_mpim {
            ConversationType::Mpim
        } else if self.is_private {
            ConversationType::PrivateChannel
        } else {
            ConversationType::PublicChannel
        }
    }

    /// Human-readable label for log lines
    pub fn pretty_name(&self) -> String {
        match (&self.name, &self.user) {
            (Some(name), _) => format!("#{}", name),
            (None, Some(user)) => format!("im:{}", user),
            (None, None) => self.id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_types_join() {
        assert_eq!(
            ConversationType::join(&ConversationType::ALL),
            "public_channel,private_channel,mpim,im"
        );
        assert_eq!(ConversationType::join(&ConversationType::PRIVATE), "private_channel,mpim,im");
    }

    #[test]
    fn test_parse_channel() {
        let c = Conversation::from_value(&json!({
            "id": "C1", "name": "general", "is_channel": true, "is_member": false,
            "is_archived": false, "topic": {"value": "hi"}
        }))
        .unwrap();
        assert_eq!(c.id, "C1");
        assert!(c.is_public_channel());
        assert_eq!(c.pretty_name(), "#general");
    }

    #[test]
    fn test_parse_im() {
        let c = Conversation::from_value(&json!({"id": "D1", "user": "U9", "is_im": true})).unwrap();
        assert!(!c.is_public_channel());
        assert_eq!(c.kind(), ConversationType::Im);
        assert_eq!(c.pretty_name(), "im:U9");
    }

    #[test]
    fn test_missing_id() {
        assert!(Conversation::from_value(&json!({"name": "x"})).is_none());
    }
}
