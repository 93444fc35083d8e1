use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceKind {
    Online,
    Offline,
}

impl std::fmt::Display for PresenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// An online/offline transition for an identity.
///
/// Kept in a bounded in-memory log for diagnostics; never persisted and
/// never consulted for correctness.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub timestamp: String,
    pub kind: PresenceKind,
    pub user_id: String,
}

impl PresenceEvent {
    pub fn now(kind: PresenceKind, user_id: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            kind,
            user_id: user_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&PresenceKind::Online).unwrap(), "\"online\"");
        assert_eq!(serde_json::to_string(&PresenceKind::Offline).unwrap(), "\"offline\"");
        assert_eq!(PresenceKind::Online.to_string(), "online");
    }

    #[test]
    fn event_wire_shape() {
        let evt = PresenceEvent::now(PresenceKind::Online, "appA:alice");
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["kind"], "online");
        assert_eq!(json["userId"], "appA:alice");
        assert!(json["timestamp"].is_string());
    }
}
