use serde::{Deserialize, Serialize};

/// The durable user a session authenticated as.
///
/// `external_id` is the stable key (the token's subject claim); the display
/// name and avatar may change between connections and are refreshed on
/// every authenticated connect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub external_id: String,
    pub name: String,
    pub avatar_url: Option<String>,
}

impl Identity {
    pub fn new(external_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            name: name.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = Some(avatar_url.into());
        self
    }
}
