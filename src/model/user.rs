use serde::{Deserialize, Serialize};

use super::Id;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Id,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub discriminator: Option<String>,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

impl User {
    /// Minimal user carrying only an id, as found in partial payloads.
    pub fn from_id(id: Id) -> Self {
        Self {
            id,
            username: String::new(),
            discriminator: None,
            global_name: None,
            avatar: None,
            bot: false,
        }
    }
}
