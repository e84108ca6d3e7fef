use serde::{Deserialize, Serialize};

use super::{Channel, Id, Member, Role, VoiceState};

/// Guild as stored in the cache, without its embedded child collections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guild {
    pub id: Id,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner_id: Option<Id>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub member_count: Option<u64>,
    #[serde(default)]
    pub unavailable: bool,
}

/// `GUILD_CREATE` body: the guild plus everything the gateway sends along
/// with it on first sight.
#[derive(Debug, Clone, Deserialize)]
pub struct GuildCreate {
    #[serde(flatten)]
    pub guild: Guild,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub threads: Vec<Channel>,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub voice_states: Vec<VoiceState>,
}

/// `GUILD_DELETE` body and the guild stubs listed in `READY`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UnavailableGuild {
    pub id: Id,
    #[serde(default)]
    pub unavailable: bool,
}
