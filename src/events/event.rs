//! Typed gateway events
//!
//! Decoding also normalizes payloads: child objects that arrive without
//! their owning guild id (members and roles inside `GUILD_CREATE`, etc.) get
//! it filled in, so handlers and the cache see complete entities.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::GatewayError;
use crate::model::{
    Channel, Guild, GuildCreate, Id, Member, Message, Role, UnavailableGuild, User, VoiceState,
};
use crate::protocol::ReadyPayload;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MemberRemove {
    pub guild_id: Id,
    pub user: User,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MembersChunk {
    pub guild_id: Id,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub chunk_index: u32,
    #[serde(default)]
    pub chunk_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoleEvent {
    pub guild_id: Id,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RoleDelete {
    pub guild_id: Id,
    pub role_id: Id,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct MessageDelete {
    pub id: Id,
    pub channel_id: Id,
    #[serde(default)]
    pub guild_id: Option<Id>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageDeleteBulk {
    pub ids: Vec<Id>,
    pub channel_id: Id,
    #[serde(default)]
    pub guild_id: Option<Id>,
}

#[derive(Debug, Clone)]
pub enum Event {
    Ready(Box<ReadyPayload>),
    Resumed,
    GuildCreate(Box<GuildCreate>),
    GuildUpdate(Guild),
    GuildDelete(UnavailableGuild),
    MemberAdd(Box<Member>),
    MemberUpdate(Box<Member>),
    MemberRemove(MemberRemove),
    MembersChunk(MembersChunk),
    RoleCreate(RoleEvent),
    RoleUpdate(RoleEvent),
    RoleDelete(RoleDelete),
    ChannelCreate(Channel),
    ChannelUpdate(Channel),
    ChannelDelete(Channel),
    MessageCreate(Box<Message>),
    MessageUpdate(Box<Message>),
    MessageDelete(MessageDelete),
    MessageDeleteBulk(MessageDeleteBulk),
    VoiceStateUpdate(VoiceState),
    UserUpdate(User),
    /// Anything the client does not model; handlers still receive it
    Unknown { name: String, data: Value },
}

fn parse<T: DeserializeOwned>(event_type: &str, data: Value) -> Result<T, GatewayError> {
    serde_json::from_value(data).map_err(|e| GatewayError::decode(event_type, e))
}

impl Event {
    /// Decode the `d` field of a dispatch with the given `t`.
    pub fn decode(event_type: &str, data: Value) -> Result<Self, GatewayError> {
        let event = match event_type {
            "READY" => Self::Ready(Box::new(parse(event_type, data)?)),
            "RESUMED" => Self::Resumed,
            "GUILD_CREATE" => {
                let mut guild: GuildCreate = parse(event_type, data)?;
                let guild_id = guild.guild.id;

                for member in &mut guild.members {
                    member.guild_id = guild_id;
                }
                for channel in guild.channels.iter_mut().chain(guild.threads.iter_mut()) {
                    channel.guild_id = Some(guild_id);
                }
                for role in &mut guild.roles {
                    role.guild_id = guild_id;
                }
                for state in &mut guild.voice_states {
                    state.guild_id = Some(guild_id);
                }

                Self::GuildCreate(Box::new(guild))
            }
            "GUILD_UPDATE" => Self::GuildUpdate(parse(event_type, data)?),
            "GUILD_DELETE" => Self::GuildDelete(parse(event_type, data)?),
            "GUILD_MEMBER_ADD" => Self::MemberAdd(Box::new(parse(event_type, data)?)),
            "GUILD_MEMBER_UPDATE" => Self::MemberUpdate(Box::new(parse(event_type, data)?)),
            "GUILD_MEMBER_REMOVE" => Self::MemberRemove(parse(event_type, data)?),
            "GUILD_MEMBERS_CHUNK" => {
                let mut chunk: MembersChunk = parse(event_type, data)?;
                for member in &mut chunk.members {
                    member.guild_id = chunk.guild_id;
                }
                Self::MembersChunk(chunk)
            }
            "GUILD_ROLE_CREATE" | "GUILD_ROLE_UPDATE" => {
                let mut update: RoleEvent = parse(event_type, data)?;
                update.role.guild_id = update.guild_id;

                if event_type == "GUILD_ROLE_CREATE" {
                    Self::RoleCreate(update)
                } else {
                    Self::RoleUpdate(update)
                }
            }
            "GUILD_ROLE_DELETE" => Self::RoleDelete(parse(event_type, data)?),
            "CHANNEL_CREATE" => Self::ChannelCreate(parse(event_type, data)?),
            "CHANNEL_UPDATE" => Self::ChannelUpdate(parse(event_type, data)?),
            "CHANNEL_DELETE" => Self::ChannelDelete(parse(event_type, data)?),
            "MESSAGE_CREATE" => Self::MessageCreate(Box::new(parse(event_type, data)?)),
            "MESSAGE_UPDATE" => Self::MessageUpdate(Box::new(parse(event_type, data)?)),
            "MESSAGE_DELETE" => Self::MessageDelete(parse(event_type, data)?),
            "MESSAGE_DELETE_BULK" => Self::MessageDeleteBulk(parse(event_type, data)?),
            "VOICE_STATE_UPDATE" => Self::VoiceStateUpdate(parse(event_type, data)?),
            "USER_UPDATE" => Self::UserUpdate(parse(event_type, data)?),
            _ => Self::Unknown {
                name: event_type.to_owned(),
                data,
            },
        };

        Ok(event)
    }

    /// The dispatch name (`t`) this event was decoded from
    pub fn name(&self) -> &str {
        match self {
            Self::Ready(_) => "READY",
            Self::Resumed => "RESUMED",
            Self::GuildCreate(_) => "GUILD_CREATE",
            Self::GuildUpdate(_) => "GUILD_UPDATE",
            Self::GuildDelete(_) => "GUILD_DELETE",
            Self::MemberAdd(_) => "GUILD_MEMBER_ADD",
            Self::MemberUpdate(_) => "GUILD_MEMBER_UPDATE",
            Self::MemberRemove(_) => "GUILD_MEMBER_REMOVE",
            Self::MembersChunk(_) => "GUILD_MEMBERS_CHUNK",
            Self::RoleCreate(_) => "GUILD_ROLE_CREATE",
            Self::RoleUpdate(_) => "GUILD_ROLE_UPDATE",
            Self::RoleDelete(_) => "GUILD_ROLE_DELETE",
            Self::ChannelCreate(_) => "CHANNEL_CREATE",
            Self::ChannelUpdate(_) => "CHANNEL_UPDATE",
            Self::ChannelDelete(_) => "CHANNEL_DELETE",
            Self::MessageCreate(_) => "MESSAGE_CREATE",
            Self::MessageUpdate(_) => "MESSAGE_UPDATE",
            Self::MessageDelete(_) => "MESSAGE_DELETE",
            Self::MessageDeleteBulk(_) => "MESSAGE_DELETE_BULK",
            Self::VoiceStateUpdate(_) => "VOICE_STATE_UPDATE",
            Self::UserUpdate(_) => "USER_UPDATE",
            Self::Unknown { name, .. } => name,
        }
    }

    /// Guild the event concerns, if any
    pub fn guild_id(&self) -> Option<Id> {
        match self {
            Self::GuildCreate(guild) => Some(guild.guild.id),
            Self::GuildUpdate(guild) => Some(guild.id),
            Self::GuildDelete(guild) => Some(guild.id),
            Self::MemberAdd(member) | Self::MemberUpdate(member) => Some(member.guild_id),
            Self::MemberRemove(remove) => Some(remove.guild_id),
            Self::MembersChunk(chunk) => Some(chunk.guild_id),
            Self::RoleCreate(update) | Self::RoleUpdate(update) => Some(update.guild_id),
            Self::RoleDelete(delete) => Some(delete.guild_id),
            Self::ChannelCreate(channel)
            | Self::ChannelUpdate(channel)
            | Self::ChannelDelete(channel) => channel.guild_id,
            Self::MessageCreate(message) | Self::MessageUpdate(message) => message.guild_id,
            Self::MessageDelete(delete) => delete.guild_id,
            Self::MessageDeleteBulk(delete) => delete.guild_id,
            Self::VoiceStateUpdate(state) => state.guild_id,
            Self::Ready(_) | Self::Resumed | Self::UserUpdate(_) | Self::Unknown { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn guild_create_fills_guild_ids() {
        let event = Event::decode(
            "GUILD_CREATE",
            json!({
                "id": "10",
                "name": "guild",
                "members": [{ "user": { "id": "1", "username": "a" }, "roles": [] }],
                "channels": [{ "id": "2", "type": 0, "name": "general" }],
                "roles": [{ "id": "3", "name": "@everyone" }],
                "voice_states": [{ "user_id": "1", "channel_id": "4", "session_id": "s" }]
            }),
        )
        .unwrap();

        let Event::GuildCreate(guild) = event else {
            panic!("expected GuildCreate");
        };
        assert_eq!(guild.guild.name, "guild");
        assert_eq!(guild.members[0].guild_id, Id::new(10));
        assert_eq!(guild.channels[0].guild_id, Some(Id::new(10)));
        assert_eq!(guild.roles[0].guild_id, Id::new(10));
        assert_eq!(guild.voice_states[0].guild_id, Some(Id::new(10)));
    }

    #[test]
    fn role_update_carries_envelope_guild() {
        let event = Event::decode(
            "GUILD_ROLE_UPDATE",
            json!({ "guild_id": "10", "role": { "id": "3", "name": "mod" } }),
        )
        .unwrap();

        let Event::RoleUpdate(update) = event else {
            panic!("expected RoleUpdate");
        };
        assert_eq!(update.role.guild_id, Id::new(10));
    }

    #[test]
    fn unknown_event_keeps_raw_data() {
        let event = Event::decode("TYPING_START", json!({ "user_id": "1" })).unwrap();
        assert_eq!(event.name(), "TYPING_START");
        assert!(matches!(event, Event::Unknown { ref data, .. } if data["user_id"] == "1"));
    }

    #[test]
    fn malformed_known_event_is_decode_error() {
        let err = Event::decode("GUILD_MEMBER_ADD", json!({ "nick": 5 })).unwrap_err();
        assert!(err.to_string().contains("GUILD_MEMBER_ADD"));
    }

    #[test]
    fn resumed_ignores_payload() {
        let event = Event::decode("RESUMED", Value::Null).unwrap();
        assert!(matches!(event, Event::Resumed));
        assert_eq!(event.guild_id(), None);
    }
}
