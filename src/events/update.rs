//! Cache mutations driven by dispatch events

use crate::cache::Cache;
use crate::model::Id;

use super::Event;

/// Apply the cache mutation that `event` implies, if any.
pub fn apply(cache: &Cache, event: &Event) {
    match event {
        Event::Ready(ready) => cache.put_user(ready.user.clone()),
        Event::GuildCreate(create) => {
            cache.put_guild(create.guild.clone());

            for channel in create.channels.iter().chain(&create.threads) {
                cache.put_channel(channel.clone());
            }
            for role in &create.roles {
                cache.put_role(role.clone());
            }
            for member in &create.members {
                cache.put_user(member.user.clone());
                cache.put_member(member.clone());
            }
            for state in &create.voice_states {
                cache.put_voice_state(state.clone());
            }
        }
        Event::GuildUpdate(guild) => cache.put_guild(guild.clone()),
        Event::GuildDelete(guild) => {
            cache.purge_guild(guild.id);
        }
        Event::MemberAdd(member) | Event::MemberUpdate(member) => {
            cache.put_user(member.user.clone());
            cache.put_member(member.as_ref().clone());
        }
        Event::MemberRemove(remove) => {
            cache.del_member(remove.guild_id, remove.user.id);
        }
        Event::MembersChunk(chunk) => {
            for member in &chunk.members {
                cache.put_user(member.user.clone());
                cache.put_member(member.clone());
            }
        }
        Event::RoleCreate(update) | Event::RoleUpdate(update) => cache.put_role(update.role.clone()),
        Event::RoleDelete(delete) => {
            cache.del_role(delete.role_id);
        }
        Event::ChannelCreate(channel) | Event::ChannelUpdate(channel) => {
            cache.put_channel(channel.clone());
        }
        Event::ChannelDelete(channel) => {
            cache.del_channel(channel.id);
        }
        Event::MessageCreate(message) => {
            if let Some(author) = &message.author {
                cache.put_user(author.clone());
            }
            cache.put_message(message.as_ref().clone());
        }
        Event::MessageUpdate(message) => cache.put_message(message.as_ref().clone()),
        Event::MessageDelete(delete) => {
            cache.del_message(delete.id);
        }
        Event::MessageDeleteBulk(delete) => {
            for id in &delete.ids {
                cache.del_message(*id);
            }
        }
        Event::VoiceStateUpdate(state) => match (state.guild_id, state.channel_id) {
            (Some(guild_id), None) => {
                cache.del_voice_state(guild_id, state.user_id);
            }
            _ => cache.put_voice_state(state.clone()),
        },
        Event::UserUpdate(user) => cache.put_user(user.clone()),
        Event::Resumed | Event::Unknown { .. } => {}
    }
}

/// Guild the shard started (`true`) or stopped (`false`) serving, if any.
/// An outage (`unavailable`) does not count as leaving.
pub(crate) fn guild_membership_change(event: &Event) -> Option<(Id, bool)> {
    match event {
        Event::GuildCreate(create) => Some((create.guild.id, true)),
        Event::GuildDelete(guild) if !guild.unavailable => Some((guild.id, false)),
        _ => None,
    }
}
