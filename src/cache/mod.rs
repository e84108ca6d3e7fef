//! In-memory mirror of the remote object graph
//!
//! Every entity kind lives in its own [`ShardedStore`]. Child collections of a
//! guild (members, channels, roles, voice states) are additionally tracked in
//! a [`ShardedIndex`] keyed by guild id, so "all members of guild X" does not
//! need a scan.
//!
//! The primary write and its index write are two separate segment locks. A
//! concurrent reader can briefly see an entity that is not yet (or no longer)
//! listed under its guild.
//!
//! Writes for a category that is disabled in [`CacheFlags`] are dropped, and
//! reads for it report nothing, even if entries were stored while it was
//! still enabled. Entries are never evicted; they live until deleted.

mod flags;
mod index;
mod store;

pub use flags::CacheFlags;
pub use index::ShardedIndex;
pub use store::{ShardedStore, DEFAULT_SEGMENTS};

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::model::{Channel, ChannelOwner, Guild, Id, Member, Message, Role, User, VoiceState};

/// Entry counts per entity kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub users: usize,
    pub guilds: usize,
    pub members: usize,
    pub channels: usize,
    pub messages: usize,
    pub roles: usize,
    pub voice_states: usize,
}

pub struct Cache {
    flags: AtomicU32,
    users: ShardedStore<Id, User>,
    guilds: ShardedStore<Id, Guild>,
    members: ShardedStore<(Id, Id), Member>,
    channels: ShardedStore<Id, Channel>,
    messages: ShardedStore<Id, Message>,
    roles: ShardedStore<Id, Role>,
    voice_states: ShardedStore<(Id, Id), VoiceState>,
    guild_members: ShardedIndex<Id, Id>,
    guild_channels: ShardedIndex<Id, Id>,
    guild_roles: ShardedIndex<Id, Id>,
    guild_voice_states: ShardedIndex<Id, Id>,
}

impl Cache {
    pub fn new(flags: CacheFlags) -> Self {
        Self::with_segments(flags, DEFAULT_SEGMENTS)
    }

    pub fn with_segments(flags: CacheFlags, segments: usize) -> Self {
        Self {
            flags: AtomicU32::new(flags.bits()),
            users: ShardedStore::new(segments),
            guilds: ShardedStore::new(segments),
            members: ShardedStore::new(segments),
            channels: ShardedStore::new(segments),
            messages: ShardedStore::new(segments),
            roles: ShardedStore::new(segments),
            voice_states: ShardedStore::new(segments),
            guild_members: ShardedIndex::new(segments),
            guild_channels: ShardedIndex::new(segments),
            guild_roles: ShardedIndex::new(segments),
            guild_voice_states: ShardedIndex::new(segments),
        }
    }

    // --- flags ---

    pub fn flags(&self) -> CacheFlags {
        CacheFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Replace the enabled categories. Applies to subsequent operations only;
    /// nothing already stored is purged.
    pub fn set_flags(&self, flags: CacheFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub fn enable(&self, flags: CacheFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn disable(&self, flags: CacheFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    #[inline]
    fn enabled(&self, flag: CacheFlags) -> bool {
        self.flags().contains(flag)
    }

    // --- users ---

    pub fn put_user(&self, user: User) {
        if self.enabled(CacheFlags::USERS) {
            self.users.set(user.id, user);
        }
    }

    pub fn get_user(&self, id: Id) -> Option<User> {
        self.enabled(CacheFlags::USERS)
            .then(|| self.users.get(&id))
            .flatten()
    }

    pub fn has_user(&self, id: Id) -> bool {
        self.enabled(CacheFlags::USERS) && self.users.has(&id)
    }

    pub fn del_user(&self, id: Id) -> bool {
        self.enabled(CacheFlags::USERS) && self.users.delete(&id).is_some()
    }

    pub fn user_count(&self) -> usize {
        if self.enabled(CacheFlags::USERS) {
            self.users.len()
        } else {
            0
        }
    }

    // --- guilds ---

    pub fn put_guild(&self, guild: Guild) {
        if self.enabled(CacheFlags::GUILDS) {
            self.guilds.set(guild.id, guild);
        }
    }

    pub fn get_guild(&self, id: Id) -> Option<Guild> {
        self.enabled(CacheFlags::GUILDS)
            .then(|| self.guilds.get(&id))
            .flatten()
    }

    pub fn has_guild(&self, id: Id) -> bool {
        self.enabled(CacheFlags::GUILDS) && self.guilds.has(&id)
    }

    /// Removes only the guild entry itself; see [`Cache::purge_guild`].
    pub fn del_guild(&self, id: Id) -> bool {
        self.enabled(CacheFlags::GUILDS) && self.guilds.delete(&id).is_some()
    }

    pub fn guild_count(&self) -> usize {
        if self.enabled(CacheFlags::GUILDS) {
            self.guilds.len()
        } else {
            0
        }
    }

    /// Remove a guild together with every member, channel, role and voice
    /// state listed under it. Returns whether the guild entry was present.
    pub fn purge_guild(&self, id: Id) -> bool {
        self.del_guild_members(id);
        self.del_guild_channels(id);
        self.del_guild_roles(id);
        self.del_guild_voice_states(id);

        self.del_guild(id)
    }

    // --- members ---

    pub fn put_member(&self, member: Member) {
        if !self.enabled(CacheFlags::MEMBERS) {
            return;
        }

        let (guild_id, user_id) = member.key();
        self.members.set((guild_id, user_id), member);
        self.guild_members.add(guild_id, user_id);
    }

    pub fn get_member(&self, guild_id: Id, user_id: Id) -> Option<Member> {
        self.enabled(CacheFlags::MEMBERS)
            .then(|| self.members.get(&(guild_id, user_id)))
            .flatten()
    }

    pub fn has_member(&self, guild_id: Id, user_id: Id) -> bool {
        self.enabled(CacheFlags::MEMBERS) && self.members.has(&(guild_id, user_id))
    }

    pub fn del_member(&self, guild_id: Id, user_id: Id) -> bool {
        if !self.enabled(CacheFlags::MEMBERS) {
            return false;
        }

        let removed = self.members.delete(&(guild_id, user_id)).is_some();
        self.guild_members.remove(&guild_id, &user_id);

        removed
    }

    pub fn member_count(&self) -> usize {
        if self.enabled(CacheFlags::MEMBERS) {
            self.members.len()
        } else {
            0
        }
    }

    /// Members of one guild keyed by user id
    pub fn get_guild_members(&self, guild_id: Id) -> Option<HashMap<Id, Member>> {
        if !self.enabled(CacheFlags::MEMBERS) {
            return None;
        }

        let user_ids = self.guild_members.get(&guild_id)?;

        let members = user_ids
            .into_iter()
            .filter_map(|user_id| {
                self.members
                    .get(&(guild_id, user_id))
                    .map(|member| (user_id, member))
            })
            .collect();

        Some(members)
    }

    /// Drop every member of the guild. Returns whether the guild had any.
    pub fn del_guild_members(&self, guild_id: Id) -> bool {
        if !self.enabled(CacheFlags::MEMBERS) {
            return false;
        }

        let Some(user_ids) = self.guild_members.delete(&guild_id) else {
            return false;
        };

        for user_id in user_ids {
            self.members.delete(&(guild_id, user_id));
        }

        true
    }

    pub fn guild_member_count(&self, guild_id: Id) -> usize {
        if self.enabled(CacheFlags::MEMBERS) {
            self.guild_members.count(&guild_id)
        } else {
            0
        }
    }

    // --- channels ---

    pub fn put_channel(&self, channel: Channel) {
        if !self.enabled(CacheFlags::CHANNELS) {
            return;
        }

        let id = channel.id;
        let owner = channel.owner();
        let previous = self.channels.set(id, channel);

        // a channel moved between owners must not stay listed under the old one
        if let Some(ChannelOwner::Guild(old_guild)) = previous.map(|channel| channel.owner()) {
            if owner != ChannelOwner::Guild(old_guild) {
                self.guild_channels.remove(&old_guild, &id);
            }
        }

        if let ChannelOwner::Guild(guild_id) = owner {
            self.guild_channels.add(guild_id, id);
        }
    }

    pub fn get_channel(&self, id: Id) -> Option<Channel> {
        self.enabled(CacheFlags::CHANNELS)
            .then(|| self.channels.get(&id))
            .flatten()
    }

    pub fn has_channel(&self, id: Id) -> bool {
        self.enabled(CacheFlags::CHANNELS) && self.channels.has(&id)
    }

    pub fn del_channel(&self, id: Id) -> bool {
        if !self.enabled(CacheFlags::CHANNELS) {
            return false;
        }

        let Some(channel) = self.channels.delete(&id) else {
            return false;
        };

        if let ChannelOwner::Guild(guild_id) = channel.owner() {
            self.guild_channels.remove(&guild_id, &id);
        }

        true
    }

    pub fn channel_count(&self) -> usize {
        if self.enabled(CacheFlags::CHANNELS) {
            self.channels.len()
        } else {
            0
        }
    }

    pub fn get_guild_channels(&self, guild_id: Id) -> Option<HashMap<Id, Channel>> {
        if !self.enabled(CacheFlags::CHANNELS) {
            return None;
        }

        let channel_ids = self.guild_channels.get(&guild_id)?;

        let channels = channel_ids
            .into_iter()
            .filter_map(|id| self.channels.get(&id).map(|channel| (id, channel)))
            .collect();

        Some(channels)
    }

    pub fn del_guild_channels(&self, guild_id: Id) -> bool {
        if !self.enabled(CacheFlags::CHANNELS) {
            return false;
        }

        let Some(channel_ids) = self.guild_channels.delete(&guild_id) else {
            return false;
        };

        for id in channel_ids {
            self.channels.delete(&id);
        }

        true
    }

    pub fn guild_channel_count(&self, guild_id: Id) -> usize {
        if self.enabled(CacheFlags::CHANNELS) {
            self.guild_channels.count(&guild_id)
        } else {
            0
        }
    }

    // --- messages ---

    pub fn put_message(&self, message: Message) {
        if self.enabled(CacheFlags::MESSAGES) {
            self.messages.set(message.id, message);
        }
    }

    pub fn get_message(&self, id: Id) -> Option<Message> {
        self.enabled(CacheFlags::MESSAGES)
            .then(|| self.messages.get(&id))
            .flatten()
    }

    pub fn has_message(&self, id: Id) -> bool {
        self.enabled(CacheFlags::MESSAGES) && self.messages.has(&id)
    }

    pub fn del_message(&self, id: Id) -> bool {
        self.enabled(CacheFlags::MESSAGES) && self.messages.delete(&id).is_some()
    }

    pub fn message_count(&self) -> usize {
        if self.enabled(CacheFlags::MESSAGES) {
            self.messages.len()
        } else {
            0
        }
    }

    // --- roles ---

    /// Store a role under `role.guild_id`. Roles without an owning guild are
    /// kept in the primary map but not indexed.
    pub fn put_role(&self, role: Role) {
        if !self.enabled(CacheFlags::ROLES) {
            return;
        }

        let (id, guild_id) = (role.id, role.guild_id);
        let previous = self.roles.set(id, role);

        if let Some(old_guild) = previous.map(|role| role.guild_id) {
            if old_guild != guild_id && !old_guild.is_zero() {
                self.guild_roles.remove(&old_guild, &id);
            }
        }

        if !guild_id.is_zero() {
            self.guild_roles.add(guild_id, id);
        }
    }

    pub fn get_role(&self, id: Id) -> Option<Role> {
        self.enabled(CacheFlags::ROLES)
            .then(|| self.roles.get(&id))
            .flatten()
    }

    pub fn has_role(&self, id: Id) -> bool {
        self.enabled(CacheFlags::ROLES) && self.roles.has(&id)
    }

    pub fn del_role(&self, id: Id) -> bool {
        if !self.enabled(CacheFlags::ROLES) {
            return false;
        }

        let Some(role) = self.roles.delete(&id) else {
            return false;
        };

        self.guild_roles.remove(&role.guild_id, &id);

        true
    }

    pub fn role_count(&self) -> usize {
        if self.enabled(CacheFlags::ROLES) {
            self.roles.len()
        } else {
            0
        }
    }

    pub fn get_guild_roles(&self, guild_id: Id) -> Option<HashMap<Id, Role>> {
        if !self.enabled(CacheFlags::ROLES) {
            return None;
        }

        let role_ids = self.guild_roles.get(&guild_id)?;

        let roles = role_ids
            .into_iter()
            .filter_map(|id| self.roles.get(&id).map(|role| (id, role)))
            .collect();

        Some(roles)
    }

    pub fn del_guild_roles(&self, guild_id: Id) -> bool {
        if !self.enabled(CacheFlags::ROLES) {
            return false;
        }

        let Some(role_ids) = self.guild_roles.delete(&guild_id) else {
            return false;
        };

        for id in role_ids {
            self.roles.delete(&id);
        }

        true
    }

    pub fn guild_role_count(&self, guild_id: Id) -> usize {
        if self.enabled(CacheFlags::ROLES) {
            self.guild_roles.count(&guild_id)
        } else {
            0
        }
    }

    // --- voice states ---

    /// Voice states outside a guild are not cached.
    pub fn put_voice_state(&self, state: VoiceState) {
        if !self.enabled(CacheFlags::VOICE_STATES) {
            return;
        }

        let Some(guild_id) = state.guild_id else {
            return;
        };

        let user_id = state.user_id;
        self.voice_states.set((guild_id, user_id), state);
        self.guild_voice_states.add(guild_id, user_id);
    }

    pub fn get_voice_state(&self, guild_id: Id, user_id: Id) -> Option<VoiceState> {
        self.enabled(CacheFlags::VOICE_STATES)
            .then(|| self.voice_states.get(&(guild_id, user_id)))
            .flatten()
    }

    pub fn has_voice_state(&self, guild_id: Id, user_id: Id) -> bool {
        self.enabled(CacheFlags::VOICE_STATES) && self.voice_states.has(&(guild_id, user_id))
    }

    pub fn del_voice_state(&self, guild_id: Id, user_id: Id) -> bool {
        if !self.enabled(CacheFlags::VOICE_STATES) {
            return false;
        }

        let removed = self.voice_states.delete(&(guild_id, user_id)).is_some();
        self.guild_voice_states.remove(&guild_id, &user_id);

        removed
    }

    pub fn voice_state_count(&self) -> usize {
        if self.enabled(CacheFlags::VOICE_STATES) {
            self.voice_states.len()
        } else {
            0
        }
    }

    /// Voice states of one guild keyed by user id
    pub fn get_guild_voice_states(&self, guild_id: Id) -> Option<HashMap<Id, VoiceState>> {
        if !self.enabled(CacheFlags::VOICE_STATES) {
            return None;
        }

        let user_ids = self.guild_voice_states.get(&guild_id)?;

        let states = user_ids
            .into_iter()
            .filter_map(|user_id| {
                self.voice_states
                    .get(&(guild_id, user_id))
                    .map(|state| (user_id, state))
            })
            .collect();

        Some(states)
    }

    pub fn del_guild_voice_states(&self, guild_id: Id) -> bool {
        if !self.enabled(CacheFlags::VOICE_STATES) {
            return false;
        }

        let Some(user_ids) = self.guild_voice_states.delete(&guild_id) else {
            return false;
        };

        for user_id in user_ids {
            self.voice_states.delete(&(guild_id, user_id));
        }

        true
    }

    pub fn guild_voice_state_count(&self, guild_id: Id) -> usize {
        if self.enabled(CacheFlags::VOICE_STATES) {
            self.guild_voice_states.count(&guild_id)
        } else {
            0
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            users: self.user_count(),
            guilds: self.guild_count(),
            members: self.member_count(),
            channels: self.channel_count(),
            messages: self.message_count(),
            roles: self.role_count(),
            voice_states: self.voice_state_count(),
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(CacheFlags::all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChannelType;

    fn user(id: u64) -> User {
        User {
            username: format!("user{id}"),
            ..User::from_id(Id::new(id))
        }
    }

    fn member(guild_id: u64, user_id: u64) -> Member {
        Member {
            guild_id: Id::new(guild_id),
            user: user(user_id),
            nick: None,
            roles: Vec::new(),
            joined_at: None,
            deaf: false,
            mute: false,
            pending: false,
        }
    }

    fn channel(id: u64, kind: ChannelType, guild_id: Option<u64>) -> Channel {
        Channel {
            id: Id::new(id),
            kind,
            guild_id: guild_id.map(Id::new),
            name: None,
            position: None,
            parent_id: None,
            topic: None,
            last_message_id: None,
        }
    }

    fn role(id: u64, guild_id: u64) -> Role {
        Role {
            id: Id::new(id),
            guild_id: Id::new(guild_id),
            name: format!("role{id}"),
            color: 0,
            position: 0,
            permissions: "0".to_string(),
            hoist: false,
            managed: false,
            mentionable: false,
        }
    }

    fn voice_state(guild_id: u64, user_id: u64) -> VoiceState {
        VoiceState {
            guild_id: Some(Id::new(guild_id)),
            channel_id: Some(Id::new(500)),
            user_id: Id::new(user_id),
            session_id: "voice".to_string(),
            deaf: false,
            mute: false,
            self_deaf: false,
            self_mute: false,
        }
    }

    #[test]
    fn user_member_cascade_scenario() {
        let cache = Cache::default();

        cache.put_user(user(1));
        assert_eq!(cache.get_user(Id::new(1)), Some(user(1)));

        cache.put_member(member(10, 1));
        let members = cache.get_guild_members(Id::new(10)).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members.get(&Id::new(1)), Some(&member(10, 1)));

        assert!(cache.del_guild_members(Id::new(10)));
        assert!(cache.get_guild_members(Id::new(10)).is_none());
        assert!(cache.get_member(Id::new(10), Id::new(1)).is_none());
        assert!(!cache.del_guild_members(Id::new(10)));

        // the user entity is independent of its memberships
        assert!(cache.has_user(Id::new(1)));
    }

    #[test]
    fn put_replaces_wholesale() {
        let cache = Cache::default();
        let mut first = member(10, 1);
        first.nick = Some("old".to_string());
        first.roles = vec![Id::new(3)];
        cache.put_member(first);

        cache.put_member(member(10, 1));
        let stored = cache.get_member(Id::new(10), Id::new(1)).unwrap();
        assert_eq!(stored.nick, None);
        assert!(stored.roles.is_empty());
        assert_eq!(cache.guild_member_count(Id::new(10)), 1);
    }

    #[test]
    fn member_index_tracks_single_deletes() {
        let cache = Cache::default();
        cache.put_member(member(10, 1));
        cache.put_member(member(10, 2));
        cache.put_member(member(11, 1));

        assert!(cache.del_member(Id::new(10), Id::new(1)));
        assert_eq!(cache.guild_member_count(Id::new(10)), 1);
        assert!(cache.has_member(Id::new(11), Id::new(1)));

        assert!(cache.del_member(Id::new(10), Id::new(2)));
        assert!(cache.get_guild_members(Id::new(10)).is_none());
        assert!(!cache.del_member(Id::new(10), Id::new(2)));
    }

    #[test]
    fn disabled_category_drops_writes_and_hides_reads() {
        let cache = Cache::new(CacheFlags::all() - CacheFlags::USERS);

        cache.put_user(user(1));
        assert!(cache.get_user(Id::new(1)).is_none());
        assert!(!cache.has_user(Id::new(1)));

        cache.enable(CacheFlags::USERS);
        assert!(cache.get_user(Id::new(1)).is_none(), "write while disabled was kept");

        cache.put_user(user(1));
        assert!(cache.has_user(Id::new(1)));

        // hidden, not purged
        cache.disable(CacheFlags::USERS);
        assert!(cache.get_user(Id::new(1)).is_none());
        assert_eq!(cache.user_count(), 0);

        cache.set_flags(CacheFlags::all());
        assert_eq!(cache.get_user(Id::new(1)), Some(user(1)));
    }

    #[test]
    fn disabled_members_hide_guild_lookups() {
        let cache = Cache::default();
        cache.put_member(member(10, 1));

        cache.disable(CacheFlags::MEMBERS);
        assert!(cache.get_guild_members(Id::new(10)).is_none());
        assert!(!cache.del_guild_members(Id::new(10)));
        assert_eq!(cache.guild_member_count(Id::new(10)), 0);

        cache.enable(CacheFlags::MEMBERS);
        assert_eq!(cache.guild_member_count(Id::new(10)), 1);
    }

    #[test]
    fn only_guild_channels_are_indexed() {
        let cache = Cache::default();
        cache.put_channel(channel(1, ChannelType::GuildText, Some(10)));
        cache.put_channel(channel(2, ChannelType::GuildVoice, Some(10)));
        cache.put_channel(channel(3, ChannelType::Dm, None));

        assert_eq!(cache.guild_channel_count(Id::new(10)), 2);
        assert!(cache.has_channel(Id::new(3)));

        assert!(cache.del_channel(Id::new(1)));
        assert_eq!(cache.guild_channel_count(Id::new(10)), 1);

        assert!(cache.del_guild_channels(Id::new(10)));
        assert!(!cache.has_channel(Id::new(2)));
        assert!(cache.has_channel(Id::new(3)));
    }

    #[test]
    fn channel_moving_guilds_is_reindexed() {
        let cache = Cache::default();
        cache.put_channel(channel(1, ChannelType::GuildText, Some(10)));
        cache.put_channel(channel(1, ChannelType::GuildText, Some(11)));

        assert!(cache.get_guild_channels(Id::new(10)).is_none());
        assert_eq!(cache.guild_channel_count(Id::new(11)), 1);
    }

    #[test]
    fn roles_are_indexed_by_owning_guild() {
        let cache = Cache::default();
        cache.put_role(role(1, 10));
        cache.put_role(role(2, 10));

        let roles = cache.get_guild_roles(Id::new(10)).unwrap();
        assert_eq!(roles.len(), 2);

        assert!(cache.del_role(Id::new(1)));
        assert_eq!(cache.guild_role_count(Id::new(10)), 1);
        assert!(!cache.del_role(Id::new(1)));
    }

    #[test]
    fn moving_a_role_reindexes_it() {
        let cache = Cache::default();
        cache.put_role(role(1, 10));
        cache.put_role(role(1, 20));

        assert_eq!(cache.guild_role_count(Id::new(10)), 0);
        assert_eq!(cache.guild_role_count(Id::new(20)), 1);

        // The old guild's cascade must not reach the moved role
        cache.del_guild_roles(Id::new(10));
        assert!(cache.has_role(Id::new(1)));
        assert_eq!(cache.get_role(Id::new(1)).unwrap().guild_id, Id::new(20));
    }

    #[test]
    fn voice_states_without_guild_are_ignored() {
        let cache = Cache::default();
        let mut state = voice_state(10, 1);
        state.guild_id = None;
        cache.put_voice_state(state);
        assert_eq!(cache.voice_state_count(), 0);

        cache.put_voice_state(voice_state(10, 1));
        assert!(cache.has_voice_state(Id::new(10), Id::new(1)));
        assert_eq!(cache.get_guild_voice_states(Id::new(10)).unwrap().len(), 1);

        assert!(cache.del_voice_state(Id::new(10), Id::new(1)));
        assert!(cache.get_guild_voice_states(Id::new(10)).is_none());
    }

    #[test]
    fn purge_guild_cascades_to_children() {
        let cache = Cache::default();
        cache.put_guild(Guild {
            id: Id::new(10),
            name: "guild".to_string(),
            owner_id: None,
            icon: None,
            member_count: Some(1),
            unavailable: false,
        });
        cache.put_member(member(10, 1));
        cache.put_channel(channel(2, ChannelType::GuildText, Some(10)));
        cache.put_role(role(3, 10));
        cache.put_voice_state(voice_state(10, 1));

        assert!(cache.purge_guild(Id::new(10)));

        assert_eq!(cache.stats(), CacheStats::default());
        assert!(!cache.purge_guild(Id::new(10)));
    }
}
