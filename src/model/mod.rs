//! Remote objects mirrored by the cache
//!
//! Only the fields the client reads are modelled; serde ignores the rest.

mod channel;
mod guild;
mod id;
mod member;
mod message;
mod role;
mod user;

pub use channel::{Channel, ChannelOwner, ChannelType};
pub use guild::{Guild, GuildCreate, UnavailableGuild};
pub use id::Id;
pub use member::{Member, VoiceState};
pub use message::Message;
pub use role::Role;
pub use user::User;
