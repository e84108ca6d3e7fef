//! Gateway event decoding, cache mirroring and handler fan-out

mod dispatcher;
mod event;
pub(crate) mod update;

pub use dispatcher::{
    EventContext, EventDispatcher, EventHandler, HandlerError, ANY_EVENT,
};
pub use event::{
    Event, MemberRemove, MembersChunk, MessageDelete, MessageDeleteBulk, RoleDelete, RoleEvent,
};
