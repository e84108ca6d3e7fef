//! Gateway wire protocol
//!
//! JSON envelopes `{op, d, s, t}` over a text WebSocket.

mod close_code;
mod intents;
mod opcode;
mod payload;

pub use close_code::CloseCode;
pub use intents::Intents;
pub use opcode::OpCode;
pub use payload::{
    heartbeat, ConnectionProperties, GatewayPayload, HelloPayload, IdentifyPayload, ReadyPayload,
    ResumePayload, API_VERSION, LARGE_THRESHOLD,
};
