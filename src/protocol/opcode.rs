//! Gateway operation codes

use serde::{Deserialize, Serialize};

/// Op codes of the gateway envelope the client understands
///
/// Anything else on the wire fails to decode and the frame is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum OpCode {
    /// Event dispatched to the client (inbound)
    Dispatch = 0,
    /// Liveness ping; sent periodically, or requested by the server
    Heartbeat = 1,
    /// Start a new session (outbound)
    Identify = 2,
    /// Reattach to an existing session (outbound)
    Resume = 6,
    /// Server asks the client to reconnect and resume (inbound)
    Reconnect = 7,
    /// Session is invalid; `d` says whether it may be resumed (inbound)
    InvalidSession = 9,
    /// First message on every connection, carries the heartbeat interval
    Hello = 10,
    /// Acknowledges a heartbeat (inbound)
    HeartbeatAck = 11,
}

impl OpCode {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dispatch => "Dispatch",
            Self::Heartbeat => "Heartbeat",
            Self::Identify => "Identify",
            Self::Resume => "Resume",
            Self::Reconnect => "Reconnect",
            Self::InvalidSession => "InvalidSession",
            Self::Hello => "Hello",
            Self::HeartbeatAck => "HeartbeatAck",
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Dispatch),
            1 => Ok(Self::Heartbeat),
            2 => Ok(Self::Identify),
            6 => Ok(Self::Resume),
            7 => Ok(Self::Reconnect),
            9 => Ok(Self::InvalidSession),
            10 => Ok(Self::Hello),
            11 => Ok(Self::HeartbeatAck),
            other => Err(format!("unsupported opcode {other}")),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op as u8
    }
}
