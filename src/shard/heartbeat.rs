use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

use super::session::LiveSession;
use crate::protocol;

/// Raised by a connection's helper tasks; ends the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionSignal {
    /// The previous heartbeat was never acknowledged
    Zombie,
    /// The transport rejected a write
    WriteFailed,
}

impl ConnectionSignal {
    pub(crate) fn reason(&self) -> &'static str {
        match self {
            ConnectionSignal::Zombie => "zombie",
            ConnectionSignal::WriteFailed => "write_failed",
        }
    }
}

/// Sends a heartbeat every `period`. Before each one, checks that the last was
/// acknowledged; if not, raises [`ConnectionSignal::Zombie`] and stops.
///
/// Runs until it signals, or until the outbound channel closes.
pub(crate) async fn run(
    shard_id: u32,
    period: Duration,
    live: Arc<LiveSession>,
    outbound: mpsc::UnboundedSender<Message>,
    signals: mpsc::UnboundedSender<ConnectionSignal>,
) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if !live.take_ack() {
            warn!(shard_id, "Heartbeat not acknowledged, connection is a zombie");
            let _ = signals.send(ConnectionSignal::Zombie);
            return;
        }

        let frame = match protocol::heartbeat(live.sequence()) {
            Ok(frame) => frame,
            Err(e) => {
                error!(shard_id, error = %e, "Failed to encode heartbeat");
                continue;
            }
        };

        live.heartbeat_sent();
        if outbound.send(Message::Text(frame)).is_err() {
            return;
        }
        debug!(shard_id, sequence = live.sequence(), "Heartbeat sent");
    }
}
