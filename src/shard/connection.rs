//! Gateway connection state machine
//!
//! One `ShardConnection` per shard. `run` dials the gateway, answers Hello with
//! Identify or Resume, heartbeats, feeds dispatches to the [`EventDispatcher`]
//! and reconnects with backoff whenever the connection is lost. Only
//! [`ShardConnection::shutdown`] stops it.
//!
//! Each physical connection gets its own task set (writer, heartbeat,
//! handshake) and channels. Reconnecting drops the whole set and builds a new
//! one, so nothing from a stale connection can write to the next.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::heartbeat::{self, ConnectionSignal};
use super::ratelimit::IdentifyLimiter;
use super::session::{Handshake, LiveSession, ResumeInfo};
use super::state::{ShardStage, ShardState};
use crate::config::ShardConfig;
use crate::error::GatewayError;
use crate::events::{update, Event, EventDispatcher};
use crate::metrics::GatewayMetrics;
use crate::protocol::{
    self, CloseCode, GatewayPayload, HelloPayload, IdentifyPayload, OpCode, ResumePayload,
    API_VERSION,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long teardown waits for the writer to flush a close frame
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a physical connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Shutdown,
    Reconnect {
        reason: &'static str,
        /// Wait out the backoff delay before dialing again
        backoff: bool,
    },
}

impl Outcome {
    fn failed(reason: &'static str) -> Self {
        Outcome::Reconnect {
            reason,
            backoff: true,
        }
    }
}

/// Background tasks tied to one physical connection. Dropping aborts them.
struct ConnectionTasks {
    writer: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    handshake: Option<JoinHandle<()>>,
}

impl ConnectionTasks {
    fn new(writer: JoinHandle<()>) -> Self {
        Self {
            writer: Some(writer),
            heartbeat: None,
            handshake: None,
        }
    }

    fn replace_heartbeat(&mut self, task: JoinHandle<()>) {
        if let Some(old) = self.heartbeat.replace(task) {
            old.abort();
        }
    }

    fn replace_handshake(&mut self, task: JoinHandle<()>) {
        if let Some(old) = self.handshake.replace(task) {
            old.abort();
        }
    }

    /// Stop everything except the writer, which still has to flush
    fn stop_helpers(&mut self) {
        for task in [self.heartbeat.take(), self.handshake.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

impl Drop for ConnectionTasks {
    fn drop(&mut self) {
        self.stop_helpers();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

/// A single gateway shard
pub struct ShardConnection {
    shard_id: u32,
    total_shards: u32,
    config: Arc<ShardConfig>,
    limiter: Arc<dyn IdentifyLimiter>,
    dispatcher: Arc<EventDispatcher>,
    state: ShardState,
    metrics: Arc<GatewayMetrics>,
    live: Arc<LiveSession>,
    shutdown: watch::Sender<bool>,
}

impl ShardConnection {
    pub fn new(
        shard_id: u32,
        total_shards: u32,
        config: Arc<ShardConfig>,
        limiter: Arc<dyn IdentifyLimiter>,
        dispatcher: Arc<EventDispatcher>,
        state: ShardState,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Self, GatewayError> {
        if shard_id >= total_shards {
            return Err(GatewayError::InvalidShard {
                shard_id,
                total_shards,
            });
        }

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            shard_id,
            total_shards,
            config,
            limiter,
            dispatcher,
            state,
            metrics,
            live: Arc::new(LiveSession::new()),
            shutdown,
        })
    }

    pub fn id(&self) -> u32 {
        self.shard_id
    }

    pub fn total_shards(&self) -> u32 {
        self.total_shards
    }

    /// Last dispatch sequence number seen, 0 before the first
    pub fn sequence(&self) -> u64 {
        self.live.sequence()
    }

    /// Last heartbeat round trip
    pub fn latency(&self) -> Option<Duration> {
        self.live.latency()
    }

    pub fn stage(&self) -> Option<ShardStage> {
        self.state.stage(self.shard_id)
    }

    /// Stop the shard for good. A running `run` closes its connection and
    /// returns; a later `run` returns immediately.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Connect and keep reconnecting until [`shutdown`](Self::shutdown)
    pub async fn run(&self) {
        let shard_id = self.shard_id;
        let mut shutdown = self.shutdown.subscribe();
        let mut session: Option<ResumeInfo> = None;
        let mut backoff = Backoff::new(self.config.reconnect_base, self.config.reconnect_max);

        info!(shard_id, total_shards = self.total_shards, "Shard starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let connected = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.connect(session.as_ref()) => result,
            };

            let outcome = match connected {
                Ok(ws) => {
                    self.drive(ws, &mut session, &mut backoff, &mut shutdown)
                        .await
                }
                Err(e) => {
                    warn!(shard_id, error = %e, "Gateway connection failed");
                    self.metrics.record_error(shard_id, e.error_type_label());
                    Outcome::failed("connect_failed")
                }
            };

            let Outcome::Reconnect { reason, backoff: wait } = outcome else {
                break;
            };

            self.state.set_stage(shard_id, ShardStage::Reconnecting);
            self.state.record_reconnect(shard_id);
            self.metrics.record_reconnect(shard_id, reason);

            if wait {
                let delay = backoff.next_delay();
                info!(
                    shard_id,
                    reason,
                    delay_ms = delay.as_millis() as u64,
                    attempt = backoff.attempts(),
                    "Reconnecting after delay"
                );
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = time::sleep(delay) => {}
                }
            } else {
                info!(shard_id, reason, "Reconnecting");
            }
        }

        self.state.set_stage(shard_id, ShardStage::Shutdown);
        info!(shard_id, "Shard shut down");
    }

    /// Opens the transport, to the session's resume endpoint when one is held
    async fn connect(&self, session: Option<&ResumeInfo>) -> Result<WsStream, GatewayError> {
        self.state.set_stage(self.shard_id, ShardStage::Connecting);

        let base = session
            .and_then(|s| s.resume_url.as_deref())
            .unwrap_or(&self.config.gateway_url);
        let url = gateway_url(base);

        debug!(shard_id = self.shard_id, url = %url, "Connecting to gateway");

        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|source| GatewayError::Connect {
                shard_id: self.shard_id,
                url: url.clone(),
                source,
            })?;

        info!(shard_id = self.shard_id, "Connected to gateway");
        Ok(ws)
    }

    /// Runs one physical connection until it ends
    async fn drive(
        &self,
        ws: WsStream,
        session: &mut Option<ResumeInfo>,
        backoff: &mut Backoff,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Outcome {
        let shard_id = self.shard_id;
        let (sink, mut stream) = ws.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (signals, mut signal_rx) = mpsc::unbounded_channel();

        let mut tasks = ConnectionTasks::new(tokio::spawn(write_loop(
            shard_id,
            sink,
            outbound_rx,
            signals.clone(),
        )));

        self.state.set_stage(shard_id, ShardStage::AwaitingHello);

        let outcome = loop {
            let next = tokio::select! {
                _ = shutdown.changed() => break Outcome::Shutdown,
                Some(signal) = signal_rx.recv() => {
                    break Outcome::failed(signal.reason());
                }
                next = stream.next() => next,
            };

            let text = match next {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(frame))) => break self.on_close(frame, session),
                // Pings are answered by tungstenite; binary frames only carry compressed payloads
                Some(Ok(_)) => continue,
                Some(Err(source)) => {
                    let e = GatewayError::Receive { shard_id, source };
                    error!(shard_id, error = %e, "Gateway connection lost");
                    self.metrics.record_error(shard_id, e.error_type_label());
                    break Outcome::failed("receive_failed");
                }
                None => {
                    error!(shard_id, "Gateway stream ended");
                    break Outcome::failed("stream_ended");
                }
            };

            let payload = match GatewayPayload::decode(&text) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(shard_id, error = %e, "Discarding undecodable gateway message");
                    self.metrics.record_error(shard_id, e.error_type_label());
                    continue;
                }
            };

            if let Some(outcome) =
                self.on_payload(payload, session, backoff, &mut tasks, &outbound, &signals)
            {
                break outcome;
            }
        };

        self.close(outcome, tasks, outbound).await;
        outcome
    }

    fn on_payload(
        &self,
        payload: GatewayPayload,
        session: &mut Option<ResumeInfo>,
        backoff: &mut Backoff,
        tasks: &mut ConnectionTasks,
        outbound: &mpsc::UnboundedSender<Message>,
        signals: &mpsc::UnboundedSender<ConnectionSignal>,
    ) -> Option<Outcome> {
        let shard_id = self.shard_id;

        match payload.op {
            OpCode::Hello => {
                let hello: HelloPayload = match serde_json::from_value(payload.d) {
                    Ok(hello) => hello,
                    Err(source) => {
                        let e = GatewayError::decode("Hello", source);
                        warn!(shard_id, error = %e, "Malformed Hello");
                        self.metrics.record_error(shard_id, e.error_type_label());
                        return Some(Outcome::failed("bad_hello"));
                    }
                };

                let period = Duration::from_millis(hello.heartbeat_interval.max(1));
                debug!(shard_id, interval_ms = hello.heartbeat_interval, "Received Hello");

                self.live.begin_heartbeating();
                tasks.replace_heartbeat(tokio::spawn(heartbeat::run(
                    shard_id,
                    period,
                    Arc::clone(&self.live),
                    outbound.clone(),
                    signals.clone(),
                )));

                let handshake = Handshake::choose(session.as_ref(), self.live.sequence());
                tasks.replace_handshake(self.spawn_handshake(
                    handshake,
                    Duration::ZERO,
                    outbound.clone(),
                ));
                None
            }

            OpCode::Dispatch => {
                if let Some(sequence) = payload.s {
                    self.live.set_sequence(sequence);
                }

                let Some(event_type) = payload.t else {
                    warn!(shard_id, "Dispatch without an event type");
                    return None;
                };

                self.state.record_event(shard_id);
                if let Some(event) = self.dispatcher.dispatch(shard_id, &event_type, payload.d) {
                    self.observe(&event, session, backoff);
                }
                None
            }

            OpCode::Heartbeat => {
                debug!(shard_id, "Gateway requested a heartbeat");
                match protocol::heartbeat(self.live.sequence()) {
                    Ok(frame) => {
                        self.live.heartbeat_sent();
                        if let Err(e) = send_text(shard_id, outbound, "Heartbeat", frame) {
                            warn!(shard_id, error = %e, "Heartbeat reply not sent");
                            self.metrics.record_error(shard_id, e.error_type_label());
                            return Some(Outcome::failed("write_failed"));
                        }
                    }
                    Err(e) => error!(shard_id, error = %e, "Failed to encode heartbeat"),
                }
                None
            }

            OpCode::HeartbeatAck => {
                if let Some(latency) = self.live.acknowledge() {
                    debug!(shard_id, latency_ms = latency.as_millis() as u64, "Heartbeat acknowledged");
                    self.state.record_heartbeat_ack(shard_id, latency);
                    self.metrics.record_heartbeat_latency(shard_id, latency);
                }
                None
            }

            OpCode::Reconnect => {
                info!(shard_id, "Gateway requested reconnect");
                Some(Outcome::Reconnect {
                    reason: "requested",
                    backoff: false,
                })
            }

            OpCode::InvalidSession => {
                let resumable = payload.d.as_bool().unwrap_or(false);
                warn!(shard_id, resumable, "Session invalidated");

                if !resumable {
                    *session = None;
                    self.live.reset_sequence();
                }

                let handshake = Handshake::choose(session.as_ref(), self.live.sequence());
                tasks.replace_handshake(self.spawn_handshake(
                    handshake,
                    self.config.invalid_session_delay,
                    outbound.clone(),
                ));
                None
            }

            OpCode::Identify | OpCode::Resume => {
                debug!(shard_id, op = payload.op.name(), "Ignoring client-only opcode");
                None
            }
        }
    }

    /// Session bookkeeping for events the connection itself cares about
    fn observe(&self, event: &Event, session: &mut Option<ResumeInfo>, backoff: &mut Backoff) {
        let shard_id = self.shard_id;

        match event {
            Event::Ready(ready) => {
                *session = Some(ResumeInfo {
                    session_id: ready.session_id.clone(),
                    resume_url: ready.resume_gateway_url.clone(),
                });
                self.state
                    .set_guilds(shard_id, ready.guilds.iter().map(|g| g.id));
                self.state.set_stage(shard_id, ShardStage::Heartbeating);
                backoff.reset();
                info!(
                    shard_id,
                    session_id = %ready.session_id,
                    guilds = ready.guilds.len(),
                    user = %ready.user.username,
                    "Shard ready"
                );
            }
            Event::Resumed => {
                self.state.set_stage(shard_id, ShardStage::Heartbeating);
                backoff.reset();
                info!(shard_id, sequence = self.live.sequence(), "Shard resumed");
            }
            other => match update::guild_membership_change(other) {
                Some((guild_id, true)) => self.state.add_guild(shard_id, guild_id),
                Some((guild_id, false)) => self.state.remove_guild(shard_id, guild_id),
                None => {}
            },
        }
    }

    /// Sends Identify or Resume after `delay`. Identify waits for the shared
    /// limiter here, off the read loop, so acks keep being read meanwhile.
    fn spawn_handshake(
        &self,
        handshake: Handshake,
        delay: Duration,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> JoinHandle<()> {
        let shard_id = self.shard_id;
        let total_shards = self.total_shards;
        let config = Arc::clone(&self.config);
        let limiter = Arc::clone(&self.limiter);
        let state = self.state.clone();
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            if !delay.is_zero() {
                time::sleep(delay).await;
            }

            let frame = match &handshake {
                Handshake::Resume {
                    session_id,
                    sequence,
                } => {
                    state.advance_stage(shard_id, ShardStage::Resuming);
                    ResumePayload {
                        token: &config.token,
                        session_id,
                        seq: *sequence,
                    }
                    .encode()
                }
                Handshake::Identify => {
                    state.advance_stage(shard_id, ShardStage::Identifying);
                    debug!(shard_id, "Waiting for identify slot");
                    limiter.wait().await;
                    IdentifyPayload::new(
                        &config.token,
                        &config.properties,
                        shard_id,
                        total_shards,
                        config.intents,
                    )
                    .encode()
                }
            };

            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    error!(shard_id, error = %e, "Failed to encode handshake");
                    return;
                }
            };

            let op = match handshake {
                Handshake::Identify => "Identify",
                Handshake::Resume { .. } => "Resume",
            };

            match send_text(shard_id, &outbound, op, frame) {
                Ok(()) => {
                    // The connection may have ended meanwhile; never overwrite Reconnecting
                    state.advance_stage(shard_id, ShardStage::Heartbeating);
                    info!(shard_id, op, sequence = handshake_sequence(&handshake), "Sent handshake");
                }
                Err(e) => {
                    debug!(shard_id, error = %e, "Handshake not sent");
                    metrics.record_error(shard_id, e.error_type_label());
                }
            }
        })
    }

    fn on_close(&self, frame: Option<CloseFrame<'static>>, session: &mut Option<ResumeInfo>) -> Outcome {
        let shard_id = self.shard_id;
        let Some(frame) = frame else {
            warn!(shard_id, "Gateway closed the connection");
            return Outcome::failed("closed");
        };

        let raw = u16::from(frame.code);
        match CloseCode::from_u16(raw) {
            Some(code) if code.is_configuration_error() => {
                error!(shard_id, code = raw, reason = %frame.reason, "Gateway rejected the connection configuration");
            }
            Some(code) if code.invalidates_session() => {
                warn!(shard_id, code = raw, "Session can no longer be resumed");
                *session = None;
                self.live.reset_sequence();
            }
            _ => {
                warn!(shard_id, code = raw, reason = %frame.reason, "Gateway closed the connection");
            }
        }

        Outcome::failed("closed")
    }

    /// Tears down one physical connection. Helpers stop at once; the writer
    /// gets a bounded window to send the close frame.
    async fn close(
        &self,
        outcome: Outcome,
        mut tasks: ConnectionTasks,
        outbound: mpsc::UnboundedSender<Message>,
    ) {
        tasks.stop_helpers();

        // Normal closure ends the session; anything else keeps it resumable
        let code = match outcome {
            Outcome::Shutdown => WsCloseCode::Normal,
            Outcome::Reconnect { .. } => WsCloseCode::Restart,
        };
        let _ = outbound.send(Message::Close(Some(CloseFrame {
            code,
            reason: "".into(),
        })));
        drop(outbound);

        if let Some(mut writer) = tasks.writer.take() {
            if time::timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
                debug!(shard_id = self.shard_id, "Writer did not finish closing, aborting");
                writer.abort();
            }
        }
    }
}

fn handshake_sequence(handshake: &Handshake) -> u64 {
    match handshake {
        Handshake::Identify => 0,
        Handshake::Resume { sequence, .. } => *sequence,
    }
}

/// Queue a text frame for the connection's writer
fn send_text(
    shard_id: u32,
    outbound: &mpsc::UnboundedSender<Message>,
    op: &'static str,
    frame: String,
) -> Result<(), GatewayError> {
    outbound
        .send(Message::Text(frame))
        .map_err(|_| GatewayError::Send { shard_id, op })
}

/// Owns the write half of the transport
async fn write_loop(
    shard_id: u32,
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    signals: mpsc::UnboundedSender<ConnectionSignal>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));

        if let Err(e) = sink.send(message).await {
            if !closing {
                debug!(shard_id, error = %e, "Gateway write failed");
                let _ = signals.send(ConnectionSignal::WriteFailed);
            }
            return;
        }

        if closing {
            break;
        }
    }

    let _ = sink.close().await;
}

/// Gateway URL with the protocol version and encoding query
pub fn gateway_url(base: &str) -> String {
    if base.contains('?') {
        return base.to_string();
    }
    format!(
        "{}/?v={API_VERSION}&encoding=json",
        base.trim_end_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, CacheFlags};
    use crate::protocol::Intents;
    use crate::shard::ratelimit::TokenBucket;

    fn shard(shard_id: u32, total_shards: u32) -> Result<ShardConnection, GatewayError> {
        let metrics = Arc::new(GatewayMetrics::detached());
        let cache = Arc::new(Cache::new(CacheFlags::all()));
        ShardConnection::new(
            shard_id,
            total_shards,
            Arc::new(ShardConfig::new("token", Intents::GUILDS)),
            Arc::new(TokenBucket::new(1, Duration::from_secs(5))),
            Arc::new(EventDispatcher::new(cache, Arc::clone(&metrics))),
            ShardState::new(0, [shard_id], total_shards),
            metrics,
        )
    }

    #[test]
    fn gateway_url_appends_query() {
        assert_eq!(
            gateway_url("wss://gateway.discord.gg"),
            "wss://gateway.discord.gg/?v=10&encoding=json"
        );
        assert_eq!(
            gateway_url("wss://resume.example/"),
            "wss://resume.example/?v=10&encoding=json"
        );
        assert_eq!(
            gateway_url("ws://localhost:1/?v=9"),
            "ws://localhost:1/?v=9"
        );
    }

    #[test]
    fn send_after_writer_exit_is_a_send_error() {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        assert!(send_text(4, &outbound, "Heartbeat", "{}".to_string()).is_ok());

        drop(outbound_rx);
        let err = send_text(4, &outbound, "Identify", "{}".to_string()).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Send {
                shard_id: 4,
                op: "Identify"
            }
        ));
        assert_eq!(err.error_type_label(), "send");
    }

    #[tokio::test]
    async fn rejects_out_of_range_shard() {
        let err = shard(2, 2).err().unwrap();
        assert!(matches!(
            err,
            GatewayError::InvalidShard {
                shard_id: 2,
                total_shards: 2
            }
        ));
    }

    #[tokio::test]
    async fn shutdown_before_run_is_terminal() {
        let shard = shard(0, 1).unwrap();
        assert_eq!(shard.stage(), Some(ShardStage::Idle));

        shard.shutdown();
        assert!(shard.is_shut_down());

        shard.run().await;
        assert_eq!(shard.stage(), Some(ShardStage::Shutdown));
        assert_eq!(shard.sequence(), 0);
        assert_eq!(shard.latency(), None);
    }

    #[tokio::test]
    async fn shutdown_interrupts_reconnect_backoff() {
        // Nothing listens on port 1, so every dial fails
        let config = ShardConfig::new("token", Intents::GUILDS)
            .with_gateway_url("ws://127.0.0.1:1")
            .with_backoff(Duration::from_secs(30), Duration::from_secs(60));

        let metrics = Arc::new(GatewayMetrics::detached());
        let cache = Arc::new(Cache::new(CacheFlags::all()));
        let shard = Arc::new(
            ShardConnection::new(
                0,
                1,
                Arc::new(config),
                Arc::new(TokenBucket::new(1, Duration::from_secs(5))),
                Arc::new(EventDispatcher::new(cache, Arc::clone(&metrics))),
                ShardState::new(0, [0], 1),
                metrics,
            )
            .unwrap(),
        );

        let running = tokio::spawn({
            let shard = Arc::clone(&shard);
            async move { shard.run().await }
        });

        time::sleep(Duration::from_millis(50)).await;
        shard.shutdown();
        running.await.unwrap();

        assert_eq!(shard.stage(), Some(ShardStage::Shutdown));
    }
}
