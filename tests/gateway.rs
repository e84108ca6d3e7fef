//! End-to-end shard behavior against an in-process gateway

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use shardlink::events::{EventContext, HandlerError};
use shardlink::model::Id;
use shardlink::protocol::Intents;
use shardlink::shard::ShardStage;
use shardlink::{
    Cache, CacheFlags, Event, EventDispatcher, GatewayMetrics, ShardConfig, ShardConnection,
    ShardPool, TokenBucket,
};

const STEP: Duration = Duration::from_secs(5);

type ServerSocket = WebSocketStream<TcpStream>;

struct MockGateway {
    listener: TcpListener,
    url: String,
}

impl MockGateway {
    async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        Self { listener, url }
    }

    async fn accept(&self) -> ServerSocket {
        let (stream, _) = timeout(STEP, self.listener.accept())
            .await
            .expect("shard never connected")
            .unwrap();
        accept_async(stream).await.unwrap()
    }
}

async fn send(ws: &mut ServerSocket, payload: Value) {
    ws.send(Message::Text(payload.to_string())).await.unwrap();
}

async fn hello(ws: &mut ServerSocket, heartbeat_interval: u64) {
    send(ws, json!({ "op": 10, "d": { "heartbeat_interval": heartbeat_interval } })).await;
}

/// Next client frame with the given opcode, skipping anything else
async fn expect_op(ws: &mut ServerSocket, op: u64) -> Value {
    timeout(STEP, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["op"] == op {
                        return value;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("connection ended while waiting for op {op}: {other:?}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for op {op}"))
}

async fn close_with(mut ws: ServerSocket, code: u16) {
    ws.close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: "".into(),
    }))
    .await
    .ok();
}

fn ready(session_id: &str, resume_url: &str, seq: u64) -> Value {
    json!({
        "op": 0,
        "t": "READY",
        "s": seq,
        "d": {
            "v": 10,
            "user": { "id": "1", "username": "shardlink", "bot": true },
            "guilds": [{ "id": "10", "unavailable": true }],
            "session_id": session_id,
            "resume_gateway_url": resume_url,
            "shard": [0, 1]
        }
    })
}

fn config(url: &str) -> ShardConfig {
    ShardConfig::new("test-token", Intents::GUILDS | Intents::GUILD_MEMBERS)
        .with_gateway_url(url)
        .with_backoff(Duration::from_millis(10), Duration::from_millis(100))
        .with_invalid_session_delay(Duration::ZERO)
}

struct Harness {
    cache: Arc<Cache>,
    dispatcher: Arc<EventDispatcher>,
    metrics: Arc<GatewayMetrics>,
}

impl Harness {
    fn new() -> Self {
        let metrics = Arc::new(GatewayMetrics::detached());
        let cache = Arc::new(Cache::new(CacheFlags::all()));
        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::clone(&cache),
            Arc::clone(&metrics),
        ));
        Self {
            cache,
            dispatcher,
            metrics,
        }
    }

    fn shard(&self, url: &str, limiter: Arc<TokenBucket>) -> Arc<ShardConnection> {
        self.shard_with(config(url), limiter)
    }

    fn shard_with(&self, config: ShardConfig, limiter: Arc<TokenBucket>) -> Arc<ShardConnection> {
        Arc::new(
            ShardConnection::new(
                0,
                1,
                Arc::new(config),
                limiter,
                Arc::clone(&self.dispatcher),
                shardlink::shard::ShardState::new(0, [0], 1),
                Arc::clone(&self.metrics),
            )
            .unwrap(),
        )
    }
}

fn spawn_run(shard: &Arc<ShardConnection>) -> tokio::task::JoinHandle<()> {
    let shard = Arc::clone(shard);
    tokio::spawn(async move { shard.run().await })
}

#[tokio::test]
async fn reconnect_directive_resumes_session() {
    let gateway = MockGateway::bind().await;
    let harness = Harness::new();
    let shard = harness.shard(
        &gateway.url,
        Arc::new(TokenBucket::new(1, Duration::from_secs(5))),
    );

    let (guild_tx, mut guild_rx) = mpsc::unbounded_channel();
    harness.dispatcher.register(
        "GUILD_CREATE",
        move |ctx: EventContext, event: Arc<Event>| {
            let guild_tx = guild_tx.clone();
            async move {
                if let Event::GuildCreate(create) = event.as_ref() {
                    guild_tx
                        .send((create.guild.id, ctx.cache.has_guild(create.guild.id)))
                        .ok();
                }
                Ok::<_, HandlerError>(())
            }
        },
    );

    let running = spawn_run(&shard);

    // First connection: fresh session
    let mut ws = gateway.accept().await;
    hello(&mut ws, 45_000).await;

    let identify = expect_op(&mut ws, 2).await;
    assert_eq!(identify["d"]["token"], "test-token");
    assert_eq!(identify["d"]["shard"], json!([0, 1]));
    assert_eq!(identify["d"]["intents"], 3);
    assert!(identify["d"]["properties"]["os"].is_string());

    send(&mut ws, ready("abc", &gateway.url, 1)).await;
    send(
        &mut ws,
        json!({
            "op": 0,
            "t": "GUILD_CREATE",
            "s": 2,
            "d": { "id": "10", "name": "guild", "channels": [{ "id": "20", "type": 0, "name": "general" }] }
        }),
    )
    .await;

    // Handlers see the cache already updated
    let (guild_id, cached) = timeout(STEP, guild_rx.recv()).await.unwrap().unwrap();
    assert_eq!(guild_id, Id::new(10));
    assert!(cached);
    assert_eq!(shard.sequence(), 2);

    // Server-requested heartbeat is answered right away
    send(&mut ws, json!({ "op": 1, "d": null })).await;
    let heartbeat = expect_op(&mut ws, 1).await;
    assert_eq!(heartbeat["d"], 2);

    send(&mut ws, json!({ "op": 7, "d": null })).await;

    // Second connection resumes where the first left off
    let mut ws = gateway.accept().await;
    hello(&mut ws, 45_000).await;

    let resume = expect_op(&mut ws, 6).await;
    assert_eq!(resume["d"]["token"], "test-token");
    assert_eq!(resume["d"]["session_id"], "abc");
    assert_eq!(resume["d"]["seq"], 2);

    send(&mut ws, json!({ "op": 0, "t": "RESUMED", "s": 3, "d": {} })).await;
    send(&mut ws, json!({ "op": 1, "d": null })).await;
    assert_eq!(expect_op(&mut ws, 1).await["d"], 3);

    assert!(harness.cache.has_user(Id::new(1)));
    assert_eq!(harness.cache.guild_channel_count(Id::new(10)), 1);
    assert_eq!(shard.stage(), Some(ShardStage::Heartbeating));

    shard.shutdown();
    timeout(STEP, running).await.unwrap().unwrap();
    assert_eq!(shard.stage(), Some(ShardStage::Shutdown));
}

#[tokio::test]
async fn non_resumable_invalid_session_identifies_again() {
    let gateway = MockGateway::bind().await;
    let harness = Harness::new();
    let shard = harness.shard(
        &gateway.url,
        Arc::new(TokenBucket::new(2, Duration::from_secs(5))),
    );
    let running = spawn_run(&shard);

    let mut ws = gateway.accept().await;
    hello(&mut ws, 45_000).await;
    expect_op(&mut ws, 2).await;
    send(&mut ws, ready("abc", &gateway.url, 5)).await;

    send(&mut ws, json!({ "op": 9, "d": false })).await;

    // Same connection, fresh session
    let identify = expect_op(&mut ws, 2).await;
    assert_eq!(identify["d"]["shard"], json!([0, 1]));
    assert_eq!(shard.sequence(), 0);

    shard.shutdown();
    timeout(STEP, running).await.unwrap().unwrap();
}

#[tokio::test]
async fn unacknowledged_heartbeat_forces_reconnect() {
    let gateway = MockGateway::bind().await;
    let harness = Harness::new();
    let shard = harness.shard(
        &gateway.url,
        Arc::new(TokenBucket::new(2, Duration::from_secs(5))),
    );
    let running = spawn_run(&shard);

    let mut ws = gateway.accept().await;
    hello(&mut ws, 100).await;
    expect_op(&mut ws, 2).await;

    // One heartbeat goes out; it is never acknowledged
    let first = expect_op(&mut ws, 1).await;
    assert_eq!(first["d"], Value::Null);

    // The next tick gives up on this connection instead of heartbeating again
    let mut ws = gateway.accept().await;
    hello(&mut ws, 45_000).await;
    expect_op(&mut ws, 2).await;

    shard.shutdown();
    timeout(STEP, running).await.unwrap().unwrap();
}

#[tokio::test]
async fn heartbeat_ack_records_latency() {
    let gateway = MockGateway::bind().await;
    let harness = Harness::new();
    let shard = harness.shard(
        &gateway.url,
        Arc::new(TokenBucket::new(1, Duration::from_secs(5))),
    );
    let running = spawn_run(&shard);

    let mut ws = gateway.accept().await;
    hello(&mut ws, 50).await;
    expect_op(&mut ws, 2).await;

    for _ in 0..3 {
        expect_op(&mut ws, 1).await;
        send(&mut ws, json!({ "op": 11 })).await;
    }

    timeout(STEP, async {
        while shard.latency().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    shard.shutdown();
    timeout(STEP, running).await.unwrap().unwrap();
}

#[tokio::test]
async fn shared_limiter_spaces_identifies_across_shards() {
    let interval = Duration::from_millis(300);
    let gateway = Arc::new(MockGateway::bind().await);
    let harness = Harness::new();

    let pool = Arc::new(
        ShardPool::with_shards(
            0,
            [0, 1],
            2,
            Arc::new(config(&gateway.url)),
            Arc::new(TokenBucket::new(1, interval)),
            Arc::clone(&harness.dispatcher),
            Arc::clone(&harness.metrics),
        )
        .unwrap(),
    );

    let running = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    let (identify_tx, mut identify_rx) = mpsc::unbounded_channel();
    for _ in 0..2 {
        let mut ws = gateway.accept().await;
        let identify_tx = identify_tx.clone();
        tokio::spawn(async move {
            hello(&mut ws, 45_000).await;
            let identify = expect_op(&mut ws, 2).await;
            identify_tx
                .send((identify["d"]["shard"][0].as_u64().unwrap(), Instant::now()))
                .ok();
            // Hold the connection open until the test ends
            while ws.next().await.is_some() {}
        });
    }

    let (first_shard, first_at) = timeout(STEP, identify_rx.recv()).await.unwrap().unwrap();
    let (second_shard, second_at) = timeout(STEP, identify_rx.recv()).await.unwrap().unwrap();

    assert_ne!(first_shard, second_shard);
    assert!(
        second_at.duration_since(first_at) >= Duration::from_millis(250),
        "second identify came {:?} after the first",
        second_at.duration_since(first_at)
    );

    pool.shutdown();
    timeout(STEP, running).await.unwrap().unwrap();
}

#[tokio::test]
async fn resumable_invalid_session_resumes() {
    let gateway = MockGateway::bind().await;
    let harness = Harness::new();
    let shard = harness.shard(
        &gateway.url,
        Arc::new(TokenBucket::new(1, Duration::from_secs(5))),
    );
    let running = spawn_run(&shard);

    let mut ws = gateway.accept().await;
    hello(&mut ws, 45_000).await;
    expect_op(&mut ws, 2).await;
    send(&mut ws, ready("abc", &gateway.url, 5)).await;

    send(&mut ws, json!({ "op": 9, "d": true })).await;

    // Same connection, same session
    let resume = expect_op(&mut ws, 6).await;
    assert_eq!(resume["d"]["session_id"], "abc");
    assert_eq!(resume["d"]["seq"], 5);
    assert_eq!(shard.sequence(), 5);

    shard.shutdown();
    timeout(STEP, running).await.unwrap().unwrap();
}

#[tokio::test]
async fn session_timeout_close_identifies_fresh() {
    let gateway = MockGateway::bind().await;
    let harness = Harness::new();
    let shard = harness.shard(
        &gateway.url,
        Arc::new(TokenBucket::new(2, Duration::from_secs(5))),
    );
    let running = spawn_run(&shard);

    let mut ws = gateway.accept().await;
    hello(&mut ws, 45_000).await;
    expect_op(&mut ws, 2).await;
    send(&mut ws, ready("abc", &gateway.url, 5)).await;
    close_with(ws, 4009).await;

    // 4009 drops the session, so the next connection starts over
    let mut ws = gateway.accept().await;
    hello(&mut ws, 45_000).await;
    let identify = expect_op(&mut ws, 2).await;
    assert_eq!(identify["d"]["shard"], json!([0, 1]));
    assert_eq!(shard.sequence(), 0);

    shard.shutdown();
    timeout(STEP, running).await.unwrap().unwrap();
}

#[tokio::test]
async fn reconnect_dials_resume_gateway_url() {
    let gateway = MockGateway::bind().await;
    let resume_gateway = MockGateway::bind().await;
    let harness = Harness::new();
    let shard = harness.shard(
        &gateway.url,
        Arc::new(TokenBucket::new(1, Duration::from_secs(5))),
    );
    let running = spawn_run(&shard);

    let mut ws = gateway.accept().await;
    hello(&mut ws, 45_000).await;
    expect_op(&mut ws, 2).await;
    send(&mut ws, ready("abc", &resume_gateway.url, 3)).await;
    send(&mut ws, json!({ "op": 7, "d": null })).await;

    let mut ws = resume_gateway.accept().await;
    hello(&mut ws, 45_000).await;
    let resume = expect_op(&mut ws, 6).await;
    assert_eq!(resume["d"]["session_id"], "abc");
    assert_eq!(resume["d"]["seq"], 3);

    shard.shutdown();
    timeout(STEP, running).await.unwrap().unwrap();
}

#[tokio::test]
async fn rejected_handshakes_keep_backing_off() {
    let gateway = MockGateway::bind().await;
    let harness = Harness::new();
    let shard = harness.shard_with(
        config(&gateway.url).with_backoff(Duration::from_millis(100), Duration::from_secs(5)),
        Arc::new(TokenBucket::new(10, Duration::from_secs(5))),
    );
    let running = spawn_run(&shard);

    // Hello arrives every time, but no session is ever established
    let mut accepted = Vec::new();
    for _ in 0..5 {
        let mut ws = gateway.accept().await;
        accepted.push(Instant::now());
        hello(&mut ws, 45_000).await;
        expect_op(&mut ws, 2).await;
        close_with(ws, 4004).await;
    }

    let first = accepted[1].duration_since(accepted[0]);
    let last = accepted[4].duration_since(accepted[3]);
    assert!(
        last >= Duration::from_millis(700) && last > first * 2,
        "reconnect gaps did not grow: first {first:?}, last {last:?}"
    );

    shard.shutdown();
    timeout(STEP, running).await.unwrap().unwrap();
}
