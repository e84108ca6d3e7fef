use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

const NONE: u64 = u64::MAX;

/// Where a new session handshake should resume from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeInfo {
    pub session_id: String,
    pub resume_url: Option<String>,
}

/// Which frame to answer Hello (or a retried InvalidSession) with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Identify,
    Resume { session_id: String, sequence: u64 },
}

impl Handshake {
    pub fn choose(session: Option<&ResumeInfo>, sequence: u64) -> Self {
        match session {
            Some(info) if !info.session_id.is_empty() && sequence > 0 => Handshake::Resume {
                session_id: info.session_id.clone(),
                sequence,
            },
            _ => Handshake::Identify,
        }
    }
}

/// Connection counters shared between the read loop and the heartbeat task
#[derive(Debug)]
pub struct LiveSession {
    sequence: AtomicU64,
    acked: AtomicBool,
    latency_ms: AtomicU64,
    heartbeat_sent_ms: AtomicU64,
    epoch: Instant,
}

impl Default for LiveSession {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveSession {
    pub fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
            acked: AtomicBool::new(true),
            latency_ms: AtomicU64::new(NONE),
            heartbeat_sent_ms: AtomicU64::new(NONE),
            epoch: Instant::now(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn set_sequence(&self, sequence: u64) {
        self.sequence.store(sequence, Ordering::Release);
    }

    pub fn reset_sequence(&self) {
        self.sequence.store(0, Ordering::Release);
    }

    /// Start a fresh heartbeat cycle on a new connection
    pub fn begin_heartbeating(&self) {
        self.acked.store(true, Ordering::Release);
        self.heartbeat_sent_ms.store(NONE, Ordering::Release);
    }

    /// Clears the ack flag for the heartbeat about to be sent. Returns whether
    /// the previous heartbeat was acknowledged.
    pub fn take_ack(&self) -> bool {
        self.acked.swap(false, Ordering::AcqRel)
    }

    pub fn heartbeat_sent(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.heartbeat_sent_ms.store(now, Ordering::Release);
    }

    /// Record a HeartbeatAck; returns the round trip if a heartbeat was pending
    pub fn acknowledge(&self) -> Option<Duration> {
        self.acked.store(true, Ordering::Release);

        let sent = self.heartbeat_sent_ms.swap(NONE, Ordering::AcqRel);
        if sent == NONE {
            return None;
        }

        let now = self.epoch.elapsed().as_millis() as u64;
        let latency = now.saturating_sub(sent);
        self.latency_ms.store(latency, Ordering::Release);
        Some(Duration::from_millis(latency))
    }

    /// Last measured heartbeat round trip
    pub fn latency(&self) -> Option<Duration> {
        match self.latency_ms.load(Ordering::Acquire) {
            NONE => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
