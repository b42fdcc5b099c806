//! SSE session registry: one entry per open event stream.
//!
//! Sessions are identified by a UUID carried in the `endpoint` event and
//! echoed back on `POST /messages`. A maintenance task emits heartbeats
//! and evicts sessions that have been idle past the configured timeout.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const SESSION_CHANNEL_CAPACITY: usize = 64;

/// One event queued toward an SSE client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

impl SseEvent {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    pub fn message(payload: &serde_json::Value) -> Self {
        Self::new("message", payload.to_string())
    }

    /// Wire framing: `event: <name>\ndata: <json>\n\n`.
    pub fn to_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }
}

pub struct SseSession {
    id: String,
    tx: mpsc::Sender<SseEvent>,
    last_activity: Mutex<Instant>,
}

impl SseSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue an event toward the client. Returns false when the client is
    /// gone and the session should be dropped.
    pub async fn send(&self, event: SseEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<SseSession>>>,
    max_clients: usize,
    session_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(max_clients: usize, session_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            max_clients,
            session_timeout,
        })
    }

    /// Open a session; None when the client cap is reached.
    pub fn open(&self) -> Option<(Arc<SseSession>, mpsc::Receiver<SseEvent>)> {
        let mut sessions = self.sessions.lock();
        if sessions.len() >= self.max_clients {
            return None;
        }

        let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let session = Arc::new(SseSession {
            id: uuid::Uuid::new_v4().to_string(),
            tx,
            last_activity: Mutex::new(Instant::now()),
        });
        sessions.insert(session.id.clone(), session.clone());
        Some((session, rx))
    }

    pub fn get(&self, id: &str) -> Option<Arc<SseSession>> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn close(&self, id: &str) {
        self.sessions.lock().remove(id);
    }

    pub fn client_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Remove sessions idle past the timeout; returns the evicted ids.
    pub fn evict_idle(&self) -> Vec<String> {
        let mut sessions = self.sessions.lock();
        let timeout = self.session_timeout;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.idle_for() > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        expired
    }

    /// All open sessions, for broadcast paths.
    pub fn snapshot(&self) -> Vec<Arc<SseSession>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Heartbeat + idle eviction loop. Aborting the handle stops it.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;

                for id in registry.evict_idle() {
                    tracing::info!("SSE session {id} timed out; disconnecting");
                }

                for session in registry.snapshot() {
                    let heartbeat = SseEvent::new(
                        "heartbeat",
                        serde_json::json!({"timestamp": chrono::Utc::now().to_rfc3339()})
                            .to_string(),
                    );
                    if !session.send(heartbeat).await {
                        registry.close(session.id());
                    }
                }
            }
        })
    }
}
