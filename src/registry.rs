// src/registry.rs
//
// Tenant-indexed registry of live WebSocket connections.
//
// Each connection owns an unbounded outbound channel drained by its writer
// task, so every send here is a non-blocking push and locks are never held
// across an await. Broadcast serializes the envelope once and delivers
// best-effort: a connection whose writer has gone away is simply skipped.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

/// Inbound message budget per connection: at most `RATE_LIMIT_MAX` messages
/// in any `RATE_LIMIT_WINDOW`. Excess messages are dropped silently.
pub const RATE_LIMIT_MAX: u32 = 10;
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

/// Interval between heartbeat sweeps. A peer that misses one full interval
/// is terminated on the next, so dead peers are detected within 30–60 s.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

// ─── Rate limiting ──────────────────────────────────────────────────────────

struct RateWindow {
    count: u32,
    window_start: Instant,
}

// ─── Connection ─────────────────────────────────────────────────────────────

/// One authenticated live socket. Belongs to exactly one tenant set.
pub struct Connection {
    pub user_id: i64,
    pub user_name: String,
    pub organization_id: i64,
    pub session_id: String,
    /// Flipped false by each heartbeat sweep, back to true on pong.
    is_alive: AtomicBool,
    sender: mpsc::UnboundedSender<Message>,
    rate: Mutex<RateWindow>,
}

impl Connection {
    pub fn new(
        user_id: i64,
        user_name: String,
        organization_id: i64,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Self {
        let session_id = format!("{user_id}-{}", chrono::Utc::now().timestamp_millis());
        Self {
            user_id,
            user_name,
            organization_id,
            session_id,
            is_alive: AtomicBool::new(true),
            sender,
            rate: Mutex::new(RateWindow {
                count: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Best-effort send; a closed writer is not an error.
    pub fn send(&self, message: Message) {
        let _ = self.sender.send(message);
    }

    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Clear the liveness flag, returning whether the peer answered since
    /// the previous sweep.
    pub fn take_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Count one inbound message against the sliding window. Returns false
    /// when the message should be dropped.
    pub fn allow_message(&self) -> bool {
        let mut rate = self.rate.lock().unwrap();
        let now = Instant::now();
        if now.duration_since(rate.window_start) >= RATE_LIMIT_WINDOW {
            rate.count = 0;
            rate.window_start = now;
        }
        rate.count += 1;
        rate.count <= RATE_LIMIT_MAX
    }
}

// ─── Registry ───────────────────────────────────────────────────────────────

type TenantSet = HashMap<String, Arc<Connection>>;

/// Process-wide map `organization_id → { session_id → connection }`.
#[derive(Default)]
pub struct ConnectionRegistry {
    tenants: RwLock<HashMap<i64, TenantSet>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn: Arc<Connection>) {
        let mut tenants = self.tenants.write().unwrap();
        tenants
            .entry(conn.organization_id)
            .or_default()
            .insert(conn.session_id.clone(), conn.clone());
        debug!(
            org_id = conn.organization_id,
            user_id = conn.user_id,
            session_id = %conn.session_id,
            "connection registered"
        );
    }

    /// Remove a connection. Returns it only on the first call for a given
    /// session, which makes close-path cleanup idempotent. Empty tenant
    /// sets are dropped.
    pub fn unregister(&self, org: i64, session_id: &str) -> Option<Arc<Connection>> {
        let mut tenants = self.tenants.write().unwrap();
        let set = tenants.get_mut(&org)?;
        let conn = set.remove(session_id);
        if set.is_empty() {
            tenants.remove(&org);
        }
        if let Some(c) = &conn {
            debug!(
                org_id = org,
                user_id = c.user_id,
                session_id = session_id,
                "connection unregistered"
            );
        }
        conn
    }

    /// Send `{ type, data }` to every connection in the tenant, serializing
    /// once. `exclude_user_id` skips the originator to avoid echo.
    pub fn broadcast(
        &self,
        org: i64,
        msg_type: &str,
        data: serde_json::Value,
        exclude_user_id: Option<i64>,
    ) -> usize {
        let text = json!({ "type": msg_type, "data": data }).to_string();

        let tenants = self.tenants.read().unwrap();
        let Some(set) = tenants.get(&org) else {
            return 0;
        };

        let mut sent = 0;
        for conn in set.values() {
            if exclude_user_id == Some(conn.user_id) {
                continue;
            }
            conn.send(Message::Text(text.clone()));
            sent += 1;
        }
        sent
    }

    /// Like `broadcast`, but only to sockets belonging to one user.
    pub fn send_to_user(
        &self,
        org: i64,
        user_id: i64,
        msg_type: &str,
        data: serde_json::Value,
    ) -> usize {
        let text = json!({ "type": msg_type, "data": data }).to_string();

        let tenants = self.tenants.read().unwrap();
        let Some(set) = tenants.get(&org) else {
            return 0;
        };

        let mut sent = 0;
        for conn in set.values().filter(|c| c.user_id == user_id) {
            conn.send(Message::Text(text.clone()));
            sent += 1;
        }
        sent
    }

    /// Snapshot of every live connection, for the heartbeat sweep.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let tenants = self.tenants.read().unwrap();
        tenants.values().flat_map(|set| set.values().cloned()).collect()
    }

    pub fn connection_count(&self) -> usize {
        let tenants = self.tenants.read().unwrap();
        tenants.values().map(|set| set.len()).sum()
    }

    /// Drop everything, returning the drained connections so the caller can
    /// close their sockets. Used by graceful shutdown.
    pub fn clear(&self) -> Vec<Arc<Connection>> {
        let mut tenants = self.tenants.write().unwrap();
        tenants
            .drain()
            .flat_map(|(_, set)| set.into_values())
            .collect()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(
        registry: &ConnectionRegistry,
        org: i64,
        user_id: i64,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(user_id, format!("user{user_id}"), org, tx));
        registry.register(conn.clone());
        (conn, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                out.push(text);
            }
        }
        out
    }

    #[tokio::test]
    async fn broadcast_is_tenant_isolated() {
        let registry = ConnectionRegistry::new();
        let (_x, mut rx_x) = connect(&registry, 1, 10);
        let (_y, mut rx_y) = connect(&registry, 2, 20);

        let sent = registry.broadcast(1, "kunde_created", json!({ "id": 7 }), None);
        assert_eq!(sent, 1);

        assert_eq!(drain(&mut rx_x).len(), 1);
        assert!(drain(&mut rx_y).is_empty());
    }

    #[tokio::test]
    async fn broadcast_excludes_originator() {
        let registry = ConnectionRegistry::new();
        let (_a, mut rx_a) = connect(&registry, 1, 10);
        let (_b, mut rx_b) = connect(&registry, 1, 11);

        registry.broadcast(1, "chat_typing", json!({ "conversationId": 3 }), Some(10));

        assert!(drain(&mut rx_a).is_empty());
        let got = drain(&mut rx_b);
        assert_eq!(got.len(), 1);
        assert!(got[0].contains("chat_typing"));
    }

    #[tokio::test]
    async fn send_to_user_targets_one_user_only() {
        let registry = ConnectionRegistry::new();
        let (_a, mut rx_a) = connect(&registry, 1, 10);
        let (_b, mut rx_b) = connect(&registry, 1, 11);

        let sent = registry.send_to_user(1, 11, "note", json!({}));
        assert_eq!(sent, 1);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent_and_drops_empty_tenants() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = connect(&registry, 1, 10);

        assert!(registry.unregister(1, &conn.session_id).is_some());
        assert!(registry.unregister(1, &conn.session_id).is_none());
        assert_eq!(registry.connection_count(), 0);

        // Tenant entry is gone, so broadcast reaches nobody.
        assert_eq!(registry.broadcast(1, "x", json!({}), None), 0);
    }

    #[tokio::test]
    async fn closed_writer_does_not_panic_broadcast() {
        let registry = ConnectionRegistry::new();
        let (_a, rx_a) = connect(&registry, 1, 10);
        let (_b, mut rx_b) = connect(&registry, 1, 11);
        drop(rx_a); // peer went away mid-broadcast

        registry.broadcast(1, "kunde_updated", json!({}), None);
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[tokio::test]
    async fn rate_limiter_allows_first_ten_per_window() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Connection::new(1, "u".into(), 1, tx);

        let allowed = (0..15).filter(|_| conn.allow_message()).count();
        assert_eq!(allowed, RATE_LIMIT_MAX as usize);

        // A fresh window admits messages again.
        {
            let mut rate = conn.rate.lock().unwrap();
            rate.window_start = Instant::now() - RATE_LIMIT_WINDOW;
        }
        assert!(conn.allow_message());
    }

    #[tokio::test]
    async fn heartbeat_flag_round_trip() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Connection::new(1, "u".into(), 1, tx);

        assert!(conn.take_alive()); // starts alive
        assert!(!conn.take_alive()); // no pong since last sweep
        conn.mark_alive();
        assert!(conn.take_alive());
    }

    #[tokio::test]
    async fn clear_drains_everything() {
        let registry = ConnectionRegistry::new();
        connect(&registry, 1, 10);
        connect(&registry, 2, 20);

        let drained = registry.clear();
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.connection_count(), 0);
    }
}
