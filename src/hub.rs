// src/hub.rs
//
// Realtime hub façade: WebSocket upgrade, inbound message dispatch, and the
// broadcast API the rest of the application uses.
//
// ─ Lifecycle ────────────────────────────────────────────────────────────────
//
//   upgrade ──auth(cookie+JWT+blacklist)──> register connection
//       │                                       │
//       │ 401/500 on failure                    ├─ send `connected` with the
//       │                                       │  tenant presence snapshot
//       ▼                                       ├─ reader: dispatch messages
//   socket destroyed                            └─ on close: unregister,
//                                                  release claims, announce
//                                                  `user_offline`
//
// A 30-second heartbeat pings every connection; a peer that missed a full
// interval is terminated on the next sweep. Graceful shutdown closes every
// socket with 1001 "Server shutting down".
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::{Arc, Mutex};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audit::{record_best_effort, AuditEntry, SecurityAuditLog};
use crate::auth::{token_from_cookie_header, verify_token, TokenBlacklist};
use crate::config::Config;
use crate::error::AuthError;
use crate::presence::{initials, PresenceManager};
use crate::registry::{Connection, ConnectionRegistry, HEARTBEAT_INTERVAL};

// ─── Inbound messages ───────────────────────────────────────────────────────

/// Closed set of recognized client messages. Anything else (unknown types,
/// malformed JSON, wrong field shapes) is dropped without an error.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientMessage {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "claim_customer")]
    ClaimCustomer {
        #[serde(rename = "kundeId")]
        kunde_id: i64,
        #[serde(rename = "userName")]
        user_name: Option<String>,
    },
    #[serde(rename = "release_customer")]
    ReleaseCustomer {
        #[serde(rename = "kundeId")]
        kunde_id: i64,
    },
    #[serde(rename = "chat_typing_start")]
    ChatTypingStart {
        #[serde(rename = "conversationId")]
        conversation_id: i64,
    },
    #[serde(rename = "chat_typing_stop")]
    ChatTypingStop {
        #[serde(rename = "conversationId")]
        conversation_id: i64,
    },
    #[serde(other)]
    Unknown,
}

// ─── Identity ───────────────────────────────────────────────────────────────

/// Authenticated upgrade identity.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: i64,
    pub user_name: String,
    pub organization_id: i64,
}

// ─── Hub ────────────────────────────────────────────────────────────────────

pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceManager>,
    blacklist: Arc<dyn TokenBlacklist>,
    audit: Arc<dyn SecurityAuditLog>,
    jwt_secret: String,
    auth_cookie: String,
    heartbeat: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Hub {
    pub fn new(
        config: &Config,
        registry: Arc<ConnectionRegistry>,
        presence: Arc<PresenceManager>,
        blacklist: Arc<dyn TokenBlacklist>,
        audit: Arc<dyn SecurityAuditLog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            presence,
            blacklist,
            audit,
            jwt_secret: config.jwt_secret.clone(),
            auth_cookie: config.auth_cookie.clone(),
            heartbeat: Mutex::new(None),
        })
    }

    // ── Application-facing send API ─────────────────────────────────────

    /// Broadcast `{ type, data }` to every connection in a tenant.
    pub fn broadcast(
        &self,
        org: i64,
        msg_type: &str,
        data: serde_json::Value,
        exclude_user_id: Option<i64>,
    ) -> usize {
        self.registry.broadcast(org, msg_type, data, exclude_user_id)
    }

    /// Send `{ type, data }` to one user's sockets in a tenant.
    pub fn send_to_user(
        &self,
        org: i64,
        user_id: i64,
        msg_type: &str,
        data: serde_json::Value,
    ) -> usize {
        self.registry.send_to_user(org, user_id, msg_type, data)
    }

    /// Number of live connections across all tenants.
    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    // ── Upgrade path ────────────────────────────────────────────────────

    async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AuthError> {
        let cookie_header = headers
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::MissingCookie)?;
        let token = token_from_cookie_header(cookie_header, &self.auth_cookie)
            .ok_or(AuthError::MissingCookie)?;

        let claims = verify_token(&self.jwt_secret, &token)?;
        let organization_id = claims.organization_id.ok_or(AuthError::MissingOrganization)?;

        if let Some(jti) = &claims.jti {
            if self.blacklist.is_revoked(jti).await {
                return Err(AuthError::Revoked);
            }
        }

        Ok(Identity {
            user_id: claims.sub,
            user_name: claims.display_name(),
            organization_id,
        })
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, identity: Identity) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let conn = Arc::new(Connection::new(
            identity.user_id,
            identity.user_name.clone(),
            identity.organization_id,
            tx,
        ));
        self.registry.register(conn.clone());

        // Writer task: drains the outbound channel into the socket. Everything
        // sent to this connection goes through the channel, preserving order.
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        conn.send(Message::Text(
            json!({
                "type": "connected",
                "message": "Connected to realtime updates",
                "data": {
                    "userId": conn.user_id,
                    "userName": conn.user_name,
                    "initials": initials(&conn.user_name),
                    "presence": self.presence.snapshot(conn.organization_id),
                },
            })
            .to_string(),
        ));

        info!(
            org_id = conn.organization_id,
            user_id = conn.user_id,
            session_id = %conn.session_id,
            "websocket connected"
        );

        while let Some(result) = stream.next().await {
            let Ok(message) = result else { break };
            match message {
                Message::Text(text) => self.handle_text(&conn, &text),
                Message::Pong(_) => conn.mark_alive(),
                Message::Close(_) => break,
                // Pings are answered by the protocol layer; binary frames
                // are not part of the client contract.
                _ => {}
            }
        }

        self.cleanup(&conn);
        writer.abort();
    }

    // ── Message dispatch ────────────────────────────────────────────────

    fn handle_text(&self, conn: &Arc<Connection>, text: &str) {
        if !conn.allow_message() {
            debug!(
                user_id = conn.user_id,
                session_id = %conn.session_id,
                "rate limit exceeded, dropping message"
            );
            return;
        }

        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(_) => {
                debug!(user_id = conn.user_id, "ignoring malformed client message");
                return;
            }
        };

        match message {
            ClientMessage::Ping => {
                conn.send(Message::Text(json!({ "type": "pong" }).to_string()));
            }
            ClientMessage::ClaimCustomer { kunde_id, user_name } if kunde_id > 0 => {
                let name = user_name.as_deref().unwrap_or(&conn.user_name);
                self.presence
                    .claim(conn.organization_id, kunde_id, conn.user_id, name);
            }
            ClientMessage::ReleaseCustomer { kunde_id } if kunde_id > 0 => {
                self.presence
                    .release(conn.organization_id, kunde_id, conn.user_id);
            }
            ClientMessage::ChatTypingStart { conversation_id } if conversation_id > 0 => {
                self.registry.broadcast(
                    conn.organization_id,
                    "chat_typing",
                    json!({
                        "conversationId": conversation_id,
                        "userId": conn.user_id,
                        "userName": conn.user_name,
                    }),
                    Some(conn.user_id),
                );
            }
            ClientMessage::ChatTypingStop { conversation_id } if conversation_id > 0 => {
                self.registry.broadcast(
                    conn.organization_id,
                    "chat_typing_stop",
                    json!({
                        "conversationId": conversation_id,
                        "userId": conn.user_id,
                    }),
                    Some(conn.user_id),
                );
            }
            // Guarded-out ids and unknown types fall through silently.
            _ => {}
        }
    }

    // ── Close path ──────────────────────────────────────────────────────

    /// Tear down one connection. Idempotent: only the caller that actually
    /// removes the registry entry performs presence cleanup and announces
    /// the departure.
    fn cleanup(&self, conn: &Arc<Connection>) {
        if self
            .registry
            .unregister(conn.organization_id, &conn.session_id)
            .is_none()
        {
            return;
        }

        self.presence.release_all(conn.organization_id, conn.user_id);
        self.registry.broadcast(
            conn.organization_id,
            "user_offline",
            json!({ "userId": conn.user_id, "userName": conn.user_name }),
            Some(conn.user_id),
        );
        info!(
            org_id = conn.organization_id,
            user_id = conn.user_id,
            session_id = %conn.session_id,
            "websocket disconnected"
        );
    }

    // ── Heartbeat ───────────────────────────────────────────────────────

    /// Start the 30-second ping/pong sweep. A connection that has not
    /// answered since the previous tick is closed and cleaned up.
    pub fn spawn_heartbeat(self: &Arc<Self>) {
        let hub = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                for conn in hub.registry.connections() {
                    if conn.take_alive() {
                        conn.send(Message::Ping(Vec::new()));
                    } else {
                        warn!(
                            org_id = conn.organization_id,
                            user_id = conn.user_id,
                            session_id = %conn.session_id,
                            "heartbeat missed, terminating connection"
                        );
                        conn.send(Message::Close(None));
                        hub.cleanup(&conn);
                    }
                }
            }
        });
        *self.heartbeat.lock().unwrap() = Some(handle);
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// Stop the heartbeat, close every socket with 1001, and clear the
    /// in-memory tenant maps.
    pub fn shutdown(&self) {
        if let Some(handle) = self.heartbeat.lock().unwrap().take() {
            handle.abort();
        }

        let connections = self.registry.clear();
        let count = connections.len();
        for conn in connections {
            conn.send(Message::Close(Some(CloseFrame {
                code: close_code::AWAY,
                reason: "Server shutting down".into(),
            })));
        }
        self.presence.clear();
        info!(closed = count, "realtime hub shut down");
    }
}

// ─── Axum handler ───────────────────────────────────────────────────────────

/// `GET /ws` -- authenticate the upgrade and hand the socket to the hub.
pub async fn ws_handler(
    State(hub): State<Arc<Hub>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    match hub.authenticate(&headers).await {
        Ok(identity) => {
            record_best_effort(
                hub.audit.as_ref(),
                AuditEntry::new("ws_connected")
                    .user(identity.user_id)
                    .organization(identity.organization_id),
            )
            .await;
            let hub = hub.clone();
            ws.on_upgrade(move |socket| hub.handle_socket(socket, identity))
        }
        Err(e) => {
            warn!(error = %e, "websocket upgrade rejected");
            record_best_effort(
                hub.audit.as_ref(),
                AuditEntry::new("ws_auth_failed").detail(e.to_string()),
            )
            .await;
            (e.status(), e.to_string()).into_response()
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
