// src/events.rs
//
// Event taxonomy for the webhook plane.
//
// Every domain occurrence that can be fanned out to subscribed endpoints is
// identified by an `EventKind` and wrapped in an `EventEnvelope`, the exact
// JSON document the receiving endpoint sees as the request body.
//
// ────────────────────────────────────────────────────────────────────────────

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Event kinds ────────────────────────────────────────────────────────────

/// Canonical event type string, used in JSON payloads, delivery headers and
/// endpoint subscription filters. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "customer.created")]
    CustomerCreated,
    #[serde(rename = "customer.updated")]
    CustomerUpdated,
    #[serde(rename = "customer.deleted")]
    CustomerDeleted,
    #[serde(rename = "route.completed")]
    RouteCompleted,
    #[serde(rename = "sync.completed")]
    SyncCompleted,
    #[serde(rename = "sync.failed")]
    SyncFailed,
}

impl EventKind {
    /// Stable string representation used in HTTP headers and filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CustomerCreated => "customer.created",
            Self::CustomerUpdated => "customer.updated",
            Self::CustomerDeleted => "customer.deleted",
            Self::RouteCompleted => "route.completed",
            Self::SyncCompleted => "sync.completed",
            Self::SyncFailed => "sync.failed",
        }
    }

    /// Every kind an endpoint may subscribe to.
    pub fn all() -> &'static [EventKind] {
        &[
            Self::CustomerCreated,
            Self::CustomerUpdated,
            Self::CustomerDeleted,
            Self::RouteCompleted,
            Self::SyncCompleted,
            Self::SyncFailed,
        ]
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── The event envelope ─────────────────────────────────────────────────────

/// A fully self-describing event, ready for serialisation.
///
/// ```json
/// {
///   "id":              "evt_a1b2c3d4-...",
///   "type":            "customer.created",
///   "created_at":      "2026-03-02T14:22:33.123Z",
///   "organization_id": 17,
///   "data":            { "customer": { "id": 7 } }
/// }
/// ```
///
/// One `triggerEvent` mints one envelope; every delivery fanned out from it
/// shares the same `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Globally unique event identifier (format: `evt_<uuid-v4>`).
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: EventKind,

    /// ISO-8601 timestamp (UTC).
    pub created_at: DateTime<Utc>,

    /// Tenant the event belongs to.
    pub organization_id: i64,

    /// Event-specific payload.
    pub data: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(organization_id: i64, event_type: EventKind, data: serde_json::Value) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::new_v4()),
            event_type,
            created_at: Utc::now(),
            organization_id,
            data,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
