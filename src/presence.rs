// src/presence.rs
//
// Customer-claim presence: a soft, advisory lock showing which user is
// currently working on a given customer record.
//
// State is per-tenant and in-memory only. Claim/release broadcasts go out
// while the tenant map lock is held (sends are non-blocking channel pushes),
// so every observer in the tenant sees a coherent claim/release sequence
// for each customer.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::registry::ConnectionRegistry;

// ─── Claim ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceClaim {
    pub user_id: i64,
    pub user_name: String,
    pub initials: String,
    pub claimed_at: DateTime<Utc>,
}

/// Short display initials for a user name.
///
/// The name splits on `.`, `-`, `_` and whitespace; with two or more parts
/// the first letter of each of the first two is used, otherwise the first
/// two characters. Always uppercased.
pub fn initials(name: &str) -> String {
    let parts: Vec<&str> = name
        .split(|c: char| c == '.' || c == '-' || c == '_' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .collect();

    let raw: String = if parts.len() >= 2 {
        parts[0]
            .chars()
            .take(1)
            .chain(parts[1].chars().take(1))
            .collect()
    } else {
        name.chars().take(2).collect()
    };
    raw.to_uppercase()
}

// ─── Manager ────────────────────────────────────────────────────────────────

type TenantClaims = HashMap<i64, PresenceClaim>;

/// Per-tenant claim maps with single-owner release semantics.
pub struct PresenceManager {
    tenants: RwLock<HashMap<i64, TenantClaims>>,
    registry: Arc<ConnectionRegistry>,
}

impl PresenceManager {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            registry,
        }
    }

    /// Claim a customer for a user.
    ///
    /// Re-claiming with unchanged attributes is a no-op. A claim held by a
    /// different user is displaced silently (last writer wins). Broadcasts
    /// `customer_claimed` to the tenant on every state change.
    pub fn claim(&self, org: i64, customer_id: i64, user_id: i64, user_name: &str) {
        let mut tenants = self.tenants.write().unwrap();
        let claims = tenants.entry(org).or_default();

        if let Some(existing) = claims.get(&customer_id) {
            if existing.user_id == user_id && existing.user_name == user_name {
                return;
            }
        }

        let claim = PresenceClaim {
            user_id,
            user_name: user_name.to_string(),
            initials: initials(user_name),
            claimed_at: Utc::now(),
        };
        claims.insert(customer_id, claim.clone());

        debug!(org_id = org, customer_id, user_id, "customer claimed");
        self.registry.broadcast(
            org,
            "customer_claimed",
            json!({
                "kundeId": customer_id,
                "userId": claim.user_id,
                "userName": claim.user_name,
                "initials": claim.initials,
                "claimedAt": claim.claimed_at,
            }),
            None,
        );
    }

    /// Release a claim. No-op unless `user_id` owns it. Broadcasts
    /// `customer_released` on success.
    pub fn release(&self, org: i64, customer_id: i64, user_id: i64) {
        let mut tenants = self.tenants.write().unwrap();
        let Some(claims) = tenants.get_mut(&org) else {
            return;
        };
        if claims.get(&customer_id).map(|c| c.user_id) != Some(user_id) {
            return;
        }
        claims.remove(&customer_id);
        if claims.is_empty() {
            tenants.remove(&org);
        }

        debug!(org_id = org, customer_id, user_id, "customer released");
        self.registry.broadcast(
            org,
            "customer_released",
            json!({ "kundeId": customer_id, "userId": user_id }),
            None,
        );
    }

    /// Drop every claim a user holds in the tenant, broadcasting
    /// `customer_released` for each. Invoked on disconnect.
    pub fn release_all(&self, org: i64, user_id: i64) {
        let mut tenants = self.tenants.write().unwrap();
        let Some(claims) = tenants.get_mut(&org) else {
            return;
        };

        let owned: Vec<i64> = claims
            .iter()
            .filter(|(_, c)| c.user_id == user_id)
            .map(|(id, _)| *id)
            .collect();

        for customer_id in owned {
            claims.remove(&customer_id);
            self.registry.broadcast(
                org,
                "customer_released",
                json!({ "kundeId": customer_id, "userId": user_id }),
                None,
            );
        }
        if claims.is_empty() {
            tenants.remove(&org);
        }
    }

    /// Current claims for a tenant, keyed by customer id, as sent in the
    /// `connected` handshake message.
    pub fn snapshot(&self, org: i64) -> serde_json::Value {
        let tenants = self.tenants.read().unwrap();
        let Some(claims) = tenants.get(&org) else {
            return json!({});
        };
        let map: serde_json::Map<String, serde_json::Value> = claims
            .iter()
            .map(|(id, claim)| (id.to_string(), serde_json::to_value(claim).unwrap_or_default()))
            .collect();
        serde_json::Value::Object(map)
    }

    /// Whether any claim exists for the tenant (used by shutdown/tests).
    pub fn is_empty(&self, org: i64) -> bool {
        let tenants = self.tenants.read().unwrap();
        tenants.get(&org).map_or(true, |claims| claims.is_empty())
    }

    /// Drop all tenant maps. Used by graceful shutdown.
    pub fn clear(&self) {
        self.tenants.write().unwrap().clear();
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
