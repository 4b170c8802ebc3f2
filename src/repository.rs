// src/repository.rs
//
// Persistence interface for webhook endpoints and deliveries.
//
// The real store lives in the platform's database layer; this crate talks to
// it through `WebhookRepository` only. Mutations on endpoints are scoped by
// `(id, organization_id)` so one tenant can never touch another tenant's
// rows. `get_endpoint_with_secret` is the single place the stored secret
// hash leaves the repository, and it is only called by the delivery engine
// and secret rotation.
//
// `InMemoryWebhookRepository` backs tests and local runs.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RepositoryError;
use crate::events::EventKind;

pub type RepoResult<T> = Result<T, RepositoryError>;

// ─── Endpoint model ─────────────────────────────────────────────────────────

/// A registered webhook destination. The secret hash is deliberately not a
/// field here, so list/get surfaces can never leak it.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEndpoint {
    pub id: i64,
    pub organization_id: i64,
    pub url: String,
    pub name: String,
    pub description: Option<String>,
    pub events: Vec<EventKind>,
    pub is_active: bool,
    /// Consecutive failed deliveries; reset to 0 on any success.
    pub failure_count: i32,
    /// Why the endpoint was disabled, when it was.
    pub disabled_reason: Option<String>,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    pub fn subscribes_to(&self, kind: EventKind) -> bool {
        self.events.contains(&kind)
    }
}

#[derive(Debug, Clone)]
pub struct NewWebhookEndpoint {
    pub organization_id: i64,
    pub url: String,
    pub name: String,
    pub description: Option<String>,
    pub events: Vec<EventKind>,
    pub secret_hash: String,
    pub created_by: i64,
}

/// Partial endpoint update; `Some` fields overwrite.
#[derive(Debug, Clone, Default)]
pub struct EndpointUpdate {
    pub url: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub events: Option<Vec<EventKind>>,
    pub is_active: Option<bool>,
}

// ─── Delivery model ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    /// Terminal states only leave via an explicit admin retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt record for one endpoint. Many per event when multiple
/// endpoints subscribe; all share the `event_id`.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookDelivery {
    pub id: i64,
    pub webhook_endpoint_id: i64,
    pub organization_id: i64,
    pub event_type: EventKind,
    pub event_id: String,
    /// Immutable envelope persisted at dispatch time.
    pub payload: serde_json::Value,
    pub status: DeliveryStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub response_status: Option<u16>,
    /// Truncated to 1000 characters before persisting.
    pub response_body: Option<String>,
    pub response_time_ms: Option<i64>,
    pub error_message: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWebhookDelivery {
    pub webhook_endpoint_id: i64,
    pub organization_id: i64,
    pub event_type: EventKind,
    pub event_id: String,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
}

/// HTTP response details captured with a delivery outcome.
#[derive(Debug, Clone, Default)]
pub struct ResponseMeta {
    pub status: Option<u16>,
    pub body: Option<String>,
    pub duration_ms: Option<i64>,
}

// ─── Repository interface ───────────────────────────────────────────────────

#[async_trait]
pub trait WebhookRepository: Send + Sync {
    // Endpoints
    async fn create_endpoint(&self, new: NewWebhookEndpoint) -> RepoResult<WebhookEndpoint>;
    async fn get_endpoint(&self, id: i64, org: i64) -> RepoResult<Option<WebhookEndpoint>>;
    async fn list_endpoints(&self, org: i64) -> RepoResult<Vec<WebhookEndpoint>>;
    async fn update_endpoint(
        &self,
        id: i64,
        org: i64,
        changes: EndpointUpdate,
    ) -> RepoResult<Option<WebhookEndpoint>>;
    async fn delete_endpoint(&self, id: i64, org: i64) -> RepoResult<bool>;

    /// Internal use only (delivery engine, secret rotation): endpoint plus
    /// its stored secret hash, fetched by id alone.
    async fn get_endpoint_with_secret(
        &self,
        id: i64,
    ) -> RepoResult<Option<(WebhookEndpoint, String)>>;

    /// Active endpoints of one tenant subscribed to the given event.
    async fn get_active_endpoints_for_event(
        &self,
        org: i64,
        kind: EventKind,
    ) -> RepoResult<Vec<WebhookEndpoint>>;

    /// Atomically replace the stored secret hash.
    async fn update_secret_hash(&self, id: i64, org: i64, secret_hash: String) -> RepoResult<bool>;

    /// Deactivate an endpoint, recording why.
    async fn disable_endpoint(&self, id: i64, reason: &str) -> RepoResult<()>;

    /// A successful delivery resets the failure counter.
    async fn record_endpoint_success(&self, id: i64) -> RepoResult<()>;

    /// A failed delivery bumps the counter; returns the new value.
    async fn record_endpoint_failure(&self, id: i64) -> RepoResult<i32>;

    // Deliveries
    async fn create_delivery(&self, new: NewWebhookDelivery) -> RepoResult<WebhookDelivery>;

    /// Everything due now: `pending` rows plus `retrying` rows whose
    /// `next_retry_at` has passed.
    async fn get_due_deliveries(&self, now: DateTime<Utc>) -> RepoResult<Vec<WebhookDelivery>>;

    async fn get_delivery(&self, id: i64, org: i64) -> RepoResult<Option<WebhookDelivery>>;

    /// Delivery history for one endpoint, newest first.
    async fn list_deliveries_for_endpoint(
        &self,
        endpoint_id: i64,
        org: i64,
        limit: usize,
    ) -> RepoResult<Vec<WebhookDelivery>>;

    async fn mark_delivered(&self, id: i64, attempt_count: i32, meta: ResponseMeta)
        -> RepoResult<()>;

    async fn mark_retrying(
        &self,
        id: i64,
        attempt_count: i32,
        next_retry_at: DateTime<Utc>,
        error: &str,
        meta: ResponseMeta,
    ) -> RepoResult<()>;

    async fn mark_failed(
        &self,
        id: i64,
        attempt_count: i32,
        error: &str,
        meta: ResponseMeta,
    ) -> RepoResult<()>;

    /// Admin retry: back to `pending` with counters and schedule cleared.
    async fn reset_for_retry(&self, id: i64, org: i64) -> RepoResult<bool>;
}

// ─── In-memory implementation ───────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    endpoints: HashMap<i64, (WebhookEndpoint, String)>,
    deliveries: HashMap<i64, WebhookDelivery>,
    next_endpoint_id: i64,
    next_delivery_id: i64,
}

/// Hash-map backed repository. All operations are synchronous under one
/// mutex; nothing awaits while holding it.
#[derive(Default)]
pub struct InMemoryWebhookRepository {
    inner: Mutex<Inner>,
}

impl InMemoryWebhookRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookRepository for InMemoryWebhookRepository {
    async fn create_endpoint(&self, new: NewWebhookEndpoint) -> RepoResult<WebhookEndpoint> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_endpoint_id += 1;
        let endpoint = WebhookEndpoint {
            id: inner.next_endpoint_id,
            organization_id: new.organization_id,
            url: new.url,
            name: new.name,
            description: new.description,
            events: new.events,
            is_active: true,
            failure_count: 0,
            disabled_reason: None,
            created_by: new.created_by,
            created_at: Utc::now(),
        };
        inner
            .endpoints
            .insert(endpoint.id, (endpoint.clone(), new.secret_hash));
        Ok(endpoint)
    }

    async fn get_endpoint(&self, id: i64, org: i64) -> RepoResult<Option<WebhookEndpoint>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .endpoints
            .get(&id)
            .filter(|(e, _)| e.organization_id == org)
            .map(|(e, _)| e.clone()))
    }

    async fn list_endpoints(&self, org: i64) -> RepoResult<Vec<WebhookEndpoint>> {
        let inner = self.inner.lock().unwrap();
        let mut list: Vec<WebhookEndpoint> = inner
            .endpoints
            .values()
            .filter(|(e, _)| e.organization_id == org)
            .map(|(e, _)| e.clone())
            .collect();
        list.sort_by_key(|e| e.id);
        Ok(list)
    }

    async fn update_endpoint(
        &self,
        id: i64,
        org: i64,
        changes: EndpointUpdate,
    ) -> RepoResult<Option<WebhookEndpoint>> {
        let mut inner = self.inner.lock().unwrap();
        let Some((endpoint, _)) = inner
            .endpoints
            .get_mut(&id)
            .filter(|(e, _)| e.organization_id == org)
        else {
            return Ok(None);
        };

        if let Some(url) = changes.url {
            endpoint.url = url;
        }
        if let Some(name) = changes.name {
            endpoint.name = name;
        }
        if let Some(description) = changes.description {
            endpoint.description = Some(description);
        }
        if let Some(events) = changes.events {
            endpoint.events = events;
        }
        if let Some(is_active) = changes.is_active {
            endpoint.is_active = is_active;
            if is_active {
                endpoint.disabled_reason = None;
            }
        }
        Ok(Some(endpoint.clone()))
    }

    async fn delete_endpoint(&self, id: i64, org: i64) -> RepoResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let owned = inner
            .endpoints
            .get(&id)
            .is_some_and(|(e, _)| e.organization_id == org);
        if owned {
            inner.endpoints.remove(&id);
        }
        Ok(owned)
    }

    async fn get_endpoint_with_secret(
        &self,
        id: i64,
    ) -> RepoResult<Option<(WebhookEndpoint, String)>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.endpoints.get(&id).cloned())
    }

    async fn get_active_endpoints_for_event(
        &self,
        org: i64,
        kind: EventKind,
    ) -> RepoResult<Vec<WebhookEndpoint>> {
        let inner = self.inner.lock().unwrap();
        let mut list: Vec<WebhookEndpoint> = inner
            .endpoints
            .values()
            .filter(|(e, _)| e.organization_id == org && e.is_active && e.subscribes_to(kind))
            .map(|(e, _)| e.clone())
            .collect();
        list.sort_by_key(|e| e.id);
        Ok(list)
    }

    async fn update_secret_hash(&self, id: i64, org: i64, secret_hash: String) -> RepoResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner
            .endpoints
            .get_mut(&id)
            .filter(|(e, _)| e.organization_id == org)
        else {
            return Ok(false);
        };
        entry.1 = secret_hash;
        Ok(true)
    }

    async fn disable_endpoint(&self, id: i64, reason: &str) -> RepoResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((endpoint, _)) = inner.endpoints.get_mut(&id) {
            endpoint.is_active = false;
            endpoint.disabled_reason = Some(reason.to_string());
        }
        Ok(())
    }

    async fn record_endpoint_success(&self, id: i64) -> RepoResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((endpoint, _)) = inner.endpoints.get_mut(&id) {
            endpoint.failure_count = 0;
        }
        Ok(())
    }

    async fn record_endpoint_failure(&self, id: i64) -> RepoResult<i32> {
        let mut inner = self.inner.lock().unwrap();
        let Some((endpoint, _)) = inner.endpoints.get_mut(&id) else {
            return Ok(0);
        };
        endpoint.failure_count += 1;
        Ok(endpoint.failure_count)
    }

    async fn create_delivery(&self, new: NewWebhookDelivery) -> RepoResult<WebhookDelivery> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_delivery_id += 1;
        let delivery = WebhookDelivery {
            id: inner.next_delivery_id,
            webhook_endpoint_id: new.webhook_endpoint_id,
            organization_id: new.organization_id,
            event_type: new.event_type,
            event_id: new.event_id,
            payload: new.payload,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            max_attempts: new.max_attempts,
            next_retry_at: None,
            response_status: None,
            response_body: None,
            response_time_ms: None,
            error_message: None,
            delivered_at: None,
            created_at: Utc::now(),
        };
        inner.deliveries.insert(delivery.id, delivery.clone());
        Ok(delivery)
    }

    async fn get_due_deliveries(&self, now: DateTime<Utc>) -> RepoResult<Vec<WebhookDelivery>> {
        let inner = self.inner.lock().unwrap();
        let mut due: Vec<WebhookDelivery> = inner
            .deliveries
            .values()
            .filter(|d| match d.status {
                DeliveryStatus::Pending => true,
                DeliveryStatus::Retrying => d.next_retry_at.is_some_and(|at| at <= now),
                _ => false,
            })
            .cloned()
            .collect();
        due.sort_by_key(|d| d.id);
        Ok(due)
    }

    async fn get_delivery(&self, id: i64, org: i64) -> RepoResult<Option<WebhookDelivery>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .deliveries
            .get(&id)
            .filter(|d| d.organization_id == org)
            .cloned())
    }

    async fn list_deliveries_for_endpoint(
        &self,
        endpoint_id: i64,
        org: i64,
        limit: usize,
    ) -> RepoResult<Vec<WebhookDelivery>> {
        let inner = self.inner.lock().unwrap();
        let mut list: Vec<WebhookDelivery> = inner
            .deliveries
            .values()
            .filter(|d| d.webhook_endpoint_id == endpoint_id && d.organization_id == org)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.id.cmp(&a.id));
        list.truncate(limit);
        Ok(list)
    }

    async fn mark_delivered(
        &self,
        id: i64,
        attempt_count: i32,
        meta: ResponseMeta,
    ) -> RepoResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(d) = inner.deliveries.get_mut(&id) {
            d.status = DeliveryStatus::Delivered;
            d.attempt_count = attempt_count;
            d.next_retry_at = None;
            d.error_message = None;
            d.response_status = meta.status;
            d.response_body = meta.body;
            d.response_time_ms = meta.duration_ms;
            d.delivered_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_retrying(
        &self,
        id: i64,
        attempt_count: i32,
        next_retry_at: DateTime<Utc>,
        error: &str,
        meta: ResponseMeta,
    ) -> RepoResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(d) = inner.deliveries.get_mut(&id) {
            d.status = DeliveryStatus::Retrying;
            d.attempt_count = attempt_count;
            d.next_retry_at = Some(next_retry_at);
            d.error_message = Some(error.to_string());
            d.response_status = meta.status;
            d.response_body = meta.body;
            d.response_time_ms = meta.duration_ms;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        attempt_count: i32,
        error: &str,
        meta: ResponseMeta,
    ) -> RepoResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(d) = inner.deliveries.get_mut(&id) {
            d.status = DeliveryStatus::Failed;
            d.attempt_count = attempt_count;
            d.next_retry_at = None;
            d.error_message = Some(error.to_string());
            d.response_status = meta.status;
            d.response_body = meta.body;
            d.response_time_ms = meta.duration_ms;
        }
        Ok(())
    }

    async fn reset_for_retry(&self, id: i64, org: i64) -> RepoResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(d) = inner
            .deliveries
            .get_mut(&id)
            .filter(|d| d.organization_id == org && d.status != DeliveryStatus::Delivered)
        else {
            return Ok(false);
        };
        d.status = DeliveryStatus::Pending;
        d.attempt_count = 0;
        d.next_retry_at = None;
        d.error_message = None;
        Ok(true)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
