// src/webhook.rs
//
// Webhook service: endpoint administration, event dispatch, and the
// delivery engine.
//
// ─ Architecture ─────────────────────────────────────────────────────────────
//
//   business code ──trigger_event()──> WebhookService
//                                          │ persists one pending delivery
//                                          │ per subscribed endpoint
//                                          ▼
//                                   DeliveryEngine (background task)
//                                          │
//                                          ├─ woken by kick() and by a
//                                          │  periodic sweep for due retries
//                                          ├─ re-validates the URL
//                                          ├─ signs payload (HMAC-SHA256)
//                                          ├─ POSTs with a 30 s timeout
//                                          └─ records outcome via repository
//
// ─ Retry policy ─────────────────────────────────────────────────────────────
//
//   Failures reschedule with delays 1 min, 5 min, 15 min, 1 h, 2 h; a
//   delivery is abandoned as `failed` after 6 attempts. Ten consecutive
//   endpoint failures auto-deactivate the endpoint.
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use reqwest::Client;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::WebhookError;
use crate::events::{EventEnvelope, EventKind};
use crate::repository::{
    EndpointUpdate, NewWebhookDelivery, NewWebhookEndpoint, ResponseMeta, WebhookDelivery,
    WebhookEndpoint, WebhookRepository,
};
use crate::signature;
use crate::url_safety::validate_endpoint_url;

/// Retry delays in seconds: 1 min, 5 min, 15 min, 1 h, 2 h.
const RETRY_DELAYS_SECS: [i64; 5] = [60, 300, 900, 3600, 7200];

/// Attempts per delivery before giving up (schedule length + 1).
pub const MAX_ATTEMPTS: i32 = RETRY_DELAYS_SECS.len() as i32 + 1;

/// Consecutive endpoint failures before auto-deactivation.
const AUTO_DISABLE_THRESHOLD: i32 = 10;

const AUTO_DISABLE_REASON: &str = "Auto-deactivated after repeated failures";

/// Hard wall-clock budget for one delivery attempt.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Stored response bodies are truncated to this many characters.
const RESPONSE_BODY_CAP: usize = 1000;

/// Concurrent attempts per engine pass.
const MAX_CONCURRENT_DELIVERIES: usize = 8;

const USER_AGENT: &str = "SkyPlanner-Webhooks/1.0";

// ─── Delivery engine ────────────────────────────────────────────────────────

/// Result of the HTTP leg of one attempt.
enum AttemptOutcome {
    /// Endpoint missing, disabled, or its URL no longer validates; the
    /// delivery fails without an HTTP request and without counting against
    /// the endpoint.
    Blocked(String),
    Response {
        status: u16,
        body: String,
        duration_ms: i64,
    },
    Transport {
        error: String,
        duration_ms: i64,
    },
}

/// Consumes due deliveries and attempts each one. A single engine task owns
/// the loop; dispatcher kicks and admin retries funnel through `kick()`, so
/// triggering is reentrant-safe and the repository stays the source of
/// truth.
pub struct DeliveryEngine {
    repo: Arc<dyn WebhookRepository>,
    client: Client,
    kick: Notify,
    /// Disabled only by the test constructor, so unit tests can point the
    /// engine at a plain-HTTP loopback receiver.
    verify_destinations: bool,
}

impl DeliveryEngine {
    pub fn new(repo: Arc<dyn WebhookRepository>) -> Arc<Self> {
        Arc::new(Self {
            repo,
            client: Client::builder()
                .timeout(DELIVERY_TIMEOUT)
                .redirect(reqwest::redirect::Policy::none())
                .user_agent(USER_AGENT)
                .build()
                .expect("failed to build webhook HTTP client"),
            kick: Notify::new(),
            verify_destinations: true,
        })
    }

    #[cfg(test)]
    fn new_for_tests(repo: Arc<dyn WebhookRepository>) -> Arc<Self> {
        Arc::new(Self {
            repo,
            client: Client::builder()
                .timeout(DELIVERY_TIMEOUT)
                .user_agent(USER_AGENT)
                .build()
                .unwrap(),
            kick: Notify::new(),
            verify_destinations: false,
        })
    }

    /// Wake the engine loop; called after queueing deliveries.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// Spawn the background loop: process on every kick and on a periodic
    /// sweep that picks up due retries.
    pub fn spawn(self: &Arc<Self>, sweep_interval: Duration) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            info!(sweep_secs = sweep_interval.as_secs(), "webhook delivery engine started");
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = engine.kick.notified() => {}
                }
                engine.process_due().await;
            }
        })
    }

    /// Attempt every delivery currently due.
    pub async fn process_due(&self) {
        let due = match self.repo.get_due_deliveries(Utc::now()).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "failed to load due webhook deliveries");
                return;
            }
        };
        if due.is_empty() {
            return;
        }

        debug!(count = due.len(), "processing due webhook deliveries");
        futures::stream::iter(due)
            .for_each_concurrent(MAX_CONCURRENT_DELIVERIES, |delivery| async move {
                self.attempt(delivery).await;
            })
            .await;
    }

    /// Run one delivery attempt end to end and record its outcome.
    async fn attempt(&self, delivery: WebhookDelivery) {
        let outcome = self.run_attempt(&delivery).await;
        self.record_outcome(&delivery, outcome).await;
    }

    async fn run_attempt(&self, delivery: &WebhookDelivery) -> AttemptOutcome {
        let endpoint = match self.repo.get_endpoint_with_secret(delivery.webhook_endpoint_id).await
        {
            Ok(Some((endpoint, _))) if !endpoint.is_active => None,
            Ok(Some(pair)) => Some(pair),
            Ok(None) => None,
            Err(e) => {
                return AttemptOutcome::Transport {
                    error: format!("storage error: {e}"),
                    duration_ms: 0,
                }
            }
        };
        let Some((endpoint, secret_hash)) = endpoint else {
            return AttemptOutcome::Blocked("endpoint inactive or not found".into());
        };

        // DNS answers change; the URL is checked again on every attempt.
        if self.verify_destinations {
            if let Err(e) = validate_endpoint_url(&endpoint.url).await {
                return AttemptOutcome::Blocked(e.to_string());
            }
        }

        let body = serde_json::to_vec(&delivery.payload).expect("JSON value serialization cannot fail");
        let sig = signature::sign_payload(&secret_hash, &body);

        let started = Instant::now();
        let result = self
            .client
            .post(&endpoint.url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Signature", format!("sha256={sig}"))
            .header("X-Webhook-Event", delivery.event_type.as_str())
            .header("X-Webhook-ID", &delivery.event_id)
            .header("X-Webhook-Timestamp", Utc::now().to_rfc3339())
            .body(body)
            .send()
            .await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                let body: String = response
                    .text()
                    .await
                    .unwrap_or_default()
                    .chars()
                    .take(RESPONSE_BODY_CAP)
                    .collect();
                AttemptOutcome::Response {
                    status,
                    body,
                    duration_ms,
                }
            }
            Err(e) => {
                let error = if e.is_timeout() {
                    format!("timed out after {}s", DELIVERY_TIMEOUT.as_secs())
                } else {
                    e.to_string()
                };
                AttemptOutcome::Transport { error, duration_ms }
            }
        }
    }

    /// Apply the delivery state machine to an attempt outcome.
    async fn record_outcome(&self, delivery: &WebhookDelivery, outcome: AttemptOutcome) {
        let result = match outcome {
            AttemptOutcome::Blocked(reason) => {
                warn!(
                    delivery_id = delivery.id,
                    endpoint_id = delivery.webhook_endpoint_id,
                    reason = %reason,
                    "webhook delivery blocked"
                );
                self.repo
                    .mark_failed(delivery.id, delivery.attempt_count, &reason, ResponseMeta::default())
                    .await
            }
            AttemptOutcome::Response {
                status,
                body,
                duration_ms,
            } if (200..300).contains(&status) => {
                let attempts = delivery.attempt_count + 1;
                info!(
                    delivery_id = delivery.id,
                    endpoint_id = delivery.webhook_endpoint_id,
                    status,
                    attempts,
                    duration_ms,
                    "webhook delivered"
                );
                let meta = ResponseMeta {
                    status: Some(status),
                    body: Some(body),
                    duration_ms: Some(duration_ms),
                };
                match self.repo.mark_delivered(delivery.id, attempts, meta).await {
                    Ok(()) => self.repo.record_endpoint_success(delivery.webhook_endpoint_id).await,
                    Err(e) => Err(e),
                }
            }
            AttemptOutcome::Response {
                status,
                body,
                duration_ms,
            } => {
                let meta = ResponseMeta {
                    status: Some(status),
                    body: Some(body),
                    duration_ms: Some(duration_ms),
                };
                self.record_failure(delivery, format!("HTTP {status}"), meta).await
            }
            AttemptOutcome::Transport { error, duration_ms } => {
                let meta = ResponseMeta {
                    status: None,
                    body: None,
                    duration_ms: Some(duration_ms),
                };
                self.record_failure(delivery, error, meta).await
            }
        };

        // Delivery errors never escape to callers; a failed bookkeeping write
        // is only observable in the logs.
        if let Err(e) = result {
            error!(delivery_id = delivery.id, error = %e, "failed to record delivery outcome");
        }
    }

    /// Failed attempt: schedule a retry or give up, then bump the endpoint
    /// failure counter and auto-disable past the threshold.
    async fn record_failure(
        &self,
        delivery: &WebhookDelivery,
        error: String,
        meta: ResponseMeta,
    ) -> Result<(), crate::error::RepositoryError> {
        let attempts = delivery.attempt_count + 1;

        if attempts >= delivery.max_attempts {
            warn!(
                delivery_id = delivery.id,
                endpoint_id = delivery.webhook_endpoint_id,
                attempts,
                error = %error,
                "webhook delivery permanently failed"
            );
            self.repo.mark_failed(delivery.id, attempts, &error, meta).await?;
        } else {
            let idx = ((attempts - 1) as usize).min(RETRY_DELAYS_SECS.len() - 1);
            let next_retry_at = Utc::now() + chrono::Duration::seconds(RETRY_DELAYS_SECS[idx]);
            warn!(
                delivery_id = delivery.id,
                endpoint_id = delivery.webhook_endpoint_id,
                attempts,
                next_retry_at = %next_retry_at,
                error = %error,
                "webhook delivery failed, will retry"
            );
            self.repo
                .mark_retrying(delivery.id, attempts, next_retry_at, &error, meta)
                .await?;
        }

        let failures = self
            .repo
            .record_endpoint_failure(delivery.webhook_endpoint_id)
            .await?;
        if failures >= AUTO_DISABLE_THRESHOLD {
            warn!(
                endpoint_id = delivery.webhook_endpoint_id,
                failures, "endpoint exceeded failure threshold, deactivating"
            );
            self.repo
                .disable_endpoint(delivery.webhook_endpoint_id, AUTO_DISABLE_REASON)
                .await?;
        }
        Ok(())
    }
}

// ─── Webhook service ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CreateEndpointRequest {
    pub url: String,
    pub name: String,
    pub description: Option<String>,
    pub events: Vec<EventKind>,
    pub created_by: i64,
}

/// Creation result; `secret` is shown exactly once and never stored.
#[derive(Debug)]
pub struct CreatedEndpoint {
    pub endpoint: WebhookEndpoint,
    pub secret: String,
}

/// Endpoint administration and event dispatch, on top of the repository and
/// the delivery engine.
pub struct WebhookService {
    repo: Arc<dyn WebhookRepository>,
    engine: Arc<DeliveryEngine>,
}

impl WebhookService {
    pub fn new(repo: Arc<dyn WebhookRepository>, engine: Arc<DeliveryEngine>) -> Self {
        Self { repo, engine }
    }

    // ── Endpoint administration ─────────────────────────────────────────

    pub async fn create_endpoint(
        &self,
        org: i64,
        req: CreateEndpointRequest,
    ) -> Result<CreatedEndpoint, WebhookError> {
        if req.events.is_empty() {
            return Err(WebhookError::NoEvents);
        }
        validate_endpoint_url(&req.url).await?;

        let secret = signature::generate_secret();
        let endpoint = self
            .repo
            .create_endpoint(NewWebhookEndpoint {
                organization_id: org,
                url: req.url,
                name: req.name,
                description: req.description,
                events: req.events,
                secret_hash: signature::hash_secret(&secret),
                created_by: req.created_by,
            })
            .await?;

        info!(org_id = org, endpoint_id = endpoint.id, url = %endpoint.url, "webhook endpoint created");
        Ok(CreatedEndpoint { endpoint, secret })
    }

    pub async fn get_endpoint(&self, id: i64, org: i64) -> Result<WebhookEndpoint, WebhookError> {
        self.repo
            .get_endpoint(id, org)
            .await?
            .ok_or(WebhookError::EndpointNotFound)
    }

    pub async fn list_endpoints(&self, org: i64) -> Result<Vec<WebhookEndpoint>, WebhookError> {
        Ok(self.repo.list_endpoints(org).await?)
    }

    pub async fn update_endpoint(
        &self,
        id: i64,
        org: i64,
        changes: EndpointUpdate,
    ) -> Result<WebhookEndpoint, WebhookError> {
        if let Some(url) = &changes.url {
            validate_endpoint_url(url).await?;
        }
        if changes.events.as_ref().is_some_and(|e| e.is_empty()) {
            return Err(WebhookError::NoEvents);
        }
        self.repo
            .update_endpoint(id, org, changes)
            .await?
            .ok_or(WebhookError::EndpointNotFound)
    }

    pub async fn delete_endpoint(&self, id: i64, org: i64) -> Result<(), WebhookError> {
        if self.repo.delete_endpoint(id, org).await? {
            info!(org_id = org, endpoint_id = id, "webhook endpoint deleted");
            Ok(())
        } else {
            Err(WebhookError::EndpointNotFound)
        }
    }

    /// Replace the endpoint secret; returns the new plaintext exactly once.
    pub async fn rotate_secret(&self, id: i64, org: i64) -> Result<String, WebhookError> {
        let secret = signature::generate_secret();
        if self
            .repo
            .update_secret_hash(id, org, signature::hash_secret(&secret))
            .await?
        {
            info!(org_id = org, endpoint_id = id, "webhook secret rotated");
            Ok(secret)
        } else {
            Err(WebhookError::EndpointNotFound)
        }
    }

    pub async fn delivery_history(
        &self,
        endpoint_id: i64,
        org: i64,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, WebhookError> {
        Ok(self
            .repo
            .list_deliveries_for_endpoint(endpoint_id, org, limit)
            .await?)
    }

    /// Admin retry: put a non-delivered delivery back in the queue with
    /// counters cleared, then wake the engine.
    pub async fn retry_delivery(&self, id: i64, org: i64) -> Result<(), WebhookError> {
        let delivery = self
            .repo
            .get_delivery(id, org)
            .await?
            .ok_or(WebhookError::DeliveryNotFound)?;
        if delivery.status == crate::repository::DeliveryStatus::Delivered {
            return Err(WebhookError::AlreadyDelivered);
        }
        if !self.repo.reset_for_retry(id, org).await? {
            return Err(WebhookError::DeliveryNotFound);
        }
        self.engine.kick();
        Ok(())
    }

    // ── Event dispatch ──────────────────────────────────────────────────

    /// Queue one delivery per subscribed active endpoint and wake the
    /// engine. Returns the number of deliveries queued; the caller never
    /// waits for any HTTP work.
    pub async fn trigger_event(
        &self,
        org: i64,
        kind: EventKind,
        data: serde_json::Value,
    ) -> Result<usize, WebhookError> {
        let endpoints = self.repo.get_active_endpoints_for_event(org, kind).await?;
        if endpoints.is_empty() {
            debug!(org_id = org, event = %kind, "no webhook endpoints subscribed");
            return Ok(0);
        }

        let envelope = EventEnvelope::new(org, kind, data);
        let payload = serde_json::to_value(&envelope)
            .expect("event envelope serialization cannot fail");

        for endpoint in &endpoints {
            self.repo
                .create_delivery(NewWebhookDelivery {
                    webhook_endpoint_id: endpoint.id,
                    organization_id: org,
                    event_type: kind,
                    event_id: envelope.id.clone(),
                    payload: payload.clone(),
                    max_attempts: MAX_ATTEMPTS,
                })
                .await?;
        }

        info!(
            org_id = org,
            event = %kind,
            event_id = %envelope.id,
            endpoints = endpoints.len(),
            "webhook event queued"
        );
        self.engine.kick();
        Ok(endpoints.len())
    }

    // ── Typed convenience triggers ──────────────────────────────────────

    pub async fn customer_created(
        &self,
        org: i64,
        customer: serde_json::Value,
    ) -> Result<usize, WebhookError> {
        self.trigger_event(org, EventKind::CustomerCreated, serde_json::json!({ "customer": customer }))
            .await
    }

    pub async fn customer_updated(
        &self,
        org: i64,
        customer: serde_json::Value,
    ) -> Result<usize, WebhookError> {
        self.trigger_event(org, EventKind::CustomerUpdated, serde_json::json!({ "customer": customer }))
            .await
    }

    pub async fn customer_deleted(
        &self,
        org: i64,
        customer_id: i64,
    ) -> Result<usize, WebhookError> {
        self.trigger_event(
            org,
            EventKind::CustomerDeleted,
            serde_json::json!({ "customer": { "id": customer_id } }),
        )
        .await
    }

    pub async fn route_completed(
        &self,
        org: i64,
        route: serde_json::Value,
    ) -> Result<usize, WebhookError> {
        self.trigger_event(org, EventKind::RouteCompleted, serde_json::json!({ "route": route }))
            .await
    }

    pub async fn sync_completed(
        &self,
        org: i64,
        summary: serde_json::Value,
    ) -> Result<usize, WebhookError> {
        self.trigger_event(org, EventKind::SyncCompleted, serde_json::json!({ "sync": summary }))
            .await
    }

    pub async fn sync_failed(
        &self,
        org: i64,
        details: serde_json::Value,
    ) -> Result<usize, WebhookError> {
        self.trigger_event(org, EventKind::SyncFailed, serde_json::json!({ "sync": details }))
            .await
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::Router;

    use crate::repository::{DeliveryStatus, InMemoryWebhookRepository};

    // ── Test receiver ───────────────────────────────────────────────────

    #[derive(Default)]
    struct Receiver {
        /// Status codes to answer with, in order; empty queue answers 200.
        responses: Mutex<VecDeque<u16>>,
        requests: Mutex<Vec<(HeaderMap, Vec<u8>)>>,
    }

    impl Receiver {
        fn push_responses(&self, statuses: &[u16]) {
            self.responses.lock().unwrap().extend(statuses.iter().copied());
        }

        fn requests(&self) -> Vec<(HeaderMap, Vec<u8>)> {
            self.requests.lock().unwrap().clone()
        }
    }

    async fn receiver_handler(
        State(receiver): State<Arc<Receiver>>,
        headers: HeaderMap,
        body: axum::body::Bytes,
    ) -> axum::http::StatusCode {
        receiver
            .requests
            .lock()
            .unwrap()
            .push((headers, body.to_vec()));
        let status = receiver
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(200);
        axum::http::StatusCode::from_u16(status).unwrap()
    }

    async fn spawn_receiver() -> (Arc<Receiver>, String) {
        let receiver = Arc::new(Receiver::default());
        let app = Router::new()
            .route("/hook", post(receiver_handler))
            .with_state(receiver.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (receiver, format!("http://{addr}/hook"))
    }

    // ── Fixtures ────────────────────────────────────────────────────────

    struct Fixture {
        repo: Arc<InMemoryWebhookRepository>,
        engine: Arc<DeliveryEngine>,
        service: WebhookService,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryWebhookRepository::new());
        let engine = DeliveryEngine::new_for_tests(repo.clone());
        let service = WebhookService::new(repo.clone(), engine.clone());
        Fixture {
            repo,
            engine,
            service,
        }
    }

    async fn seed_endpoint(fx: &Fixture, org: i64, url: &str) -> (WebhookEndpoint, String) {
        let secret = signature::generate_secret();
        let endpoint = fx
            .repo
            .create_endpoint(NewWebhookEndpoint {
                organization_id: org,
                url: url.to_string(),
                name: "receiver".into(),
                description: None,
                events: vec![EventKind::CustomerCreated],
                secret_hash: signature::hash_secret(&secret),
                created_by: 1,
            })
            .await
            .unwrap();
        (endpoint, secret)
    }

    async fn backdate_retry(fx: &Fixture, delivery_id: i64, org: i64) {
        let row = fx.repo.get_delivery(delivery_id, org).await.unwrap().unwrap();
        fx.repo
            .mark_retrying(
                delivery_id,
                row.attempt_count,
                Utc::now() - chrono::Duration::seconds(1),
                row.error_message.as_deref().unwrap_or(""),
                ResponseMeta::default(),
            )
            .await
            .unwrap();
    }

    // ── Service-level tests ─────────────────────────────────────────────

    #[tokio::test]
    async fn create_endpoint_returns_secret_once_and_stores_hash() {
        let fx = fixture();
        let created = fx
            .service
            .create_endpoint(
                1,
                CreateEndpointRequest {
                    url: "https://93.184.216.34/hook".into(),
                    name: "crm".into(),
                    description: Some("CRM sync".into()),
                    events: vec![EventKind::CustomerCreated],
                    created_by: 9,
                },
            )
            .await
            .unwrap();

        assert!(created.secret.starts_with("whsec_"));
        let (_, stored_hash) = fx
            .repo
            .get_endpoint_with_secret(created.endpoint.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_hash, signature::hash_secret(&created.secret));
        assert_ne!(stored_hash, created.secret);
    }

    #[tokio::test]
    async fn create_endpoint_rejects_bad_input() {
        let fx = fixture();

        let no_events = fx
            .service
            .create_endpoint(
                1,
                CreateEndpointRequest {
                    url: "https://93.184.216.34/hook".into(),
                    name: "x".into(),
                    description: None,
                    events: vec![],
                    created_by: 1,
                },
            )
            .await;
        assert!(matches!(no_events, Err(WebhookError::NoEvents)));

        let ssrf = fx
            .service
            .create_endpoint(
                1,
                CreateEndpointRequest {
                    url: "https://169.254.169.254/latest".into(),
                    name: "x".into(),
                    description: None,
                    events: vec![EventKind::CustomerCreated],
                    created_by: 1,
                },
            )
            .await;
        assert!(matches!(ssrf, Err(WebhookError::InvalidUrl(_))));

        let plain_http = fx
            .service
            .create_endpoint(
                1,
                CreateEndpointRequest {
                    url: "http://example.com/hook".into(),
                    name: "x".into(),
                    description: None,
                    events: vec![EventKind::CustomerCreated],
                    created_by: 1,
                },
            )
            .await;
        assert!(matches!(plain_http, Err(WebhookError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn rotate_secret_produces_fresh_secret() {
        let fx = fixture();
        let (endpoint, old_secret) = seed_endpoint(&fx, 1, "https://93.184.216.34/hook").await;

        let new_secret = fx.service.rotate_secret(endpoint.id, 1).await.unwrap();
        assert_ne!(new_secret, old_secret);

        let (_, stored) = fx
            .repo
            .get_endpoint_with_secret(endpoint.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, signature::hash_secret(&new_secret));

        // Wrong tenant cannot rotate.
        assert!(matches!(
            fx.service.rotate_secret(endpoint.id, 2).await,
            Err(WebhookError::EndpointNotFound)
        ));
    }

    #[tokio::test]
    async fn trigger_event_fans_out_with_shared_event_id() {
        let fx = fixture();
        let (a, _) = seed_endpoint(&fx, 1, "https://93.184.216.34/a").await;
        let (b, _) = seed_endpoint(&fx, 1, "https://93.184.216.34/b").await;
        // Different tenant, same subscription: must not receive anything.
        seed_endpoint(&fx, 2, "https://93.184.216.34/c").await;

        let queued = fx
            .service
            .customer_created(1, serde_json::json!({ "id": 7 }))
            .await
            .unwrap();
        assert_eq!(queued, 2);

        let rows_a = fx.repo.list_deliveries_for_endpoint(a.id, 1, 10).await.unwrap();
        let rows_b = fx.repo.list_deliveries_for_endpoint(b.id, 1, 10).await.unwrap();
        assert_eq!(rows_a.len(), 1);
        assert_eq!(rows_b.len(), 1);
        assert_eq!(rows_a[0].event_id, rows_b[0].event_id);
        assert!(rows_a[0].event_id.starts_with("evt_"));
        assert_eq!(rows_a[0].status, DeliveryStatus::Pending);
        assert_eq!(rows_a[0].max_attempts, MAX_ATTEMPTS);
        assert_eq!(rows_a[0].payload["data"]["customer"]["id"], 7);
        assert_eq!(rows_a[0].payload["organization_id"], 1);
    }

    #[tokio::test]
    async fn trigger_event_without_subscribers_is_silent() {
        let fx = fixture();
        let queued = fx
            .service
            .sync_failed(1, serde_json::json!({ "error": "boom" }))
            .await
            .unwrap();
        assert_eq!(queued, 0);
    }

    // ── Engine end-to-end tests ─────────────────────────────────────────

    #[tokio::test]
    async fn happy_delivery_signs_and_records() {
        let fx = fixture();
        let (receiver, url) = spawn_receiver().await;
        let (endpoint, secret) = seed_endpoint(&fx, 1, &url).await;

        fx.service
            .customer_created(1, serde_json::json!({ "id": 7 }))
            .await
            .unwrap();
        fx.engine.process_due().await;

        let rows = fx
            .repo
            .list_deliveries_for_endpoint(endpoint.id, 1, 1)
            .await
            .unwrap();
        let row = &rows[0];
        assert_eq!(row.status, DeliveryStatus::Delivered);
        assert_eq!(row.attempt_count, 1);
        assert_eq!(row.response_status, Some(200));
        assert!(row.delivered_at.is_some());
        assert!(row.response_time_ms.is_some());

        let requests = receiver.requests();
        assert_eq!(requests.len(), 1);
        let (headers, body) = &requests[0];
        assert_eq!(headers["x-webhook-event"], "customer.created");
        assert_eq!(headers["x-webhook-id"], row.event_id.as_str());
        assert_eq!(headers["content-type"], "application/json");
        assert!(headers.contains_key("x-webhook-timestamp"));
        assert_eq!(headers["user-agent"], USER_AGENT);

        // Signature verifies against SHA-256 of the one-time secret.
        let sig = headers["x-webhook-signature"].to_str().unwrap();
        let sig = sig.strip_prefix("sha256=").unwrap();
        assert!(signature::verify_signature(
            &signature::hash_secret(&secret),
            body,
            sig
        ));

        // The wire body is the persisted payload.
        let wire: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(wire, row.payload);
    }

    #[tokio::test]
    async fn retry_schedule_walks_the_delay_table() {
        let fx = fixture();
        let (receiver, url) = spawn_receiver().await;
        let (endpoint, _) = seed_endpoint(&fx, 1, &url).await;
        receiver.push_responses(&[503, 503, 503]);

        fx.service
            .customer_created(1, serde_json::json!({ "id": 7 }))
            .await
            .unwrap();

        let expected_delays = [60, 300, 900];
        let delivery_id = fx
            .repo
            .list_deliveries_for_endpoint(endpoint.id, 1, 1)
            .await
            .unwrap()[0]
            .id;

        for (attempt, delay) in expected_delays.iter().enumerate() {
            let before = Utc::now();
            fx.engine.process_due().await;

            let row = fx.repo.get_delivery(delivery_id, 1).await.unwrap().unwrap();
            assert_eq!(row.status, DeliveryStatus::Retrying);
            assert_eq!(row.attempt_count, attempt as i32 + 1);
            assert_eq!(row.response_status, Some(503));
            assert_eq!(row.error_message.as_deref(), Some("HTTP 503"));

            let scheduled = row.next_retry_at.unwrap();
            let offset = (scheduled - before).num_seconds();
            assert!(
                (delay - 2..=delay + 2).contains(&offset),
                "attempt {} scheduled {offset}s out, expected ~{delay}s",
                attempt + 1
            );

            backdate_retry(&fx, delivery_id, 1).await;
        }

        // Fourth attempt succeeds (queue empty → 200).
        fx.engine.process_due().await;
        let row = fx.repo.get_delivery(delivery_id, 1).await.unwrap().unwrap();
        assert_eq!(row.status, DeliveryStatus::Delivered);
        assert_eq!(row.attempt_count, 4);
        assert_eq!(receiver.requests().len(), 4);

        // Success reset the endpoint failure counter.
        let (ep, _) = fx.repo.get_endpoint_with_secret(endpoint.id).await.unwrap().unwrap();
        assert_eq!(ep.failure_count, 0);
        assert!(ep.is_active);
    }

    #[tokio::test]
    async fn exhausted_retries_end_in_failed() {
        let fx = fixture();
        let (receiver, url) = spawn_receiver().await;
        let (endpoint, _) = seed_endpoint(&fx, 1, &url).await;
        receiver.push_responses(&[500; 6]);

        fx.service.customer_created(1, serde_json::json!({ "id": 1 })).await.unwrap();
        let id = fx.repo.list_deliveries_for_endpoint(endpoint.id, 1, 1).await.unwrap()[0].id;

        for _ in 0..MAX_ATTEMPTS {
            fx.engine.process_due().await;
            let row = fx.repo.get_delivery(id, 1).await.unwrap().unwrap();
            if row.status == DeliveryStatus::Retrying {
                backdate_retry(&fx, id, 1).await;
            }
        }

        let row = fx.repo.get_delivery(id, 1).await.unwrap().unwrap();
        assert_eq!(row.status, DeliveryStatus::Failed);
        assert_eq!(row.attempt_count, MAX_ATTEMPTS);
        assert_eq!(row.error_message.as_deref(), Some("HTTP 500"));
        assert_eq!(receiver.requests().len(), MAX_ATTEMPTS as usize);

        // Six failures counted, below the auto-disable threshold.
        let (ep, _) = fx.repo.get_endpoint_with_secret(endpoint.id).await.unwrap().unwrap();
        assert_eq!(ep.failure_count, MAX_ATTEMPTS);
        assert!(ep.is_active);
    }

    #[tokio::test]
    async fn tenth_cumulative_failure_disables_endpoint() {
        let fx = fixture();
        let (receiver, url) = spawn_receiver().await;
        let (endpoint, _) = seed_endpoint(&fx, 1, &url).await;
        receiver.push_responses(&[500; 12]);

        // Two deliveries fail in lock-step: five passes make ten cumulative
        // endpoint failures, which trips the threshold.
        fx.service.customer_created(1, serde_json::json!({ "id": 1 })).await.unwrap();
        fx.service.customer_created(1, serde_json::json!({ "id": 2 })).await.unwrap();

        let rows = fx.repo.list_deliveries_for_endpoint(endpoint.id, 1, 10).await.unwrap();
        let ids = [rows[1].id, rows[0].id];

        for _ in 0..5 {
            fx.engine.process_due().await;
            for id in ids {
                backdate_retry(&fx, id, 1).await;
            }
        }

        let (ep, _) = fx.repo.get_endpoint_with_secret(endpoint.id).await.unwrap().unwrap();
        assert_eq!(ep.failure_count, 10);
        assert!(!ep.is_active);
        assert_eq!(ep.disabled_reason.as_deref(), Some(AUTO_DISABLE_REASON));

        // Deliveries queued against the disabled endpoint fail on the next
        // attempt without an HTTP request.
        fx.engine.process_due().await;
        for id in ids {
            let row = fx.repo.get_delivery(id, 1).await.unwrap().unwrap();
            assert_eq!(row.status, DeliveryStatus::Failed);
            assert_eq!(
                row.error_message.as_deref(),
                Some("endpoint inactive or not found")
            );
        }
        assert_eq!(receiver.requests().len(), 10);
    }

    #[tokio::test]
    async fn attempt_count_never_exceeds_max() {
        let fx = fixture();
        let (receiver, url) = spawn_receiver().await;
        let (endpoint, _) = seed_endpoint(&fx, 1, &url).await;
        receiver.push_responses(&[500; 10]);

        fx.service.customer_created(1, serde_json::json!({})).await.unwrap();
        let id = fx.repo.list_deliveries_for_endpoint(endpoint.id, 1, 1).await.unwrap()[0].id;

        let mut last_count = 0;
        // More passes than attempts: the failed row must not be retried.
        for _ in 0..(MAX_ATTEMPTS + 3) {
            fx.engine.process_due().await;
            let row = fx.repo.get_delivery(id, 1).await.unwrap().unwrap();
            assert!(row.attempt_count >= last_count, "attempt_count regressed");
            assert!(row.attempt_count <= row.max_attempts);
            last_count = row.attempt_count;
            if row.status == DeliveryStatus::Retrying {
                backdate_retry(&fx, id, 1).await;
            }
        }
        assert_eq!(last_count, MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn delivery_against_inactive_endpoint_is_blocked() {
        let fx = fixture();
        let (receiver, url) = spawn_receiver().await;
        let (endpoint, _) = seed_endpoint(&fx, 1, &url).await;

        fx.service.customer_created(1, serde_json::json!({})).await.unwrap();
        fx.repo.disable_endpoint(endpoint.id, "manual").await.unwrap();
        fx.engine.process_due().await;

        let rows = fx.repo.list_deliveries_for_endpoint(endpoint.id, 1, 1).await.unwrap();
        assert_eq!(rows[0].status, DeliveryStatus::Failed);
        assert_eq!(
            rows[0].error_message.as_deref(),
            Some("endpoint inactive or not found")
        );
        assert!(receiver.requests().is_empty());
    }

    #[tokio::test]
    async fn url_turned_internal_is_blocked_before_any_request() {
        let fx = fixture();
        // Strict engine: destination verification on.
        let repo = fx.repo.clone();
        let engine = DeliveryEngine::new(repo.clone());
        let service = WebhookService::new(repo.clone(), engine.clone());

        // Endpoint whose URL now resolves to an internal address.
        let (endpoint, _) = seed_endpoint(&fx, 1, "https://10.0.0.5/hook").await;
        service.customer_created(1, serde_json::json!({})).await.unwrap();
        engine.process_due().await;

        let rows = repo.list_deliveries_for_endpoint(endpoint.id, 1, 1).await.unwrap();
        assert_eq!(rows[0].status, DeliveryStatus::Failed);
        assert!(rows[0].error_message.as_deref().unwrap().contains("blocked"));
        assert!(rows[0].response_status.is_none());
    }

    #[tokio::test]
    async fn admin_retry_requeues_and_redelivers() {
        let fx = fixture();
        let (receiver, url) = spawn_receiver().await;
        let (endpoint, _) = seed_endpoint(&fx, 1, &url).await;
        receiver.push_responses(&[400; 6]);

        fx.service.customer_created(1, serde_json::json!({})).await.unwrap();
        let id = fx.repo.list_deliveries_for_endpoint(endpoint.id, 1, 1).await.unwrap()[0].id;

        for _ in 0..MAX_ATTEMPTS {
            fx.engine.process_due().await;
            let row = fx.repo.get_delivery(id, 1).await.unwrap().unwrap();
            if row.status == DeliveryStatus::Retrying {
                backdate_retry(&fx, id, 1).await;
            }
        }
        assert_eq!(
            fx.repo.get_delivery(id, 1).await.unwrap().unwrap().status,
            DeliveryStatus::Failed
        );

        fx.service.retry_delivery(id, 1).await.unwrap();
        let row = fx.repo.get_delivery(id, 1).await.unwrap().unwrap();
        assert_eq!(row.status, DeliveryStatus::Pending);
        assert_eq!(row.attempt_count, 0);
        assert!(row.error_message.is_none());

        // Receiver queue exhausted → 200 now.
        fx.engine.process_due().await;
        let row = fx.repo.get_delivery(id, 1).await.unwrap().unwrap();
        assert_eq!(row.status, DeliveryStatus::Delivered);
        assert_eq!(row.attempt_count, 1);
    }

    #[tokio::test]
    async fn retry_of_delivered_row_is_refused() {
        let fx = fixture();
        let (_receiver, url) = spawn_receiver().await;
        let (endpoint, _) = seed_endpoint(&fx, 1, &url).await;

        fx.service.customer_created(1, serde_json::json!({})).await.unwrap();
        fx.engine.process_due().await;
        let id = fx.repo.list_deliveries_for_endpoint(endpoint.id, 1, 1).await.unwrap()[0].id;

        assert!(matches!(
            fx.service.retry_delivery(id, 1).await,
            Err(WebhookError::AlreadyDelivered)
        ));
        // Wrong tenant sees nothing.
        assert!(matches!(
            fx.service.retry_delivery(id, 2).await,
            Err(WebhookError::DeliveryNotFound)
        ));
    }
}
