use axum::http::StatusCode;

// ─── InvalidUrl ─────────────────────────────────────────────────────────────

/// A webhook destination URL was rejected by the safety validator.
///
/// The inner string is user-visible and explains which rule failed
/// (malformed, non-HTTPS, blocked address range, DNS failure).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct InvalidUrl(pub String);

// ─── AuthError ──────────────────────────────────────────────────────────────

/// Failures on the WebSocket upgrade path.
///
/// Everything except `Internal` terminates the handshake with 401; an
/// `Internal` error terminates it with 500.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authentication cookie missing")]
    MissingCookie,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token carries no organization")]
    MissingOrganization,

    #[error("token has been revoked")]
    Revoked,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

// ─── RepositoryError ────────────────────────────────────────────────────────

/// Failure inside a `WebhookRepository` implementation.
///
/// The in-memory repository never produces one; database-backed
/// implementations map their driver errors here.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("storage error: {0}")]
    Storage(String),
}

// ─── WebhookError ───────────────────────────────────────────────────────────

/// Errors surfaced by the webhook service at its API boundary
/// (endpoint create/update/rotate/delete and admin retry).
///
/// Delivery-time failures never take this form; they are recorded on the
/// delivery row and observable only through history.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("{0}")]
    InvalidUrl(#[from] InvalidUrl),

    #[error("endpoint must subscribe to at least one event")]
    NoEvents,

    #[error("webhook endpoint not found")]
    EndpointNotFound,

    #[error("webhook delivery not found")]
    DeliveryNotFound,

    #[error("delivery already succeeded")]
    AlreadyDelivered,

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}
