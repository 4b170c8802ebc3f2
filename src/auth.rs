// src/auth.rs
//
// Upgrade-path authentication for the realtime hub.
//
// The browser presents a JWT in a cookie. Verification (HS256), cookie
// parsing and the token-blacklist lookup live here; issuing tokens is the
// auth service's job and out of scope.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::HashSet;
use std::sync::RwLock;

use async_trait::async_trait;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

// ─── Claims ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: i64,
    /// Tenant the user belongs to. A token without one cannot join the hub.
    #[serde(default)]
    pub organization_id: Option<i64>,
    #[serde(default)]
    pub email: Option<String>,
    /// Token id, checked against the blacklist when present.
    #[serde(default)]
    pub jti: Option<String>,
    /// Expiration (unix timestamp).
    pub exp: usize,
    /// Issued-at (unix timestamp).
    pub iat: usize,
}

impl Claims {
    /// Display name shown to other hub members: the email local-part, or a
    /// generic fallback when the token carries no email.
    pub fn display_name(&self) -> String {
        self.email
            .as_deref()
            .and_then(|e| e.split('@').next())
            .filter(|local| !local.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Bruker {}", self.sub))
    }
}

/// Verify and decode a JWT, returning the inner claims.
pub fn verify_token(secret: &str, token: &str) -> Result<Claims, AuthError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(), // HS256 + exp validation
    )
    .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
    Ok(token_data.claims)
}

// ─── Cookie extraction ──────────────────────────────────────────────────────

/// Pull the named cookie's value out of a raw `Cookie` header.
pub fn token_from_cookie_header(header: &str, cookie_name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        if name == cookie_name && !value.is_empty() {
            Some(value.to_string())
        } else {
            None
        }
    })
}

// ─── Token blacklist ────────────────────────────────────────────────────────

/// Revocation lookup, provided by the auth service.
#[async_trait]
pub trait TokenBlacklist: Send + Sync {
    async fn is_revoked(&self, jti: &str) -> bool;
}

/// Set-backed blacklist for tests and local runs.
#[derive(Default)]
pub struct InMemoryBlacklist {
    revoked: RwLock<HashSet<String>>,
}

impl InMemoryBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoke(&self, jti: impl Into<String>) {
        self.revoked.write().unwrap().insert(jti.into());
    }
}

#[async_trait]
impl TokenBlacklist for InMemoryBlacklist {
    async fn is_revoked(&self, jti: &str) -> bool {
        self.revoked.read().unwrap().contains(jti)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
