// src/alerts.rs
//
// Operator alert fan-out.
//
// A much simpler sibling of the webhook engine: alerts go to at most three
// ambient destinations (Slack, Discord, generic JSON) read from
// configuration, formatted per vendor, POSTed in parallel, best-effort.
// Callers never see an error; a failed destination is logged and the others
// proceed.
//
// ────────────────────────────────────────────────────────────────────────────

use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::Config;

/// Brute-force alerts below this attempt count are noise and suppressed.
const BRUTE_FORCE_THRESHOLD: u32 = 10;

const ALERT_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Alert model ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    fn emoji(&self) -> &'static str {
        match self {
            Self::Info => "ℹ️",
            Self::Warning => "⚠️",
            Self::Error => "✖️",
            Self::Critical => "🚨",
        }
    }

    /// Slack attachment sidebar color.
    fn slack_color(&self) -> &'static str {
        match self {
            Self::Info => "#36a64f",
            Self::Warning => "#f2c744",
            Self::Error => "#e01e5a",
            Self::Critical => "#8b0000",
        }
    }

    /// Discord embed color (RGB int).
    fn discord_color(&self) -> u32 {
        match self {
            Self::Info => 0x3498db,
            Self::Warning => 0xffaa00,
            Self::Error => 0xe74c3c,
            Self::Critical => 0x8b0000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Security,
    PaymentFailure,
    SystemError,
    DatabaseIssue,
    ResourceUsage,
    RateLimit,
    BruteForce,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    /// Which subsystem raised the alert.
    pub source: String,
}

impl Alert {
    pub fn new(
        kind: AlertKind,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            title: title.into(),
            message: message.into(),
            source: source.into(),
        }
    }

    pub fn security(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AlertKind::Security, AlertSeverity::Critical, title, message, "security")
    }

    pub fn payment_failure(message: impl Into<String>) -> Self {
        Self::new(
            AlertKind::PaymentFailure,
            AlertSeverity::Error,
            "Payment failure",
            message,
            "billing",
        )
    }

    pub fn system_error(message: impl Into<String>) -> Self {
        Self::new(
            AlertKind::SystemError,
            AlertSeverity::Error,
            "System error",
            message,
            "system",
        )
    }

    pub fn database_issue(message: impl Into<String>) -> Self {
        Self::new(
            AlertKind::DatabaseIssue,
            AlertSeverity::Critical,
            "Database issue",
            message,
            "database",
        )
    }

    pub fn resource_usage(message: impl Into<String>) -> Self {
        Self::new(
            AlertKind::ResourceUsage,
            AlertSeverity::Warning,
            "High resource usage",
            message,
            "system",
        )
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(
            AlertKind::RateLimit,
            AlertSeverity::Warning,
            "Rate limiting engaged",
            message,
            "gateway",
        )
    }
}

// ─── Dispatcher ─────────────────────────────────────────────────────────────

/// Fans one alert out to every configured destination.
#[derive(Clone)]
pub struct AlertDispatcher {
    client: Client,
    slack_url: Option<String>,
    discord_url: Option<String>,
    generic_url: Option<String>,
}

impl AlertDispatcher {
    pub fn from_config(config: &Config) -> Self {
        Self {
            client: Client::builder()
                .timeout(ALERT_TIMEOUT)
                .build()
                .expect("failed to build alert HTTP client"),
            slack_url: config.slack_alert_url.clone(),
            discord_url: config.discord_alert_url.clone(),
            generic_url: config.generic_alert_url.clone(),
        }
    }

    /// Dispatch to all destinations in parallel. Fire-and-forget: spawns one
    /// task per destination, logs failures, never returns an error.
    pub fn dispatch(&self, alert: Alert) {
        if self.slack_url.is_none() && self.discord_url.is_none() && self.generic_url.is_none() {
            debug!(kind = ?alert.kind, "no alert destinations configured, dropping alert");
            return;
        }

        let targets = [
            (self.slack_url.clone(), slack_payload(&alert), "slack"),
            (self.discord_url.clone(), discord_payload(&alert), "discord"),
            (self.generic_url.clone(), generic_payload(&alert), "generic"),
        ];

        for (url, payload, channel) in targets {
            let Some(url) = url else { continue };
            let client = self.client.clone();
            tokio::spawn(async move {
                match client.post(&url).json(&payload).send().await {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) => {
                        warn!(channel, status = %resp.status(), "alert delivery got non-2xx");
                    }
                    Err(e) => {
                        warn!(channel, error = %e, "alert delivery failed");
                    }
                }
            });
        }
    }

    /// Report a suspected brute-force attack. Only emitted once the attempt
    /// count reaches the threshold.
    pub fn brute_force(&self, identifier: &str, attempts: u32) {
        if attempts < BRUTE_FORCE_THRESHOLD {
            return;
        }
        self.dispatch(Alert::new(
            AlertKind::BruteForce,
            AlertSeverity::Critical,
            "Possible brute-force attack",
            format!("{attempts} failed attempts against {identifier}"),
            "security",
        ));
    }
}

// ─── Vendor payload shaping ─────────────────────────────────────────────────

fn slack_payload(alert: &Alert) -> Value {
    json!({
        "attachments": [{
            "color": alert.severity.slack_color(),
            "blocks": [
                {
                    "type": "header",
                    "text": {
                        "type": "plain_text",
                        "text": format!("{} {}", alert.severity.emoji(), alert.title),
                        "emoji": true
                    }
                },
                {
                    "type": "section",
                    "text": { "type": "mrkdwn", "text": alert.message }
                },
                {
                    "type": "context",
                    "elements": [{
                        "type": "mrkdwn",
                        "text": format!(
                            "{} | {} | {}",
                            alert.source,
                            alert.severity.as_str(),
                            Utc::now().to_rfc3339()
                        )
                    }]
                }
            ]
        }]
    })
}

fn discord_payload(alert: &Alert) -> Value {
    json!({
        "embeds": [{
            "title": format!("{} {}", alert.severity.emoji(), alert.title),
            "description": alert.message,
            "color": alert.severity.discord_color(),
            "fields": [
                { "name": "Source", "value": alert.source, "inline": true },
                { "name": "Severity", "value": alert.severity.as_str(), "inline": true }
            ],
            "timestamp": Utc::now().to_rfc3339(),
            "footer": { "text": "SkyPlanner alerts" }
        }]
    })
}

fn generic_payload(alert: &Alert) -> Value {
    let mut payload = serde_json::to_value(alert).unwrap_or_default();
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
    }
    payload
}

// ─── Tests ──────────────────────────────────────────────────────────────────
