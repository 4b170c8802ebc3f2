use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Service configuration — loaded from environment variables
// ---------------------------------------------------------------------------

/// Complete configuration loaded at startup.
///
/// Every field can be set via an environment variable prefixed with
/// `SKYPLANNER_`. Defaults are suitable for local development; production
/// deployments MUST override at least `jwt_secret`.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Network ─────────────────────────────────────────────────────────
    /// Address to bind the HTTP listener to.
    pub bind_addr: String,

    // ── Auth ────────────────────────────────────────────────────────────
    /// HS256 key used to verify upgrade tokens.
    pub jwt_secret: String,
    /// Name of the cookie carrying the auth token.
    pub auth_cookie: String,

    // ── Alert destinations ──────────────────────────────────────────────
    /// Slack incoming-webhook URL for operator alerts.
    pub slack_alert_url: Option<String>,
    /// Discord webhook URL for operator alerts.
    pub discord_alert_url: Option<String>,
    /// Generic JSON POST destination for operator alerts.
    pub generic_alert_url: Option<String>,

    // ── Delivery engine ─────────────────────────────────────────────────
    /// Seconds between sweeps for due webhook retries.
    pub delivery_sweep_secs: u64,

    // ── CORS ────────────────────────────────────────────────────────────
    pub allowed_origins: String,

    // ── Logging / environment ───────────────────────────────────────────
    pub log_level: String,
    pub production: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        // Best-effort .env loading — ignore errors.
        let _ = dotenvy::dotenv();

        let jwt_secret = match std::env::var("SKYPLANNER_JWT_SECRET") {
            Ok(s) if !s.is_empty() => s,
            _ => {
                let secret = uuid::Uuid::new_v4().to_string();
                warn!(
                    "SKYPLANNER_JWT_SECRET not set — using random value (not suitable for production)"
                );
                secret
            }
        };

        let config = Config {
            bind_addr: env_or("SKYPLANNER_BIND_ADDR", "0.0.0.0:8080"),
            jwt_secret,
            auth_cookie: env_or("SKYPLANNER_AUTH_COOKIE", "auth_token"),
            slack_alert_url: env_opt("SKYPLANNER_SLACK_ALERT_URL"),
            discord_alert_url: env_opt("SKYPLANNER_DISCORD_ALERT_URL"),
            generic_alert_url: env_opt("SKYPLANNER_GENERIC_ALERT_URL"),
            delivery_sweep_secs: env_or("SKYPLANNER_DELIVERY_SWEEP_SECS", "30")
                .parse::<u64>()
                .unwrap_or(30),
            allowed_origins: env_or("SKYPLANNER_ALLOWED_ORIGINS", "*"),
            log_level: env_or("SKYPLANNER_LOG_LEVEL", "info"),
            production: env_bool("SKYPLANNER_PRODUCTION", false),
        };

        config.log_summary();
        config
    }

    fn log_summary(&self) {
        info!("──── SkyPlanner Realtime Configuration ────");
        info!("  bind_addr           : {}", self.bind_addr);
        info!("  production          : {}", self.production);
        info!("  auth_cookie         : {}", self.auth_cookie);
        info!("  delivery_sweep_secs : {}", self.delivery_sweep_secs);
        info!(
            "  alert channels      : slack={} discord={} generic={}",
            self.slack_alert_url.is_some(),
            self.discord_alert_url.is_some(),
            self.generic_alert_url.is_some()
        );
        info!(
            "  cors_origins        : {}",
            if self.allowed_origins == "*" {
                "* (permissive)"
            } else {
                &self.allowed_origins
            }
        );
        info!("  log_level           : {}", self.log_level);
        info!("───────────────────────────────────────────");
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}
