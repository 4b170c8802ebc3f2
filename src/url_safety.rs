// src/url_safety.rs
//
// SSRF guard for webhook destination URLs.
//
// A destination is accepted only when it parses, uses https, and every
// address it resolves to lies outside the private / loopback / link-local
// ranges. Validation runs at endpoint create and update AND again
// immediately before every delivery attempt, because DNS answers change.
//
// ────────────────────────────────────────────────────────────────────────────

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::Url;

use crate::error::InvalidUrl;

/// Validate a webhook destination URL.
///
/// Returns the parsed URL on success so callers can reuse host/port without
/// re-parsing. The error message is user-visible.
pub async fn validate_endpoint_url(raw: &str) -> Result<Url, InvalidUrl> {
    let parsed =
        Url::parse(raw).map_err(|e| InvalidUrl(format!("URL could not be parsed: {e}")))?;

    if parsed.scheme() != "https" {
        return Err(InvalidUrl("webhook URLs must use https".into()));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| InvalidUrl("URL has no host".into()))?;

    // Literal IP hosts are checked directly, before any resolver involvement.
    if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        if is_blocked_ip(&ip) {
            return Err(InvalidUrl(format!(
                "address {ip} is in a blocked range"
            )));
        }
        return Ok(parsed);
    }

    let port = parsed.port_or_known_default().unwrap_or(443);
    let addrs: Vec<std::net::SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| InvalidUrl(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(InvalidUrl(format!("{host} resolved to no addresses")));
    }

    // Every A/AAAA answer must be public; a single internal address rejects
    // the whole URL.
    for addr in &addrs {
        if is_blocked_ip(&addr.ip()) {
            return Err(InvalidUrl(format!(
                "{host} resolves to blocked address {}",
                addr.ip()
            )));
        }
    }

    Ok(parsed)
}

/// Whether an address falls in a range webhook traffic must never reach.
///
/// Blocked: 127.0.0.0/8, 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16,
/// 169.254.0.0/16 (cloud metadata lives here), 0.0.0.0/8, ::1/128,
/// fc00::/7, fe80::/10.
pub fn is_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => is_blocked_v6(v6),
    }
}

fn is_blocked_v4(v4: &Ipv4Addr) -> bool {
    v4.is_loopback()            // 127.0.0.0/8
        || v4.is_private()      // 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16
        || v4.is_link_local()   // 169.254.0.0/16
        || v4.octets()[0] == 0  // 0.0.0.0/8
}

fn is_blocked_v6(v6: &Ipv6Addr) -> bool {
    // IPv4-mapped addresses (::ffff:a.b.c.d) answer for the embedded v4.
    if let Some(v4) = v6.to_ipv4_mapped() {
        return is_blocked_v4(&v4);
    }

    v6.is_loopback()                               // ::1
        || (v6.segments()[0] & 0xfe00) == 0xfc00   // fc00::/7 (unique local)
        || (v6.segments()[0] & 0xffc0) == 0xfe80   // fe80::/10 (link-local)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
