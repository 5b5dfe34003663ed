//! Relay URL normalization and validation.
//!
//! Relay URLs arrive from untrusted sources (NIP-65 relay lists, follow-list
//! hints, configuration). Everything that reaches the planner goes through
//! [`normalize_relay_url`] first so the same relay is never treated as two
//! different ones.
//!
//! # Normalization Rules
//!
//! - Scheme must be `ws://` or `wss://`
//! - Scheme and host are lowercased, default ports dropped
//! - Trailing slashes are removed, paths are preserved
//!
//! # Filtering Rules
//!
//! Unless [`NormalizeOptions::allow_local`] is set, URLs pointing at loopback,
//! private, link-local or mDNS hosts are rejected. `.onion` hosts are rejected
//! unless [`NormalizeOptions::allow_onion`] is set.

use nostr::RelayUrl;

use crate::error::{Error, Result};

/// Options for URL normalization.
#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
    /// Allow .onion (Tor hidden service) addresses.
    pub allow_onion: bool,
    /// Allow loopback and private-network hosts (local development relays).
    pub allow_local: bool,
}

/// Result of URL normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeResult {
    /// URL is valid and normalized.
    Ok(String),
    /// URL is syntactically invalid.
    Invalid(String),
    /// URL is well-formed but points somewhere we refuse to connect.
    Blocked(String),
}

impl NormalizeResult {
    /// Returns the normalized URL if valid.
    pub fn ok(self) -> Option<String> {
        match self {
            Self::Ok(url) => Some(url),
            _ => None,
        }
    }

    /// Returns true if the URL is valid.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// Normalize a relay URL with the default (strict) options.
///
/// # Examples
///
/// ```ignore
/// use outbox_core::url::normalize_relay_url;
///
/// assert_eq!(
///     normalize_relay_url("wss://Relay.Example.COM/").ok(),
///     Some("wss://relay.example.com".to_string())
/// );
/// assert!(normalize_relay_url("https://relay.example.com").ok().is_none());
/// ```
pub fn normalize_relay_url(url: &str) -> NormalizeResult {
    normalize_relay_url_with_opts(url, &NormalizeOptions::default())
}

/// Normalize a relay URL with custom options.
pub fn normalize_relay_url_with_opts(url: &str, opts: &NormalizeOptions) -> NormalizeResult {
    let url = url.trim();

    let lower = url.to_ascii_lowercase();
    if !lower.starts_with("wss://") && !lower.starts_with("ws://") {
        return NormalizeResult::Invalid("URL must start with wss:// or ws://".to_string());
    }

    let parsed = match RelayUrl::parse(url) {
        Ok(u) => u,
        Err(e) => return NormalizeResult::Invalid(format!("Invalid relay URL: {}", e)),
    };

    let mut normalized = parsed.to_string();
    while normalized.ends_with('/') {
        normalized.pop();
    }

    let host = extract_host(&normalized);
    if host.is_empty() {
        return NormalizeResult::Invalid("empty host".to_string());
    }

    if let Some(reason) = check_blocklist(host, opts) {
        return NormalizeResult::Blocked(reason);
    }

    NormalizeResult::Ok(normalized)
}

/// Normalize a relay URL that must be usable, such as one taken from
/// configuration.
///
/// Unlike [`normalize_relay_url_with_opts`], an invalid or blocked URL is an
/// error naming the rejected input.
pub fn parse_relay_url(url: &str, opts: &NormalizeOptions) -> Result<String> {
    match normalize_relay_url_with_opts(url, opts) {
        NormalizeResult::Ok(url) => Ok(url),
        NormalizeResult::Invalid(reason) | NormalizeResult::Blocked(reason) => {
            Err(Error::InvalidRelayUrl {
                url: url.trim().to_string(),
                reason,
            })
        }
    }
}

/// Normalize a list of URLs, dropping anything invalid or blocked and
/// removing duplicates while keeping the original order.
pub fn normalize_relay_list<'a, I>(urls: I, opts: &NormalizeOptions) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out: Vec<String> = Vec::new();
    for raw in urls {
        match normalize_relay_url_with_opts(raw, opts) {
            NormalizeResult::Ok(url) => {
                if !out.contains(&url) {
                    out.push(url);
                }
            }
            NormalizeResult::Invalid(reason) | NormalizeResult::Blocked(reason) => {
                tracing::trace!(url = %raw, %reason, "dropping relay url");
            }
        }
    }
    out
}

/// Check a host (with optional port) against the blocklist patterns.
///
/// Returns `Some(reason)` if blocked, `None` if allowed.
fn check_blocklist(host: &str, opts: &NormalizeOptions) -> Option<String> {
    let bare = strip_port(host);

    if !opts.allow_onion && bare.ends_with(".onion") {
        return Some(".onion addresses not allowed".to_string());
    }

    if opts.allow_local {
        return None;
    }

    if bare == "localhost" || bare.ends_with(".localhost") {
        return Some("localhost not allowed".to_string());
    }
    if bare.ends_with(".local") {
        return Some(".local addresses not allowed".to_string());
    }

    let ip_text = bare.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = ip_text.parse::<std::net::IpAddr>()
        && is_private_ip(&ip)
    {
        return Some(format!("private or reserved address {} not allowed", ip));
    }

    None
}

/// Extract the host (and port) portion from a websocket URL.
fn extract_host(url: &str) -> &str {
    let without_scheme = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .unwrap_or(url);

    without_scheme.split('/').next().unwrap_or(without_scheme)
}

/// Drop a trailing `:port` from a host, leaving bracketed IPv6 intact.
fn strip_port(host: &str) -> &str {
    if let Some(end) = host.rfind(']') {
        return &host[..=end];
    }
    match host.rfind(':') {
        Some(pos) => &host[..pos],
        None => host,
    }
}

/// Check if an IP address is private, reserved, or otherwise not a public
/// relay address.
pub fn is_private_ip(ip: &std::net::IpAddr) -> bool {
    use std::net::IpAddr;

    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            v4.is_loopback()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_link_local()
                || v4.is_private()
                || (o[0] == 100 && (64..=127).contains(&o[1])) // CGNAT
                || o[0] >= 240
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || (first & 0xffc0) == 0xfe80 // link-local
                || (first & 0xfe00) == 0xfc00 // unique local
                || v6.to_ipv4_mapped().is_some()
        }
    }
}
