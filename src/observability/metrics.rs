//! # Metrics Collection
//!
//! Counters for resolutions, logins and client-cache lookups, emitted through
//! the `metrics` facade. Without an installed recorder every call is a no-op;
//! the embedding process chooses the exporter.

use metrics::{counter, describe_counter, Unit};

pub const RESOLUTIONS_TOTAL: &str = "latchkey_resolutions_total";
pub const AUTH_ATTEMPTS_TOTAL: &str = "latchkey_auth_attempts_total";
pub const CLIENT_CACHE_TOTAL: &str = "latchkey_client_cache_total";

/// Outcome of a client cache lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Valid client returned without I/O
    Hit,
    /// This caller started the login
    Miss,
    /// Joined a login another caller started
    Joined,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Joined => "joined",
        }
    }
}

/// Register metric descriptions with whichever recorder is installed.
pub fn describe_metrics() {
    describe_counter!(
        RESOLUTIONS_TOTAL,
        Unit::Count,
        "Secret resolutions by provider and outcome (success or error kind)"
    );
    describe_counter!(
        AUTH_ATTEMPTS_TOTAL,
        Unit::Count,
        "Backend logins by provider, auth method and outcome"
    );
    describe_counter!(
        CLIENT_CACHE_TOTAL,
        Unit::Count,
        "Authenticated client cache lookups by provider and result"
    );
}

/// Record the outcome of one `resolve` call
pub fn record_resolution(provider: &str, outcome: &str) {
    let labels = [("provider", provider.to_string()), ("outcome", outcome.to_string())];
    counter!(RESOLUTIONS_TOTAL, &labels).increment(1);
}

/// Record one login attempt against a backend
pub fn record_auth_attempt(provider: &str, method: &str, outcome: &str) {
    let labels = [
        ("provider", provider.to_string()),
        ("method", method.to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!(AUTH_ATTEMPTS_TOTAL, &labels).increment(1);
}

/// Record a client cache lookup
pub fn record_client_cache(provider: &str, outcome: CacheOutcome) {
    let labels = [("provider", provider.to_string()), ("result", outcome.as_str().to_string())];
    counter!(CLIENT_CACHE_TOTAL, &labels).increment(1);
}
