//! Access-token expiry checks.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::Deserialize;

/// Upper bound on any token lifetime or expiry margin (ten years)
pub const MAX_LIFETIME_SECONDS: i64 = 10 * 365 * 24 * 60 * 60;

/// Decides whether a cached access token can still be used.
///
/// A token is expired once `now >= expires_at - margin`. The margin defaults
/// to zero, which takes `expires_at` literally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpiryPolicy {
    margin: Duration,
}

impl ExpiryPolicy {
    pub fn new(margin: Duration) -> Self {
        Self { margin }
    }

    /// Margins beyond what `Duration` can hold saturate, which marks every
    /// token as expired.
    pub fn with_margin_seconds(seconds: i64) -> Self {
        Self::new(Duration::try_seconds(seconds).unwrap_or(Duration::MAX))
    }

    pub fn margin(&self) -> Duration {
        self.margin
    }

    pub fn is_expired(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match expires_at.checked_sub_signed(self.margin) {
            Some(deadline) => now >= deadline,
            // Deadline before the representable range
            None => true,
        }
    }
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self::new(Duration::zero())
    }
}

/// Expiry policy configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExpiryConfig {
    /// Seconds before `expires_at` at which a token counts as expired
    #[serde(default)]
    pub margin_seconds: i64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self { margin_seconds: 0 }
    }
}

impl From<&ExpiryConfig> for ExpiryPolicy {
    fn from(config: &ExpiryConfig) -> Self {
        ExpiryPolicy::with_margin_seconds(config.margin_seconds)
    }
}

/// Parses a stored expiry timestamp.
///
/// The value must be RFC 3339 with an explicit offset; naive timestamps are
/// rejected rather than assumed to be UTC.
pub fn parse_expires_at(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::<FixedOffset>::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc))
}
