use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default ingestion endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://dc.services.visualstudio.com/v2/track";

/// Compression applied to transmission payloads.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpEncoding {
    /// No compression. The `Content-Encoding` header is omitted.
    Identity,
    /// Compression with the format of the UNIX gzip program.
    #[default]
    Gzip,
}

impl HttpEncoding {
    /// Parses an encoding from its `Content-Encoding` header value.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.eq_ignore_ascii_case("gzip") || value.eq_ignore_ascii_case("x-gzip") {
            Self::Gzip
        } else {
            Self::Identity
        }
    }

    /// Returns the value for the `Content-Encoding` HTTP header.
    ///
    /// Returns `None` for [`Identity`](Self::Identity).
    pub fn name(&self) -> Option<&'static str> {
        match self {
            Self::Identity => None,
            Self::Gzip => Some("gzip"),
        }
    }
}

/// Controls the delays after failed transmissions.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Base unit of the exponential backoff in seconds.
    pub slot_delay_secs: u64,
    /// Upper bound for computed delays in seconds.
    pub max_delay_secs: u64,
    /// Errors arriving closer together than this many seconds count as one.
    pub min_error_interval_secs: u64,
}

impl BackoffConfig {
    /// Returns the base unit of the exponential backoff.
    pub fn slot_delay(&self) -> Duration {
        Duration::from_secs(self.slot_delay_secs)
    }

    /// Returns the upper bound for computed delays.
    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs.max(self.slot_delay_secs))
    }

    /// Returns the minimum interval between two counted errors.
    pub fn min_error_interval(&self) -> Duration {
        Duration::from_secs(self.min_error_interval_secs)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            slot_delay_secs: 10,
            max_delay_secs: 3600,
            min_error_interval_secs: 20,
        }
    }
}

/// Configuration of the [`TelemetryChannel`](crate::TelemetryChannel).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// URL of the ingestion endpoint.
    pub endpoint: String,

    /// Number of buffered items that triggers an early transmission.
    pub buffer_capacity: usize,

    /// Maximum number of buffered items. Items beyond this are dropped.
    ///
    /// Values below `buffer_capacity` are raised to `buffer_capacity`.
    pub backlog_size: usize,

    /// Interval between regular transmissions in milliseconds.
    pub sending_interval_ms: u64,

    /// Timeout for a single transmission in seconds, covering redirects and the response body.
    pub send_timeout_secs: u64,

    /// Maximum number of `307` and `308` redirects followed per transmission.
    pub max_redirects: usize,

    /// How long a redirect is remembered if the response carries no `max-age`, in seconds.
    pub redirect_cache_ttl_secs: u64,

    /// Compression of transmission payloads.
    pub encoding: HttpEncoding,

    /// Delays after failed transmissions.
    pub backoff: BackoffConfig,

    /// Minimum interval between repeated diagnostic warnings in seconds.
    pub diagnostics_interval_secs: u64,
}

impl ChannelConfig {
    /// Returns the effective backlog size.
    pub fn backlog_size(&self) -> usize {
        self.backlog_size.max(self.buffer_capacity)
    }

    /// Returns the interval between regular transmissions.
    pub fn sending_interval(&self) -> Duration {
        Duration::from_millis(self.sending_interval_ms)
    }

    /// Returns the timeout of a single transmission.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Returns the default lifetime of cached redirects.
    pub fn redirect_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.redirect_cache_ttl_secs)
    }

    /// Returns the minimum interval between repeated diagnostic warnings.
    pub fn diagnostics_interval(&self) -> Duration {
        Duration::from_secs(self.diagnostics_interval_secs)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            buffer_capacity: 500,
            backlog_size: 1_000_000,
            sending_interval_ms: 30_000,
            send_timeout_secs: 100,
            max_redirects: 10,
            redirect_cache_ttl_secs: 12 * 60 * 60,
            encoding: HttpEncoding::Gzip,
            backoff: BackoffConfig::default(),
            diagnostics_interval_secs: 10,
        }
    }
}
