//! Node configuration.

use std::time::Duration;

use crate::common::{DEFAULT_STALE_THRESHOLD, MAX_BUCKET_SIZE_K};

pub const DEFAULT_ALPHA: usize = 3;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_RETRIES: u8 = 2;
pub const DEFAULT_BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_REPUBLISH_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_CONTENT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_MAX_STORED_KEYS: usize = 1000;

#[derive(Debug, Clone)]
/// Node configuration. The defaults are sensible for most deployments;
/// tests shrink the timing knobs to run fast.
pub struct Config {
    /// Bucket capacity and content replication factor.
    /// Defaults to [MAX_BUCKET_SIZE_K].
    pub k: usize,
    /// Number of parallel requests per lookup round.
    /// Defaults to [DEFAULT_ALPHA].
    pub alpha: usize,
    /// Consecutive failures before a contact is considered stale.
    /// Defaults to [DEFAULT_STALE_THRESHOLD].
    pub stale_threshold: u8,
    /// How long to wait for a response before retrying a request.
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT].
    pub request_timeout: Duration,
    /// Retransmissions after the first attempt before a request is
    /// considered failed. Defaults to [DEFAULT_MAX_RETRIES].
    pub max_retries: u8,
    /// A bucket with no successful exchange for this long gets refreshed
    /// with a lookup for a random id in its range.
    /// Defaults to [DEFAULT_BUCKET_REFRESH_INTERVAL].
    pub bucket_refresh_interval: Duration,
    /// How often locally published values are pushed again to the closest
    /// nodes. Defaults to [DEFAULT_REPUBLISH_INTERVAL].
    pub republish_interval: Duration,
    /// Values stored for other nodes expire after not being republished
    /// for this long. Defaults to [DEFAULT_CONTENT_TTL].
    pub content_ttl: Duration,
    /// Upper bound on the number of stored values; the least recently
    /// used entry is dropped first. Defaults to [DEFAULT_MAX_STORED_KEYS].
    pub max_stored_keys: usize,
    /// UDP port to listen on, or `None` for an ephemeral port.
    pub port: Option<u16>,
    /// Addresses of existing nodes used to join the overlay.
    pub bootstrap: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: MAX_BUCKET_SIZE_K,
            alpha: DEFAULT_ALPHA,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            bucket_refresh_interval: DEFAULT_BUCKET_REFRESH_INTERVAL,
            republish_interval: DEFAULT_REPUBLISH_INTERVAL,
            content_ttl: DEFAULT_CONTENT_TTL,
            max_stored_keys: DEFAULT_MAX_STORED_KEYS,
            port: None,
            bootstrap: Vec::new(),
        }
    }
}
