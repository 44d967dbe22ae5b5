//! Service configuration read from `KILN_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::{cron, hook};

/// Default per-user artifact quota: 1 GiB.
pub const DEFAULT_ARTIFACT_QUOTA: u64 = 1 << 30;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KilnConfig {
    /// Root of the artifact store.
    pub store_dir: PathBuf,
    /// Per-record write limit in bytes, `0` for none.
    pub store_limit: u64,
    /// Per-user artifact quota enforced by the curator.
    pub artifact_quota: u64,
    /// Scratch space for build workspaces.
    pub data_dir: PathBuf,
    pub cron_interval: Duration,
    pub cron_batch: usize,
    pub hook_timeout: Duration,
    pub hook_body_limit: usize,
    /// Product name, used in the webhook `User-Agent`.
    pub product: String,
    pub queue_capacity: usize,
    pub log_json: bool,
}

impl Default for KilnConfig {
    fn default() -> Self {
        let data_dir = std::env::temp_dir().join("kiln");
        Self {
            store_dir: data_dir.join("artifacts"),
            store_limit: 0,
            artifact_quota: DEFAULT_ARTIFACT_QUOTA,
            data_dir,
            cron_interval: cron::DEFAULT_INTERVAL,
            cron_batch: cron::DEFAULT_BATCH_SIZE,
            hook_timeout: hook::DEFAULT_TIMEOUT,
            hook_body_limit: hook::DEFAULT_BODY_LIMIT,
            product: hook::DEFAULT_PRODUCT.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            log_json: false,
        }
    }
}

impl KilnConfig {
    /// Create from environment variables
    ///
    /// Reads (all optional):
    /// - KILN_DATA_DIR (default: `$TMPDIR/kiln`)
    /// - KILN_STORE_DIR (default: `$KILN_DATA_DIR/artifacts`)
    /// - KILN_STORE_LIMIT bytes per record (default: 0, unlimited)
    /// - KILN_ARTIFACT_QUOTA bytes per user (default: 1 GiB)
    /// - KILN_CRON_INTERVAL seconds (default: 60)
    /// - KILN_CRON_BATCH (default: 1000)
    /// - KILN_HOOK_TIMEOUT seconds (default: 60)
    /// - KILN_HOOK_BODY_LIMIT bytes (default: 65536, 0 keeps everything)
    /// - KILN_PRODUCT (default: "Kiln")
    /// - KILN_QUEUE_CAPACITY (default: 1024)
    /// - KILN_LOG_JSON (default: "false")
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`KilnConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = var("KILN_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
            config.store_dir = config.data_dir.join("artifacts");
        }
        if let Some(dir) = var("KILN_STORE_DIR") {
            config.store_dir = PathBuf::from(dir);
        }
        if let Some(v) = var("KILN_STORE_LIMIT") {
            config.store_limit = number("KILN_STORE_LIMIT", &v)?;
        }
        if let Some(v) = var("KILN_ARTIFACT_QUOTA") {
            config.artifact_quota = number("KILN_ARTIFACT_QUOTA", &v)?;
        }
        if let Some(v) = var("KILN_CRON_INTERVAL") {
            let secs: u64 = number("KILN_CRON_INTERVAL", &v)?;
            if secs == 0 {
                return Err("KILN_CRON_INTERVAL must be at least 1".to_string());
            }
            config.cron_interval = Duration::from_secs(secs);
        }
        if let Some(v) = var("KILN_CRON_BATCH") {
            config.cron_batch = number::<usize>("KILN_CRON_BATCH", &v)?.max(1);
        }
        if let Some(v) = var("KILN_HOOK_TIMEOUT") {
            config.hook_timeout = Duration::from_secs(number("KILN_HOOK_TIMEOUT", &v)?);
        }
        if let Some(v) = var("KILN_HOOK_BODY_LIMIT") {
            config.hook_body_limit = number("KILN_HOOK_BODY_LIMIT", &v)?;
        }
        if let Some(v) = var("KILN_PRODUCT") {
            config.product = v;
        }
        if let Some(v) = var("KILN_QUEUE_CAPACITY") {
            config.queue_capacity = number::<usize>("KILN_QUEUE_CAPACITY", &v)?.max(1);
        }
        if let Some(v) = var("KILN_LOG_JSON") {
            config.log_json = v.to_lowercase() == "true";
        }
        Ok(config)
    }
}

fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("{key} must be a non-negative integer, got {value:?}"))
}
