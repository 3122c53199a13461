use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
    pub audit_file: String,
    pub data_dir: String,

    pub queue_partitions: usize,
    pub worker_threads: usize,
    /// Checkout-to-redelivery timeout for in-flight commands.
    pub transaction_timeout_ms: u64,
    pub sweep_interval_ms: u64,

    /// Stripe count per lock resource class.
    pub lock_stripes: usize,
    /// Per-acquisition wait bound. Independent of the transaction timeout.
    pub lock_timeout_ms: u64,

    pub snapshot_buckets: usize,
    pub pending_expiry_secs: u64,
    pub trigger_poll_interval_ms: u64,

    pub quote_ttl_secs: u64,
    /// Price the canned quote source serves, in cents.
    pub quote_price_cents: i64,
}

pub fn load_config() -> Result<AppConfig, ConfigError> {
    let s = Config::builder()
        // Set defaults
        .set_default("log_level", "info")?
        .set_default("log_to_file", false)?
        .set_default("log_file", "log/tradeserv.log")?
        .set_default("audit_file", "log/audit.jsonl")?
        .set_default("data_dir", "data")?
        .set_default("queue_partitions", 4)?
        .set_default("worker_threads", 8)?
        .set_default("transaction_timeout_ms", 10_000)?
        .set_default("sweep_interval_ms", 500)?
        .set_default("lock_stripes", 1000)?
        .set_default("lock_timeout_ms", 1_000)?
        .set_default("snapshot_buckets", 10)?
        .set_default("pending_expiry_secs", 60)?
        .set_default("trigger_poll_interval_ms", 1_000)?
        .set_default("quote_ttl_secs", 60)?
        .set_default("quote_price_cents", 1255)?
        // Add configuration from a file
        .add_source(File::with_name("config/config.yaml").required(false))
        // Add configuration from environment variables
        .add_source(config::Environment::with_prefix("APP"))
        .build()?;

    s.try_deserialize()
}
