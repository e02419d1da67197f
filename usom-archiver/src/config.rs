use std::time::Duration;

use common_redis::ConnectionConfig;
use envconfig::Envconfig;

use crate::store::StoreConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    // Redis connection
    #[envconfig(from = "REDIS_HOST", default = "localhost")]
    pub redis_host: String,

    #[envconfig(from = "REDIS_PORT", default = "6379")]
    pub redis_port: u16,

    // Empty means no AUTH
    #[envconfig(from = "REDIS_PASSWORD", default = "")]
    pub redis_password: String,

    #[envconfig(from = "REDIS_DB", default = "0")]
    pub redis_db: i64,

    #[envconfig(from = "REDIS_TLS", default = "false")]
    pub redis_tls: bool,

    #[envconfig(from = "REDIS_MAX_RECONNECT_ATTEMPTS", default = "5")]
    pub redis_max_reconnect_attempts: u32,

    #[envconfig(from = "REDIS_RECONNECT_BASE_DELAY_MS", default = "1000")]
    pub redis_reconnect_base_delay_ms: u64,

    // Unset means no timeout
    #[envconfig(from = "REDIS_CONNECTION_TIMEOUT_MS")]
    pub redis_connection_timeout_ms: Option<u64>,

    #[envconfig(from = "REDIS_RESPONSE_TIMEOUT_MS")]
    pub redis_response_timeout_ms: Option<u64>,

    // Archive layout
    #[envconfig(from = "REDIS_KEY_PREFIX", default = "usom:")]
    pub redis_key_prefix: String,

    #[envconfig(from = "OUTPUT_FILE", default = "usom-archive.json")]
    pub output_file: String,

    // Checkpoint every N batches
    #[envconfig(from = "SAVE_INTERVAL", default = "10")]
    pub save_interval: u64,

    #[envconfig(from = "EXPORT_CHUNK_SIZE", default = "1000")]
    pub export_chunk_size: usize,

    #[envconfig(from = "BASE_URL", default = "https://www.usom.gov.tr/api/address/index")]
    pub base_url: String,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("redis_host", &self.redis_host)
            .field("redis_port", &self.redis_port)
            .field("redis_password", &(!self.redis_password.is_empty()).then_some("<redacted>"))
            .field("redis_db", &self.redis_db)
            .field("redis_tls", &self.redis_tls)
            .field("redis_key_prefix", &self.redis_key_prefix)
            .field("output_file", &self.output_file)
            .field("save_interval", &self.save_interval)
            .field("export_chunk_size", &self.export_chunk_size)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.redis_reconnect_base_delay_ms)
    }

    /// Get connection timeout as Duration, `None` when unset
    pub fn connection_timeout(&self) -> Option<Duration> {
        self.redis_connection_timeout_ms.map(Duration::from_millis)
    }

    /// Get response timeout as Duration, `None` when unset
    pub fn response_timeout(&self) -> Option<Duration> {
        self.redis_response_timeout_ms.map(Duration::from_millis)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new(self.redis_host.clone(), self.redis_port)
            .with_password(self.redis_password.clone())
            .with_db(self.redis_db)
            .with_tls(self.redis_tls)
            .with_reconnect(
                self.redis_max_reconnect_attempts,
                self.reconnect_base_delay(),
            )
            .with_connection_timeout(self.connection_timeout())
            .with_response_timeout(self.response_timeout())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            key_prefix: self.redis_key_prefix.clone(),
            export_chunk_size: self.export_chunk_size,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.redis_key_prefix.is_empty() {
            anyhow::bail!("REDIS_KEY_PREFIX cannot be empty: clear would match every key");
        }
        if self.export_chunk_size == 0 {
            anyhow::bail!("EXPORT_CHUNK_SIZE must be at least 1");
        }
        self.connection_config().validate()?;
        Ok(())
    }
}
