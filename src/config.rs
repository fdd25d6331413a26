use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProtocolConfig {
    /// Maximum accepted |now - X-Timestamp|, both directions.
    #[serde(default = "default_timestamp_tolerance")]
    pub timestamp_tolerance_secs: i64,
    /// Lifetime of a claimed (device, nonce) pair.
    #[serde(default = "default_nonce_ttl")]
    pub nonce_ttl_secs: i64,
    /// How long a superseded key keeps verifying and decrypting.
    #[serde(default = "default_rotation_grace")]
    pub rotation_grace_secs: i64,
    /// How long expired key versions stay readable before the sweeper
    /// purges them.
    #[serde(default = "default_key_retention")]
    pub key_retention_secs: i64,
    /// Largest number of instructions in one poll envelope.
    #[serde(default = "default_max_poll_batch")]
    pub max_poll_batch: usize,
    /// Cadence of the nonce/key sweeper task.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            timestamp_tolerance_secs: default_timestamp_tolerance(),
            nonce_ttl_secs: default_nonce_ttl(),
            rotation_grace_secs: default_rotation_grace(),
            key_retention_secs: default_key_retention(),
            max_poll_batch: default_max_poll_batch(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AdminConfig {
    /// Shared key for the /admin scope. Unset means the admin surface
    /// rejects everything.
    pub api_key: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3004
}

fn default_timestamp_tolerance() -> i64 {
    300
}

fn default_nonce_ttl() -> i64 {
    600
}

fn default_rotation_grace() -> i64 {
    120
}

fn default_key_retention() -> i64 {
    86_400
}

fn default_max_poll_batch() -> usize {
    100
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_data_dir() -> String {
    "data".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let home = env::var("HOME").unwrap_or_else(|_| ".".into());

        let s = Config::builder()
            // 1. Global config from ~/.beacon/config.{toml,json}
            .add_source(File::with_name(&format!("{}/.beacon/config", home)).required(false))
            // 2. Project config from config/config.{toml,json}
            .add_source(File::with_name("config/config").required(false))
            // 3. Local overrides (not checked in)
            .add_source(File::with_name("config/local").required(false))
            // 4. Environment overrides, e.g. GATEWAY_PROTOCOL__NONCE_TTL_SECS
            .add_source(Environment::with_prefix("GATEWAY").separator("__"))
            .build()?;

        let settings: Settings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// The replay argument relies on the nonce TTL outlasting the freshness
    /// window by at least 2x: by the time a claimed nonce lapses, any
    /// request still carrying it is already stale on timestamp alone.
    /// Refuse to boot with a configuration that breaks that.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol.timestamp_tolerance_secs <= 0 {
            return Err(ConfigError::Message(
                "timestamp_tolerance_secs must be positive".to_string(),
            ));
        }
        if self.protocol.nonce_ttl_secs < 2 * self.protocol.timestamp_tolerance_secs {
            return Err(ConfigError::Message(format!(
                "nonce_ttl_secs ({}) must be at least 2x timestamp_tolerance_secs ({})",
                self.protocol.nonce_ttl_secs, self.protocol.timestamp_tolerance_secs
            )));
        }
        if self.protocol.max_poll_batch == 0 {
            return Err(ConfigError::Message(
                "max_poll_batch must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
