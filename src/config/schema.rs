use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
#[cfg(unix)]
use tokio::fs::File;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Env var that relocates the config directory (also set by `--config-dir`).
pub const CONFIG_DIR_ENV: &str = "CHATBROKER_CONFIG_DIR";

// ── Top-level config ──────────────────────────────────────────────

/// Top-level broker configuration, loaded from `config.toml`.
///
/// Resolution order: `CHATBROKER_CONFIG_DIR` env → `~/.chatbroker/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Path to config.toml - computed at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// HTTP/WebSocket listener configuration (`[gateway]`).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Session lifecycle and relay tuning (`[broker]`).
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Logging configuration (`[observability]`).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ── Gateway ──────────────────────────────────────────────────────

/// Gateway server configuration (`[gateway]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    /// Gateway port (default: 8080)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Allow binding to a non-loopback address (default: false)
    #[serde(default)]
    pub allow_public_bind: bool,
    /// Timeout for REST query requests.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Max request body accepted on the REST surface.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Send `Access-Control-Allow-Origin: *` on the query surface (default: true)
    #[serde(default = "default_true")]
    pub cors_allow_any_origin: bool,
}

fn default_gateway_port() -> u16 {
    8080
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    65_536
}

fn default_true() -> bool {
    true
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            host: default_gateway_host(),
            allow_public_bind: false,
            request_timeout_secs: default_request_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
            cors_allow_any_origin: true,
        }
    }
}

// ── Broker ───────────────────────────────────────────────────────

/// Session broker configuration (`[broker]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BrokerConfig {
    /// Seconds a session may wait for an admin before it is ended as abandoned.
    #[serde(default = "default_waiting_timeout_secs")]
    pub waiting_timeout_secs: u64,
    /// Seconds an active session survives its admin disconnecting without `end`.
    /// 0 disables the expiry.
    #[serde(default)]
    pub admin_disconnect_grace_secs: u64,
    /// Seconds an ended session stays in the directory. 0 keeps it forever.
    #[serde(default)]
    pub ended_retention_secs: u64,
    /// How often the retention sweep runs.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Per-connection outbound frame queue depth.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    /// Dropped frames after which a slow leg is detached.
    #[serde(default = "default_max_dropped_frames")]
    pub max_dropped_frames: u64,
    /// Largest accepted inbound WebSocket message.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Keepalive ping period on each socket.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Reject `join`/`end` from sockets without an admin identity claim.
    #[serde(default)]
    pub require_admin_claim: bool,
}

fn default_waiting_timeout_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_max_dropped_frames() -> u64 {
    100
}

fn default_max_frame_bytes() -> usize {
    8192
}

fn default_ping_interval_secs() -> u64 {
    54
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            waiting_timeout_secs: default_waiting_timeout_secs(),
            admin_disconnect_grace_secs: 0,
            ended_retention_secs: 0,
            sweep_interval_secs: default_sweep_interval_secs(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            max_dropped_frames: default_max_dropped_frames(),
            max_frame_bytes: default_max_frame_bytes(),
            ping_interval_secs: default_ping_interval_secs(),
            require_admin_claim: false,
        }
    }
}

impl BrokerConfig {
    pub fn waiting_timeout(&self) -> Duration {
        Duration::from_secs(self.waiting_timeout_secs)
    }

    /// `None` when admin-left expiry is disabled.
    pub fn admin_disconnect_grace(&self) -> Option<Duration> {
        (self.admin_disconnect_grace_secs > 0)
            .then(|| Duration::from_secs(self.admin_disconnect_grace_secs))
    }

    /// `None` when ended sessions are kept forever.
    pub fn ended_retention(&self) -> Option<Duration> {
        (self.ended_retention_secs > 0).then(|| Duration::from_secs(self.ended_retention_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}

// ── Observability ────────────────────────────────────────────────

/// Logging configuration (`[observability]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ObservabilityConfig {
    /// `tracing` filter used when `RUST_LOG` is unset (default: "info").
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_log_filter() -> String {
    "info".into()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
        }
    }
}

// ── Config impl ──────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());

        Self {
            config_path: home.join(".chatbroker").join("config.toml"),
            gateway: GatewayConfig::default(),
            broker: BrokerConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

fn default_config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".chatbroker"))
}

pub(crate) fn is_loopback_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

impl Config {
    /// Load the config from the default location and apply env overrides.
    pub async fn load_or_init() -> Result<Self> {
        let config_dir = default_config_dir()?;
        let mut config = Self::load_or_init_in(&config_dir).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load `config.toml` from `config_dir`, writing defaults on first run.
    pub async fn load_or_init_in(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join("config.toml");

        fs::create_dir_all(config_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let initialized = !config_path.exists();
        let config = if initialized {
            let mut config = Config::default();
            config.config_path = config_path.clone();
            config.save().await?;
            config
        } else {
            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            // Set computed paths that are skipped during serialization
            config.config_path = config_path.clone();
            config
        };

        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            initialized,
            "Config loaded"
        );
        Ok(config)
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        // Gateway
        if self.gateway.host.trim().is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }
        if !self.gateway.allow_public_bind && !is_loopback_host(&self.gateway.host) {
            anyhow::bail!(
                "gateway.host {} is not a loopback address; set gateway.allow_public_bind = true to expose the broker",
                self.gateway.host
            );
        }

        // Broker
        if self.broker.waiting_timeout_secs == 0 {
            anyhow::bail!("broker.waiting_timeout_secs must be greater than 0");
        }
        if self.broker.outbound_queue_capacity == 0 {
            anyhow::bail!("broker.outbound_queue_capacity must be greater than 0");
        }
        if self.broker.max_frame_bytes < 256 {
            anyhow::bail!("broker.max_frame_bytes must be at least 256");
        }

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        // Gateway port: CHATBROKER_GATEWAY_PORT or PORT
        if let Ok(port_str) =
            std::env::var("CHATBROKER_GATEWAY_PORT").or_else(|_| std::env::var("PORT"))
        {
            if let Ok(port) = port_str.parse::<u16>() {
                self.gateway.port = port;
            }
        }

        // Gateway host: CHATBROKER_GATEWAY_HOST or HOST
        if let Ok(host) =
            std::env::var("CHATBROKER_GATEWAY_HOST").or_else(|_| std::env::var("HOST"))
        {
            if !host.is_empty() {
                self.gateway.host = host;
            }
        }

        // Allow public bind: CHATBROKER_ALLOW_PUBLIC_BIND
        if let Ok(val) = std::env::var("CHATBROKER_ALLOW_PUBLIC_BIND") {
            self.gateway.allow_public_bind = val == "1" || val.eq_ignore_ascii_case("true");
        }

        // Waiting bound: CHATBROKER_WAITING_TIMEOUT_SECS
        if let Ok(secs) = std::env::var("CHATBROKER_WAITING_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(secs) if secs > 0 => self.broker.waiting_timeout_secs = secs,
                _ => tracing::warn!(
                    value = %secs,
                    "Ignoring invalid CHATBROKER_WAITING_TIMEOUT_SECS"
                ),
            }
        }

        // Log filter: CHATBROKER_LOG
        if let Ok(filter) = std::env::var("CHATBROKER_LOG") {
            if !filter.trim().is_empty() {
                self.observability.log_filter = filter;
            }
        }
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;

        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir).await
    }
}

async fn sync_directory(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)
            .await
            .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
        dir.sync_all()
            .await
            .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Defaults ─────────────────────────────────────────────

    #[test]
    fn config_default_has_sane_values() {
        let c = Config::default();
        assert_eq!(c.gateway.host, "127.0.0.1");
        assert_eq!(c.gateway.port, 8080);
        assert_eq!(c.broker.waiting_timeout(), Duration::from_secs(300));
        assert!(c.broker.admin_disconnect_grace().is_none());
        assert!(c.broker.ended_retention().is_none());
        assert_eq!(c.broker.outbound_queue_capacity, 256);
        assert!(c.config_path.to_string_lossy().contains("config.toml"));
        c.validate().unwrap();
    }

    #[test]
    fn config_schema_export_contains_expected_sections() {
        let schema = schemars::schema_for!(Config);
        let schema_json = serde_json::to_value(&schema).expect("schema should serialize to json");
        let properties = schema_json
            .get("properties")
            .and_then(serde_json::Value::as_object)
            .expect("schema should expose top-level properties");

        assert!(properties.contains_key("gateway"));
        assert!(properties.contains_key("broker"));
        assert!(properties.contains_key("observability"));
        assert!(!properties.contains_key("config_path"));
    }

    // ── Parsing ──────────────────────────────────────────────

    #[test]
    fn partial_toml_fills_in_defaults() {
        let c: Config = toml::from_str(
            r#"
[broker]
waiting_timeout_secs = 45
admin_disconnect_grace_secs = 120
"#,
        )
        .unwrap();
        assert_eq!(c.broker.waiting_timeout(), Duration::from_secs(45));
        assert_eq!(
            c.broker.admin_disconnect_grace(),
            Some(Duration::from_secs(120))
        );
        assert_eq!(c.broker.max_dropped_frames, 100);
        assert_eq!(c.gateway.port, 8080);
    }

    // ── Validation ───────────────────────────────────────────

    #[test]
    fn validate_rejects_zero_waiting_timeout() {
        let mut c = Config::default();
        c.broker.waiting_timeout_secs = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_requires_opt_in_for_public_bind() {
        let mut c = Config::default();
        c.gateway.host = "0.0.0.0".into();
        assert!(c.validate().is_err());
        c.gateway.allow_public_bind = true;
        c.validate().unwrap();

        c.gateway.host = "localhost".into();
        c.gateway.allow_public_bind = false;
        c.validate().unwrap();
    }

    #[test]
    fn validate_rejects_tiny_frame_limit() {
        let mut c = Config::default();
        c.broker.max_frame_bytes = 16;
        assert!(c.validate().is_err());
    }

    // ── Persistence ──────────────────────────────────────────

    #[tokio::test]
    async fn load_or_init_writes_defaults_then_reads_them_back() {
        let tmp = tempfile::tempdir().unwrap();
        let first = Config::load_or_init_in(tmp.path()).await.unwrap();
        assert!(first.config_path.exists());

        let contents = tokio::fs::read_to_string(&first.config_path).await.unwrap();
        assert!(contents.contains("[broker]"));
        assert!(contents.contains("waiting_timeout_secs = 300"));

        let second = Config::load_or_init_in(tmp.path()).await.unwrap();
        assert_eq!(second.config_path, first.config_path);
        assert_eq!(
            second.broker.outbound_queue_capacity,
            first.broker.outbound_queue_capacity
        );
    }

    #[tokio::test]
    async fn save_round_trips_edited_values() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config {
            config_path: tmp.path().join("config.toml"),
            ..Config::default()
        };
        config.broker.ended_retention_secs = 3600;
        config.save().await.unwrap();

        let loaded = Config::load_or_init_in(tmp.path()).await.unwrap();
        assert_eq!(
            loaded.broker.ended_retention(),
            Some(Duration::from_secs(3600))
        );
    }

    #[tokio::test]
    async fn load_rejects_unparseable_file() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "[broker\nnope")
            .await
            .unwrap();
        assert!(Config::load_or_init_in(tmp.path()).await.is_err());
    }
}
