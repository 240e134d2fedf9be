// src/config.rs

//! Manages gateway configuration: loading, environment overrides, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::{info, warn};

/// Node identity used when neither the config file nor the environment names one.
pub const DEFAULT_NODE_ID: &str = "local";

/// Selects the shared coordination store implementation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// Process-local store. Only coordinates gateways living in the same process.
    #[default]
    Memory,
    /// A Redis-protocol server reached over RESP.
    Resp,
}

/// Selects the message broker implementation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerMode {
    #[default]
    Memory,
    /// Durable topic log built on RESP streams.
    Stream,
}

/// Timing and capacity knobs of the session coordination protocol.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionConfig {
    /// Lease length of the per-user login lock.
    #[serde(with = "humantime_serde", default = "default_lock_ttl")]
    pub lock_ttl: Duration,
    /// Lifetime of the distributed session record, refreshed on every login.
    #[serde(with = "humantime_serde", default = "default_record_ttl")]
    pub record_ttl: Duration,
    /// How many times a login re-reads the session record before overriding it.
    #[serde(default = "default_verify_retries")]
    pub verify_retries: u32,
    #[serde(with = "humantime_serde", default = "default_verify_delay")]
    pub verify_delay: Duration,
    /// Pause between the forced record delete and the final re-check.
    #[serde(with = "humantime_serde", default = "default_override_settle")]
    pub override_settle: Duration,
    /// Sessions idle for longer than this are logged out. `0s` disables the reaper.
    #[serde(with = "humantime_serde", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_reaper_interval")]
    pub reaper_interval: Duration,
    /// Capacity of every connection's outbound queue.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(5)
}
fn default_record_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}
fn default_verify_retries() -> u32 {
    3
}
fn default_verify_delay() -> Duration {
    Duration::from_millis(100)
}
fn default_override_settle() -> Duration {
    Duration::from_millis(50)
}
fn default_idle_timeout() -> Duration {
    Duration::ZERO
}
fn default_reaper_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_outbound_queue() -> usize {
    256
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lock_ttl: default_lock_ttl(),
            record_ttl: default_record_ttl(),
            verify_retries: default_verify_retries(),
            verify_delay: default_verify_delay(),
            override_settle: default_override_settle(),
            idle_timeout: default_idle_timeout(),
            reaper_interval: default_reaper_interval(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// Connection settings for the shared coordination store.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub mode: StoreMode,
    #[serde(default = "default_store_addr")]
    pub addr: String,
    /// Number of pooled command connections for the RESP store.
    #[serde(default = "default_store_pool_size")]
    pub pool_size: usize,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_command_timeout")]
    pub command_timeout: Duration,
    /// Startup connection attempts before giving up.
    #[serde(default = "default_startup_retries")]
    pub startup_retries: u32,
    #[serde(with = "humantime_serde", default = "default_startup_backoff")]
    pub startup_backoff: Duration,
}

fn default_store_addr() -> String {
    "127.0.0.1:6379".to_string()
}
fn default_store_pool_size() -> usize {
    8
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_command_timeout() -> Duration {
    Duration::from_secs(3)
}
fn default_startup_retries() -> u32 {
    5
}
fn default_startup_backoff() -> Duration {
    Duration::from_millis(500)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mode: StoreMode::default(),
            addr: default_store_addr(),
            pool_size: default_store_pool_size(),
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
            startup_retries: default_startup_retries(),
            startup_backoff: default_startup_backoff(),
        }
    }
}

/// Broker settings: topic names and dispatcher sizing.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerConfig {
    #[serde(default)]
    pub mode: BrokerMode,
    #[serde(default = "default_broker_addr")]
    pub addr: String,
    /// Cluster-wide topic carrying fallback kick commands.
    #[serde(default = "default_kick_topic")]
    pub kick_topic: String,
    /// Topic consumed by the remote storage service.
    #[serde(default = "default_storage_topic")]
    pub storage_topic: String,
    #[serde(default = "default_dispatcher_workers")]
    pub dispatcher_workers: usize,
    /// How long a stream read blocks waiting for new entries.
    #[serde(with = "humantime_serde", default = "default_block_timeout")]
    pub block_timeout: Duration,
    /// Entries each topic keeps in memory mode. Older entries are dropped.
    #[serde(default = "default_memory_retention")]
    pub memory_retention: usize,
}

fn default_broker_addr() -> String {
    "127.0.0.1:6379".to_string()
}
fn default_kick_topic() -> String {
    "user-kick-topic".to_string()
}
fn default_storage_topic() -> String {
    "storage-service".to_string()
}
fn default_dispatcher_workers() -> usize {
    4
}
fn default_block_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_memory_retention() -> usize {
    10_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mode: BrokerMode::default(),
            addr: default_broker_addr(),
            kick_topic: default_kick_topic(),
            storage_topic: default_storage_topic(),
            dispatcher_workers: default_dispatcher_workers(),
            block_timeout: default_block_timeout(),
            memory_retention: default_memory_retention(),
        }
    }
}

/// Settings for the remote authentication service.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_auth_url")]
    pub base_url: String,
    #[serde(with = "humantime_serde", default = "default_auth_timeout")]
    pub timeout: Duration,
}

fn default_auth_url() -> String {
    "http://127.0.0.1:8081/".to_string()
}
fn default_auth_timeout() -> Duration {
    Duration::from_secs(3)
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            base_url: default_auth_url(),
            timeout: default_auth_timeout(),
        }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9100
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

/// Configuration for TLS encryption of the WebSocket listener.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
}

fn default_cert_path() -> String {
    "spinelgate.crt".to_string()
}
fn default_key_path() -> String {
    "spinelgate.key".to_string()
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: default_cert_path(),
            key_path: default_key_path(),
        }
    }
}

/// A raw representation of the config file before overrides and validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    node_id: Option<String>,
    #[serde(default = "default_ws_path")]
    ws_path: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_max_clients")]
    max_clients: usize,
    #[serde(default)]
    session: SessionConfig,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    broker: BrokerConfig,
    #[serde(default)]
    auth: AuthConfig,
    #[serde(default)]
    tls: TlsConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_ws_path() -> String {
    "/ws".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_clients() -> usize {
    10000
}

/// Represents the final, validated, and resolved gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Identity of this node. Also the name of the broker topic it consumes.
    pub node_id: String,
    pub ws_path: String,
    pub log_level: String,
    pub max_clients: usize,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            node_id: DEFAULT_NODE_ID.to_string(),
            ws_path: default_ws_path(),
            log_level: default_log_level(),
            max_clients: default_max_clients(),
            session: SessionConfig::default(),
            store: StoreConfig::default(),
            broker: BrokerConfig::default(),
            auth: AuthConfig::default(),
            tls: TlsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file,
    /// then applying environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let mut config = Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to load config from '{path}'"))?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document without consulting the environment.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(contents).context("Failed to parse TOML")?;
        let config = Config {
            host: raw.host,
            port: raw.port,
            node_id: raw
                .node_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_NODE_ID.to_string()),
            ws_path: raw.ws_path,
            log_level: raw.log_level,
            max_clients: raw.max_clients,
            session: raw.session,
            store: raw.store,
            broker: raw.broker,
            auth: raw.auth,
            tls: raw.tls,
            metrics: raw.metrics,
        };
        config.validate()?;
        Ok(config)
    }

    /// Applies `NODE_ID`/`HOSTNAME`, `STORE_ADDR`, `BROKER_ADDR`, `AUTH_ADDR` and `PORT`.
    ///
    /// The lookup is injected so tests never have to mutate the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(node_id) = non_empty("NODE_ID").or_else(|| non_empty("HOSTNAME")) {
            info!("Node identity taken from environment: {}", node_id);
            self.node_id = node_id;
        }
        if let Some(addr) = non_empty("STORE_ADDR") {
            self.store.addr = addr;
        }
        if let Some(addr) = non_empty("BROKER_ADDR") {
            self.broker.addr = addr;
        }
        if let Some(addr) = non_empty("AUTH_ADDR") {
            url::Url::parse(&addr)
                .with_context(|| format!("AUTH_ADDR '{addr}' is not a valid URL"))?;
            self.auth.base_url = addr;
        }
        if let Some(port) = non_empty("PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("PORT '{port}' is not a valid port number"))?;
        }
        Ok(())
    }

    /// The broker topic this node consumes. Named after the node identity.
    pub fn node_topic(&self) -> &str {
        &self.node_id
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.max_clients == 0 {
            return Err(anyhow!("max_clients cannot be 0"));
        }
        if self.node_id.trim().is_empty() {
            return Err(anyhow!("node_id cannot be empty"));
        }
        // Session records are `connection:node` split at the last colon; kick commands need a bare token.
        if !self
            .node_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(anyhow!(
                "node_id '{}' may only contain ASCII letters, digits, '.', '_' and '-'",
                self.node_id
            ));
        }
        if !self.ws_path.starts_with('/') {
            return Err(anyhow!("ws_path must start with '/'"));
        }

        if self.session.lock_ttl.is_zero() {
            return Err(anyhow!("session.lock_ttl cannot be 0"));
        }
        if self.session.record_ttl.is_zero() {
            return Err(anyhow!("session.record_ttl cannot be 0"));
        }
        if self.session.verify_retries == 0 {
            return Err(anyhow!("session.verify_retries cannot be 0"));
        }
        if self.session.outbound_queue == 0 {
            return Err(anyhow!("session.outbound_queue cannot be 0"));
        }
        if self.session.lock_ttl
            < self.session.verify_delay * self.session.verify_retries + self.session.override_settle
        {
            warn!(
                "session.lock_ttl ({:?}) is shorter than the login verification window; the lock may expire mid-login.",
                self.session.lock_ttl
            );
        }
        if !self.session.idle_timeout.is_zero() && self.session.reaper_interval.is_zero() {
            return Err(anyhow!(
                "session.reaper_interval cannot be 0 when session.idle_timeout is set"
            ));
        }

        if self.store.mode == StoreMode::Resp && self.store.addr.trim().is_empty() {
            return Err(anyhow!("store.addr cannot be empty in resp mode"));
        }
        if self.store.pool_size == 0 {
            return Err(anyhow!("store.pool_size cannot be 0"));
        }
        if self.broker.mode == BrokerMode::Stream && self.broker.addr.trim().is_empty() {
            return Err(anyhow!("broker.addr cannot be empty in stream mode"));
        }
        if self.broker.kick_topic.trim().is_empty() || self.broker.storage_topic.trim().is_empty()
        {
            return Err(anyhow!("broker topics cannot be empty"));
        }
        if self.broker.kick_topic == self.node_id || self.broker.storage_topic == self.node_id {
            return Err(anyhow!(
                "node_id '{}' collides with a shared broker topic",
                self.node_id
            ));
        }
        if self.broker.dispatcher_workers == 0 {
            return Err(anyhow!("broker.dispatcher_workers cannot be 0"));
        }
        if self.broker.memory_retention == 0 {
            return Err(anyhow!("broker.memory_retention cannot be 0"));
        }
        url::Url::parse(&self.auth.base_url)
            .with_context(|| format!("auth.base_url '{}' is not a valid URL", self.auth.base_url))?;

        if self.tls.enabled {
            if self.tls.cert_path.trim().is_empty() {
                return Err(anyhow!("tls.cert_path cannot be empty when TLS is enabled"));
            }
            if self.tls.key_path.trim().is_empty() {
                return Err(anyhow!("tls.key_path cannot be empty when TLS is enabled"));
            }
        }

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main server port"
                ));
            }
        }
        Ok(())
    }
}
