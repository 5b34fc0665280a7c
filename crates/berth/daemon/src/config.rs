//! Daemon configuration
//!
//! Layered as built-in defaults, then an optional TOML file, then
//! `BERTH__`-prefixed environment variables (`BERTH__SERVER__LISTEN_ADDR`).

use std::collections::BTreeMap;
use std::net::SocketAddr;

use berth_control::{ProvisioningConfig, ReconcilerConfig};
use berth_pool::PoolConfig;
use berth_runtime::RuntimeTemplate;
use berth_types::{MemoryLimit, PlanSpec, PlanTable};
use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, DaemonResult};

/// Top-level daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub runtime: RuntimeConfig,
    pub pool: PoolConfig,
    pub plans: Vec<PlanEntry>,
    pub template: TemplateConfig,
    pub provisioning: ProvisioningConfig,
    pub reconciler: ReconcilerConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let plans = PlanTable::default()
            .iter()
            .map(|(id, spec)| PlanEntry {
                id: id.as_str().to_string(),
                memory_limit: spec.memory_limit.as_str().to_string(),
                display_name: spec.display_name.clone(),
            })
            .collect();

        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            runtime: RuntimeConfig::default(),
            pool: PoolConfig::default(),
            plans,
            template: TemplateConfig::from(&RuntimeTemplate::default()),
            provisioning: ProvisioningConfig::default(),
            reconciler: ReconcilerConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: SocketAddr,

    /// Enable CORS
    pub enable_cors: bool,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            enable_cors: true,
            request_timeout_secs: 90,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Where fleet state lives
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage; state is lost on restart
    #[default]
    Memory,

    /// PostgreSQL storage (requires the `postgres` feature)
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        #[serde(default = "default_connect_timeout")]
        connect_timeout_secs: u64,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

/// Which container runtime backs the fleet
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuntimeConfig {
    /// In-process runtime, for development and demos
    #[default]
    Simulated,

    /// Local Docker engine (requires the `docker` feature)
    Docker {
        #[serde(default = "default_docker_request_timeout")]
        request_timeout_secs: u64,
        #[serde(default = "default_docker_stop_timeout")]
        stop_timeout_secs: u64,
    },
}

fn default_docker_request_timeout() -> u64 {
    120
}

fn default_docker_stop_timeout() -> u64 {
    30
}

/// One purchasable plan. Kept as a list so plan ids keep their case
/// through the environment layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub id: String,
    pub memory_limit: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Container settings shared by every server. Env and labels are lists
/// so their keys survive the layered loader untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub image: String,
    pub container_port: u16,
    pub env: Vec<KeyValue>,
    pub labels: Vec<KeyValue>,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self::from(&RuntimeTemplate::default())
    }
}

/// A single `name = value` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub name: String,
    pub value: String,
}

fn to_pairs(map: &BTreeMap<String, String>) -> Vec<KeyValue> {
    map.iter()
        .map(|(name, value)| KeyValue {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

fn to_map(pairs: &[KeyValue]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|kv| (kv.name.clone(), kv.value.clone()))
        .collect()
}

impl From<&RuntimeTemplate> for TemplateConfig {
    fn from(template: &RuntimeTemplate) -> Self {
        Self {
            image: template.image.clone(),
            container_port: template.container_port,
            env: to_pairs(&template.env),
            labels: to_pairs(&template.labels),
        }
    }
}

impl From<&TemplateConfig> for RuntimeTemplate {
    fn from(config: &TemplateConfig) -> Self {
        Self {
            image: config.image.clone(),
            container_port: config.container_port,
            env: to_map(&config.env),
            labels: to_map(&config.labels),
        }
    }
}

/// Background sweep intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Run the background sweeps at all
    pub enabled: bool,

    /// Interval between reconciliation sweeps
    pub reconcile_interval_secs: u64,

    /// Interval between expiry sweeps for unconfirmed allocations
    pub expiry_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reconcile_interval_secs: 30,
            expiry_interval_secs: 60,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,

    /// Emit JSON lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file and environment
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("BERTH")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Check cross-section constraints the individual sections cannot.
    pub fn validate(&self) -> DaemonResult<()> {
        self.pool
            .validate()
            .map_err(|e| DaemonError::Config(e.to_string()))?;
        if self.scheduler.reconcile_interval_secs == 0 || self.scheduler.expiry_interval_secs == 0 {
            return Err(DaemonError::Config(
                "scheduler intervals must be at least one second".into(),
            ));
        }
        if self.template.image.trim().is_empty() || self.template.container_port == 0 {
            return Err(DaemonError::Config(
                "template needs an image and a container port".into(),
            ));
        }
        if self.reconciler.concurrency == 0 {
            return Err(DaemonError::Config(
                "reconciler concurrency must be at least 1".into(),
            ));
        }
        self.plan_table().map(|_| ())
    }

    /// Resolve the configured plans into a lookup table.
    pub fn plan_table(&self) -> DaemonResult<PlanTable> {
        if self.plans.is_empty() {
            return Err(DaemonError::Config("at least one plan is required".into()));
        }
        let mut table = PlanTable::empty();
        for entry in &self.plans {
            let memory_limit = MemoryLimit::parse(&entry.memory_limit)
                .map_err(|e| DaemonError::Config(format!("plan {}: {}", entry.id, e)))?;
            table = table.with_plan(
                entry.id.clone(),
                PlanSpec {
                    memory_limit,
                    display_name: entry.display_name.clone(),
                },
            );
        }
        Ok(table)
    }

    /// Reconciler settings with the orphan-sweep prefix taken from the pool,
    /// so the two can never disagree.
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            name_prefix: self.pool.name_prefix.clone(),
            ..self.reconciler.clone()
        }
    }
}
