use common::postgres::PostgresConfig;
use common::telemetry::TelemetryConfig;
use config::{Config, ConfigError, File, FileFormat, Map, Source, Value};
use device_twin::ReconcilerConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Environment variable holding the path of the YAML configuration file
pub const CONFIG_PATH_ENV: &str = "DMS_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const ENV_PREFIX: &str = "DMS_";

/// Keys that can be overridden from the environment, `DMS_` + upper-cased
/// key with `.` replaced by `_` (`mqtt.url` -> `DMS_MQTT_URL`)
const ENV_KEYS: &[&str] = &[
    "log_level",
    "telemetry.service_name",
    "telemetry.otel_endpoint",
    "telemetry.otel_enabled",
    "mqtt.url",
    "mqtt.port",
    "mqtt.client_id_prefix",
    "mqtt.ca_path",
    "mqtt.cert_path",
    "mqtt.key_path",
    "mqtt.health_topic",
    "mqtt.pub_topic",
    "mqtt.keep_alive_secs",
    "mqtt.publish_timeout_secs",
    "mqtt.inbound_capacity",
    "mqtt.reconnect_delay_secs",
    "database.driver",
    "database.dsn",
    "database.max_pool_size",
    "database.ensure_schema",
    "egress.capacity",
    "reconciler.install_service_tick_secs",
    "reconciler.device_check_tick_secs",
    "reconciler.redispatch_after_secs",
    "reconciler.enabled",
    "auth.provider",
    "shutdown_timeout_secs",
];

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub mqtt: MqttConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub egress: EgressConfig,

    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Grace period for closers once every process stopped
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// File keys and `DMS_*` variables that matched no setting
    #[serde(skip)]
    pub ignored_keys: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker host name
    pub url: String,
    pub port: u16,
    pub client_id_prefix: String,
    /// PEM files for mutual TLS; all three or none
    pub ca_path: String,
    pub cert_path: String,
    pub key_path: String,
    pub health_topic: String,
    pub pub_topic: String,
    pub keep_alive_secs: u64,
    pub publish_timeout_secs: u64,
    /// Buffered inbound messages per subscription
    pub inbound_capacity: usize,
    pub reconnect_delay_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            url: "localhost".to_string(),
            port: 1883,
            client_id_prefix: "dms".to_string(),
            ca_path: String::new(),
            cert_path: String::new(),
            key_path: String::new(),
            health_topic: "devices/health/+".to_string(),
            pub_topic: "devices/pub/+".to_string(),
            keep_alive_secs: 30,
            publish_timeout_secs: 10,
            inbound_capacity: 100,
            reconnect_delay_secs: 5,
        }
    }
}

impl MqttConfig {
    pub fn tls_enabled(&self) -> bool {
        !self.ca_path.is_empty() || !self.cert_path.is_empty() || !self.key_path.is_empty()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    Postgres,
    Memory,
}

#[derive(Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub driver: DatabaseDriver,
    pub dsn: String,
    pub max_pool_size: usize,
    /// Apply the bundled schema at startup
    pub ensure_schema: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let postgres = PostgresConfig::default();
        Self {
            driver: DatabaseDriver::Postgres,
            dsn: postgres.dsn,
            max_pool_size: postgres.max_pool_size,
            ensure_schema: postgres.ensure_schema,
        }
    }
}

// the dsn may carry credentials
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("driver", &self.driver)
            .field("dsn", &redact_dsn(&self.dsn))
            .field("max_pool_size", &self.max_pool_size)
            .field("ensure_schema", &self.ensure_schema)
            .finish()
    }
}

fn redact_dsn(dsn: &str) -> String {
    match (dsn.find("://"), dsn.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***@{}", &dsn[..scheme], &dsn[at + 1..])
        }
        _ if dsn.contains("password") => "***".to_string(),
        _ => dsn.to_string(),
    }
}

impl DatabaseConfig {
    pub fn postgres(&self) -> PostgresConfig {
        PostgresConfig {
            dsn: self.dsn.clone(),
            max_pool_size: self.max_pool_size,
            ensure_schema: self.ensure_schema,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct EgressConfig {
    /// Queued outbound publishes before callers wait
    pub capacity: usize,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

/// Identity provider of the REST facade; the core only carries the setting
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    pub provider: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            telemetry: TelemetryConfig::default(),
            mqtt: MqttConfig::default(),
            database: DatabaseConfig::default(),
            egress: EgressConfig::default(),
            reconciler: ReconcilerConfig::default(),
            auth: AuthConfig::default(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            ignored_keys: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Loads defaults, then the YAML file named by `DMS_CONFIG` (or
    /// `./config.yaml` when present), then `DMS_*` overrides
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path, std::env::vars())
    }

    pub fn load_from(
        path: &str,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter(|(name, _)| name.starts_with(ENV_PREFIX))
            .collect();

        let defaults = Config::try_from(&ServiceConfig::default())?;
        let mut known = BTreeSet::new();
        collect_keys("", defaults.collect()?, &mut known);

        let mut builder = Config::builder()
            .add_source(defaults)
            .add_source(File::new(path, FileFormat::Yaml).required(false));

        for key in ENV_KEYS {
            if let Some(value) = vars.get(&env_var_name(key)) {
                builder = builder.set_override(*key, value.as_str())?;
            }
        }

        let merged = builder.build()?;
        let mut loaded = BTreeSet::new();
        collect_keys("", merged.collect()?, &mut loaded);

        let env_names: BTreeSet<String> = ENV_KEYS.iter().map(|key| env_var_name(key)).collect();
        let mut ignored: Vec<String> = loaded.difference(&known).cloned().collect();
        let mut ignored_vars: Vec<String> = vars
            .into_keys()
            .filter(|name| name != CONFIG_PATH_ENV && !env_names.contains(name))
            .collect();
        ignored_vars.sort();
        ignored.extend(ignored_vars);

        let mut config: ServiceConfig = merged.try_deserialize()?;
        config.validate()?;
        config.ignored_keys = ignored;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.url.trim().is_empty() {
            return Err(ConfigError::Message("mqtt.url cannot be empty".to_string()));
        }
        if self.mqtt.tls_enabled()
            && (self.mqtt.ca_path.is_empty()
                || self.mqtt.cert_path.is_empty()
                || self.mqtt.key_path.is_empty())
        {
            return Err(ConfigError::Message(
                "mqtt.ca_path, mqtt.cert_path and mqtt.key_path must be set together".to_string(),
            ));
        }
        if self.database.driver == DatabaseDriver::Postgres && self.database.dsn.trim().is_empty() {
            return Err(ConfigError::Message(
                "database.dsn is required for the postgres driver".to_string(),
            ));
        }
        Ok(())
    }

    /// Telemetry settings with the top-level log level applied
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: self.log_level.clone(),
            ..self.telemetry.clone()
        }
    }
}

/// Dotted paths of every leaf value in `table`
fn collect_keys(prefix: &str, table: Map<String, Value>, out: &mut BTreeSet<String>) {
    for (key, value) in table {
        let path = if prefix.is_empty() {
            key
        } else {
            format!("{}.{}", prefix, key)
        };
        match value.clone().into_table() {
            Ok(nested) if !nested.is_empty() => collect_keys(&path, nested, out),
            _ => {
                out.insert(path);
            }
        }
    }
}

fn env_var_name(key: &str) -> String {
    format!("{}{}", ENV_PREFIX, key.replace('.', "_").to_uppercase())
}
