// src/config.rs

use std::{env, fmt, path::PathBuf, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::{broker::DEFAULT_MAX_PACKET_SIZE, handler::DEFAULT_MAX_OPERATIONS};

pub const BROKER_URL_KEY: &str = "IOTFLOW_BROKER_URL";
pub const USERNAME_KEY: &str = "IOTFLOW_USERNAME";
pub const PASSWORD_KEY: &str = "IOTFLOW_PASSWORD";
pub const REQUEST_TIMEOUT_KEY: &str = "IOTFLOW_REQUEST_TIMEOUT_MS";
pub const SCRIPT_MAX_OPERATIONS_KEY: &str = "IOTFLOW_SCRIPT_MAX_OPERATIONS";
pub const KEEP_ALIVE_KEY: &str = "IOTFLOW_KEEP_ALIVE_SECS";
pub const MAX_PACKET_KEY: &str = "IOTFLOW_MAX_PACKET_BYTES";
pub const ROOT_KEY: &str = "IOTFLOW_ROOT";

pub const DEFAULT_BROKER_URL: &str = "wss://mqtt-edu.webduino.io/mqtt";

/// Read-only key/value configuration source.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn describe(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.describe())
    }
}

impl ConfigManager {
    pub fn env(env_file: PathBuf) -> Self {
        ConfigManager(EnvConfigManager::new(env_file))
    }

    pub fn in_memory() -> Self {
        ConfigManager(MapConfigManager::new())
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }
}

/// Process environment, seeded from an optional `.env` file. Variables
/// already set in the environment win over the file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("loaded {}", env_file.display()),
                Err(e) => warn!("could not parse {}: {}", env_file.display(), e),
            }
        } else {
            debug!("no env file at {}", env_file.display());
        }
        Box::new(Self { env_file })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn describe(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// Fixed in-memory configuration, mostly for tests.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Box<Self>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let map = pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        Box::new(Self { map })
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn describe(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Settings the orchestrator applies to every device it creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Used when a device node leaves `brokerUrl` empty.
    pub broker_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub request_timeout: Duration,
    pub script_max_operations: u64,
    pub keep_alive_secs: u64,
    /// Largest MQTT packet a device sends or accepts.
    pub max_packet_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            username: None,
            password: None,
            request_timeout: Duration::from_millis(5_000),
            script_max_operations: DEFAULT_MAX_OPERATIONS,
            keep_alive_secs: 30,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl RuntimeConfig {
    pub async fn load(config: &ConfigManager) -> Self {
        let defaults = RuntimeConfig::default();
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        RuntimeConfig {
            broker_url: non_empty(config.get(BROKER_URL_KEY).await).unwrap_or(defaults.broker_url),
            username: non_empty(config.get(USERNAME_KEY).await),
            password: non_empty(config.get(PASSWORD_KEY).await),
            request_timeout: Duration::from_millis(
                number(config, REQUEST_TIMEOUT_KEY, defaults.request_timeout.as_millis() as u64).await,
            ),
            script_max_operations: number(
                config,
                SCRIPT_MAX_OPERATIONS_KEY,
                defaults.script_max_operations,
            )
            .await,
            keep_alive_secs: number(config, KEEP_ALIVE_KEY, defaults.keep_alive_secs).await,
            max_packet_size: number(config, MAX_PACKET_KEY, defaults.max_packet_size as u64).await as usize,
        }
    }
}

async fn number(config: &ConfigManager, key: &str, default: u64) -> u64 {
    match config.get(key).await {
        None => default,
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(n) => n,
            Err(_) => {
                warn!(%key, value = %raw, default, "not a number, using default");
                default
            }
        },
    }
}
