use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_BASE_DN: &str = "dc=teapot,dc=ovh";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub tls: Option<TlsConfig>,
    /// Optional HTTP listen address for metrics and health (e.g. "0.0.0.0:9090"). Endpoints: GET /metrics (Prometheus), GET /health (liveness), GET /ready (readiness).
    pub metrics_listen: Option<String>,
    /// How long shutdown waits for open sessions to drain (default 10).
    pub shutdown_timeout_sec: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub url: String,
    /// Per-message read deadline in seconds. Absent or 0 disables it.
    pub read_timeout_sec: Option<u64>,
    /// Per-message write deadline in seconds. Absent or 0 disables it.
    pub write_timeout_sec: Option<u64>,
    /// Bounded per-connection response queue (default 32).
    pub output_queue: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default = "default_base_dn")]
    pub base_dn: String,
    /// Plaintext root password, hashed at startup. Empty or absent disables root bind.
    pub root_password: Option<String>,
    /// Access rules, `user:groups:actions:target:attributes`.
    #[serde(default = "default_acl")]
    pub acl: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Mem,
    Sql,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    /// PostgreSQL connection URL, required when kind is sql.
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub ca_file: Option<String>,
}

fn default_base_dn() -> String {
    DEFAULT_BASE_DN.to_string()
}

fn default_max_connections() -> u32 {
    10
}

pub fn default_acl() -> Vec<String> {
    [
        "ANONYMOUS::bind:*,ou=users,dc=teapot,dc=ovh:",
        "ANONYMOUS::bind:dc=teapot,dc=ovh:",
        "*,dc=teapot,dc=ovh::read:*:* !userpassword",
        "*::read modify:SELF:*",
        "dc=teapot,dc=ovh::read add modify delete:*:*",
        "*:cn=admin,ou=groups,dc=teapot,dc=ovh:read add modify delete:*:*",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn seconds(value: Option<u64>) -> Option<Duration> {
    value.filter(|s| *s > 0).map(Duration::from_secs)
}

impl ListenConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        seconds(self.read_timeout_sec)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        seconds(self.write_timeout_sec)
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_dn: default_base_dn(),
            root_password: None,
            acl: default_acl(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Mem,
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("Failed to parse config")?;
        Ok(config)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_sec.unwrap_or(10))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig {
                url: "ldap://127.0.0.1:1389".to_string(),
                read_timeout_sec: None,
                write_timeout_sec: None,
                output_queue: Some(32),
            },
            directory: DirectoryConfig::default(),
            store: StoreConfig::default(),
            tls: None,
            metrics_listen: None,
            shutdown_timeout_sec: Some(10),
        }
    }
}
