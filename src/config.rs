//! Configuration management for Tollgate.
//!
//! Settings come from an optional YAML file, then `TOLLGATE__*` environment
//! variables (for example `TOLLGATE__RATE_LIMITING__PROFILE=production`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{Category, KeyResolver, PolicyRule, PolicyTable, Profile};

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 8081))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Deployment profile selecting the built-in policies
    #[serde(default)]
    pub profile: Profile,

    /// Path to a YAML file of policy overrides
    #[serde(default)]
    pub policies_path: Option<String>,

    /// Inline policy overrides, applied after `policies_path`
    #[serde(default)]
    pub policies: BTreeMap<Category, PolicyRule>,

    /// IPv6 prefix length used to group addresses; 128 keeps them distinct
    #[serde(default = "default_ipv6_prefix_len")]
    pub ipv6_prefix_len: u8,

    /// Derive the client address from X-Forwarded-For / X-Real-IP
    #[serde(default)]
    pub trust_proxy_headers: bool,

    /// Janitor sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Idle time in seconds before an entry may be evicted
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            profile: Profile::default(),
            policies_path: None,
            policies: BTreeMap::new(),
            ipv6_prefix_len: default_ipv6_prefix_len(),
            trust_proxy_headers: false,
            sweep_interval_secs: default_sweep_interval(),
            retention_secs: default_retention(),
        }
    }
}

fn default_ipv6_prefix_len() -> u8 {
    128
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_retention() -> u64 {
    7200
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Layer an optional YAML file and `TOLLGATE__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let config: TollgateConfig = builder
            .add_source(
                config::Environment::with_prefix("TOLLGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// Build and validate the policy table: profile defaults, then the
    /// overrides file, then inline overrides.
    pub fn policy_table(&self) -> Result<PolicyTable> {
        let rl = &self.rate_limiting;
        let mut table = match &rl.policies_path {
            Some(path) => PolicyTable::from_file(path, rl.profile)?,
            None => PolicyTable::builtin(rl.profile),
        };
        table.apply(&rl.policies);
        table.validate_all()?;
        Ok(table)
    }

    pub fn key_resolver(&self) -> Result<KeyResolver> {
        let prefix = self.rate_limiting.ipv6_prefix_len;
        if prefix > 128 {
            return Err(TollgateError::Config(format!(
                "ipv6_prefix_len must be at most 128, got {}",
                prefix
            )));
        }
        Ok(KeyResolver::new(prefix))
    }

    pub fn sweep_interval(&self) -> Result<Duration> {
        match self.rate_limiting.sweep_interval_secs {
            0 => Err(TollgateError::Config(
                "sweep_interval_secs must be greater than zero".to_string(),
            )),
            secs => Ok(Duration::from_secs(secs)),
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.rate_limiting.retention_secs)
    }
}
