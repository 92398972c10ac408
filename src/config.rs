//! Environment-based configuration
//!
//! Secrets (share encryption passwords, the node signing key) come from
//! environment variables only. A `.env` file is honoured through `dotenv`.
//!
//! # TSS server
//! - `TSS_ENV` - "production", "staging" or "development" (default: "development")
//! - `TSS_BIND` - listen address (default: "0.0.0.0:4200")
//! - `TSS_DB_PATH` - SQLite file (default: "data/tss.db")
//! - `TSS_SHARE_PASSWORD` - password sealing `enc_tss_share` (required outside development)
//! - `TSS_ENGINE` - crypto engine, only "software" is bundled
//! - `TSS_SSS_THRESHOLD` - threshold recorded on new wallets (default: 2)
//! - `TSS_LOG_LEVEL` - trace/debug/info/warn/error
//!
//! # Key-share node
//! - `KSN_ENV`, `KSN_BIND` (default "0.0.0.0:4201"), `KSN_DB_PATH` (default "data/ksn.db")
//! - `KSN_NODE_NAME` - node name, hashed into the Shamir x-coordinate
//! - `KSN_NODE_KEY` - hex ed25519 secret key (required outside development)
//! - `KSN_SHARE_PASSWORD` - password sealing stored shares
//! - `KSN_CR_SESSION_TTL_SECS` - commit-reveal session lifetime (default: 300)
//! - `KSN_ALLOWED_ISSUERS` - comma-separated id_token issuers
//! - `KSN_LOG_LEVEL`

use serde::Deserialize;
use std::env;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::types::{KeyShareNodeMeta, NodeWalletStatus};

const DEV_PASSWORD: &str = "dev-only-password";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("not allowed in production: {0}")]
    NotAllowedInProduction(String),

    #[error("failed to read {0}: {1}")]
    Io(String, String),
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Staging,
    Development,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "staging" | "stage" => Ok(Environment::Staging),
            "development" | "dev" => Ok(Environment::Development),
            _ => Err(ConfigError::InvalidValue(
                "ENV".to_string(),
                format!("unknown environment: {}", s),
            )),
        }
    }
}

impl Environment {
    fn from_var(var_name: &str) -> Result<Self, ConfigError> {
        env::var(var_name)
            .unwrap_or_else(|_| "development".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue(var_name.to_string(), "unknown environment".to_string()))
    }

    /// JSON logs outside development
    pub fn json_logs(&self) -> bool {
        !matches!(self, Environment::Development)
    }
}

/// Crypto engine selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// In-process engine; its triple multiplication is development grade
    Software,
}

impl FromStr for EngineKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "software" => Ok(EngineKind::Software),
            other => Err(ConfigError::InvalidValue(
                "TSS_ENGINE".to_string(),
                format!("unknown engine: {} (bundled: 'software')", other),
            )),
        }
    }
}

/// TSS API server configuration
#[derive(Debug, Clone)]
pub struct TssConfig {
    pub environment: Environment,
    pub bind: String,
    pub db_path: String,
    pub share_password: String,
    pub engine: EngineKind,
    pub sss_threshold: u16,
    pub log_level: String,
}

impl TssConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = Environment::from_var("TSS_ENV")?;
        let bind = env::var("TSS_BIND").unwrap_or_else(|_| "0.0.0.0:4200".to_string());
        let db_path = env::var("TSS_DB_PATH").unwrap_or_else(|_| "data/tss.db".to_string());
        let share_password = required_or_dev_default("TSS_SHARE_PASSWORD", DEV_PASSWORD, environment)?;
        let engine: EngineKind = env::var("TSS_ENGINE")
            .unwrap_or_else(|_| "software".to_string())
            .parse()?;
        let sss_threshold = parse_or_default("TSS_SSS_THRESHOLD", 2u16)?;
        if sss_threshold < 2 {
            return Err(ConfigError::InvalidValue(
                "TSS_SSS_THRESHOLD".to_string(),
                "threshold must be at least 2".to_string(),
            ));
        }
        let log_level = env::var("TSS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            bind,
            db_path,
            share_password,
            engine,
            sss_threshold,
            log_level,
        })
    }

    /// Validate configuration for production readiness
    pub fn validate_for_production(&self) -> Result<(), ConfigError> {
        if self.environment != Environment::Production {
            return Ok(());
        }
        if self.engine == EngineKind::Software {
            return Err(ConfigError::NotAllowedInProduction(
                "software engine reveals triple b-shares; bind the native MPC engine".to_string(),
            ));
        }
        if self.share_password == DEV_PASSWORD {
            return Err(ConfigError::NotAllowedInProduction("default share password".to_string()));
        }
        Ok(())
    }
}

/// Key-share node configuration
#[derive(Debug, Clone)]
pub struct KsnConfig {
    pub environment: Environment,
    pub bind: String,
    pub db_path: String,
    pub node_name: String,
    /// Hex ed25519 secret key; `None` means generate an ephemeral one (development)
    pub node_key: Option<String>,
    pub share_password: String,
    pub cr_session_ttl_secs: i64,
    pub allowed_issuers: Vec<String>,
    pub log_level: String,
}

impl KsnConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = Environment::from_var("KSN_ENV")?;
        let bind = env::var("KSN_BIND").unwrap_or_else(|_| "0.0.0.0:4201".to_string());
        let db_path = env::var("KSN_DB_PATH").unwrap_or_else(|_| "data/ksn.db".to_string());
        let node_name = env::var("KSN_NODE_NAME")
            .map_err(|_| ConfigError::MissingEnvVar("KSN_NODE_NAME".to_string()))?;
        let node_key = match env::var("KSN_NODE_KEY") {
            Ok(key) => Some(key),
            Err(_) if environment == Environment::Development => None,
            Err(_) => return Err(ConfigError::MissingEnvVar("KSN_NODE_KEY".to_string())),
        };
        let share_password = required_or_dev_default("KSN_SHARE_PASSWORD", DEV_PASSWORD, environment)?;
        let cr_session_ttl_secs = parse_or_default("KSN_CR_SESSION_TTL_SECS", 300i64)?;
        let allowed_issuers = env::var("KSN_ALLOWED_ISSUERS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let log_level = env::var("KSN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            bind,
            db_path,
            node_name,
            node_key,
            share_password,
            cr_session_ttl_secs,
            allowed_issuers,
            log_level,
        })
    }

    /// Validate configuration for production readiness
    pub fn validate_for_production(&self) -> Result<(), ConfigError> {
        if self.environment != Environment::Production {
            return Ok(());
        }
        if self.share_password == DEV_PASSWORD {
            return Err(ConfigError::NotAllowedInProduction("default share password".to_string()));
        }
        if self.allowed_issuers.is_empty() {
            return Err(ConfigError::NotAllowedInProduction(
                "KSN_ALLOWED_ISSUERS must list at least one issuer".to_string(),
            ));
        }
        Ok(())
    }
}

/// Node set file consumed by the key-share node client
///
/// ```toml
/// threshold = 2
/// timeout_secs = 10
///
/// [[nodes]]
/// node_id = "1"
/// name = "ksn-alpha"
/// endpoint = "https://ksn-alpha.example.com"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSetFile {
    pub threshold: u16,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub nodes: Vec<NodeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeEntry {
    pub node_id: String,
    pub name: String,
    pub endpoint: String,
}

fn default_timeout_secs() -> u64 {
    10
}

impl NodeSetFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let file: NodeSetFile = toml::from_str(raw)
            .map_err(|e| ConfigError::InvalidValue("node set".to_string(), e.to_string()))?;
        if file.threshold < 2 {
            return Err(ConfigError::InvalidValue(
                "threshold".to_string(),
                "threshold must be at least 2".to_string(),
            ));
        }
        if usize::from(file.threshold) > file.nodes.len() {
            return Err(ConfigError::InvalidValue(
                "threshold".to_string(),
                "threshold cannot exceed the number of nodes".to_string(),
            ));
        }
        Ok(file)
    }

    /// Node metadata, status unknown until checked
    pub fn node_metas(&self) -> Vec<KeyShareNodeMeta> {
        self.nodes
            .iter()
            .map(|n| KeyShareNodeMeta {
                node_id: n.node_id.clone(),
                name: n.name.clone(),
                endpoint: n.endpoint.trim_end_matches('/').to_string(),
                wallet_status: NodeWalletStatus::NotRegistered,
            })
            .collect()
    }
}

fn required_or_dev_default(
    var_name: &str,
    dev_default: &str,
    environment: Environment,
) -> Result<String, ConfigError> {
    match env::var(var_name) {
        Ok(value) => Ok(value),
        Err(_) if environment == Environment::Development => {
            tracing::warn!(var = var_name, "using development default - DO NOT USE WITH REAL KEYS");
            Ok(dev_default.to_string())
        }
        Err(_) => Err(ConfigError::MissingEnvVar(var_name.to_string())),
    }
}

fn parse_or_default<T: FromStr>(var_name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var_name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(var_name.to_string(), "must be a number".to_string())),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parsing() {
        assert!(matches!("production".parse::<Environment>(), Ok(Environment::Production)));
        assert!(matches!("dev".parse::<Environment>(), Ok(Environment::Development)));
        assert!("moon".parse::<Environment>().is_err());
        assert!(Environment::Staging.json_logs());
        assert!(!Environment::Development.json_logs());
    }

    #[test]
    fn test_production_rejects_software_engine() {
        let config = TssConfig {
            environment: Environment::Production,
            bind: "127.0.0.1:0".to_string(),
            db_path: ":memory:".to_string(),
            share_password: "a-real-password".to_string(),
            engine: EngineKind::Software,
            sss_threshold: 2,
            log_level: "info".to_string(),
        };
        assert!(matches!(
            config.validate_for_production(),
            Err(ConfigError::NotAllowedInProduction(_))
        ));
    }

    #[test]
    fn test_node_set_file_parsing() {
        let raw = r#"
            threshold = 2

            [[nodes]]
            node_id = "1"
            name = "ksn-alpha"
            endpoint = "http://localhost:4201/"

            [[nodes]]
            node_id = "2"
            name = "ksn-beta"
            endpoint = "http://localhost:4202"
        "#;
        let file = NodeSetFile::parse(raw).unwrap();
        assert_eq!(file.timeout_secs, 10);
        let metas = file.node_metas();
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0].endpoint, "http://localhost:4201");
    }

    #[test]
    fn test_node_set_threshold_bounds() {
        let raw = r#"
            threshold = 3

            [[nodes]]
            node_id = "1"
            name = "ksn-alpha"
            endpoint = "http://localhost:4201"
        "#;
        assert!(NodeSetFile::parse(raw).is_err());
    }
}
