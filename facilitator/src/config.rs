//! Configuration module for the x402 facilitator server.

use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use x402_core::chain::ChainId;
use x402_eip155_exact::chain::config::{Eip155ChainConfig, Eip155ChainConfigInner};
use x402_eip155_exact::chain::EIP155_NAMESPACE;

/// CLI arguments for the x402 facilitator server.
#[derive(Parser, Debug)]
#[command(name = "x402-facilitator")]
#[command(about = "x402 Facilitator HTTP server")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

/// Server configuration.
///
/// Fields use serde defaults that fall back to environment variables,
/// then to hardcoded defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "config_defaults::default_port")]
    port: u16,
    #[serde(default = "config_defaults::default_host")]
    host: IpAddr,
    #[serde(default)]
    chains: ChainsConfig,
    /// Mounts `POST /close`, which cancels the server's shutdown token. Off by
    /// default: it lets anyone with network access stop the process, so it
    /// exists only for test harnesses that can't send an OS signal.
    #[serde(default)]
    enable_close_endpoint: bool,
}

/// Configuration for the set of chains this facilitator serves.
///
/// Wraps `Vec<Eip155ChainConfig>`, deserialized from a JSON object whose keys
/// are CAIP-2 chain identifiers (e.g. `"eip155:8453"`) and whose values are
/// the per-chain configuration.
#[derive(Debug, Clone, Default)]
pub struct ChainsConfig(pub Vec<Eip155ChainConfig>);

impl Deref for ChainsConfig {
    type Target = Vec<Eip155ChainConfig>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for ChainsConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{MapAccess, Visitor};
        use std::fmt;

        struct ChainsVisitor;

        impl<'de> Visitor<'de> for ChainsVisitor {
            type Value = ChainsConfig;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of eip155 chain identifiers to chain configurations")
            }

            fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut chains = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some(chain_id) = access.next_key::<ChainId>()? {
                    if chain_id.namespace() != EIP155_NAMESPACE {
                        return Err(serde::de::Error::custom(format!(
                            "unsupported chain namespace: {} (only {} is supported)",
                            chain_id.namespace(),
                            EIP155_NAMESPACE
                        )));
                    }
                    let inner: Eip155ChainConfigInner = access.next_value()?;
                    let chain_reference = chain_id
                        .try_into()
                        .map_err(|e| serde::de::Error::custom(format!("{}", e)))?;
                    chains.push(Eip155ChainConfig { chain_reference, inner });
                }
                Ok(ChainsConfig(chains))
            }
        }

        deserializer.deserialize_map(ChainsVisitor)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: config_defaults::default_port(),
            host: config_defaults::default_host(),
            chains: ChainsConfig::default(),
            enable_close_endpoint: false,
        }
    }
}

pub mod config_defaults {
    use std::env;
    use std::net::IpAddr;

    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_HOST: &str = "0.0.0.0";

    /// Returns the default port value with fallback: $PORT env var -> 8080
    pub fn default_port() -> u16 {
        env::var("PORT").ok().and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_PORT)
    }

    /// Returns the default host value with fallback: $HOST env var -> "0.0.0.0"
    pub fn default_host() -> IpAddr {
        env::var("HOST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(IpAddr::V4(DEFAULT_HOST.parse().unwrap()))
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl Config {
    /// Get the port value.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the host value as an IpAddr.
    pub fn host(&self) -> IpAddr {
        self.host
    }

    /// Get the chains configuration.
    ///
    /// Keys are CAIP-2 chain identifiers (e.g., "eip155:84532").
    pub fn chains(&self) -> &ChainsConfig {
        &self.chains
    }

    /// Whether `POST /close` should be mounted.
    pub fn enable_close_endpoint(&self) -> bool {
        self.enable_close_endpoint
    }

    /// Load configuration from CLI arguments and JSON file.
    ///
    /// The config file path is determined by:
    /// 1. `--config <path>` CLI argument
    /// 2. `./config.json` (if it exists)
    ///
    /// Values not present in the config file will be resolved via
    /// environment variables or defaults during deserialization.
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        let config_path = Path::new(&cli_args.config)
            .canonicalize()
            .map_err(|e| ConfigError::FileRead(cli_args.config, e))?;
        Self::load_from_path(config_path)
    }

    /// Load configuration from a specific path.
    fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path, e))?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }
}
