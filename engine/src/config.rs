//! Engine Configuration
//!
//! Handles loading and saving engine configuration from TOML files.

use std::path::{Path, PathBuf};
use std::fs;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Address;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Full engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine identity and signing domain
    #[serde(default)]
    pub engine: EngineSettings,

    /// Access control settings
    #[serde(default)]
    pub acl: AclSettings,

    /// Cost metering settings
    #[serde(default)]
    pub cost: CostSettings,

    /// Threshold public decryption settings
    #[serde(default)]
    pub public_decryption: PublicDecryptionSettings,

    /// Input verification settings
    #[serde(default)]
    pub input: InputSettings,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageSettings,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl EngineConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Local development configuration: in-memory storage, no budget, no TTL
    pub fn local() -> Self {
        Self {
            engine: EngineSettings {
                chain_id: 31337,
                ..Default::default()
            },
            storage: StorageSettings { path: None },
            logging: LoggingSettings {
                level: "debug".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Testnet configuration
    pub fn testnet() -> Self {
        Self {
            engine: EngineSettings {
                name: "Umbra Testnet".to_string(),
                chain_id: 8009,
                shard_count: 64,
                ..Default::default()
            },
            cost: CostSettings {
                budget_per_window: Some(10_000_000),
            },
            public_decryption: PublicDecryptionSettings {
                request_ttl_secs: Some(3600),
                ..Default::default()
            },
            logging: LoggingSettings {
                format: "json".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Set the gateway identity
    pub fn with_gateway(mut self, gateway: Address) -> Self {
        self.public_decryption.gateway = Some(gateway.to_hex());
        self
    }

    /// Trust an additional coprocessor key for input proofs
    pub fn with_coprocessor(mut self, key: &VerifyingKey) -> Self {
        self.input.coprocessor_keys.push(hex::encode(key.as_bytes()));
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.name.is_empty() {
            return Err(ConfigError::Invalid("Engine name must not be empty".to_string()));
        }

        if self.engine.shard_count == 0 {
            return Err(ConfigError::Invalid(
                "Shard count must be greater than 0".to_string()
            ));
        }

        self.engine.address()?;
        self.public_decryption.gateway()?;
        self.input.coprocessor_keys()?;

        if self.public_decryption.request_ttl_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "Request TTL must be greater than 0 when set".to_string()
            ));
        }

        if self.cost.budget_per_window == Some(0) {
            return Err(ConfigError::Invalid(
                "Cost budget must be greater than 0 when set".to_string()
            ));
        }

        Ok(())
    }
}

/// Engine identity and signing domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Domain name used in decryption authorizations
    pub name: String,

    /// Domain version
    pub version: String,

    /// Chain id bound into signatures
    pub chain_id: u64,

    /// Engine address (hex); derived from the name when absent
    pub address: Option<String>,

    /// Number of ciphertext store shards
    pub shard_count: usize,
}

impl EngineSettings {
    /// Resolve the engine address
    pub fn address(&self) -> Result<Address, ConfigError> {
        match &self.address {
            Some(hex) => parse_address("engine.address", hex),
            None => Ok(Address::from_label(&self.name)),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            name: "Umbra".to_string(),
            version: "1".to_string(),
            chain_id: 1,
            address: None,
            shard_count: 16,
        }
    }
}

/// Access control settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclSettings {
    /// Maximum grants a single handle may carry
    pub max_entries_per_handle: usize,
}

impl Default for AclSettings {
    fn default() -> Self {
        Self {
            max_entries_per_handle: 1024,
        }
    }
}

/// Cost metering settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSettings {
    /// Cost units allowed per window; unlimited when absent
    pub budget_per_window: Option<u64>,
}

/// Threshold public decryption settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublicDecryptionSettings {
    /// The only address allowed to fulfil requests (hex)
    pub gateway: Option<String>,

    /// Pending requests older than this expire; requests never expire when absent
    pub request_ttl_secs: Option<u64>,
}

impl PublicDecryptionSettings {
    /// Resolve the gateway address, if configured
    pub fn gateway(&self) -> Result<Option<Address>, ConfigError> {
        self.gateway
            .as_deref()
            .map(|hex| parse_address("public_decryption.gateway", hex))
            .transpose()
    }
}

/// Input verification settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputSettings {
    /// Trusted coprocessor ed25519 public keys (hex)
    pub coprocessor_keys: Vec<String>,
}

impl InputSettings {
    /// Parse the trusted coprocessor keys
    pub fn coprocessor_keys(&self) -> Result<Vec<VerifyingKey>, ConfigError> {
        self.coprocessor_keys
            .iter()
            .map(|s| {
                let bytes: [u8; 32] = hex::decode(s.strip_prefix("0x").unwrap_or(s))
                    .ok()
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| ConfigError::Invalid(format!("Bad coprocessor key: {}", s)))?;
                VerifyingKey::from_bytes(&bytes)
                    .map_err(|_| ConfigError::Invalid(format!("Bad coprocessor key: {}", s)))
            })
            .collect()
    }
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Request database path; in memory when absent
    pub path: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("./umbra_data/requests.redb")),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level
    pub level: String,

    /// Output format (text, json)
    pub format: String,
}

impl LoggingSettings {
    /// Whether JSON output is selected
    pub fn json(&self) -> bool {
        self.format == "json"
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

fn parse_address(field: &str, hex: &str) -> Result<Address, ConfigError> {
    Address::from_hex(hex)
        .ok_or_else(|| ConfigError::Invalid(format!("{} is not a 32-byte hex address", field)))
}
