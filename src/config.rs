use std::{fs, path::Path};

use ethereum_types::U256;
use serde::{Deserialize, Serialize};

use crate::{
    ledger::{Ledger, TokenMetadata},
    types::{decimal, Account, Amount},
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Parameters the ledger is created with.
///
/// ```toml
/// name = "My Block"
/// symbol = "BLK"
/// decimals = 18
/// initial_supply = "1000000000000000000"
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GenesisConfig {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    #[serde(with = "decimal")]
    pub initial_supply: Amount,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            name: "My Block".into(),
            symbol: "BLK".into(),
            decimals: 18,
            initial_supply: U256::exp10(18),
        }
    }
}

impl GenesisConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Builds the ledger with the whole supply credited to `creator`.
    pub fn build(&self, creator: Account) -> Ledger {
        Ledger::new(
            TokenMetadata {
                name: self.name.clone(),
                symbol: self.symbol.clone(),
                decimals: self.decimals,
            },
            self.initial_supply,
            creator,
        )
    }
}
