use std::{fmt, str::FromStr};

use ethereum_types::{H160, U256};
use serde::{Deserialize, Serialize};

/// Quantity of the asset in base units.
pub type Amount = U256;

/// Length of an account identifier in bytes.
pub const ACCOUNT_LEN: usize = 20;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid account hex: {0}")]
    AccountHex(String),
    #[error("account must be 20 bytes, got {0}")]
    AccountLength(usize),
    #[error("invalid amount {0:?}: expected a non-negative base-10 integer below 2^256")]
    Amount(String),
}

/// Opaque holder identifier. Displays as `0x` followed by 40 hex digits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Account(H160);

impl Account {
    pub fn from_bytes(bytes: [u8; ACCOUNT_LEN]) -> Self {
        Self(H160(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() != ACCOUNT_LEN {
            return Err(ParseError::AccountLength(bytes.len()));
        }
        Ok(Self(H160::from_slice(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0.as_bytes()))
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Account {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| ParseError::AccountHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl TryFrom<String> for Account {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Account> for String {
    fn from(value: Account) -> Self {
        value.to_string()
    }
}

/// Parses a base-10 amount. Rejects signs, whitespace inside the number and
/// anything that does not fit in 256 bits.
pub fn parse_amount(s: &str) -> Result<Amount, ParseError> {
    let trimmed = s.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::Amount(s.to_string()));
    }
    U256::from_dec_str(trimmed).map_err(|_| ParseError::Amount(s.to_string()))
}

/// Big-endian 32-byte encoding, used for hashing.
pub fn amount_be_bytes(amount: &Amount) -> [u8; 32] {
    let mut buf = [0u8; 32];
    amount.to_big_endian(&mut buf);
    buf
}

/// Serde adapter writing amounts as decimal strings.
pub mod decimal {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use super::{parse_amount, Amount};

    pub fn serialize<S>(value: &Amount, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Amount, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        parse_amount(&encoded).map_err(D::Error::custom)
    }
}
