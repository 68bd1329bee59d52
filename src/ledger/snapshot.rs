use std::collections::BTreeMap;

use ethereum_types::U256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Ledger, LedgerError, TokenMetadata};
use crate::types::{amount_be_bytes, decimal, Account, Amount};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BalanceEntry {
    pub account: Account,
    #[serde(with = "decimal")]
    pub amount: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllowanceEntry {
    pub owner: Account,
    pub spender: Account,
    #[serde(with = "decimal")]
    pub amount: Amount,
}

/// Full ledger state in key order, plus a commitment over it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub metadata: TokenMetadata,
    #[serde(with = "decimal")]
    pub total_supply: Amount,
    pub balances: Vec<BalanceEntry>,
    pub allowances: Vec<AllowanceEntry>,
    #[serde(with = "hex_root")]
    pub state_root: [u8; 32],
}

impl Ledger {
    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            metadata: self.metadata.clone(),
            total_supply: self.total_supply,
            balances: self
                .balances
                .iter()
                .map(|(account, amount)| BalanceEntry {
                    account: *account,
                    amount: *amount,
                })
                .collect(),
            allowances: self
                .allowances
                .iter()
                .map(|((owner, spender), amount)| AllowanceEntry {
                    owner: *owner,
                    spender: *spender,
                    amount: *amount,
                })
                .collect(),
            state_root: self.state_root(),
        }
    }

    /// Rebuilds a ledger, rejecting snapshots whose balances do not add up to
    /// the supply or whose root does not match the entries.
    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self, LedgerError> {
        let mut ledger = Ledger {
            metadata: snapshot.metadata,
            total_supply: snapshot.total_supply,
            balances: BTreeMap::new(),
            allowances: BTreeMap::new(),
        };
        let mut sum = U256::zero();
        for entry in snapshot.balances {
            sum = sum
                .checked_add(entry.amount)
                .ok_or(LedgerError::ArithmeticOverflow)?;
            let previous = ledger.balance_of(&entry.account);
            let merged = previous
                .checked_add(entry.amount)
                .ok_or(LedgerError::ArithmeticOverflow)?;
            ledger.set_balance(entry.account, merged);
        }
        if sum != ledger.total_supply {
            return Err(LedgerError::SupplyMismatch {
                expected: ledger.total_supply,
                actual: sum,
            });
        }
        for entry in snapshot.allowances {
            ledger.set_allowance(entry.owner, entry.spender, entry.amount);
        }
        if ledger.state_root() != snapshot.state_root {
            return Err(LedgerError::StateRootMismatch);
        }
        Ok(ledger)
    }

    /// SHA-256 commitment over supply, balances and allowances.
    ///
    /// Each entry becomes a tagged leaf, in key order after the supply leaf,
    /// and the leaves are folded pairwise up to a single root.
    pub fn state_root(&self) -> [u8; 32] {
        let supply = amount_be_bytes(&self.total_supply);
        let leaves = std::iter::once(leaf_hash(b"supply", &[&supply[..]]))
            .chain(self.balances.iter().map(|(account, amount)| {
                leaf_hash(b"acct", &[account.as_bytes(), &amount_be_bytes(amount)[..]])
            }))
            .chain(self.allowances.iter().map(|((owner, spender), amount)| {
                leaf_hash(
                    b"allow",
                    &[owner.as_bytes(), spender.as_bytes(), &amount_be_bytes(amount)[..]],
                )
            }))
            .collect();
        fold_root(leaves)
    }
}

fn leaf_hash(tag: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(tag);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Parent nodes commit to their height so a subtree cannot pass for a leaf.
fn node_hash(height: u32, left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    Sha256::new()
        .chain_update(b"node")
        .chain_update(height.to_be_bytes())
        .chain_update(left)
        .chain_update(right)
        .finalize()
        .into()
}

/// A trailing node without a sibling moves up a level unchanged.
fn fold_root(mut level: Vec<[u8; 32]>) -> [u8; 32] {
    let mut height = 0u32;
    while level.len() > 1 {
        height += 1;
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => node_hash(height, left, right),
                _ => pair[0],
            })
            .collect();
    }
    // `state_root` always supplies the supply leaf.
    level.first().copied().unwrap_or_default()
}

pub(crate) mod hex_root {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("state root must be 32 bytes"))
    }
}
