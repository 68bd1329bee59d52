use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{decimal, Account, Amount};

mod snapshot;

pub use snapshot::{AllowanceEntry, BalanceEntry, LedgerSnapshot};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("not sufficient balance: {account} holds {balance}, requested {requested}")]
    InsufficientBalance {
        account: Account,
        balance: Amount,
        requested: Amount,
    },
    #[error("allowance too low: {spender} may move {allowance} from {owner}, requested {requested}")]
    AllowanceTooLow {
        owner: Account,
        spender: Account,
        allowance: Amount,
        requested: Amount,
    },
    #[error("token balance too low: {account} holds {balance}, requested {requested}")]
    BalanceTooLow {
        account: Account,
        balance: Amount,
        requested: Amount,
    },
    #[error("arithmetic overflow")]
    ArithmeticOverflow,
    #[error("balances sum to {actual}, total supply is {expected}")]
    SupplyMismatch { expected: Amount, actual: Amount },
    #[error("state root mismatch")]
    StateRootMismatch,
}

/// Construction-time metadata. Stored, never interpreted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenMetadata {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferRecord {
    pub from: Account,
    pub to: Account,
    #[serde(with = "decimal")]
    pub amount: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalRecord {
    pub owner: Account,
    pub spender: Account,
    #[serde(with = "decimal")]
    pub amount: Amount,
}

/// Notification produced by every successful mutation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Transfer(TransferRecord),
    Approval(ApprovalRecord),
}

impl From<TransferRecord> for LedgerEvent {
    fn from(record: TransferRecord) -> Self {
        LedgerEvent::Transfer(record)
    }
}

impl From<ApprovalRecord> for LedgerEvent {
    fn from(record: ApprovalRecord) -> Self {
        LedgerEvent::Approval(record)
    }
}

/// A mutating operation, minus the caller it is bound to.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerCommand {
    Transfer {
        to: Account,
        #[serde(with = "decimal")]
        amount: Amount,
    },
    Approve {
        spender: Account,
        #[serde(with = "decimal")]
        amount: Amount,
    },
    TransferFrom {
        owner: Account,
        to: Account,
        #[serde(with = "decimal")]
        amount: Amount,
    },
}

/// Post-state of the two balances touched by a move, computed before any
/// write so a rejected move leaves the ledger untouched.
struct BalanceUpdate {
    debit: (Account, Amount),
    credit: Option<(Account, Amount)>,
}

/// Fixed-supply ledger.
///
/// Absent balance or allowance entries read as zero, and writing zero removes
/// the entry, so the maps only ever hold non-zero values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ledger {
    metadata: TokenMetadata,
    total_supply: Amount,
    balances: BTreeMap<Account, Amount>,
    allowances: BTreeMap<(Account, Account), Amount>,
}

impl Ledger {
    /// Creates a ledger with the entire `initial_supply` credited to `creator`.
    pub fn new(metadata: TokenMetadata, initial_supply: Amount, creator: Account) -> Self {
        let mut ledger = Self {
            metadata,
            total_supply: initial_supply,
            balances: BTreeMap::new(),
            allowances: BTreeMap::new(),
        };
        ledger.set_balance(creator, initial_supply);
        ledger
    }

    pub fn metadata(&self) -> &TokenMetadata {
        &self.metadata
    }

    pub fn total_supply(&self) -> Amount {
        self.total_supply
    }

    pub fn balance_of(&self, account: &Account) -> Amount {
        self.balances.get(account).copied().unwrap_or_default()
    }

    pub fn allowance(&self, owner: &Account, spender: &Account) -> Amount {
        self.allowances
            .get(&(*owner, *spender))
            .copied()
            .unwrap_or_default()
    }

    /// Number of accounts holding a non-zero balance.
    pub fn holders(&self) -> usize {
        self.balances.len()
    }

    /// Moves `amount` from `caller` to `to`.
    pub fn transfer(
        &mut self,
        caller: Account,
        to: Account,
        amount: Amount,
    ) -> Result<TransferRecord, LedgerError> {
        let update = self.plan_move(&caller, &to, amount, |balance| {
            LedgerError::InsufficientBalance {
                account: caller,
                balance,
                requested: amount,
            }
        })?;
        self.commit(update);
        tracing::debug!(from = %caller, %to, %amount, "transfer");
        Ok(TransferRecord {
            from: caller,
            to,
            amount,
        })
    }

    /// Replaces the allowance `spender` holds over `caller`'s balance.
    pub fn approve(&mut self, caller: Account, spender: Account, amount: Amount) -> ApprovalRecord {
        self.set_allowance(caller, spender, amount);
        tracing::debug!(owner = %caller, %spender, %amount, "approve");
        ApprovalRecord {
            owner: caller,
            spender,
            amount,
        }
    }

    /// Moves `amount` from `owner` to `to` on behalf of `spender`, consuming
    /// the allowance. The allowance is checked before the balance.
    pub fn transfer_from(
        &mut self,
        spender: Account,
        owner: Account,
        to: Account,
        amount: Amount,
    ) -> Result<TransferRecord, LedgerError> {
        let allowance = self.allowance(&owner, &spender);
        let remaining = allowance
            .checked_sub(amount)
            .ok_or(LedgerError::AllowanceTooLow {
                owner,
                spender,
                allowance,
                requested: amount,
            })?;
        let update = self.plan_move(&owner, &to, amount, |balance| LedgerError::BalanceTooLow {
            account: owner,
            balance,
            requested: amount,
        })?;
        self.set_allowance(owner, spender, remaining);
        self.commit(update);
        tracing::debug!(%spender, from = %owner, %to, %amount, "transfer_from");
        Ok(TransferRecord {
            from: owner,
            to,
            amount,
        })
    }

    /// Runs `command` as `caller`.
    pub fn apply(
        &mut self,
        caller: Account,
        command: &LedgerCommand,
    ) -> Result<LedgerEvent, LedgerError> {
        match command {
            LedgerCommand::Transfer { to, amount } => {
                self.transfer(caller, *to, *amount).map(Into::into)
            }
            LedgerCommand::Approve { spender, amount } => {
                Ok(self.approve(caller, *spender, *amount).into())
            }
            LedgerCommand::TransferFrom { owner, to, amount } => self
                .transfer_from(caller, *owner, *to, *amount)
                .map(Into::into),
        }
    }

    fn plan_move(
        &self,
        from: &Account,
        to: &Account,
        amount: Amount,
        shortfall: impl FnOnce(Amount) -> LedgerError,
    ) -> Result<BalanceUpdate, LedgerError> {
        let from_balance = self.balance_of(from);
        let debited = match from_balance.checked_sub(amount) {
            Some(value) => value,
            None => return Err(shortfall(from_balance)),
        };
        if from == to {
            return Ok(BalanceUpdate {
                debit: (*from, from_balance),
                credit: None,
            });
        }
        let credited = self
            .balance_of(to)
            .checked_add(amount)
            .ok_or(LedgerError::ArithmeticOverflow)?;
        Ok(BalanceUpdate {
            debit: (*from, debited),
            credit: Some((*to, credited)),
        })
    }

    fn commit(&mut self, update: BalanceUpdate) {
        let (account, balance) = update.debit;
        self.set_balance(account, balance);
        if let Some((account, balance)) = update.credit {
            self.set_balance(account, balance);
        }
    }

    fn set_balance(&mut self, account: Account, amount: Amount) {
        if amount.is_zero() {
            self.balances.remove(&account);
        } else {
            self.balances.insert(account, amount);
        }
    }

    fn set_allowance(&mut self, owner: Account, spender: Account, amount: Amount) {
        if amount.is_zero() {
            self.allowances.remove(&(owner, spender));
        } else {
            self.allowances.insert((owner, spender), amount);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ethereum_types::U256;

    fn account(n: u8) -> Account {
        Account::from_bytes([n; 20])
    }

    fn one_token() -> Amount {
        U256::exp10(18)
    }

    fn block_ledger() -> Ledger {
        Ledger::new(
            TokenMetadata {
                name: "My Block".into(),
                symbol: "BLK".into(),
                decimals: 18,
            },
            one_token(),
            account(0xa),
        )
    }

    fn sum_of_balances(ledger: &Ledger) -> Amount {
        ledger
            .balances
            .values()
            .fold(U256::zero(), |acc, v| acc + *v)
    }

    #[test]
    fn creator_holds_entire_supply() {
        let ledger = block_ledger();
        assert_eq!(ledger.total_supply(), one_token());
        assert_eq!(ledger.balance_of(&account(0xa)), one_token());
        assert_eq!(ledger.balance_of(&account(0xb)), U256::zero());
        assert_eq!(ledger.metadata().symbol, "BLK");
    }

    #[test]
    fn transfer_moves_balance_and_reports_record() {
        let mut ledger = block_ledger();
        let record = ledger
            .transfer(account(0xa), account(0xb), U256::from(100))
            .unwrap();
        assert_eq!(
            record,
            TransferRecord {
                from: account(0xa),
                to: account(0xb),
                amount: U256::from(100),
            }
        );
        assert_eq!(ledger.balance_of(&account(0xa)), one_token() - 100);
        assert_eq!(ledger.balance_of(&account(0xb)), U256::from(100));
        assert_eq!(sum_of_balances(&ledger), ledger.total_supply());
    }

    #[test]
    fn transfer_beyond_balance_is_rejected_without_mutation() {
        let mut ledger = block_ledger();
        ledger
            .transfer(account(0xa), account(0xb), U256::from(100))
            .unwrap();
        let before = ledger.clone();
        let requested = one_token() * 10;
        let err = ledger
            .transfer(account(0xa), account(0xb), requested)
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientBalance {
                account: account(0xa),
                balance: one_token() - 100,
                requested,
            }
        );
        assert_eq!(ledger, before);
        assert!(err.to_string().starts_with("not sufficient balance"));
    }

    #[test]
    fn transfer_to_self_and_zero_amount_are_no_ops() {
        let mut ledger = block_ledger();
        let before = ledger.clone();
        ledger
            .transfer(account(0xa), account(0xa), U256::from(5))
            .unwrap();
        ledger
            .transfer(account(0xa), account(0xb), U256::zero())
            .unwrap();
        // an empty account may send nothing
        ledger
            .transfer(account(0xc), account(0xb), U256::zero())
            .unwrap();
        assert_eq!(ledger, before);
        assert_eq!(ledger.holders(), 1);
    }

    #[test]
    fn transfer_to_self_still_requires_balance() {
        let mut ledger = block_ledger();
        let err = ledger
            .transfer(account(0xc), account(0xc), U256::one())
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
    }

    #[test]
    fn draining_an_account_removes_its_entry() {
        let mut ledger = block_ledger();
        ledger
            .transfer(account(0xa), account(0xb), one_token())
            .unwrap();
        assert_eq!(ledger.balance_of(&account(0xa)), U256::zero());
        assert_eq!(ledger.holders(), 1);
    }

    #[test]
    fn approve_replaces_previous_allowance() {
        let mut ledger = block_ledger();
        let record = ledger.approve(account(0xa), account(0xb), U256::from(1000));
        assert_eq!(
            record,
            ApprovalRecord {
                owner: account(0xa),
                spender: account(0xb),
                amount: U256::from(1000),
            }
        );
        assert_eq!(
            ledger.allowance(&account(0xa), &account(0xb)),
            U256::from(1000)
        );

        ledger.approve(account(0xa), account(0xb), U256::from(5));
        ledger.approve(account(0xa), account(0xb), U256::from(2));
        assert_eq!(ledger.allowance(&account(0xa), &account(0xb)), U256::from(2));
        // direction matters
        assert_eq!(ledger.allowance(&account(0xb), &account(0xa)), U256::zero());

        ledger.approve(account(0xa), account(0xb), U256::zero());
        assert_eq!(ledger.allowance(&account(0xa), &account(0xb)), U256::zero());
        assert!(ledger.allowances.is_empty());
    }

    #[test]
    fn transfer_from_consumes_allowance_exactly() {
        let mut ledger = block_ledger();
        ledger.approve(account(0xa), account(0xb), U256::from(1000));
        let record = ledger
            .transfer_from(account(0xb), account(0xa), account(0xc), U256::from(400))
            .unwrap();
        assert_eq!(record.from, account(0xa));
        assert_eq!(record.to, account(0xc));
        assert_eq!(ledger.allowance(&account(0xa), &account(0xb)), U256::from(600));
        assert_eq!(ledger.balance_of(&account(0xc)), U256::from(400));
        assert_eq!(ledger.balance_of(&account(0xb)), U256::zero());
        assert_eq!(sum_of_balances(&ledger), ledger.total_supply());

        ledger
            .transfer_from(account(0xb), account(0xa), account(0xc), U256::from(600))
            .unwrap();
        assert_eq!(ledger.allowance(&account(0xa), &account(0xb)), U256::zero());
        let err = ledger
            .transfer_from(account(0xb), account(0xa), account(0xc), U256::one())
            .unwrap_err();
        assert!(matches!(err, LedgerError::AllowanceTooLow { .. }));
    }

    #[test]
    fn transfer_from_rejects_low_allowance_first() {
        let mut ledger = block_ledger();
        ledger.approve(account(0xa), account(0xb), U256::from(1000));
        let before = ledger.clone();
        let err = ledger
            .transfer_from(account(0xb), account(0xa), account(0xc), U256::from(100_000))
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::AllowanceTooLow {
                owner: account(0xa),
                spender: account(0xb),
                allowance: U256::from(1000),
                requested: U256::from(100_000),
            }
        );
        assert_eq!(ledger, before);

        // both checks fail: the allowance failure wins
        let err = ledger
            .transfer_from(account(0xe), account(0xd), account(0xe), U256::one())
            .unwrap_err();
        assert!(matches!(err, LedgerError::AllowanceTooLow { .. }));
    }

    #[test]
    fn transfer_from_rejects_low_owner_balance() {
        let mut ledger = block_ledger();
        ledger.approve(account(0xd), account(0xe), U256::from(100));
        let before = ledger.clone();
        let err = ledger
            .transfer_from(account(0xe), account(0xd), account(0xe), U256::from(100))
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::BalanceTooLow {
                account: account(0xd),
                balance: U256::zero(),
                requested: U256::from(100),
            }
        );
        assert!(err.to_string().starts_with("token balance too low"));
        assert_eq!(ledger.allowance(&account(0xd), &account(0xe)), U256::from(100));
        assert_eq!(ledger, before);
    }

    #[test]
    fn transfer_from_owner_to_self_only_consumes_allowance() {
        let mut ledger = block_ledger();
        ledger.approve(account(0xa), account(0xb), U256::from(10));
        ledger
            .transfer_from(account(0xb), account(0xa), account(0xa), U256::from(4))
            .unwrap();
        assert_eq!(ledger.balance_of(&account(0xa)), one_token());
        assert_eq!(ledger.allowance(&account(0xa), &account(0xb)), U256::from(6));
    }

    #[test]
    fn credit_overflow_is_rejected_without_mutation() {
        let mut ledger = block_ledger();
        // A state that breaks the supply bound, only reachable by hand.
        ledger.balances.insert(account(0xb), U256::MAX);
        let before = ledger.clone();
        let err = ledger
            .transfer(account(0xa), account(0xb), U256::one())
            .unwrap_err();
        assert_eq!(err, LedgerError::ArithmeticOverflow);
        assert_eq!(ledger, before);

        ledger.approve(account(0xa), account(0xc), U256::one());
        let before = ledger.clone();
        let err = ledger
            .transfer_from(account(0xc), account(0xa), account(0xb), U256::one())
            .unwrap_err();
        assert_eq!(err, LedgerError::ArithmeticOverflow);
        assert_eq!(ledger, before);
    }

    #[test]
    fn apply_dispatches_commands() {
        let mut ledger = block_ledger();
        let event = ledger
            .apply(
                account(0xa),
                &LedgerCommand::Approve {
                    spender: account(0xb),
                    amount: U256::from(50),
                },
            )
            .unwrap();
        assert!(matches!(event, LedgerEvent::Approval(_)));

        let event = ledger
            .apply(
                account(0xb),
                &LedgerCommand::TransferFrom {
                    owner: account(0xa),
                    to: account(0xc),
                    amount: U256::from(20),
                },
            )
            .unwrap();
        assert_eq!(
            event,
            LedgerEvent::Transfer(TransferRecord {
                from: account(0xa),
                to: account(0xc),
                amount: U256::from(20),
            })
        );

        let event = ledger
            .apply(
                account(0xc),
                &LedgerCommand::Transfer {
                    to: account(0xd),
                    amount: U256::from(20),
                },
            )
            .unwrap();
        assert!(matches!(event, LedgerEvent::Transfer(_)));
        assert_eq!(ledger.balance_of(&account(0xd)), U256::from(20));
    }

    #[test]
    fn reads_are_stable_without_mutation() {
        let mut ledger = block_ledger();
        ledger.approve(account(0xa), account(0xb), U256::from(7));
        let reads = |l: &Ledger| {
            (
                l.total_supply(),
                l.balance_of(&account(0xa)),
                l.allowance(&account(0xa), &account(0xb)),
            )
        };
        assert_eq!(reads(&ledger), reads(&ledger));
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = LedgerEvent::Transfer(TransferRecord {
            from: account(1),
            to: account(2),
            amount: U256::from(100),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "transfer");
        assert_eq!(json["amount"], "100");
        let back: LedgerEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
