//! Fixed-supply fungible token ledger.
//!
//! * [`ledger`] — balances, allowances and the `transfer` / `approve` /
//!   `transfer_from` state transitions, all-or-nothing.
//! * [`shared`] — a lock-guarded handle for concurrent callers, with an
//!   injectable sink for `Transfer` / `Approval` notifications.
//! * [`auth`] — ed25519 caller identity and signed requests.
//! * [`store`] — directory-backed persistence with replay protection.
//! * [`config`] — genesis parameters.

pub mod auth;
pub mod config;
pub mod ledger;
pub mod shared;
pub mod store;
pub mod types;

pub use ledger::{Ledger, LedgerCommand, LedgerError, LedgerEvent, TokenMetadata};
pub use shared::{EventSink, SharedLedger, TracingSink};
pub use types::{Account, Amount};
