//! Thread-safe ledger handle.
//!
//! All reads and writes go through one `parking_lot::Mutex` per ledger, so a
//! mutation's checks and effects never interleave with another caller's.
//! Successful mutations are handed to an [`EventSink`] while the lock is still
//! held, which keeps sink order identical to commit order.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    ledger::{Ledger, LedgerCommand, LedgerError, LedgerEvent, LedgerSnapshot},
    types::{Account, Amount},
};

/// Receives notifications for committed mutations.
pub trait EventSink: Send {
    fn publish(&mut self, event: &LedgerEvent);
}

impl EventSink for Vec<LedgerEvent> {
    fn publish(&mut self, event: &LedgerEvent) {
        self.push(event.clone());
    }
}

/// Emits each event as a structured log record.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&mut self, event: &LedgerEvent) {
        match event {
            LedgerEvent::Transfer(record) => tracing::info!(
                from = %record.from,
                to = %record.to,
                amount = %record.amount,
                "Transfer"
            ),
            LedgerEvent::Approval(record) => tracing::info!(
                owner = %record.owner,
                spender = %record.spender,
                amount = %record.amount,
                "Approval"
            ),
        }
    }
}

struct Inner<S> {
    ledger: Ledger,
    sink: S,
}

pub struct SharedLedger<S> {
    inner: Arc<Mutex<Inner<S>>>,
}

impl<S> Clone for SharedLedger<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: EventSink> SharedLedger<S> {
    pub fn new(ledger: Ledger, sink: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { ledger, sink })),
        }
    }

    pub fn total_supply(&self) -> Amount {
        self.inner.lock().ledger.total_supply()
    }

    pub fn balance_of(&self, account: &Account) -> Amount {
        self.inner.lock().ledger.balance_of(account)
    }

    pub fn allowance(&self, owner: &Account, spender: &Account) -> Amount {
        self.inner.lock().ledger.allowance(owner, spender)
    }

    pub fn transfer(
        &self,
        caller: Account,
        to: Account,
        amount: Amount,
    ) -> Result<LedgerEvent, LedgerError> {
        self.execute(caller, &LedgerCommand::Transfer { to, amount })
    }

    pub fn approve(&self, caller: Account, spender: Account, amount: Amount) -> LedgerEvent {
        let mut guard = self.inner.lock();
        let event = LedgerEvent::from(guard.ledger.approve(caller, spender, amount));
        guard.sink.publish(&event);
        event
    }

    pub fn transfer_from(
        &self,
        spender: Account,
        owner: Account,
        to: Account,
        amount: Amount,
    ) -> Result<LedgerEvent, LedgerError> {
        self.execute(spender, &LedgerCommand::TransferFrom { owner, to, amount })
    }

    /// Applies `command` as `caller` in one critical section.
    pub fn execute(
        &self,
        caller: Account,
        command: &LedgerCommand,
    ) -> Result<LedgerEvent, LedgerError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let event = inner.ledger.apply(caller, command)?;
        inner.sink.publish(&event);
        Ok(event)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.inner.lock().ledger.snapshot()
    }

    /// Runs `f` against the sink, e.g. to drain an in-memory journal.
    pub fn with_sink<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.inner.lock().sink)
    }
}
