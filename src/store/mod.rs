//! On-disk ledger state.
//!
//! A store directory holds one `state.json`: the ledger snapshot, the nonce
//! table used for replay protection, and the journal of committed events.
//! Every commit replaces the file atomically (write a uniquely named temp
//! file, then rename), and runs under an exclusive OS lock on `ledger.lock`,
//! so commits from separate handles or processes never interleave.

use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::PathBuf,
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{
    auth::{signature_tag, AuthError, SignedRequest},
    ledger::{Ledger, LedgerError, LedgerEvent, LedgerSnapshot},
    shared::EventSink,
    types::Account,
};

const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "ledger.lock";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed state file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("store already initialized at {0}")]
    AlreadyInitialized(PathBuf),
    #[error("no ledger initialized at {0}")]
    NotInitialized(PathBuf),
    #[error("stale nonce for {account}: expected {expected}, got {actual}")]
    StaleNonce {
        account: Account,
        expected: u64,
        actual: u64,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StoreMeta {
    /// Number of committed mutations.
    pub height: u64,
    /// Unix milliseconds of the last commit (or of `init`).
    pub timestamp: u64,
    /// Hex digest of the last applied request.
    pub last_request: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StateFile {
    meta: StoreMeta,
    #[serde(default)]
    nonces: BTreeMap<Account, u64>,
    ledger: LedgerSnapshot,
    #[serde(default)]
    events: Vec<LedgerEvent>,
}

/// Directory-backed ledger persistence.
pub struct LedgerStore {
    dir: PathBuf,
}

/// Exclusive hold on a store directory; released when the file is closed.
struct CommitLock {
    _file: fs::File,
}

impl LedgerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn is_initialized(&self) -> bool {
        self.state_path().exists()
    }

    /// Writes the genesis state. Refuses to overwrite an existing ledger.
    pub fn init(&self, ledger: &Ledger, timestamp: u64) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let _lock = self.lock()?;
        if self.is_initialized() {
            return Err(StoreError::AlreadyInitialized(self.dir.clone()));
        }
        let state = StateFile {
            meta: StoreMeta {
                height: 0,
                timestamp,
                last_request: None,
            },
            nonces: BTreeMap::new(),
            ledger: ledger.snapshot(),
            events: Vec::new(),
        };
        self.write_state(&state)?;
        tracing::info!(
            dir = %self.dir.display(),
            symbol = %ledger.metadata().symbol,
            supply = %ledger.total_supply(),
            "ledger initialized"
        );
        Ok(())
    }

    pub fn load(&self) -> Result<Ledger, StoreError> {
        let state = self.read_state()?;
        Ok(Ledger::from_snapshot(state.ledger)?)
    }

    pub fn meta(&self) -> Result<StoreMeta, StoreError> {
        Ok(self.read_state()?.meta)
    }

    /// Nonce the next request signed by `account` must carry.
    pub fn next_nonce(&self, account: &Account) -> Result<u64, StoreError> {
        let state = self.read_state()?;
        Ok(state.nonces.get(account).copied().unwrap_or_default())
    }

    pub fn events(&self) -> Result<Vec<LedgerEvent>, StoreError> {
        Ok(self.read_state()?.events)
    }

    /// Authenticates `request`, applies it and persists the result. The
    /// event reaches `sink` only after the new state is on disk; on any
    /// error the stored state is unchanged.
    pub fn submit(
        &self,
        request: &SignedRequest,
        timestamp: u64,
        sink: &mut impl EventSink,
    ) -> Result<LedgerEvent, StoreError> {
        let caller = request.verify()?;
        if !self.is_initialized() {
            return Err(StoreError::NotInitialized(self.dir.clone()));
        }
        let _lock = self.lock()?;
        let mut state = self.read_state()?;

        let expected = state.nonces.get(&caller).copied().unwrap_or_default();
        if request.nonce != expected {
            return Err(StoreError::StaleNonce {
                account: caller,
                expected,
                actual: request.nonce,
            });
        }

        let mut ledger = Ledger::from_snapshot(state.ledger)?;
        let event = ledger.apply(caller, &request.command).map_err(|err| {
            tracing::warn!(%caller, nonce = request.nonce, %err, "request rejected");
            err
        })?;

        let digest = hex::encode(request.digest());
        state.nonces.insert(caller, expected + 1);
        state.ledger = ledger.snapshot();
        state.events.push(event.clone());
        state.meta.height += 1;
        state.meta.timestamp = timestamp;
        state.meta.last_request = Some(digest);
        self.write_state(&state)?;

        tracing::debug!(
            %caller,
            nonce = request.nonce,
            sig = %signature_tag(request),
            height = state.meta.height,
            "request committed"
        );
        sink.publish(&event);
        Ok(event)
    }

    /// Blocks until this process holds the directory's commit lock.
    fn lock(&self) -> Result<CommitLock, StoreError> {
        let path = self.dir.join(LOCK_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        FileExt::lock_exclusive(&file).map_err(|source| StoreError::Io { path, source })?;
        Ok(CommitLock { _file: file })
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn read_state(&self) -> Result<StateFile, StoreError> {
        let path = self.state_path();
        if !path.exists() {
            return Err(StoreError::NotInitialized(self.dir.clone()));
        }
        let bytes = fs::read(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Json { path, source })
    }

    fn write_state(&self, state: &StateFile) -> Result<(), StoreError> {
        let target = self.state_path();
        let bytes = serde_json::to_vec_pretty(state).map_err(|source| StoreError::Json {
            path: target.clone(),
            source,
        })?;
        let io_err = |source: std::io::Error| StoreError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&target).map_err(|err| StoreError::Io {
            path: target.clone(),
            source: err.error,
        })?;
        Ok(())
    }
}
