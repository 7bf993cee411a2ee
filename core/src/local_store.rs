/// Local key-value persistence: the only writer of durable bytes.
///
/// Values are JSON wrapped in a version-tagged envelope so a later reader
/// can detect and migrate old records. Multi-key read-modify-write goes
/// through `LocalStore::transaction`, which locks the listed keys (sorted,
/// so overlapping transactions cannot deadlock) and commits all writes as
/// one batch.
use crate::error::{ChatError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

/// Current on-disk schema version for every record
pub const SCHEMA_VERSION: u16 = 1;

/// Raw byte storage behind a `LocalStore`
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Apply all writes atomically
    fn apply_batch(&self, writes: Vec<(String, Vec<u8>)>) -> Result<()>;

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

// ─── sled backend ────────────────────────────────────────────────────────────

/// Durable backend on a sled database
#[derive(Clone)]
pub struct SledBackend {
    db: sled::Db,
}

impl SledBackend {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("chat.db");
        debug!("Opening chat store at {:?}", db_path);

        let db = sled::open(&db_path)?;
        info!("Chat store initialized at {:?}", db_path);
        Ok(Self { db })
    }
}

impl KvBackend for SledBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.db.insert(key.as_bytes(), value)?;
        self.db.flush()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.db.remove(key.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    fn apply_batch(&self, writes: Vec<(String, Vec<u8>)>) -> Result<()> {
        let mut batch = sled::Batch::default();
        for (key, value) in writes {
            batch.insert(key.as_bytes(), value);
        }
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry?;
            match String::from_utf8(key.to_vec()) {
                Ok(k) => out.push((k, value.to_vec())),
                Err(_) => warn!("Skipping non-UTF-8 key under prefix {}", prefix),
            }
        }
        Ok(out)
    }
}

// ─── in-memory backend ───────────────────────────────────────────────────────

/// Volatile backend. Availability can be switched off to simulate an outage.
#[derive(Default)]
pub struct MemoryBackend {
    map: RwLock<BTreeMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ChatError::StorageUnavailable(
                "memory backend switched off".to_string(),
            ));
        }
        Ok(())
    }

    fn poisoned() -> ChatError {
        ChatError::StorageUnavailable("memory backend lock poisoned".to_string())
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        let map = self.map.read().map_err(|_| Self::poisoned())?;
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check()?;
        let mut map = self.map.write().map_err(|_| Self::poisoned())?;
        map.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.check()?;
        let mut map = self.map.write().map_err(|_| Self::poisoned())?;
        map.remove(key);
        Ok(())
    }

    fn apply_batch(&self, writes: Vec<(String, Vec<u8>)>) -> Result<()> {
        self.check()?;
        let mut map = self.map.write().map_err(|_| Self::poisoned())?;
        map.extend(writes);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.check()?;
        let map = self.map.read().map_err(|_| Self::poisoned())?;
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

// ─── record envelope ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    v: u16,
    data: &'a T,
}

#[derive(Deserialize)]
struct RawEnvelope {
    v: u16,
    data: serde_json::Value,
}

/// Serialize a record into its versioned envelope
pub fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    let env = EnvelopeRef {
        v: SCHEMA_VERSION,
        data: record,
    };
    Ok(serde_json::to_vec(&env)?)
}

/// Parse and validate a versioned record. Anything unparseable is `Corrupt`.
pub fn decode_record<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
    let raw: RawEnvelope = serde_json::from_slice(bytes).map_err(|e| ChatError::Corrupt {
        key: key.to_string(),
        reason: format!("invalid envelope: {}", e),
    })?;
    match raw.v {
        SCHEMA_VERSION => serde_json::from_value(raw.data).map_err(|e| ChatError::Corrupt {
            key: key.to_string(),
            reason: format!("invalid v{} record: {}", raw.v, e),
        }),
        other => Err(ChatError::Corrupt {
            key: key.to_string(),
            reason: format!("unsupported schema version {}", other),
        }),
    }
}

// ─── key locks ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held key locks. Dropping it unlocks and forgets keys nobody else waits on.
struct ScopeGuard<'a> {
    table: &'a KeyLocks,
    keys: &'a BTreeSet<String>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.guards.clear();
        let Ok(mut locks) = self.table.locks.lock() else {
            return;
        };
        for key in self.keys {
            // Waiters clone the entry under this table lock, so a count of 1 means idle
            if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(key);
            }
        }
    }
}

impl KeyLocks {
    /// Lock every key in sorted order. Guards release on drop.
    async fn acquire<'a>(&'a self, keys: &'a BTreeSet<String>) -> Result<ScopeGuard<'a>> {
        let handles: Vec<Arc<tokio::sync::Mutex<()>>> = {
            let mut locks = self.locks.lock().map_err(|_| {
                ChatError::StorageUnavailable("key lock table poisoned".to_string())
            })?;
            keys.iter()
                .map(|k| locks.entry(k.clone()).or_default().clone())
                .collect()
        };

        let mut scope = ScopeGuard {
            table: self,
            keys,
            guards: Vec::with_capacity(handles.len()),
        };
        for handle in handles {
            scope.guards.push(handle.lock_owned().await);
        }
        Ok(scope)
    }

    fn tracked(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}

// ─── store ───────────────────────────────────────────────────────────────────

/// Handle to the local store. Cheap to clone.
#[derive(Clone)]
pub struct LocalStore {
    backend: Arc<dyn KvBackend>,
    locks: Arc<KeyLocks>,
}

impl LocalStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            locks: Arc::new(KeyLocks::default()),
        }
    }

    /// Durable store under `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        Ok(Self::new(Arc::new(SledBackend::open(data_dir)?)))
    }

    /// Volatile store, mostly for tests and demos
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.backend.get(key)
    }

    pub fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.backend.set(key, value)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.backend.remove(key)
    }

    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.backend.scan_prefix(prefix)
    }

    pub fn get_record<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(key)? {
            Some(bytes) => decode_record(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn set_record<T: Serialize>(&self, key: &str, record: &T) -> Result<()> {
        self.backend.set(key, encode_record(record)?)
    }

    /// Keys currently holding a lock entry
    pub fn locked_keys(&self) -> usize {
        self.locks.tracked()
    }

    /// Run `f` with exclusive access to `keys`.
    ///
    /// Writes staged through the `Transaction` are committed as one atomic
    /// batch if `f` returns `Ok`, and discarded otherwise. Key locks are
    /// released on every exit path.
    pub async fn transaction<T, F>(&self, keys: &[String], f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let scope: BTreeSet<String> = keys.iter().cloned().collect();
        let _guards = self.locks.acquire(&scope).await?;

        let mut txn = Transaction {
            backend: self.backend.as_ref(),
            scope: &scope,
            writes: BTreeMap::new(),
        };
        let out = f(&mut txn)?;

        let writes: Vec<(String, Vec<u8>)> = txn.writes.into_iter().collect();
        if !writes.is_empty() {
            debug!("Committing {} key(s) in transaction", writes.len());
            self.backend.apply_batch(writes)?;
        }
        Ok(out)
    }
}

/// Staged view inside `LocalStore::transaction`
pub struct Transaction<'a> {
    backend: &'a dyn KvBackend,
    scope: &'a BTreeSet<String>,
    writes: BTreeMap<String, Vec<u8>>,
}

impl Transaction<'_> {
    /// Read a key, seeing this transaction's own staged writes
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(staged) = self.writes.get(key) {
            return Ok(Some(staged.clone()));
        }
        self.backend.get(key)
    }

    /// Stage a write. Only keys locked by this transaction may be written.
    pub fn set(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        if !self.scope.contains(key) {
            return Err(ChatError::InvalidTransition(format!(
                "transaction does not hold key {}",
                key
            )));
        }
        self.writes.insert(key.to_string(), value);
        Ok(())
    }

    pub fn get_record<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => decode_record(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn set_record<T: Serialize>(&mut self, key: &str, record: &T) -> Result<()> {
        let bytes = encode_record(record)?;
        self.set(key, bytes)
    }
}
