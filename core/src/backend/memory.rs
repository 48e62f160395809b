//! In-process backend.
//!
//! Records are kept in one mutex-guarded map. Expiration is honoured lazily
//! on access. Aggregation modules run their native procedure while the lock
//! is held, so only the scalar result leaves the store.
//!
//! Test hooks: [`MemoryBackend::set_offline`], [`MemoryBackend::fail_writes_after`],
//! [`MemoryBackend::remove`] and the [`MemoryBackend::round_trips`] counter.

use super::{
    AggregationModule, Backend, BackendError, Bin, Key, NativeProcedure, Record, Value, WritePolicy,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct StoredRecord {
    bins: BTreeMap<String, Value>,
    expires_at: Option<Instant>,
}

impl StoredRecord {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }

    fn apply_policy(&mut self, policy: &WritePolicy, now: Instant) {
        self.expires_at = policy
            .expiration
            .as_secs()
            .map(|secs| now + Duration::from_secs(u64::from(secs)));
    }
}

pub struct MemoryBackend {
    records: Mutex<HashMap<Key, StoredRecord>>,
    modules: Mutex<HashMap<String, NativeProcedure>>,
    supports_modules: bool,
    offline: AtomicBool,
    writes_remaining: AtomicUsize,
    round_trips: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            modules: Mutex::new(HashMap::new()),
            supports_modules: true,
            offline: AtomicBool::new(false),
            writes_remaining: AtomicUsize::new(usize::MAX),
            round_trips: AtomicU64::new(0),
        }
    }

    /// A backend with no extension mechanism: registering or executing an
    /// aggregation module fails with [`BackendError::Unsupported`].
    pub fn without_modules() -> Self {
        Self {
            supports_modules: false,
            ..Self::new()
        }
    }

    /// Every call fails with a connection error while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Allow `writes` more successful writes (put/add), then fail the rest.
    pub fn fail_writes_after(&self, writes: usize) {
        self.writes_remaining.store(writes, Ordering::SeqCst);
    }

    /// Delete a record. Returns whether it existed.
    pub fn remove(&self, key: &Key) -> bool {
        self.lock_records()
            .map(|mut records| records.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Remaining lifetime of a record, `None` if absent or never expiring.
    pub fn time_to_live(&self, key: &Key) -> Option<Duration> {
        let now = Instant::now();
        let records = self.lock_records().ok()?;
        let record = records.get(key).filter(|r| r.is_live(now))?;
        record.expires_at.map(|at| at.saturating_duration_since(now))
    }

    /// Number of live records across all namespaces and sets.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock_records()
            .map(|records| records.values().filter(|r| r.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backend calls served so far, failed ones included.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::SeqCst)
    }

    fn begin_call(&self) -> Result<(), BackendError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Connection("memory backend is offline".to_string()));
        }
        Ok(())
    }

    fn begin_write(&self) -> Result<(), BackendError> {
        self.begin_call()?;
        self.writes_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|_| ())
            .map_err(|_| BackendError::Connection("write budget exhausted".to_string()))
    }

    fn lock_records(&self) -> Result<MutexGuard<'_, HashMap<Key, StoredRecord>>, BackendError> {
        self.records
            .lock()
            .map_err(|_| BackendError::Command("record store lock poisoned".to_string()))
    }

    fn lock_modules(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<String, NativeProcedure>>, BackendError> {
        self.modules
            .lock()
            .map_err(|_| BackendError::Command("module registry lock poisoned".to_string()))
    }

    fn live_record(
        records: &mut HashMap<Key, StoredRecord>,
        key: &Key,
        now: Instant,
    ) -> Option<Record> {
        let is_live = records.get(key).map(|stored| stored.is_live(now))?;
        if !is_live {
            records.remove(key);
            return None;
        }
        records
            .get(key)
            .map(|stored| Record::from_bins(stored.bins.clone()))
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &Key) -> Result<Option<Record>, BackendError> {
        self.begin_call()?;
        let mut records = self.lock_records()?;
        Ok(Self::live_record(&mut records, key, Instant::now()))
    }

    fn put(&self, key: &Key, bins: &[Bin], policy: &WritePolicy) -> Result<(), BackendError> {
        self.begin_write()?;
        let now = Instant::now();
        let mut records = self.lock_records()?;
        let stored = records.entry(key.clone()).or_insert_with(|| StoredRecord {
            bins: BTreeMap::new(),
            expires_at: None,
        });
        if !stored.is_live(now) {
            stored.bins.clear();
        }
        for bin in bins {
            stored.bins.insert(bin.name.clone(), bin.value.clone());
        }
        stored.apply_policy(policy, now);
        Ok(())
    }

    fn batch_get(&self, keys: &[Key]) -> Result<Vec<Option<Record>>, BackendError> {
        self.begin_call()?;
        let now = Instant::now();
        let mut records = self.lock_records()?;
        Ok(keys
            .iter()
            .map(|key| Self::live_record(&mut records, key, now))
            .collect())
    }

    fn add(
        &self,
        key: &Key,
        bin: &str,
        delta: i64,
        policy: &WritePolicy,
    ) -> Result<i64, BackendError> {
        self.begin_write()?;
        let now = Instant::now();
        let mut records = self.lock_records()?;
        let stored = records.entry(key.clone()).or_insert_with(|| StoredRecord {
            bins: BTreeMap::new(),
            expires_at: None,
        });
        if !stored.is_live(now) {
            stored.bins.clear();
        }
        let current = match stored.bins.get(bin) {
            None => 0,
            Some(Value::Int(v)) => *v,
            Some(other) => {
                return Err(BackendError::TypeMismatch {
                    bin: bin.to_string(),
                    expected: "int",
                    found: other.type_name(),
                })
            }
        };
        let updated = current + delta;
        stored.bins.insert(bin.to_string(), Value::Int(updated));
        stored.apply_policy(policy, now);
        Ok(updated)
    }

    fn registered_modules(&self) -> Result<Vec<String>, BackendError> {
        self.begin_call()?;
        if !self.supports_modules {
            return Err(BackendError::Unsupported);
        }
        let mut names: Vec<String> = self.lock_modules()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn register_module(&self, module: &AggregationModule) -> Result<(), BackendError> {
        self.begin_call()?;
        if !self.supports_modules {
            return Err(BackendError::Unsupported);
        }
        self.lock_modules()?
            .insert(module.name.to_string(), module.procedure);
        Ok(())
    }

    fn execute(&self, key: &Key, module: &str, args: &[Value]) -> Result<Value, BackendError> {
        self.begin_call()?;
        if !self.supports_modules {
            return Err(BackendError::Unsupported);
        }
        let procedure = self
            .lock_modules()?
            .get(module)
            .copied()
            .ok_or_else(|| BackendError::ModuleNotRegistered(module.to_string()))?;

        let now = Instant::now();
        let records = self.lock_records()?;
        let record = records
            .get(key)
            .filter(|stored| stored.is_live(now))
            .map(|stored| Record::from_bins(stored.bins.clone()));
        procedure(record.as_ref(), args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Expiration;

    fn key(user: &str) -> Key {
        Key::new("test", "events-records", user)
    }

    #[test]
    fn test_put_merges_bins() {
        let backend = MemoryBackend::new();
        let policy = WritePolicy::default();
        backend
            .put(&key("user1"), &[Bin::new("name", "user1")], &policy)
            .unwrap();
        backend
            .put(&key("user1"), &[Bin::new("ts", 42)], &policy)
            .unwrap();

        let record = backend.get(&key("user1")).unwrap().unwrap();
        assert_eq!(record.str("name").unwrap(), Some("user1"));
        assert_eq!(record.int("ts").unwrap(), Some(42));
    }

    #[test]
    fn test_get_missing_record() {
        let backend = MemoryBackend::new();
        assert!(backend.get(&key("nobody")).unwrap().is_none());
    }

    #[test]
    fn test_add_creates_and_increments() {
        let backend = MemoryBackend::new();
        let policy = WritePolicy::default();
        assert_eq!(backend.add(&key("u"), "event-count", 1, &policy).unwrap(), 1);
        assert_eq!(backend.add(&key("u"), "event-count", 1, &policy).unwrap(), 2);
        assert_eq!(backend.add(&key("u"), "event-count", 5, &policy).unwrap(), 7);
    }

    #[test]
    fn test_add_rejects_non_integer_bin() {
        let backend = MemoryBackend::new();
        let policy = WritePolicy::default();
        backend
            .put(&key("u"), &[Bin::new("event-count", "three")], &policy)
            .unwrap();
        assert!(matches!(
            backend.add(&key("u"), "event-count", 1, &policy),
            Err(BackendError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_batch_get_is_aligned_with_keys() {
        let backend = MemoryBackend::new();
        let policy = WritePolicy::default();
        backend.put(&key("a"), &[Bin::new("v", 1)], &policy).unwrap();
        backend.put(&key("c"), &[Bin::new("v", 3)], &policy).unwrap();

        let results = backend
            .batch_get(&[key("a"), key("b"), key("c")])
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_some());
        assert!(results[1].is_none());
        assert_eq!(results[2].as_ref().unwrap().int("v").unwrap(), Some(3));
    }

    #[test]
    fn test_expiration_is_recorded_and_enforced() {
        let backend = MemoryBackend::new();
        backend
            .put(
                &key("kept"),
                &[Bin::new("v", 1)],
                &WritePolicy::with_retention_days(90),
            )
            .unwrap();
        let ttl = backend.time_to_live(&key("kept")).unwrap();
        assert!(ttl > Duration::from_secs(89 * 24 * 60 * 60));

        backend
            .put(
                &key("gone"),
                &[Bin::new("v", 1)],
                &WritePolicy {
                    expiration: Expiration::Seconds(0),
                },
            )
            .unwrap();
        assert!(backend.get(&key("gone")).unwrap().is_none());
    }

    #[test]
    fn test_offline_and_write_budget() {
        let backend = MemoryBackend::new();
        let policy = WritePolicy::default();

        backend.set_offline(true);
        assert!(matches!(
            backend.get(&key("u")),
            Err(BackendError::Connection(_))
        ));
        backend.set_offline(false);

        backend.fail_writes_after(1);
        backend.put(&key("u"), &[Bin::new("v", 1)], &policy).unwrap();
        assert!(backend.put(&key("u"), &[Bin::new("v", 2)], &policy).is_err());
        assert_eq!(backend.get(&key("u")).unwrap().unwrap().int("v").unwrap(), Some(1));
    }

    #[test]
    fn test_modules_unsupported() {
        let backend = MemoryBackend::without_modules();
        assert!(matches!(
            backend.registered_modules(),
            Err(BackendError::Unsupported)
        ));
        assert!(matches!(
            backend.execute(&key("u"), "event_module", &[]),
            Err(BackendError::Unsupported)
        ));
    }

    #[test]
    fn test_execute_unregistered_module() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.execute(&key("u"), "event_module", &[]),
            Err(BackendError::ModuleNotRegistered(name)) if name == "event_module"
        ));
    }

    #[test]
    fn test_round_trips_are_counted() {
        let backend = MemoryBackend::new();
        backend.get(&key("a")).unwrap();
        backend.batch_get(&[key("a"), key("b")]).unwrap();
        assert_eq!(backend.round_trips(), 2);
    }
}
