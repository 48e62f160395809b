//! Key-value backend abstraction.
//!
//! Records live under `namespace / set / key` and hold named bins. A backend
//! supports single-record get/put with a per-write expiration, multi-key batch
//! reads, atomic integer add on a bin, and named aggregation modules that run
//! next to the data.
//!
//! Two implementations are provided:
//! - [`memory::MemoryBackend`]: in-process, used by tests and `--in-memory` runs
//! - [`keydb::KeyDbBackend`]: KeyDB/Redis over the `redis` crate

pub mod keydb;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub use keydb::{KeyDbBackend, KeyDbConfig};
pub use memory::MemoryBackend;

/// Address of one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub namespace: String,
    pub set: String,
    pub user_key: String,
}

impl Key {
    pub fn new(
        namespace: impl Into<String>,
        set: impl Into<String>,
        user_key: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            set: set.into(),
            user_key: user_key.into(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.set, self.user_key)
    }
}

/// A bin value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(String),
    /// Timestamp-keyed map; key order equals insertion order for event maps.
    Map(BTreeMap<i64, String>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::Map(_) => "map",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<BTreeMap<i64, String>> for Value {
    fn from(v: BTreeMap<i64, String>) -> Self {
        Value::Map(v)
    }
}

/// A named value written into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bin {
    pub name: String,
    pub value: Value,
}

impl Bin {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// The bins of one record as returned by a read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    bins: BTreeMap<String, Value>,
}

impl Record {
    pub fn from_bins(bins: BTreeMap<String, Value>) -> Self {
        Self { bins }
    }

    pub fn bin(&self, name: &str) -> Option<&Value> {
        self.bins.get(name)
    }

    pub fn bins(&self) -> &BTreeMap<String, Value> {
        &self.bins
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Integer bin; `Ok(None)` when absent, an error when of another type.
    pub fn int(&self, name: &str) -> Result<Option<i64>, BackendError> {
        match self.bins.get(name) {
            None => Ok(None),
            Some(Value::Int(v)) => Ok(Some(*v)),
            Some(other) => Err(BackendError::type_mismatch(name, "int", other)),
        }
    }

    pub fn str(&self, name: &str) -> Result<Option<&str>, BackendError> {
        match self.bins.get(name) {
            None => Ok(None),
            Some(Value::Str(v)) => Ok(Some(v.as_str())),
            Some(other) => Err(BackendError::type_mismatch(name, "string", other)),
        }
    }

    pub fn map(&self, name: &str) -> Result<Option<&BTreeMap<i64, String>>, BackendError> {
        match self.bins.get(name) {
            None => Ok(None),
            Some(Value::Map(v)) => Ok(Some(v)),
            Some(other) => Err(BackendError::type_mismatch(name, "map", other)),
        }
    }
}

/// When a written record becomes eligible for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiration {
    #[default]
    Never,
    Seconds(u32),
}

impl Expiration {
    pub fn as_secs(&self) -> Option<u32> {
        match self {
            Expiration::Never => None,
            Expiration::Seconds(secs) => Some(*secs),
        }
    }
}

/// Options applied to every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WritePolicy {
    pub expiration: Expiration,
}

impl WritePolicy {
    pub fn with_retention_days(days: u32) -> Self {
        Self {
            expiration: Expiration::Seconds(days.saturating_mul(24 * 60 * 60)),
        }
    }
}

/// Native half of an aggregation module: runs against the (possibly absent)
/// record with the caller's scalar arguments.
pub type NativeProcedure = fn(Option<&Record>, &[Value]) -> Result<Value, BackendError>;

/// An aggregation module the backend can register and invoke by name.
///
/// Carries the Lua source for script-capable servers and an equivalent native
/// procedure for the in-process backend. Both must implement the same logic.
#[derive(Clone, Copy)]
pub struct AggregationModule {
    pub name: &'static str,
    pub lua_source: &'static str,
    pub procedure: NativeProcedure,
}

impl fmt::Debug for AggregationModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationModule")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("bin `{bin}` holds {found}, expected {expected}")]
    TypeMismatch {
        bin: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("undecodable stored value: {0}")]
    Corrupt(String),

    #[error("backend does not support aggregation modules")]
    Unsupported,

    #[error("aggregation module `{0}` is not registered")]
    ModuleNotRegistered(String),

    #[error("invalid aggregation arguments: {0}")]
    InvalidArguments(String),
}

impl BackendError {
    fn type_mismatch(bin: &str, expected: &'static str, found: &Value) -> Self {
        BackendError::TypeMismatch {
            bin: bin.to_string(),
            expected,
            found: found.type_name(),
        }
    }

    /// True when the failure means "no usable aggregation capability" rather
    /// than a broken round trip.
    pub fn is_capability_missing(&self) -> bool {
        matches!(
            self,
            BackendError::Unsupported | BackendError::ModuleNotRegistered(_)
        )
    }
}

/// Operations the storage layouts need from a key-value store.
///
/// Every call is one blocking round trip.
pub trait Backend: Send + Sync {
    /// Read a whole record; `None` when absent or expired.
    fn get(&self, key: &Key) -> Result<Option<Record>, BackendError>;

    /// Write bins into a record, merging with existing bins, and reset its
    /// expiration from `policy`.
    fn put(&self, key: &Key, bins: &[Bin], policy: &WritePolicy) -> Result<(), BackendError>;

    /// Read many records at once. The result is aligned with `keys`.
    fn batch_get(&self, keys: &[Key]) -> Result<Vec<Option<Record>>, BackendError>;

    /// Atomically add `delta` to an integer bin (absent counts as 0) and
    /// return the new value.
    fn add(
        &self,
        key: &Key,
        bin: &str,
        delta: i64,
        policy: &WritePolicy,
    ) -> Result<i64, BackendError>;

    /// Names of registered aggregation modules.
    fn registered_modules(&self) -> Result<Vec<String>, BackendError>;

    fn register_module(&self, module: &AggregationModule) -> Result<(), BackendError>;

    /// Run a registered module against one record.
    fn execute(&self, key: &Key, module: &str, args: &[Value]) -> Result<Value, BackendError>;
}
