//! KeyDB/Redis backend.
//!
//! Key schema: every record is a Redis hash at `{namespace}:{set}:{key}`, one
//! hash field per bin. Field values carry a type tag so reads can rebuild
//! [`Value`]s:
//! - `i:<decimal>`  integer bin
//! - `s:<text>`     string bin
//! - `m:<json>`     timestamp map bin, JSON object keyed by decimal timestamp
//!
//! Atomic add runs as a Lua script so the read-modify-write happens on the
//! server. Aggregation modules are Lua scripts loaded with `SCRIPT LOAD`; their
//! SHA1 is kept in the [`MODULE_REGISTRY_KEY`] hash under the module name.

use super::{AggregationModule, Backend, BackendError, Bin, Key, Record, Value, WritePolicy};
use redis::{pipe, Connection, Script};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Hash mapping aggregation module names to loaded script SHA1s.
pub const MODULE_REGISTRY_KEY: &str = "userevents:modules";

/// Number of keys to batch in a single Redis pipeline round-trip.
const PIPELINE_BATCH_SIZE: usize = 4096;

const ADD_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
local value = 0
if current then
  if string.sub(current, 1, 2) ~= 'i:' then
    return redis.error_reply('bin ' .. ARGV[1] .. ' is not an integer')
  end
  value = tonumber(string.sub(current, 3))
end
value = value + tonumber(ARGV[2])
redis.call('HSET', KEYS[1], ARGV[1], 'i:' .. value)
local ttl = tonumber(ARGV[3])
if ttl >= 0 then
  redis.call('EXPIRE', KEYS[1], ttl)
else
  redis.call('PERSIST', KEYS[1])
end
return value
"#;

/// Connection settings for [`KeyDbBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDbConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl KeyDbConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            url: format!("redis://{host}:{port}/"),
            connect_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(5),
        }
    }
}

pub struct KeyDbBackend {
    con: Mutex<Connection>,
    add_script: Script,
}

impl KeyDbBackend {
    pub fn connect(config: &KeyDbConfig) -> Result<Self, BackendError> {
        let client = redis::Client::open(config.url.as_str()).map_err(|err| {
            BackendError::Connection(format!("Failed to open KeyDB client: {err}"))
        })?;
        let con = client
            .get_connection_with_timeout(config.connect_timeout)
            .map_err(|err| {
                BackendError::Connection(format!(
                    "Failed to connect to KeyDB at {}: {err}",
                    config.url
                ))
            })?;
        con.set_read_timeout(Some(config.response_timeout))
            .and_then(|_| con.set_write_timeout(Some(config.response_timeout)))
            .map_err(|err| {
                BackendError::Connection(format!("Failed to set KeyDB timeouts: {err}"))
            })?;
        log::debug!("Connected to KeyDB at {}", config.url);
        Ok(Self {
            con: Mutex::new(con),
            add_script: Script::new(ADD_SCRIPT),
        })
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>, BackendError> {
        self.con
            .lock()
            .map_err(|_| BackendError::Connection("KeyDB connection lock poisoned".to_string()))
    }
}

fn command_error(operation: &str, key: &str, err: redis::RedisError) -> BackendError {
    BackendError::Command(format!("KeyDB {operation} {key}: {err}"))
}

/// Encode a bin value as a tagged hash field.
pub fn encode_value(value: &Value) -> Result<String, BackendError> {
    Ok(match value {
        Value::Int(v) => format!("i:{v}"),
        Value::Str(s) => format!("s:{s}"),
        Value::Map(m) => {
            let json = serde_json::to_string(m)
                .map_err(|err| BackendError::Corrupt(format!("encode map: {err}")))?;
            format!("m:{json}")
        }
    })
}

/// Decode a tagged hash field back into a bin value.
pub fn decode_value(raw: &str) -> Result<Value, BackendError> {
    let (tag, body) = raw
        .split_once(':')
        .ok_or_else(|| BackendError::Corrupt(format!("untagged value {raw:?}")))?;
    match tag {
        "i" => body
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|err| BackendError::Corrupt(format!("integer {body:?}: {err}"))),
        "s" => Ok(Value::Str(body.to_string())),
        "m" => serde_json::from_str::<BTreeMap<i64, String>>(body)
            .map(Value::Map)
            .map_err(|err| BackendError::Corrupt(format!("map: {err}"))),
        other => Err(BackendError::Corrupt(format!("unknown tag {other:?}"))),
    }
}

fn decode_record(fields: HashMap<String, String>) -> Result<Option<Record>, BackendError> {
    if fields.is_empty() {
        return Ok(None);
    }
    let mut bins = BTreeMap::new();
    for (name, raw) in fields {
        bins.insert(name, decode_value(&raw)?);
    }
    Ok(Some(Record::from_bins(bins)))
}

fn script_argument(value: &Value) -> Result<String, BackendError> {
    match value {
        Value::Int(v) => Ok(v.to_string()),
        Value::Str(s) => Ok(s.clone()),
        Value::Map(_) => Err(BackendError::InvalidArguments(
            "map arguments are not supported".to_string(),
        )),
    }
}

impl Backend for KeyDbBackend {
    fn get(&self, key: &Key) -> Result<Option<Record>, BackendError> {
        let redis_key = key.to_string();
        let mut con = self.connection()?;
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(&redis_key)
            .query(&mut *con)
            .map_err(|err| command_error("HGETALL", &redis_key, err))?;
        decode_record(fields)
    }

    fn put(&self, key: &Key, bins: &[Bin], policy: &WritePolicy) -> Result<(), BackendError> {
        if bins.is_empty() {
            return Ok(());
        }
        let redis_key = key.to_string();
        let mut pipeline = pipe();
        pipeline.atomic();
        pipeline.cmd("HSET").arg(&redis_key);
        for bin in bins {
            pipeline.arg(&bin.name).arg(encode_value(&bin.value)?);
        }
        pipeline.ignore();
        match policy.expiration.as_secs() {
            Some(secs) => pipeline.cmd("EXPIRE").arg(&redis_key).arg(secs).ignore(),
            None => pipeline.cmd("PERSIST").arg(&redis_key).ignore(),
        };

        let mut con = self.connection()?;
        pipeline
            .query::<()>(&mut *con)
            .map_err(|err| command_error("HSET", &redis_key, err))
    }

    fn batch_get(&self, keys: &[Key]) -> Result<Vec<Option<Record>>, BackendError> {
        let mut results = Vec::with_capacity(keys.len());
        let mut con = self.connection()?;

        for chunk in keys.chunks(PIPELINE_BATCH_SIZE) {
            let mut pipeline = pipe();
            for key in chunk {
                pipeline.cmd("HGETALL").arg(key.to_string());
            }
            let batch: Vec<HashMap<String, String>> = pipeline
                .query(&mut *con)
                .map_err(|err| command_error("pipeline HGETALL", "batch", err))?;
            for fields in batch {
                results.push(decode_record(fields)?);
            }
        }

        Ok(results)
    }

    fn add(
        &self,
        key: &Key,
        bin: &str,
        delta: i64,
        policy: &WritePolicy,
    ) -> Result<i64, BackendError> {
        let redis_key = key.to_string();
        let ttl = policy.expiration.as_secs().map_or(-1, i64::from);
        let mut con = self.connection()?;
        self.add_script
            .key(&redis_key)
            .arg(bin)
            .arg(delta)
            .arg(ttl)
            .invoke::<i64>(&mut *con)
            .map_err(|err| command_error("add", &redis_key, err))
    }

    fn registered_modules(&self) -> Result<Vec<String>, BackendError> {
        let mut con = self.connection()?;
        let registry: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(MODULE_REGISTRY_KEY)
            .query(&mut *con)
            .map_err(|err| command_error("HGETALL", MODULE_REGISTRY_KEY, err))?;
        if registry.is_empty() {
            return Ok(Vec::new());
        }

        let (names, shas): (Vec<String>, Vec<String>) = registry.into_iter().unzip();
        // The registry survives a server restart; loaded scripts do not.
        let loaded: Vec<bool> = redis::cmd("SCRIPT")
            .arg("EXISTS")
            .arg(&shas)
            .query(&mut *con)
            .map_err(|err| command_error("SCRIPT EXISTS", MODULE_REGISTRY_KEY, err))?;

        let mut modules: Vec<String> = names
            .into_iter()
            .zip(loaded)
            .filter_map(|(name, is_loaded)| is_loaded.then_some(name))
            .collect();
        modules.sort();
        Ok(modules)
    }

    fn register_module(&self, module: &AggregationModule) -> Result<(), BackendError> {
        let mut con = self.connection()?;
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(module.lua_source)
            .query(&mut *con)
            .map_err(|err| command_error("SCRIPT LOAD", module.name, err))?;
        redis::cmd("HSET")
            .arg(MODULE_REGISTRY_KEY)
            .arg(module.name)
            .arg(&sha)
            .query::<()>(&mut *con)
            .map_err(|err| command_error("HSET", MODULE_REGISTRY_KEY, err))?;
        log::info!("Registered aggregation module {} ({sha})", module.name);
        Ok(())
    }

    fn execute(&self, key: &Key, module: &str, args: &[Value]) -> Result<Value, BackendError> {
        let redis_key = key.to_string();
        let script_args = args
            .iter()
            .map(script_argument)
            .collect::<Result<Vec<_>, _>>()?;

        let mut con = self.connection()?;
        let sha: Option<String> = redis::cmd("HGET")
            .arg(MODULE_REGISTRY_KEY)
            .arg(module)
            .query(&mut *con)
            .map_err(|err| command_error("HGET", MODULE_REGISTRY_KEY, err))?;
        let sha = sha.ok_or_else(|| BackendError::ModuleNotRegistered(module.to_string()))?;

        let result: i64 = redis::cmd("EVALSHA")
            .arg(&sha)
            .arg(1)
            .arg(&redis_key)
            .arg(&script_args)
            .query(&mut *con)
            .map_err(|err| {
                if err.to_string().contains("NOSCRIPT") {
                    BackendError::ModuleNotRegistered(module.to_string())
                } else {
                    command_error("EVALSHA", &redis_key, err)
                }
            })?;
        Ok(Value::Int(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_encoding() {
        assert_eq!(encode_value(&Value::Int(-7)).unwrap(), "i:-7");
        assert_eq!(encode_value(&Value::from("birds:tap")).unwrap(), "s:birds:tap");

        let mut events = BTreeMap::new();
        events.insert(1_700_000_000_001, "birds:tap".to_string());
        events.insert(1_700_000_000_002, "cats:run".to_string());
        let encoded = encode_value(&Value::Map(events.clone())).unwrap();
        assert_eq!(
            encoded,
            r#"m:{"1700000000001":"birds:tap","1700000000002":"cats:run"}"#
        );
        assert_eq!(decode_value(&encoded).unwrap(), Value::Map(events));
    }

    #[test]
    fn test_decode_rejects_bad_fields() {
        assert!(matches!(decode_value("42"), Err(BackendError::Corrupt(_))));
        assert!(matches!(decode_value("i:x"), Err(BackendError::Corrupt(_))));
        assert!(matches!(decode_value("q:1"), Err(BackendError::Corrupt(_))));
    }

    #[test]
    fn test_empty_hash_is_absent_record() {
        assert!(decode_record(HashMap::new()).unwrap().is_none());
    }

    #[test]
    fn test_config_url() {
        let config = KeyDbConfig::new("127.0.0.1", 6379);
        assert_eq!(config.url, "redis://127.0.0.1:6379/");
    }
}
