//! The `event_module` aggregation module and its registration step.

use crate::backend::{AggregationModule, Backend, BackendError, Record, Value};
use crate::event::EventFilter;
use crate::store::EVENTS_BIN;
use std::thread;
use std::time::{Duration, Instant};

pub const EVENT_MODULE_NAME: &str = "event_module";

/// Counts map entries newer than `ARGV[3]` whose value is
/// `ARGV[2]:ARGV[1]` (campaign:action). Malformed entries are skipped; an
/// `events` field that is not a map is an error, as in the native procedure.
const EVENT_MODULE_LUA: &str = r#"
local raw = redis.call('HGET', KEYS[1], 'events')
if not raw then
  return 0
end
if string.sub(raw, 1, 2) ~= 'm:' then
  return redis.error_reply('WRONGTYPE bin `events` does not hold a map')
end
local events = cjson.decode(string.sub(raw, 3))
local action = ARGV[1]
local campaign = ARGV[2]
local since = tonumber(ARGV[3])
local count = 0
for ts, value in pairs(events) do
  if tonumber(ts) > since then
    local sep = string.find(value, ':', 1, true)
    if sep and sep > 1 and sep < string.len(value) then
      if string.sub(value, 1, sep - 1) == campaign and string.sub(value, sep + 1) == action then
        count = count + 1
      end
    end
  end
end
return count
"#;

/// Arguments: `(action, campaign, since_millis)`. Returns an integer count.
pub const EVENT_MODULE: AggregationModule = AggregationModule {
    name: EVENT_MODULE_NAME,
    lua_source: EVENT_MODULE_LUA,
    procedure: count_events,
};

fn count_events(record: Option<&Record>, args: &[Value]) -> Result<Value, BackendError> {
    let filter = match args {
        [Value::Str(action), Value::Str(campaign), Value::Int(since)] => {
            EventFilter::new(action.as_str(), campaign.as_str(), *since)
        }
        _ => {
            return Err(BackendError::InvalidArguments(
                "expected (action: string, campaign: string, since: int)".to_string(),
            ))
        }
    };

    let Some(events) = record.map(|r| r.map(EVENTS_BIN)).transpose()?.flatten() else {
        return Ok(Value::Int(0));
    };

    let count = events
        .iter()
        .filter(|(ts, value)| filter.matches_entry(**ts, value).unwrap_or(false))
        .count();
    Ok(Value::Int(count as i64))
}

/// Make sure `module` is registered, registering it if absent, and block
/// until the backend lists it or `timeout` elapses.
pub fn ensure_registered(
    backend: &dyn Backend,
    module: &AggregationModule,
    timeout: Duration,
) -> Result<(), BackendError> {
    if backend
        .registered_modules()?
        .iter()
        .any(|name| name == module.name)
    {
        log::debug!("Aggregation module {} already registered", module.name);
        return Ok(());
    }

    log::info!("Registering aggregation module {}", module.name);
    backend.register_module(module)?;

    let deadline = Instant::now() + timeout;
    loop {
        if backend
            .registered_modules()?
            .iter()
            .any(|name| name == module.name)
        {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(BackendError::ModuleNotRegistered(module.name.to_string()));
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Bin, Key, MemoryBackend, WritePolicy};
    use std::collections::BTreeMap;

    fn args(action: &str, campaign: &str, since: i64) -> Vec<Value> {
        vec![Value::from(action), Value::from(campaign), Value::Int(since)]
    }

    #[test]
    fn test_count_events_applies_filter() {
        let mut events = BTreeMap::new();
        events.insert(100, "birds:tap".to_string());
        events.insert(200, "birds:tap".to_string());
        events.insert(300, "birds:clap".to_string());
        events.insert(400, "broken".to_string());
        let mut bins = BTreeMap::new();
        bins.insert(EVENTS_BIN.to_string(), Value::Map(events));
        let record = Record::from_bins(bins);

        let result = count_events(Some(&record), &args("tap", "birds", 100)).unwrap();
        assert_eq!(result, Value::Int(1));
    }

    #[test]
    fn test_count_events_rejects_non_map_bin() {
        let mut bins = BTreeMap::new();
        bins.insert(EVENTS_BIN.to_string(), Value::from("birds:tap"));
        let record = Record::from_bins(bins);
        assert!(matches!(
            count_events(Some(&record), &args("tap", "birds", 0)),
            Err(BackendError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_count_events_missing_record() {
        assert_eq!(
            count_events(None, &args("tap", "birds", 0)).unwrap(),
            Value::Int(0)
        );
    }

    #[test]
    fn test_count_events_rejects_bad_arguments() {
        assert!(matches!(
            count_events(None, &[Value::Int(1)]),
            Err(BackendError::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_ensure_registered_is_idempotent() {
        let backend = MemoryBackend::new();
        ensure_registered(&backend, &EVENT_MODULE, Duration::from_secs(1)).unwrap();
        ensure_registered(&backend, &EVENT_MODULE, Duration::from_secs(1)).unwrap();
        assert_eq!(
            backend.registered_modules().unwrap(),
            vec![EVENT_MODULE_NAME.to_string()]
        );

        let key = Key::new("test", "events-map", "user1");
        backend
            .put(&key, &[Bin::new("name", "user1")], &WritePolicy::default())
            .unwrap();
        let count = backend
            .execute(&key, EVENT_MODULE_NAME, &args("tap", "birds", 0))
            .unwrap();
        assert_eq!(count, Value::Int(0));
    }

    #[test]
    fn test_ensure_registered_without_extension_support() {
        let backend = MemoryBackend::without_modules();
        assert!(matches!(
            ensure_registered(&backend, &EVENT_MODULE, Duration::from_secs(1)),
            Err(BackendError::Unsupported)
        ));
    }
}
