//! The event value type, its `campaign:action` encoding, and the shared
//! inclusion predicate used by every query strategy.

use crate::error::{Error, Result};
use std::fmt;

/// Separator between campaign and action in the encoded event value.
pub const EVENT_DELIMITER: char = ':';

/// One user action on one campaign at one instant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventRecord {
    timestamp_millis: i64,
    campaign_id: String,
    action: String,
}

impl EventRecord {
    /// Both ids must be non-empty. The campaign may not contain the
    /// delimiter, since decoding splits on its first occurrence.
    pub fn new(
        campaign_id: impl Into<String>,
        action: impl Into<String>,
        timestamp_millis: i64,
    ) -> Result<Self> {
        let campaign_id = campaign_id.into();
        let action = action.into();
        if campaign_id.is_empty() {
            return Err(Error::InvalidEvent("campaign id is empty".to_string()));
        }
        if action.is_empty() {
            return Err(Error::InvalidEvent("action is empty".to_string()));
        }
        if campaign_id.contains(EVENT_DELIMITER) {
            return Err(Error::InvalidEvent(format!(
                "campaign id {campaign_id:?} contains '{EVENT_DELIMITER}'"
            )));
        }
        Ok(Self {
            timestamp_millis,
            campaign_id,
            action,
        })
    }

    pub fn campaign_id(&self) -> &str {
        &self.campaign_id
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp_millis
    }

    /// Value stored against the timestamp: `campaign:action`.
    pub fn encode(&self) -> String {
        format!("{}{EVENT_DELIMITER}{}", self.campaign_id, self.action)
    }

    /// Parse a stored value back into an event at `timestamp_millis`.
    pub fn decode(timestamp_millis: i64, value: &str) -> Result<Self> {
        let malformed = |reason| Error::MalformedEvent {
            timestamp: timestamp_millis,
            value: value.to_string(),
            reason,
        };
        let (campaign, action) = value
            .split_once(EVENT_DELIMITER)
            .ok_or_else(|| malformed("missing delimiter"))?;
        if campaign.is_empty() {
            return Err(malformed("empty campaign"));
        }
        if action.is_empty() {
            return Err(malformed("empty action"));
        }
        Ok(Self {
            timestamp_millis,
            campaign_id: campaign.to_string(),
            action: action.to_string(),
        })
    }
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.encode(), self.timestamp_millis)
    }
}

/// The query predicate: action and campaign match exactly and the event
/// happened strictly after `since_millis`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub action: String,
    pub campaign: String,
    pub since_millis: i64,
}

impl EventFilter {
    pub fn new(action: impl Into<String>, campaign: impl Into<String>, since_millis: i64) -> Self {
        Self {
            action: action.into(),
            campaign: campaign.into(),
            since_millis,
        }
    }

    pub fn matches(&self, event: &EventRecord) -> bool {
        event.timestamp_millis > self.since_millis
            && event.campaign_id == self.campaign
            && event.action == self.action
    }

    /// Evaluate a raw `(timestamp, value)` entry. Entries outside the window
    /// are rejected before decoding; a malformed value inside the window is
    /// an error for the caller to skip.
    pub fn matches_entry(&self, timestamp_millis: i64, value: &str) -> Result<bool> {
        if timestamp_millis <= self.since_millis {
            return Ok(false);
        }
        let event = EventRecord::decode(timestamp_millis, value)?;
        Ok(self.matches(&event))
    }
}
