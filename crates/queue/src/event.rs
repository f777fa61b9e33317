//! Event types flowing through the dispatcher and its drivers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use trellis_core::CodecError;

/// Default per-invocation handling budget.
pub const DEFAULT_HANDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Default retry ceiling (a single attempt, no retries).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;

/// A dispatchable event: a stable type tag plus a JSON payload.
///
/// The tag is what listeners subscribe on; the payload is whatever the
/// producer serialized. Listeners decode it back with [`Event::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    key: String,
    data: JsonValue,
}

impl Event {
    /// Build an event from any serializable payload.
    pub fn new<T: Serialize>(key: impl Into<String>, data: &T) -> Result<Self, CodecError> {
        let data = serde_json::to_value(data).map_err(|e| CodecError::Marshal(e.to_string()))?;
        Ok(Self {
            key: key.into(),
            data,
        })
    }

    pub fn from_value(key: impl Into<String>, data: JsonValue) -> Self {
        Self {
            key: key.into(),
            data,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    /// Decode the payload into a typed slot.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_value(self.data.clone()).map_err(|e| CodecError::Unmarshal(e.to_string()))
    }
}

/// The durable unit flowing through queue drivers.
///
/// Invariants: `1 <= attempts <= max_attempts`, `handle_timeout > 0`, and
/// `unique_id` identifies the logical job across retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEvent {
    pub unique_id: String,
    pub key: String,
    pub value: Vec<u8>,
    #[serde(with = "duration_millis")]
    pub handle_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub backoff: Duration,
    pub attempts: u32,
    pub max_attempts: u32,
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Persistence options for an event, attached via [`persist`].
///
/// Defaults: no delay, `handle_timeout` of one hour, a single attempt, and
/// an auto-generated unique id.
#[derive(Debug, Clone)]
pub struct Persist {
    event: Event,
    delay: Duration,
    schedule_at: Option<DateTime<Utc>>,
    handle_timeout: Duration,
    max_attempts: u32,
    unique_id: Option<String>,
}

/// Mark an event persistent.
pub fn persist(event: Event) -> Persist {
    Persist {
        event,
        delay: Duration::ZERO,
        schedule_at: None,
        handle_timeout: DEFAULT_HANDLE_TIMEOUT,
        max_attempts: DEFAULT_MAX_ATTEMPTS,
        unique_id: None,
    }
}

impl Persist {
    /// Deliver no earlier than `delay` from now.
    pub fn defer(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self.schedule_at = None;
        self
    }

    /// Deliver no earlier than the given instant.
    pub fn schedule_at(mut self, at: DateTime<Utc>) -> Self {
        self.schedule_at = Some(at);
        self
    }

    /// Wall-clock budget shared by all listeners of one invocation.
    pub fn timeout(mut self, handle_timeout: Duration) -> Self {
        self.handle_timeout = handle_timeout;
        self
    }

    /// Hard retry ceiling; reaching it routes the event to `failed`.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Explicit unique id (used for deduplication and retry correlation).
    pub fn unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Resolve into the durable event plus its initial delay.
    pub(crate) fn into_persisted(
        self,
        codec: &dyn trellis_core::Codec,
    ) -> Result<(PersistedEvent, Duration), CodecError> {
        let delay = match self.schedule_at {
            Some(at) => {
                let now = Utc::now();
                if at > now {
                    (at - now).to_std().unwrap_or(Duration::ZERO)
                } else {
                    Duration::ZERO
                }
            }
            None => self.delay,
        };

        let value = codec.marshal(&self.event.data)?;
        let persisted = PersistedEvent {
            unique_id: self
                .unique_id
                .unwrap_or_else(|| Uuid::now_v7().to_string()),
            key: self.event.key,
            value,
            handle_timeout: self.handle_timeout,
            backoff: Duration::ZERO,
            attempts: 1,
            max_attempts: self.max_attempts.max(1),
        };
        Ok((persisted, delay))
    }
}
