//! Redis-backed saga log store.
//!
//! Layout: one list of JSON entries per session
//! (`<ns>:saga:log:<correlation_id>`) plus a set of known correlation ids
//! (`<ns>:saga:sessions`). Sessions are small (a handful of entries), so
//! the recovery queries read a session's list whole and reuse the same
//! selection logic as the in-memory store.

use std::time::Duration;

use crate::log::{
    SagaLogEntry, SagaLogError, SagaLogStore, select_unacknowledged, select_uncommitted,
};

/// Redis-backed [`SagaLogStore`].
pub struct RedisSagaLogStore {
    client: redis::Client,
    namespace: String,
    timeout: Duration,
}

impl RedisSagaLogStore {
    /// `timeout` is the session staleness bound used by
    /// [`SagaLogStore::uncommitted_sessions`].
    pub fn new(client: redis::Client, namespace: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            timeout,
        }
    }

    pub fn open(
        url: &str,
        namespace: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SagaLogError> {
        let client = redis::Client::open(url).map_err(storage)?;
        Ok(Self::new(client, namespace, timeout))
    }

    fn sessions_key(&self) -> String {
        format!("{}:saga:sessions", self.namespace)
    }

    fn log_key(&self, correlation_id: &str) -> String {
        format!("{}:saga:log:{}", self.namespace, correlation_id)
    }

    fn conn(&self) -> Result<redis::Connection, SagaLogError> {
        self.client.get_connection().map_err(storage)
    }

    fn session_entries(
        &self,
        conn: &mut redis::Connection,
        correlation_id: &str,
    ) -> Result<Vec<SagaLogEntry>, SagaLogError> {
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(self.log_key(correlation_id))
            .arg(0)
            .arg(-1)
            .query(conn)
            .map_err(storage)?;

        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(|e| SagaLogError::Storage(e.to_string())))
            .collect()
    }
}

impl SagaLogStore for RedisSagaLogStore {
    fn log(&self, entry: SagaLogEntry) -> Result<(), SagaLogError> {
        let mut conn = self.conn()?;
        let json =
            serde_json::to_string(&entry).map_err(|e| SagaLogError::Storage(e.to_string()))?;

        let _: () = redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(self.log_key(&entry.correlation_id))
            .arg(json)
            .ignore()
            .cmd("SADD")
            .arg(self.sessions_key())
            .arg(&entry.correlation_id)
            .ignore()
            .query(&mut conn)
            .map_err(storage)?;
        Ok(())
    }

    fn ack(&self, entry: &SagaLogEntry) -> Result<(), SagaLogError> {
        let mut conn = self.conn()?;
        let stored = self.session_entries(&mut conn, &entry.correlation_id)?;

        let Some(index) = stored.iter().position(|e| e.id == entry.id) else {
            return Err(SagaLogError::NotFound(entry.id.clone()));
        };

        let json =
            serde_json::to_string(entry).map_err(|e| SagaLogError::Storage(e.to_string()))?;
        let _: () = redis::cmd("LSET")
            .arg(self.log_key(&entry.correlation_id))
            .arg(index as i64)
            .arg(json)
            .query(&mut conn)
            .map_err(storage)?;
        Ok(())
    }

    fn unacknowledged_steps(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<SagaLogEntry>, SagaLogError> {
        let mut conn = self.conn()?;
        let entries = self.session_entries(&mut conn, correlation_id)?;
        Ok(select_unacknowledged(&entries, correlation_id))
    }

    fn uncommitted_sessions(&self) -> Result<Vec<SagaLogEntry>, SagaLogError> {
        let mut conn = self.conn()?;
        let sessions: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.sessions_key())
            .query(&mut conn)
            .map_err(storage)?;

        let mut entries = Vec::new();
        for correlation_id in sessions {
            entries.extend(self.session_entries(&mut conn, &correlation_id)?);
        }
        Ok(select_uncommitted(&entries, self.timeout))
    }
}

fn storage(err: redis::RedisError) -> SagaLogError {
    SagaLogError::Storage(err.to_string())
}
