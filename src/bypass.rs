// src/bypass.rs
//! Time-boxed administrative overrides.
//!
//! A bypass record disables enforcement for one identifier until it
//! expires. Records live in the shared store next to strategy state, so
//! every process sees a grant as soon as it is written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::clock::{duration_millis, Clock};
use crate::error::{RateLimiterError, Result};
use crate::storage::StorageBackend;

/// A granted bypass, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BypassRecord {
    pub id: String,
    pub identifier: String,
    pub reason: String,
    pub bypassed_by: String,
    /// Epoch milliseconds
    pub created_at: u64,
    /// Epoch milliseconds; the record is ignored from this instant on
    pub expires_at: u64,
}

impl BypassRecord {
    pub fn is_active(&self, now_ms: u64) -> bool {
        self.expires_at > now_ms
    }

    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        i64::try_from(self.expires_at)
            .ok()
            .and_then(DateTime::from_timestamp_millis)
    }
}

/// Creates, looks up and revokes bypass records.
#[derive(Debug)]
pub struct BypassManager<S>
where
    S: StorageBackend,
{
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    max_duration: Duration,
}

impl<S> BypassManager<S>
where
    S: StorageBackend,
{
    pub fn new(
        storage: Arc<S>,
        clock: Arc<dyn Clock>,
        key_prefix: impl Into<String>,
        max_duration: Duration,
    ) -> Self {
        Self {
            storage,
            clock,
            key_prefix: key_prefix.into(),
            max_duration,
        }
    }

    fn key(&self, identifier: &str) -> String {
        format!("{}:bypass:{{{}}}", self.key_prefix, identifier)
    }

    /// Reject a grant before anything is written.
    pub fn validate(&self, identifier: &str, duration: Duration) -> Result<()> {
        if identifier.is_empty() {
            return Err(RateLimiterError::config("identifier must not be empty"));
        }
        if duration.as_millis() == 0 {
            return Err(RateLimiterError::config(
                "bypass duration must be at least 1ms",
            ));
        }
        if duration > self.max_duration {
            return Err(RateLimiterError::config(format!(
                "bypass duration {:?} exceeds the maximum of {:?}",
                duration, self.max_duration
            )));
        }
        Ok(())
    }

    /// Grant a bypass for `duration`. A second grant for the same
    /// identifier replaces the first.
    pub async fn create(
        &self,
        identifier: &str,
        duration: Duration,
        reason: &str,
        bypassed_by: &str,
    ) -> Result<BypassRecord> {
        self.validate(identifier, duration)?;

        let now = self.clock.now_millis();
        let record = BypassRecord {
            id: Uuid::new_v4().to_string(),
            identifier: identifier.to_string(),
            reason: reason.to_string(),
            bypassed_by: bypassed_by.to_string(),
            created_at: now,
            expires_at: now.saturating_add(duration_millis(duration)),
        };

        let payload = serde_json::to_vec(&record)?;
        self.storage
            .set(&self.key(identifier), &payload, Some(duration))
            .await?;

        info!(
            identifier,
            bypassed_by,
            reason,
            expires_at = record.expires_at,
            "Rate limit bypass created"
        );
        Ok(record)
    }

    /// The active record for `identifier`, if any.
    pub async fn check(&self, identifier: &str) -> Result<Option<BypassRecord>> {
        self.active_at(identifier, self.clock.now_millis()).await
    }

    pub(crate) async fn active_at(
        &self,
        identifier: &str,
        now_ms: u64,
    ) -> Result<Option<BypassRecord>> {
        let Some(raw) = self.storage.get(&self.key(identifier)).await? else {
            return Ok(None);
        };
        let record: BypassRecord = serde_json::from_slice(&raw)?;

        // the store may not have evicted it yet
        Ok(record.is_active(now_ms).then_some(record))
    }

    /// Remove the record early. Returns whether one existed.
    pub async fn revoke(&self, identifier: &str) -> Result<bool> {
        let removed = self.storage.delete(&self.key(identifier)).await?;
        if removed {
            info!(identifier, "Rate limit bypass revoked");
        }
        Ok(removed)
    }
}
