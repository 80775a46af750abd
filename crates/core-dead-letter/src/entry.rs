//! Dead-letter entry model

use crate::error::{DeadLetterError, Result};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use taskguard_core_resilience::RetryError;

/// A permanently failed task, as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Unique key
    pub task_id: String,
    /// What the task was doing
    pub feature: String,
    /// Downstream target the task was calling
    pub target_url: String,
    pub failure_reason: String,
    pub retry_count: u32,
    /// Snapshot of the workflow at the time of failure
    pub workflow_state: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    /// Phase the task was in when the last error occurred
    pub last_error_phase: Option<String>,
}

/// Input for [`DeadLetterStore::add_entry`](crate::DeadLetterStore::add_entry)
///
/// Timestamps left unset default to the time of insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDeadLetter {
    pub task_id: String,
    pub feature: String,
    pub target_url: String,
    pub failure_reason: String,
    pub retry_count: u32,
    pub workflow_state: Option<serde_json::Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_error_phase: Option<String>,
}

impl NewDeadLetter {
    pub fn new(
        task_id: impl Into<String>,
        feature: impl Into<String>,
        target_url: impl Into<String>,
        failure_reason: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            feature: feature.into(),
            target_url: target_url.into(),
            failure_reason: failure_reason.into(),
            retry_count: 0,
            workflow_state: None,
            created_at: None,
            failed_at: None,
            last_error_phase: None,
        }
    }

    /// Build an entry from the error a retry loop gave up with
    ///
    /// The failure reason is the last underlying error and the retry count
    /// is the number of attempts made.
    pub fn from_failure<E>(
        task_id: impl Into<String>,
        feature: impl Into<String>,
        target_url: impl Into<String>,
        failure: &RetryError<E>,
    ) -> Self
    where
        E: std::error::Error + 'static,
    {
        Self::new(task_id, feature, target_url, failure.last_error().to_string())
            .with_retry_count(failure.attempts())
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_workflow_state(mut self, state: serde_json::Value) -> Self {
        self.workflow_state = Some(state);
        self
    }

    /// Snapshot any serializable workflow value
    pub fn with_workflow_state_of<S: Serialize>(self, state: &S) -> Result<Self> {
        Ok(self.with_workflow_state(serde_json::to_value(state)?))
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn with_failed_at(mut self, at: DateTime<Utc>) -> Self {
        self.failed_at = Some(at);
        self
    }

    pub fn with_last_error_phase(mut self, phase: impl Into<String>) -> Self {
        self.last_error_phase = Some(phase.into());
        self
    }

    /// Fill in defaults and normalize timestamps to what the store keeps
    pub(crate) fn into_entry(self, now: DateTime<Utc>) -> DeadLetterEntry {
        DeadLetterEntry {
            task_id: self.task_id,
            feature: self.feature,
            target_url: self.target_url,
            failure_reason: self.failure_reason,
            retry_count: self.retry_count,
            workflow_state: self.workflow_state,
            created_at: self.created_at.unwrap_or(now).trunc_subsecs(6),
            failed_at: self.failed_at.unwrap_or(now).trunc_subsecs(6),
            last_error_phase: self.last_error_phase,
        }
    }
}

/// Fixed-width RFC 3339 in UTC, so text order matches time order
pub(crate) fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(column: &'static str, value: String) -> Result<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(&value) {
        Ok(at) => Ok(at.with_timezone(&Utc)),
        Err(_) => Err(DeadLetterError::InvalidTimestamp { column, value }),
    }
}
