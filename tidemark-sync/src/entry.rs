//! Cache entries and the snapshots handed to views.
//!
//! A [`CacheEntry`] is owned exclusively by the [`CacheStore`](crate::CacheStore).
//! Everything outside the store sees a [`QuerySnapshot`]: an immutable copy of
//! the entry's observable state at one instant.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use tidemark_core::{QueryKey, StorageError, SyncError, SyncResult};
use tokio::time::Instant;

/// Type-erased cached payload. Typed access goes through
/// [`QuerySnapshot::data`].
pub type CachedValue = Arc<dyn Any + Send + Sync>;

/// One execution shared by every request attached to it.
pub(crate) type SharedExecution = Shared<BoxFuture<'static, SyncResult<CachedValue>>>;

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    /// Known key, never executed (or disabled).
    Idle,
    /// An execution is running. Prior data, if any, is still visible.
    Loading,
    Success,
    /// Last execution failed. Prior data, if any, is retained.
    Error,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Success => "success",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Result of one execution, as written into the store.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    Success(CachedValue),
    Failure(SyncError),
}

impl QueryOutcome {
    /// Wrap a typed value as a successful outcome.
    pub fn success<T: Any + Send + Sync>(value: T) -> Self {
        Self::Success(Arc::new(value))
    }

    pub fn failure(error: impl Into<SyncError>) -> Self {
        Self::Failure(error.into())
    }
}

impl From<SyncResult<CachedValue>> for QueryOutcome {
    fn from(result: SyncResult<CachedValue>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) => Self::Failure(err),
        }
    }
}

pub(crate) struct CacheEntry {
    pub(crate) key: QueryKey,
    pub(crate) status: QueryStatus,
    pub(crate) data: Option<CachedValue>,
    pub(crate) error: Option<SyncError>,
    pub(crate) fetched_at: Option<Instant>,
    pub(crate) stale_after: Duration,
    /// Set by invalidation; cleared by the next successful execution.
    pub(crate) invalidated: bool,
    /// Invalidation arrived while an execution was running, so its result
    /// may predate the change.
    pub(crate) invalidated_in_flight: bool,
    pub(crate) in_flight: Option<SharedExecution>,
    /// Store-wide id of the latest execution; stale completions are ignored.
    pub(crate) generation: u64,
    /// Store-wide stamp, renewed on put, subscribe and execution start; a
    /// pending eviction only fires if the epoch it captured is still current.
    pub(crate) epoch: u64,
}

impl CacheEntry {
    pub(crate) fn new(key: QueryKey, stale_after: Duration) -> Self {
        Self {
            key,
            status: QueryStatus::Idle,
            data: None,
            error: None,
            fetched_at: None,
            stale_after,
            invalidated: false,
            invalidated_in_flight: false,
            in_flight: None,
            generation: 0,
            epoch: 0,
        }
    }

    /// Fresh iff the last execution succeeded, nothing invalidated it, and
    /// `now - fetched_at < stale_after`.
    pub(crate) fn is_fresh(&self, now: Instant) -> bool {
        if self.status != QueryStatus::Success || self.invalidated {
            return false;
        }
        match self.fetched_at {
            Some(fetched_at) => now.saturating_duration_since(fetched_at) < self.stale_after,
            None => false,
        }
    }

    pub(crate) fn begin(&mut self, generation: u64, execution: SharedExecution) {
        self.generation = generation;
        self.in_flight = Some(execution);
        self.invalidated_in_flight = false;
        self.status = QueryStatus::Loading;
    }

    pub(crate) fn apply(&mut self, outcome: QueryOutcome, now: Instant) {
        match outcome {
            QueryOutcome::Success(value) => {
                self.status = QueryStatus::Success;
                self.data = Some(value);
                self.error = None;
                self.fetched_at = Some(now);
                self.invalidated = false;
            }
            QueryOutcome::Failure(error) => {
                // Prior data stays for display; the next read re-executes.
                self.status = QueryStatus::Error;
                self.error = Some(error);
                self.invalidated = true;
            }
        }
    }

    pub(crate) fn snapshot(&self, now: Instant) -> QuerySnapshot {
        QuerySnapshot {
            key: self.key.clone(),
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            fetched_at: self.fetched_at,
            is_stale: !self.is_fresh(now),
            is_fetching: self.in_flight.is_some(),
        }
    }
}

/// Immutable view of a cache entry at one instant.
#[derive(Debug, Clone)]
pub struct QuerySnapshot {
    key: QueryKey,
    status: QueryStatus,
    data: Option<CachedValue>,
    error: Option<SyncError>,
    fetched_at: Option<Instant>,
    is_stale: bool,
    is_fetching: bool,
}

impl QuerySnapshot {
    /// Snapshot for a key with no entry (absent or disabled).
    pub fn idle(key: QueryKey) -> Self {
        Self {
            key,
            status: QueryStatus::Idle,
            data: None,
            error: None,
            fetched_at: None,
            is_stale: true,
            is_fetching: false,
        }
    }

    /// Snapshot for a request rejected before execution.
    pub fn failed(key: QueryKey, error: SyncError) -> Self {
        Self {
            status: QueryStatus::Error,
            error: Some(error),
            ..Self::idle(key)
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// Typed access to the cached payload. `None` if there is no data or it
    /// was stored under a different type.
    pub fn data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.data.clone()?.downcast::<T>().ok()
    }

    /// Like [`data`](Self::data) but reports a type mismatch as an error.
    pub fn try_data<T: Any + Send + Sync>(&self) -> SyncResult<Option<Arc<T>>> {
        match self.data.clone() {
            None => Ok(None),
            Some(value) => value.downcast::<T>().map(Some).map_err(|_| {
                StorageError::TypeMismatch {
                    key: self.key.clone(),
                }
                .into()
            }),
        }
    }

    pub fn raw_data(&self) -> Option<&CachedValue> {
        self.data.as_ref()
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn error(&self) -> Option<&SyncError> {
        self.error.as_ref()
    }

    pub fn fetched_at(&self) -> Option<Instant> {
        self.fetched_at
    }

    /// Time since the last successful execution.
    pub fn age(&self) -> Option<Duration> {
        self.fetched_at
            .map(|at| Instant::now().saturating_duration_since(at))
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale
    }

    /// An execution for this key is in flight.
    pub fn is_fetching(&self) -> bool {
        self.is_fetching
    }

    /// Loading with nothing to show yet.
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading && self.data.is_none()
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }
}
