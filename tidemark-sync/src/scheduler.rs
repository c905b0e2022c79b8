//! Time-driven refresh for keys that declare a polling interval.
//!
//! A poll is shared by the subscriptions that asked for it, each holding a
//! [`PollHold`]. Each tick invalidates the key, and subscribed views
//! re-execute on that invalidation. The timer runs at the shortest interval
//! any current holder asked for, and is aborted when the last holder cancels.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tidemark_core::{KeyMatcher, QueryKey, StorageError, SyncResult, ValidationError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::store::CacheStore;

/// One holder's claim on the poll of a key.
///
/// Holds are never reused, so releasing one that [`RefreshScheduler::shutdown`]
/// already dropped has no effect on polls started afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollHold {
    key: QueryKey,
    id: u64,
}

impl PollHold {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

struct ScheduledPoll {
    interval: Duration,
    holders: BTreeMap<u64, Duration>,
    task: JoinHandle<()>,
}

impl ScheduledPoll {
    fn shortest(&self) -> Option<Duration> {
        self.holders.values().min().copied()
    }
}

#[derive(Default)]
struct PollTable {
    polls: HashMap<QueryKey, ScheduledPoll>,
    next_hold: u64,
}

/// Owns every active poll timer for a session.
pub struct RefreshScheduler {
    store: Weak<CacheStore>,
    table: Mutex<PollTable>,
}

impl RefreshScheduler {
    pub fn new(store: &Arc<CacheStore>) -> Self {
        Self {
            store: Arc::downgrade(store),
            table: Mutex::new(PollTable::default()),
        }
    }

    fn table(&self) -> MutexGuard<'_, PollTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a holder for polling `key` every `interval`.
    ///
    /// The first holder starts the timer; its first tick is one interval
    /// out. A later holder asking for a shorter interval restarts the timer
    /// with that interval.
    pub fn schedule_poll(&self, key: &QueryKey, interval: Duration) -> SyncResult<PollHold> {
        if interval.is_zero() {
            return Err(ValidationError::InvalidValue {
                field: "poll_interval".to_string(),
                reason: "must be > 0".to_string(),
            }
            .into());
        }
        let mut table = self.table();
        let id = table.next_hold + 1;
        match table.polls.get_mut(key) {
            Some(poll) => {
                if interval < poll.interval {
                    let task = self.spawn_timer(key.clone(), interval)?;
                    std::mem::replace(&mut poll.task, task).abort();
                    poll.interval = interval;
                }
                poll.holders.insert(id, interval);
            }
            None => {
                let task = self.spawn_timer(key.clone(), interval)?;
                debug!(key = %key, interval_ms = interval.as_millis() as u64, "Starting poll");
                table.polls.insert(
                    key.clone(),
                    ScheduledPoll {
                        interval,
                        holders: BTreeMap::from([(id, interval)]),
                        task,
                    },
                );
            }
        }
        table.next_hold = id;
        Ok(PollHold {
            key: key.clone(),
            id,
        })
    }

    /// Release `hold`. Returns true if that stopped the timer.
    ///
    /// When the shortest interval leaves, the timer restarts at the
    /// shortest one still held.
    pub fn cancel_poll(&self, hold: &PollHold) -> bool {
        let mut table = self.table();
        let Some(poll) = table.polls.get_mut(&hold.key) else {
            return false;
        };
        if poll.holders.remove(&hold.id).is_none() {
            return false;
        }
        let Some(shortest) = poll.shortest() else {
            if let Some(poll) = table.polls.remove(&hold.key) {
                poll.task.abort();
                debug!(key = %hold.key, "Stopped poll");
            }
            return true;
        };
        if shortest != poll.interval {
            match self.spawn_timer(hold.key.clone(), shortest) {
                Ok(task) => {
                    std::mem::replace(&mut poll.task, task).abort();
                    poll.interval = shortest;
                    debug!(key = %hold.key, interval_ms = shortest.as_millis() as u64, "Poll interval relaxed");
                }
                Err(err) => {
                    warn!(key = %hold.key, error = %err, "Keeping previous poll interval");
                }
            }
        }
        false
    }

    /// Keys with a running timer, sorted.
    pub fn active_polls(&self) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = self.table().polls.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn interval_for(&self, key: &QueryKey) -> Option<Duration> {
        self.table().polls.get(key).map(|p| p.interval)
    }

    pub fn holder_count(&self, key: &QueryKey) -> usize {
        self.table().polls.get(key).map_or(0, |p| p.holders.len())
    }

    /// Abort every timer regardless of holders. Outstanding holds release
    /// nothing afterwards.
    pub fn shutdown(&self) {
        for (_, poll) in self.table().polls.drain() {
            poll.task.abort();
        }
    }

    fn spawn_timer(&self, key: QueryKey, interval: Duration) -> SyncResult<JoinHandle<()>> {
        let Some(runtime) = self.store.upgrade().and_then(|store| store.runtime()) else {
            return Err(StorageError::RuntimeUnavailable { key }.into());
        };
        let store = self.store.clone();
        Ok(runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let matcher = KeyMatcher::exact(key);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                debug!(key = %matcher, "Poll tick");
                if let Err(err) = store.invalidate(&matcher) {
                    warn!(key = %matcher, error = %err, "Poll invalidation failed");
                }
            }
        }))
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
