//! Tidemark Sync - Client-Side Query Cache
//!
//! Keeps views of remote data consistent without every view re-fetching on
//! its own:
//!
//! - [`CacheStore`]: keyed results with freshness metadata and observers
//! - [`QueryCoordinator`]: single-flight reads against the store
//! - [`MutationCoordinator`]: writes followed by declared invalidations
//! - [`RefreshScheduler`]: periodic invalidation for polled keys
//! - [`LiveQuery`]: a mounted view that re-requests on invalidation
//!
//! [`SyncClient`] owns one of each for an application session.

pub mod client;
pub mod entry;
pub mod mutation;
pub mod query;
pub mod scheduler;
pub mod store;
pub mod subscription;

pub use client::SyncClient;
pub use entry::{CachedValue, QueryOutcome, QuerySnapshot, QueryStatus};
pub use mutation::{Mutation, MutationCoordinator, MutationDescriptor};
pub use query::{executor, Executor, QueryCoordinator, QueryOptions, RetryPolicy};
pub use scheduler::{PollHold, RefreshScheduler};
pub use store::{CacheCallback, CacheEvent, CacheEventKind, CacheStats, CacheStore, SubscriptionId};
pub use subscription::LiveQuery;

pub use tidemark_core::{query_key, KeyMatcher, QueryKey, SyncConfig, SyncError, SyncResult};
