//! Partition cursors and the cursor refresh barrier.
//!
//! A [`Cursor`] is the opaque continuation token handed out by the remote
//! service. It is distinct from the numeric position: the position says
//! which offset the consumer wants next, the cursor is what the service
//! needs to serve it. Cursors expire server-side, so each one carries the
//! instant it was obtained and is refreshed once older than the TTL.
//!
//! [`CursorCache`] is shared between the fetcher (which replaces cursors
//! from fetch responses) and the coordinator (which refreshes them).
//! [`RefreshBarrier`] lets the fetcher wait until a batch of refreshes
//! has finished, successfully or not.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::partition::PartitionKey;

/// Opaque continuation token for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    token: String,
    obtained_at: Instant,
}

impl Cursor {
    /// Creates a cursor obtained now.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_obtained_at(token, Instant::now())
    }

    /// Creates a cursor with an explicit acquisition instant.
    #[must_use]
    pub fn with_obtained_at(token: impl Into<String>, obtained_at: Instant) -> Self {
        Self {
            token: token.into(),
            obtained_at,
        }
    }

    /// Returns the token to pass to the next fetch call.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Returns how long ago this cursor was obtained.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.obtained_at.elapsed()
    }

    /// Returns `true` once more than `ttl` has elapsed since creation.
    #[must_use]
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.age() > ttl
    }
}

/// Shared per-partition cursor map.
///
/// Cloning yields another handle to the same map.
#[derive(Debug, Clone, Default)]
pub struct CursorCache {
    cursors: Arc<Mutex<HashMap<PartitionKey, Cursor>>>,
}

impl CursorCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the cursor for a partition.
    #[must_use]
    pub fn get(&self, partition: &PartitionKey) -> Option<Cursor> {
        self.cursors.lock().get(partition).cloned()
    }

    /// Stores the cursor for a partition, replacing any previous one.
    pub fn insert(&self, partition: PartitionKey, cursor: Cursor) {
        self.cursors.lock().insert(partition, cursor);
    }

    /// Drops the cursor for a partition.
    pub fn remove(&self, partition: &PartitionKey) -> Option<Cursor> {
        self.cursors.lock().remove(partition)
    }

    /// Returns `true` if a cursor (expired or not) is cached.
    #[must_use]
    pub fn contains(&self, partition: &PartitionKey) -> bool {
        self.cursors.lock().contains_key(partition)
    }

    /// Returns `true` if the partition has no cursor or its cursor expired.
    #[must_use]
    pub fn needs_refresh(&self, partition: &PartitionKey, ttl: Duration) -> bool {
        self.cursors
            .lock()
            .get(partition)
            .map_or(true, |c| c.is_expired(ttl))
    }

    /// Returns the token of a non-expired cursor.
    #[must_use]
    pub fn valid_token(&self, partition: &PartitionKey, ttl: Duration) -> Option<String> {
        self.cursors
            .lock()
            .get(partition)
            .filter(|c| !c.is_expired(ttl))
            .map(|c| c.token().to_string())
    }

    /// Keeps only the cursors for which `keep` returns `true`.
    pub fn retain(&self, mut keep: impl FnMut(&PartitionKey) -> bool) {
        self.cursors.lock().retain(|p, _| keep(p));
    }

    /// Drops all cursors.
    pub fn clear(&self) {
        self.cursors.lock().clear();
    }

    /// Returns the number of cached cursors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cursors.lock().len()
    }

    /// Returns `true` if no cursor is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cursors.lock().is_empty()
    }
}

#[derive(Debug, Default)]
struct BarrierInner {
    remaining: AtomicUsize,
    notify: Notify,
}

/// Waits for a set of cursor refreshes to finish.
///
/// Each refresh holds a [`RefreshTicket`]; the barrier opens once every
/// ticket has been dropped. Dropping rather than an explicit call means
/// a refresh that fails, or whose task is torn down, still counts down.
#[derive(Debug, Clone, Default)]
pub struct RefreshBarrier {
    inner: Arc<BarrierInner>,
}

impl RefreshBarrier {
    /// Creates a barrier with no outstanding tickets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one outstanding refresh.
    #[must_use]
    pub fn ticket(&self) -> RefreshTicket {
        self.inner.remaining.fetch_add(1, Ordering::AcqRel);
        RefreshTicket {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Returns the number of tickets not yet dropped.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::Acquire)
    }

    /// Resolves once every ticket has been dropped.
    ///
    /// Cancel-safe; wrap in `tokio::time::timeout` to bound it.
    pub async fn wait(&self) {
        loop {
            // Registered before the check so a concurrent final drop is not missed.
            let notified = self.inner.notify.notified();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// One outstanding cursor refresh; counts the barrier down when dropped.
#[derive(Debug)]
pub struct RefreshTicket {
    inner: Arc<BarrierInner>,
}

impl Drop for RefreshTicket {
    fn drop(&mut self) {
        if self.inner.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.notify.notify_waiters();
        }
    }
}
