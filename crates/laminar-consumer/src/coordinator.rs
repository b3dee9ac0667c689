//! Position resolution, cursor refresh and rebalance signaling.
//!
//! The [`Coordinator`] is the fetcher's view of everything outside the
//! fetch path: it decides where a partition without a position starts,
//! refreshes cursors in the background, and raises the rebalance flag
//! that the group membership layer acts on.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::OffsetResetStrategy;
use crate::cursor::{Cursor, CursorCache, RefreshTicket};
use crate::error::ConsumerError;
use crate::metrics::ConsumerMetrics;
use crate::partition::{OffsetAndMetadata, PartitionKey};
use crate::remote::StreamClient;
use crate::subscription::SharedSubscriptionState;

/// Group-side operations the fetcher depends on.
#[async_trait]
pub trait Coordinator: Send + Sync + fmt::Debug {
    /// Establishes positions for the given partitions that lack one.
    ///
    /// A pending reset uses its own strategy; otherwise the committed
    /// offset wins over the default strategy.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::NoOffsetForPartition` when the strategy is
    /// `none` and nothing was committed, or the remote error that
    /// prevented resolving an offset.
    async fn update_fetch_positions(
        &self,
        partitions: &HashSet<PartitionKey>,
    ) -> Result<(), ConsumerError>;

    /// Refreshes the cursor of `partition` at its current position in
    /// the background. `ticket` is dropped when the refresh finishes,
    /// whatever the outcome.
    fn seek(&self, partition: &PartitionKey, ticket: RefreshTicket);

    /// Flags that group membership must be renegotiated.
    fn request_rebalance(&self);

    /// Commits offsets for the group.
    ///
    /// # Errors
    ///
    /// Returns the remote error if the commit was rejected.
    async fn commit(
        &self,
        _offsets: &HashMap<PartitionKey, OffsetAndMetadata>,
    ) -> Result<(), ConsumerError> {
        Ok(())
    }
}

/// [`Coordinator`] backed by a [`StreamClient`].
pub struct StreamCoordinator {
    group_id: String,
    client: Arc<dyn StreamClient>,
    subscriptions: SharedSubscriptionState,
    cursors: CursorCache,
    metrics: Arc<ConsumerMetrics>,
    rebalance_pending: AtomicBool,
    rebalance_requests: AtomicU64,
}

impl StreamCoordinator {
    /// Creates a coordinator sharing the subscription state and cursor
    /// cache with the fetcher.
    #[must_use]
    pub fn new(
        group_id: impl Into<String>,
        client: Arc<dyn StreamClient>,
        subscriptions: SharedSubscriptionState,
        cursors: CursorCache,
        metrics: Arc<ConsumerMetrics>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            client,
            subscriptions,
            cursors,
            metrics,
            rebalance_pending: AtomicBool::new(false),
            rebalance_requests: AtomicU64::new(0),
        }
    }

    /// Returns the consumer group id.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Returns `true` while a rebalance request has not been handled.
    #[must_use]
    pub fn rebalance_pending(&self) -> bool {
        self.rebalance_pending.load(Ordering::Acquire)
    }

    /// Marks the pending rebalance as handled.
    pub fn clear_rebalance_request(&self) {
        self.rebalance_pending.store(false, Ordering::Release);
    }

    /// Returns how often `request_rebalance` has been called.
    #[must_use]
    pub fn rebalance_requests(&self) -> u64 {
        self.rebalance_requests.load(Ordering::Relaxed)
    }

    async fn refresh_committed_offsets(&self) -> Result<(), ConsumerError> {
        let partitions = {
            let state = self.subscriptions.lock();
            if !state.refresh_commits_needed() {
                return Ok(());
            }
            state.assigned_partitions()
        };

        let committed = self
            .client
            .committed_offsets(&self.group_id, &partitions)
            .await?;
        debug!(
            group_id = %self.group_id,
            partitions = partitions.len(),
            committed = committed.len(),
            "refreshed committed offsets"
        );

        let mut state = self.subscriptions.lock();
        for (partition, offset) in committed {
            if state.is_assigned(&partition) {
                state.set_committed(&partition, offset)?;
            }
        }
        state.commits_refreshed();
        Ok(())
    }

    async fn reset_offset(
        &self,
        partition: &PartitionKey,
        strategy: OffsetResetStrategy,
    ) -> Result<i64, ConsumerError> {
        let offset = match strategy {
            OffsetResetStrategy::Earliest => self.client.offset_range(partition).await?.earliest,
            OffsetResetStrategy::Latest => self.client.offset_range(partition).await?.latest,
            OffsetResetStrategy::None => {
                return Err(ConsumerError::NoOffsetForPartition(partition.clone()))
            }
        };
        debug!(partition = %partition, strategy = %strategy, offset, "reset offset");
        Ok(offset)
    }
}

#[async_trait]
impl Coordinator for StreamCoordinator {
    async fn update_fetch_positions(
        &self,
        partitions: &HashSet<PartitionKey>,
    ) -> Result<(), ConsumerError> {
        self.refresh_committed_offsets().await?;

        for partition in partitions {
            let (reset, committed, default_strategy) = {
                let state = self.subscriptions.lock();
                if !state.is_assigned(partition) || state.position(partition)?.is_some() {
                    continue;
                }
                (
                    state.reset_strategy(partition),
                    state.committed(partition)?,
                    state.default_reset_strategy(),
                )
            };

            let offset = match (reset, committed) {
                (Some(strategy), _) => self.reset_offset(partition, strategy).await?,
                (None, Some(committed)) => committed.offset,
                (None, None) => self.reset_offset(partition, default_strategy).await?,
            };

            let mut state = self.subscriptions.lock();
            if state.is_assigned(partition) {
                state.seek(partition, offset)?;
            }
        }
        Ok(())
    }

    fn seek(&self, partition: &PartitionKey, ticket: RefreshTicket) {
        let position = match self.subscriptions.lock().position(partition) {
            Ok(Some(position)) => position,
            Ok(None) | Err(_) => {
                warn!(partition = %partition, "cannot refresh cursor without a position");
                return;
            }
        };

        let client = Arc::clone(&self.client);
        let subscriptions = Arc::clone(&self.subscriptions);
        let cursors = self.cursors.clone();
        let metrics = Arc::clone(&self.metrics);
        let partition = partition.clone();

        tokio::spawn(async move {
            let _ticket = ticket;
            match client.resolve_cursor(&partition, position).await {
                Ok(token) => {
                    metrics.record_cursor_refresh(true);
                    // The position may have moved while the call was outstanding.
                    let current = subscriptions.lock().position(&partition).ok().flatten();
                    if current == Some(position) {
                        debug!(partition = %partition, position, "cursor refreshed");
                        cursors.insert(partition, Cursor::new(token));
                    } else {
                        debug!(partition = %partition, position, "discarding stale cursor");
                    }
                }
                Err(e) => {
                    metrics.record_cursor_refresh(false);
                    error!(partition = %partition, position, error = %e, "cursor refresh failed");
                }
            }
        });
    }

    fn request_rebalance(&self) {
        self.rebalance_requests.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_rebalance_request();
        if !self.rebalance_pending.swap(true, Ordering::AcqRel) {
            warn!(group_id = %self.group_id, "rebalance requested");
        }
    }

    async fn commit(
        &self,
        offsets: &HashMap<PartitionKey, OffsetAndMetadata>,
    ) -> Result<(), ConsumerError> {
        if offsets.is_empty() {
            return Ok(());
        }
        self.client.commit_offsets(&self.group_id, offsets).await?;
        self.metrics.record_commit();

        let mut state = self.subscriptions.lock();
        for (partition, offset) in offsets {
            if state.is_assigned(partition) {
                state.set_committed(partition, offset.clone())?;
            }
        }
        info!(group_id = %self.group_id, partitions = offsets.len(), "committed offsets");
        Ok(())
    }
}

impl fmt::Debug for StreamCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCoordinator")
            .field("group_id", &self.group_id)
            .field("rebalance_pending", &self.rebalance_pending())
            .field("rebalance_requests", &self.rebalance_requests())
            .finish_non_exhaustive()
    }
}
