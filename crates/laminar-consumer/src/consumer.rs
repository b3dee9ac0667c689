//! Poll-based consumer facade.
//!
//! [`CursorConsumer`] wires the subscription state, coordinator and
//! fetcher together behind the familiar subscribe / poll / commit API.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{ConsumerConfig, OffsetResetStrategy};
use crate::coordinator::{Coordinator, StreamCoordinator};
use crate::cursor::CursorCache;
use crate::error::ConsumerError;
use crate::fetcher::Fetcher;
use crate::metrics::{ConsumerMetrics, ConsumerMetricsSnapshot};
use crate::partition::{OffsetAndMetadata, PartitionKey};
use crate::rebalance::RebalanceListener;
use crate::remote::{Record, StreamClient};
use crate::subscription::{SharedSubscriptionState, SubscriptionState, SubscriptionType};

/// Records returned by one [`CursorConsumer::poll`], grouped by partition.
#[derive(Debug, Clone, Default)]
pub struct ConsumerRecords {
    records: HashMap<PartitionKey, Vec<Record>>,
}

impl ConsumerRecords {
    /// Wraps fetched batches, dropping empty ones.
    #[must_use]
    pub fn new(mut records: HashMap<PartitionKey, Vec<Record>>) -> Self {
        records.retain(|_, batch| !batch.is_empty());
        Self { records }
    }

    /// Total number of records.
    #[must_use]
    pub fn count(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    /// Returns `true` if no records were returned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Partitions with at least one record.
    #[must_use]
    pub fn partitions(&self) -> HashSet<PartitionKey> {
        self.records.keys().cloned().collect()
    }

    /// Records of one partition, in the order the service returned them.
    #[must_use]
    pub fn records(&self, partition: &PartitionKey) -> &[Record] {
        self.records
            .get(partition)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Iterates over all records with their partition.
    pub fn iter(&self) -> impl Iterator<Item = (&PartitionKey, &Record)> {
        self.records
            .iter()
            .flat_map(|(p, batch)| batch.iter().map(move |r| (p, r)))
    }

    /// Returns the underlying per-partition map.
    #[must_use]
    pub fn into_inner(self) -> HashMap<PartitionKey, Vec<Record>> {
        self.records
    }
}

/// Consumer reading partitioned streams through an opaque-cursor service.
pub struct CursorConsumer {
    config: ConsumerConfig,
    client: Arc<dyn StreamClient>,
    subscriptions: SharedSubscriptionState,
    coordinator: Arc<StreamCoordinator>,
    fetcher: Fetcher,
    metrics: Arc<ConsumerMetrics>,
    last_commit_time: Instant,
    closed: bool,
}

impl CursorConsumer {
    /// Creates a consumer for `config.group_id`.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::ConfigurationError` if the configuration is invalid.
    pub fn new(client: Arc<dyn StreamClient>, config: ConsumerConfig) -> Result<Self, ConsumerError> {
        config.validate()?;

        let subscriptions = SubscriptionState::shared(config.auto_offset_reset);
        let cursors = CursorCache::new();
        let metrics = Arc::new(ConsumerMetrics::new());
        let coordinator = Arc::new(StreamCoordinator::new(
            config.group_id.clone(),
            Arc::clone(&client),
            Arc::clone(&subscriptions),
            cursors.clone(),
            Arc::clone(&metrics),
        ));
        let fetcher = Fetcher::new(
            &config,
            Arc::clone(&client),
            coordinator.clone(),
            Arc::clone(&subscriptions),
            cursors,
            Arc::clone(&metrics),
        );

        info!(group_id = %config.group_id, "cursor consumer created");
        Ok(Self {
            config,
            client,
            subscriptions,
            coordinator,
            fetcher,
            metrics,
            last_commit_time: Instant::now(),
            closed: false,
        })
    }

    /// Interrupts `poll` when `shutdown` becomes `true`.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.fetcher = self.fetcher.with_shutdown(shutdown);
        self
    }

    fn ensure_open(&self) -> Result<(), ConsumerError> {
        if self.closed {
            return Err(ConsumerError::Closed);
        }
        Ok(())
    }

    /// Subscribes to topics; partitions arrive through
    /// [`on_group_assignment`](Self::on_group_assignment).
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if another subscription mode is active.
    pub fn subscribe<I, S>(
        &mut self,
        topics: I,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), ConsumerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_open()?;
        self.subscriptions.lock().subscribe(topics, listener)
    }

    /// Subscribes to every topic matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidArgument` for an invalid pattern,
    /// `ConsumerError::InvalidState` if another subscription mode is active.
    pub fn subscribe_pattern(
        &mut self,
        pattern: &str,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), ConsumerError> {
        self.ensure_open()?;
        let pattern = Regex::new(pattern)
            .map_err(|e| ConsumerError::InvalidArgument(format!("invalid topic pattern: {e}")))?;
        self.subscriptions.lock().subscribe_pattern(pattern, listener)
    }

    /// Reports the topics currently matched by the pattern subscription.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` unless subscribed by pattern.
    pub fn update_matched_topics<I, S>(&mut self, topics: I) -> Result<(), ConsumerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_open()?;
        self.subscriptions.lock().change_subscription(topics)
    }

    /// Installs the partitions the group assigned to this consumer and
    /// clears any pending rebalance request.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` outside group management,
    /// `ConsumerError::InvalidArgument` for partitions outside the subscription.
    pub fn on_group_assignment<I>(&mut self, partitions: I) -> Result<(), ConsumerError>
    where
        I: IntoIterator<Item = PartitionKey>,
    {
        self.ensure_open()?;
        self.subscriptions.lock().assign_from_subscribed(partitions)?;
        self.coordinator.clear_rebalance_request();
        Ok(())
    }

    /// Assigns partitions directly.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if subscribed to topics or a pattern.
    pub fn assign<I>(&mut self, partitions: I) -> Result<(), ConsumerError>
    where
        I: IntoIterator<Item = PartitionKey>,
    {
        self.ensure_open()?;
        self.subscriptions.lock().assign_from_user(partitions)
    }

    /// Drops the subscription and every assigned partition.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::Closed` after `close`.
    pub fn unsubscribe(&mut self) -> Result<(), ConsumerError> {
        self.ensure_open()?;
        self.subscriptions.lock().unsubscribe();
        self.fetcher.shutdown();
        Ok(())
    }

    /// Returns the assigned partitions.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::Closed` after `close`.
    pub fn assignment(&self) -> Result<HashSet<PartitionKey>, ConsumerError> {
        self.ensure_open()?;
        Ok(self.subscriptions.lock().assigned_partitions())
    }

    /// Returns the subscribed topics.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::Closed` after `close`.
    pub fn subscription(&self) -> Result<BTreeSet<String>, ConsumerError> {
        self.ensure_open()?;
        Ok(self.subscriptions.lock().subscription())
    }

    /// Moves the position of `partition`; the next poll reads from `offset`.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if the partition is not
    /// assigned, `ConsumerError::InvalidArgument` for a negative offset.
    pub fn seek(&mut self, partition: &PartitionKey, offset: i64) -> Result<(), ConsumerError> {
        self.ensure_open()?;
        self.subscriptions.lock().seek(partition, offset)?;
        self.fetcher.invalidate(partition);
        debug!(partition = %partition, offset, "seek");
        Ok(())
    }

    /// Moves the given partitions to their earliest offset.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if any partition is not assigned.
    pub fn seek_to_beginning(&mut self, partitions: &[PartitionKey]) -> Result<(), ConsumerError> {
        self.reset_partitions(partitions, OffsetResetStrategy::Earliest)
    }

    /// Moves the given partitions past their latest record.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if any partition is not assigned.
    pub fn seek_to_end(&mut self, partitions: &[PartitionKey]) -> Result<(), ConsumerError> {
        self.reset_partitions(partitions, OffsetResetStrategy::Latest)
    }

    fn reset_partitions(
        &mut self,
        partitions: &[PartitionKey],
        strategy: OffsetResetStrategy,
    ) -> Result<(), ConsumerError> {
        self.ensure_open()?;
        let mut state = self.subscriptions.lock();
        if let Some(p) = partitions.iter().find(|p| !state.is_assigned(p)) {
            return Err(ConsumerError::not_assigned(p));
        }
        for partition in partitions {
            state.need_offset_reset_with(partition, strategy)?;
            self.fetcher.invalidate(partition);
        }
        Ok(())
    }

    /// Returns the offset of the next record to be read from `partition`,
    /// resolving it first if necessary.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if the partition is not
    /// assigned, or the error from resolving its position.
    pub async fn position(&mut self, partition: &PartitionKey) -> Result<i64, ConsumerError> {
        self.ensure_open()?;
        let current = self.subscriptions.lock().position(partition)?;
        if let Some(position) = current {
            return Ok(position);
        }
        self.coordinator
            .update_fetch_positions(&HashSet::from([partition.clone()]))
            .await?;
        self.subscriptions
            .lock()
            .position(partition)?
            .ok_or_else(|| {
                ConsumerError::Internal(format!("position of {partition} was not resolved"))
            })
    }

    /// Returns the last committed offset of `partition`, read from the service.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if the partition is not
    /// assigned, or the remote error.
    pub async fn committed(
        &mut self,
        partition: &PartitionKey,
    ) -> Result<Option<OffsetAndMetadata>, ConsumerError> {
        self.ensure_open()?;
        self.subscriptions.lock().committed(partition)?;

        let partitions = HashSet::from([partition.clone()]);
        let mut committed = self
            .client
            .committed_offsets(&self.config.group_id, &partitions)
            .await?;
        let offset = committed.remove(partition);

        let mut state = self.subscriptions.lock();
        if let Some(offset) = &offset {
            if state.is_assigned(partition) {
                state.set_committed(partition, offset.clone())?;
            }
        }
        Ok(offset)
    }

    /// Suspends fetching from the given partitions.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if any partition is not assigned.
    pub fn pause(&mut self, partitions: &[PartitionKey]) -> Result<(), ConsumerError> {
        self.ensure_open()?;
        let mut state = self.subscriptions.lock();
        if let Some(p) = partitions.iter().find(|p| !state.is_assigned(p)) {
            return Err(ConsumerError::not_assigned(p));
        }
        for partition in partitions {
            state.pause(partition)?;
            self.fetcher.pause(partition);
        }
        debug!(partitions = partitions.len(), "paused");
        Ok(())
    }

    /// Resumes fetching from the given partitions.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if any partition is not assigned.
    pub fn resume(&mut self, partitions: &[PartitionKey]) -> Result<(), ConsumerError> {
        self.ensure_open()?;
        let mut state = self.subscriptions.lock();
        if let Some(p) = partitions.iter().find(|p| !state.is_assigned(p)) {
            return Err(ConsumerError::not_assigned(p));
        }
        for partition in partitions {
            state.resume(partition)?;
        }
        debug!(partitions = partitions.len(), "resumed");
        Ok(())
    }

    /// Returns the paused partitions.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::Closed` after `close`.
    pub fn paused(&self) -> Result<HashSet<PartitionKey>, ConsumerError> {
        self.ensure_open()?;
        Ok(self.subscriptions.lock().paused_partitions())
    }

    /// Fetches records, waiting up to `timeout` for a fetch to finish.
    ///
    /// Returns after the first cycle in which any fetch finished, even if
    /// it failed or brought no records. `Duration::MAX` waits without a
    /// deadline.
    ///
    /// Commits consumed positions first when auto-commit is due.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if nothing is subscribed or
    /// assigned, or the error from resolving positions.
    pub async fn poll(&mut self, timeout: Duration) -> Result<ConsumerRecords, ConsumerError> {
        self.ensure_open()?;
        if self.subscriptions.lock().subscription_type() == SubscriptionType::None {
            return Err(ConsumerError::InvalidState(
                "consumer is not subscribed to any topics or assigned any partitions".into(),
            ));
        }
        self.maybe_commit_offsets().await;

        // `None` waits without a deadline.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            self.fetcher.send_fetch_requests().await?;

            let mut wait = deadline.map_or(Duration::MAX, |d| {
                d.saturating_duration_since(Instant::now())
            });
            if self.fetcher.in_flight_count() == 0 {
                // Nothing can complete; retry skipped partitions next cycle.
                wait = wait.min(self.config.cursor_refresh_timeout);
            }
            let outcome = self.fetcher.poll_completions(wait).await;

            if outcome.completed > 0
                || deadline.is_some_and(|d| Instant::now() >= d)
                || self.fetcher.shutdown_requested()
            {
                return Ok(ConsumerRecords::new(outcome.records));
            }
        }
    }

    async fn maybe_commit_offsets(&mut self) {
        if !self.config.enable_auto_commit
            || self.last_commit_time.elapsed() < self.config.auto_commit_interval
        {
            return;
        }

        let offsets = self.subscriptions.lock().all_consumed();
        if let Err(e) = self.coordinator.commit(&offsets).await {
            warn!(error = %e, "auto-commit failed");
        }
        self.last_commit_time = Instant::now();
    }

    /// Commits the positions of all assigned partitions.
    ///
    /// # Errors
    ///
    /// Returns the remote error if the commit was rejected.
    pub async fn commit_sync(&mut self) -> Result<(), ConsumerError> {
        self.ensure_open()?;
        let offsets = self.subscriptions.lock().all_consumed();
        self.coordinator.commit(&offsets).await?;
        self.last_commit_time = Instant::now();
        Ok(())
    }

    /// Commits explicit offsets.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidArgument` for a negative offset, or
    /// the remote error if the commit was rejected.
    pub async fn commit_offsets(
        &mut self,
        offsets: HashMap<PartitionKey, OffsetAndMetadata>,
    ) -> Result<(), ConsumerError> {
        self.ensure_open()?;
        if let Some((p, o)) = offsets.iter().find(|(_, o)| o.offset < 0) {
            return Err(ConsumerError::InvalidArgument(format!(
                "cannot commit negative offset {} for {p}",
                o.offset
            )));
        }
        self.coordinator.commit(&offsets).await
    }

    /// Returns `true` if a fetch error asked the group to rebalance.
    #[must_use]
    pub fn rebalance_pending(&self) -> bool {
        self.coordinator.rebalance_pending()
    }

    /// Returns a snapshot of the consumer metrics.
    #[must_use]
    pub fn metrics(&self) -> ConsumerMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Commits final positions (when auto-commit is enabled), stops all
    /// fetches and drops the subscription.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::Closed` if already closed.
    pub async fn close(&mut self) -> Result<(), ConsumerError> {
        self.ensure_open()?;
        info!(group_id = %self.config.group_id, "closing cursor consumer");

        if self.config.enable_auto_commit {
            let offsets = self.subscriptions.lock().all_consumed();
            if let Err(e) = self.coordinator.commit(&offsets).await {
                warn!(error = %e, "failed to commit final offsets");
            }
        }

        self.fetcher.shutdown();
        self.subscriptions.lock().unsubscribe();
        self.closed = true;
        info!(group_id = %self.config.group_id, "cursor consumer closed");
        Ok(())
    }
}

impl fmt::Debug for CursorConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorConsumer")
            .field("group_id", &self.config.group_id)
            .field("subscriptions", &*self.subscriptions.lock())
            .field("fetcher", &self.fetcher)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::rebalance::NoopRebalanceListener;
    use crate::testing::{mock_records, MockStreamClient, RecordingListener};

    const WAIT: Duration = Duration::from_secs(5);

    fn p0() -> PartitionKey {
        PartitionKey::new("events", 0)
    }

    fn p1() -> PartitionKey {
        PartitionKey::new("events", 1)
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            group_id: "billing".into(),
            auto_offset_reset: OffsetResetStrategy::Earliest,
            enable_auto_commit: false,
            ..ConsumerConfig::default()
        }
    }

    fn consumer(client: &Arc<MockStreamClient>, config: ConsumerConfig) -> CursorConsumer {
        CursorConsumer::new(client.clone(), config).unwrap()
    }

    #[test]
    fn test_consumer_records_accessors() {
        let records = ConsumerRecords::new(HashMap::from([
            (p0(), mock_records(0, 2)),
            (p1(), Vec::new()),
        ]));
        assert_eq!(records.count(), 2);
        assert!(!records.is_empty());
        assert_eq!(records.partitions(), HashSet::from([p0()]));
        assert!(records.records(&p1()).is_empty());
        assert_eq!(records.iter().count(), 2);
        assert_eq!(records.into_inner().len(), 1);
        assert!(ConsumerRecords::default().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        for threads in [0, usize::MAX] {
            let client = Arc::new(MockStreamClient::new());
            let err = CursorConsumer::new(
                client,
                ConsumerConfig {
                    max_fetch_threads: threads,
                    ..config()
                },
            )
            .unwrap_err();
            assert!(matches!(err, ConsumerError::ConfigurationError(_)));
        }
    }

    #[tokio::test]
    async fn test_assign_and_poll() {
        let client = Arc::new(MockStreamClient::new());
        client.append(&p0(), mock_records(0, 3));
        client.append(&p1(), mock_records(0, 2));
        let mut consumer = consumer(&client, config());
        consumer.assign([p0(), p1()]).unwrap();

        let mut total = 0;
        for _ in 0..20 {
            total += consumer.poll(Duration::from_millis(200)).await.unwrap().count();
            if total == 5 {
                break;
            }
        }
        assert_eq!(total, 5);
        assert_eq!(consumer.position(&p0()).await.unwrap(), 3);
        assert_eq!(consumer.position(&p1()).await.unwrap(), 2);
        assert_eq!(consumer.metrics().records_fetched, 5);
    }

    #[tokio::test]
    async fn test_poll_returns_after_transient_error() {
        let client = Arc::new(MockStreamClient::new());
        for _ in 0..100 {
            client.push_response(&p0(), Err(RemoteError::new("DIS.5000", "service busy")));
        }
        let mut consumer = consumer(&client, config());
        consumer.assign([p0()]).unwrap();

        let polled = consumer.poll(Duration::from_millis(200)).await.unwrap();
        assert!(polled.is_empty());
        assert_eq!(client.get_records_calls(), 1);
        assert_eq!(consumer.metrics().fetch_errors, 1);
    }

    #[tokio::test]
    async fn test_poll_requests_rebalance_once_for_invalid_session() {
        let client = Arc::new(MockStreamClient::new());
        for _ in 0..100 {
            client.push_response(&p0(), Err(RemoteError::new("DIS.4319", "session expired")));
        }
        let mut consumer = consumer(&client, config());
        consumer.assign([p0()]).unwrap();

        consumer.poll(Duration::from_millis(200)).await.unwrap();
        assert_eq!(client.get_records_calls(), 1);
        assert_eq!(client.resolve_count(&p0()), 1);
        assert_eq!(consumer.metrics().rebalance_requests, 1);
        assert!(consumer.rebalance_pending());
    }

    #[tokio::test]
    async fn test_poll_returns_after_empty_batch() {
        let client = Arc::new(MockStreamClient::new());
        let mut consumer = consumer(&client, config());
        consumer.assign([p0()]).unwrap();

        let polled = consumer.poll(Duration::from_millis(200)).await.unwrap();
        assert!(polled.is_empty());
        assert_eq!(client.get_records_calls(), 1);
    }

    #[tokio::test]
    async fn test_poll_without_deadline() {
        let client = Arc::new(MockStreamClient::new());
        client.append(&p0(), mock_records(0, 2));
        let mut consumer = consumer(&client, config());
        consumer.assign([p0()]).unwrap();

        let polled = tokio::time::timeout(WAIT, consumer.poll(Duration::MAX))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(polled.count(), 2);
    }

    #[tokio::test]
    async fn test_poll_requires_subscription() {
        let client = Arc::new(MockStreamClient::new());
        let mut consumer = consumer(&client, config());
        assert!(matches!(
            consumer.poll(Duration::from_millis(10)).await,
            Err(ConsumerError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_seek_rereads() {
        let client = Arc::new(MockStreamClient::new());
        client.append(&p0(), mock_records(0, 4));
        let mut consumer = consumer(&client, config());
        consumer.assign([p0()]).unwrap();

        let first = consumer.poll(WAIT).await.unwrap();
        assert_eq!(first.count(), 4);

        consumer.seek(&p0(), 1).unwrap();
        let again = consumer.poll(WAIT).await.unwrap();
        let seqs: Vec<i64> = again.records(&p0()).iter().map(|r| r.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_seek_to_end_and_beginning() {
        let client = Arc::new(MockStreamClient::new());
        client.append(&p0(), mock_records(0, 4));
        let mut consumer = consumer(&client, config());
        consumer.assign([p0()]).unwrap();

        consumer.seek_to_end(&[p0()]).unwrap();
        assert_eq!(consumer.position(&p0()).await.unwrap(), 4);
        consumer.seek_to_beginning(&[p0()]).unwrap();
        assert_eq!(consumer.position(&p0()).await.unwrap(), 0);

        assert!(consumer.seek_to_end(&[p1()]).is_err());
    }

    #[tokio::test]
    async fn test_pause_resume() {
        let client = Arc::new(MockStreamClient::new());
        client.append(&p0(), mock_records(0, 2));
        let mut consumer = consumer(&client, config());
        consumer.assign([p0()]).unwrap();

        consumer.pause(&[p0()]).unwrap();
        assert_eq!(consumer.paused().unwrap(), HashSet::from([p0()]));
        assert!(consumer.poll(Duration::from_millis(20)).await.unwrap().is_empty());

        consumer.resume(&[p0()]).unwrap();
        assert_eq!(consumer.poll(WAIT).await.unwrap().count(), 2);
        assert!(consumer.pause(&[p1()]).is_err());
    }

    #[tokio::test]
    async fn test_group_assignment_flow() {
        let client = Arc::new(MockStreamClient::new());
        client.append(&p0(), mock_records(0, 2));
        let listener = Arc::new(RecordingListener::new());
        let mut consumer = consumer(&client, config());

        consumer.subscribe(["events"], listener.clone()).unwrap();
        assert!(consumer.assign([p0()]).is_err());
        assert!(consumer.poll(Duration::from_millis(10)).await.unwrap().is_empty());

        consumer.on_group_assignment([p0()]).unwrap();
        assert_eq!(listener.assigned_count(), 1);
        assert_eq!(consumer.poll(WAIT).await.unwrap().count(), 2);

        consumer.unsubscribe().unwrap();
        assert_eq!(listener.revoked_count(), 1);
        assert!(consumer.assignment().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pattern_subscription() {
        let client = Arc::new(MockStreamClient::new());
        let mut consumer = consumer(&client, config());
        assert!(matches!(
            consumer.subscribe_pattern("(", Arc::new(NoopRebalanceListener)),
            Err(ConsumerError::InvalidArgument(_))
        ));
        consumer
            .subscribe_pattern("^ev", Arc::new(NoopRebalanceListener))
            .unwrap();
        consumer.update_matched_topics(["events"]).unwrap();
        assert_eq!(
            consumer.subscription().unwrap(),
            BTreeSet::from(["events".to_string()])
        );
        consumer.on_group_assignment([p0()]).unwrap();
        assert!(consumer
            .on_group_assignment([PartitionKey::new("audit", 0)])
            .is_err());
    }

    #[tokio::test]
    async fn test_commit_sync_and_committed() {
        let client = Arc::new(MockStreamClient::new());
        client.append(&p0(), mock_records(0, 3));
        let mut consumer = consumer(&client, config());
        consumer.assign([p0()]).unwrap();

        assert_eq!(consumer.committed(&p0()).await.unwrap(), None);
        consumer.poll(WAIT).await.unwrap();
        consumer.commit_sync().await.unwrap();

        assert_eq!(client.committed()[&p0()].offset, 3);
        assert_eq!(consumer.committed(&p0()).await.unwrap().unwrap().offset, 3);
        assert_eq!(consumer.metrics().commits, 1);
    }

    #[tokio::test]
    async fn test_commit_offsets_rejects_negative() {
        let client = Arc::new(MockStreamClient::new());
        let mut consumer = consumer(&client, config());
        consumer.assign([p0()]).unwrap();
        let err = consumer
            .commit_offsets(HashMap::from([(p0(), OffsetAndMetadata::new(-1))]))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::InvalidArgument(_)));
        assert_eq!(client.commit_calls(), 0);
    }

    #[tokio::test]
    async fn test_resumes_from_committed_offset() {
        let client = Arc::new(MockStreamClient::new());
        client.append(&p0(), mock_records(0, 5));
        client.set_committed(&p0(), 3);
        let mut consumer = consumer(&client, config());
        consumer.assign([p0()]).unwrap();

        let records = consumer.poll(WAIT).await.unwrap();
        let seqs: Vec<i64> = records.records(&p0()).iter().map(|r| r.sequence_number).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_auto_commit_on_poll() {
        let client = Arc::new(MockStreamClient::new());
        client.append(&p0(), mock_records(0, 2));
        let mut consumer = consumer(
            &client,
            ConsumerConfig {
                enable_auto_commit: true,
                auto_commit_interval: Duration::ZERO,
                ..config()
            },
        );
        consumer.assign([p0()]).unwrap();

        consumer.poll(WAIT).await.unwrap();
        consumer.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(client.committed()[&p0()].offset, 2);
    }

    #[tokio::test]
    async fn test_close_commits_and_rejects_calls() {
        let client = Arc::new(MockStreamClient::new());
        client.append(&p0(), mock_records(0, 2));
        let mut consumer = consumer(
            &client,
            ConsumerConfig {
                enable_auto_commit: true,
                ..config()
            },
        );
        consumer.assign([p0()]).unwrap();
        consumer.poll(WAIT).await.unwrap();

        consumer.close().await.unwrap();
        assert_eq!(client.committed()[&p0()].offset, 2);
        assert!(matches!(
            consumer.poll(WAIT).await,
            Err(ConsumerError::Closed)
        ));
        assert!(matches!(consumer.assignment(), Err(ConsumerError::Closed)));
        assert!(matches!(consumer.close().await, Err(ConsumerError::Closed)));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_poll() {
        let client = Arc::new(MockStreamClient::new());
        let (tx, rx) = watch::channel(false);
        let mut consumer = consumer(&client, config()).with_shutdown(rx);
        consumer.assign([p0()]).unwrap();
        client.close_gate();

        consumer.poll(Duration::from_millis(10)).await.unwrap();
        tx.send(true).unwrap();
        let polled = tokio::time::timeout(WAIT, consumer.poll(Duration::from_secs(60)))
            .await
            .unwrap()
            .unwrap();
        assert!(polled.is_empty());
        client.open_gate();
    }
}
