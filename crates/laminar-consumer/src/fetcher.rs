//! Concurrent fetch dispatch and completion draining.
//!
//! The [`Fetcher`] is driven from a single task in two steps:
//!
//! 1. [`send_fetch_requests`](Fetcher::send_fetch_requests) resolves
//!    missing positions, refreshes absent or expired cursors (waiting a
//!    bounded time for the refreshes), then starts at most one fetch per
//!    fetchable partition.
//! 2. [`fetch_records`](Fetcher::fetch_records) waits for at least one
//!    fetch to complete and drains every completion that is ready,
//!    advancing positions and replacing cursors.
//!
//! Fetches run as tokio tasks bounded by a semaphore and report back on an
//! unbounded channel. Each dispatch carries an id so completions of
//! fetches dropped by pause or unassignment are recognised and ignored.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::ConsumerConfig;
use crate::coordinator::Coordinator;
use crate::cursor::{Cursor, CursorCache, RefreshBarrier};
use crate::error::{ConsumerError, RemoteError, RemoteErrorKind};
use crate::metrics::ConsumerMetrics;
use crate::partition::PartitionKey;
use crate::remote::{GetRecordsRequest, GetRecordsResponse, Record, StreamClient};
use crate::subscription::SharedSubscriptionState;

/// An outstanding fetch for one partition.
#[derive(Debug)]
struct InFlightFetch {
    id: u64,
    handle: JoinHandle<()>,
    dispatched_at: Instant,
}

/// Outcome of one fetch, sent from the fetch task to the driver.
#[derive(Debug)]
struct FetchCompletion {
    id: u64,
    partition: PartitionKey,
    result: Result<GetRecordsResponse, RemoteError>,
}

/// Result of draining fetch completions.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Records per partition, each batch in response order.
    pub records: HashMap<PartitionKey, Vec<Record>>,
    /// Outstanding fetches that finished, successfully or not.
    pub completed: usize,
}

/// Shared handles a fetch task needs.
#[derive(Clone)]
struct FetchContext {
    client: Arc<dyn StreamClient>,
    coordinator: Arc<dyn Coordinator>,
    cursors: CursorCache,
    metrics: Arc<ConsumerMetrics>,
    permits: Arc<Semaphore>,
    session_invalid_codes: Arc<[String]>,
    completions: mpsc::UnboundedSender<FetchCompletion>,
}

/// Dispatches fetches and drains their results.
pub struct Fetcher {
    ctx: FetchContext,
    subscriptions: SharedSubscriptionState,
    max_partition_fetch_records: usize,
    cursor_ttl: Duration,
    cursor_refresh_timeout: Duration,
    in_flight: HashMap<PartitionKey, InFlightFetch>,
    completions: mpsc::UnboundedReceiver<FetchCompletion>,
    next_dispatch_id: u64,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Fetcher {
    /// Creates a fetcher.
    ///
    /// `cursors` must be the cache the coordinator refreshes into.
    #[must_use]
    pub fn new(
        config: &ConsumerConfig,
        client: Arc<dyn StreamClient>,
        coordinator: Arc<dyn Coordinator>,
        subscriptions: SharedSubscriptionState,
        cursors: CursorCache,
        metrics: Arc<ConsumerMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            ctx: FetchContext {
                client,
                coordinator,
                cursors,
                metrics,
                permits: Arc::new(Semaphore::new(config.max_fetch_threads)),
                session_invalid_codes: config.session_invalid_codes.clone().into(),
                completions: tx,
            },
            subscriptions,
            max_partition_fetch_records: config.max_partition_fetch_records,
            cursor_ttl: config.cursor_ttl,
            cursor_refresh_timeout: config.cursor_refresh_timeout,
            in_flight: HashMap::new(),
            completions: rx,
            next_dispatch_id: 0,
            shutdown: None,
        }
    }

    /// Interrupts the suspension points when `shutdown` becomes `true`.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Returns `true` once the shutdown signal has fired.
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Returns the cursor cache.
    #[must_use]
    pub fn cursors(&self) -> &CursorCache {
        &self.ctx.cursors
    }

    /// Returns the number of outstanding fetches.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns `true` if a fetch is outstanding for `partition`.
    #[must_use]
    pub fn has_in_flight(&self, partition: &PartitionKey) -> bool {
        self.in_flight.contains_key(partition)
    }

    /// Starts fetches for every fetchable partition without one in flight.
    ///
    /// Partitions whose cursor could not be refreshed in time are skipped
    /// until the next call.
    ///
    /// # Errors
    ///
    /// Returns the error from resolving missing positions.
    pub async fn send_fetch_requests(&mut self) -> Result<(), ConsumerError> {
        self.prune();

        let missing = {
            let state = self.subscriptions.lock();
            if state.has_all_fetch_positions() {
                None
            } else {
                Some(state.missing_fetch_positions())
            }
        };
        if let Some(missing) = missing {
            // Cursors and fetches issued for the old position are void.
            for partition in &missing {
                self.invalidate(partition);
            }
            debug!(partitions = missing.len(), "resolving missing fetch positions");
            self.ctx.coordinator.update_fetch_positions(&missing).await?;
        }

        let needs_cursor: Vec<PartitionKey> = self
            .subscriptions
            .lock()
            .fetchable_partitions()
            .into_iter()
            .filter(|p| {
                !self.in_flight.contains_key(p) && self.ctx.cursors.needs_refresh(p, self.cursor_ttl)
            })
            .collect();

        if !needs_cursor.is_empty() {
            let barrier = RefreshBarrier::new();
            for partition in &needs_cursor {
                self.ctx.coordinator.seek(partition, barrier.ticket());
            }
            debug!(partitions = needs_cursor.len(), "waiting for cursor refresh");

            tokio::select! {
                waited = tokio::time::timeout(self.cursor_refresh_timeout, barrier.wait()) => {
                    if waited.is_err() {
                        warn!(
                            pending = barrier.remaining(),
                            timeout_ms = self.cursor_refresh_timeout.as_millis(),
                            "timed out waiting for cursor refresh"
                        );
                    }
                }
                () = shutdown_signalled(&mut self.shutdown) => {
                    warn!(pending = barrier.remaining(), "interrupted while waiting for cursor refresh");
                    return Ok(());
                }
            }
        }

        let fetchable = self.subscriptions.lock().fetchable_partitions();
        for partition in fetchable {
            if self.in_flight.contains_key(&partition) {
                continue;
            }
            match self.ctx.cursors.valid_token(&partition, self.cursor_ttl) {
                Some(cursor) => self.dispatch(partition, cursor),
                None => warn!(partition = %partition, "no valid cursor, skipping partition"),
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, partition: PartitionKey, cursor: String) {
        let id = self.next_dispatch_id;
        self.next_dispatch_id += 1;

        let request = GetRecordsRequest {
            partition: partition.clone(),
            cursor,
            limit: self.max_partition_fetch_records,
        };
        let handle = tokio::spawn(run_fetch(id, request, self.ctx.clone()));
        self.ctx.metrics.record_dispatch();
        debug!(partition = %partition, id, "fetch dispatched");

        self.in_flight.insert(
            partition,
            InFlightFetch {
                id,
                handle,
                dispatched_at: Instant::now(),
            },
        );
    }

    /// Waits up to `timeout` for a fetch to complete, then drains all
    /// completed fetches.
    ///
    /// Returns records per partition, each batch in response order.
    /// Partitions whose fetch did not complete are absent. Cancel-safe.
    pub async fn fetch_records(&mut self, timeout: Duration) -> HashMap<PartitionKey, Vec<Record>> {
        self.poll_completions(timeout).await.records
    }

    /// Like [`fetch_records`](Self::fetch_records), but also reports how
    /// many outstanding fetches finished, including failed ones and empty
    /// batches.
    pub async fn poll_completions(&mut self, timeout: Duration) -> FetchOutcome {
        self.prune();
        let mut outcome = FetchOutcome::default();

        let first = tokio::select! {
            completion = self.completions.recv() => completion,
            () = tokio::time::sleep(timeout) => None,
            () = shutdown_signalled(&mut self.shutdown) => {
                warn!(in_flight = self.in_flight.len(), "interrupted while waiting for fetches");
                None
            }
        };
        if let Some(completion) = first {
            self.complete(completion, &mut outcome);
        }
        while let Ok(completion) = self.completions.try_recv() {
            self.complete(completion, &mut outcome);
        }
        outcome
    }

    fn complete(&mut self, completion: FetchCompletion, outcome: &mut FetchOutcome) {
        let FetchCompletion {
            id,
            partition,
            result,
        } = completion;

        match self.in_flight.get(&partition) {
            Some(flight) if flight.id == id => {
                debug!(
                    partition = %partition,
                    id,
                    elapsed_ms = flight.dispatched_at.elapsed().as_millis(),
                    "fetch completed"
                );
            }
            _ => {
                debug!(partition = %partition, id, "discarding stale fetch completion");
                return;
            }
        }
        self.in_flight.remove(&partition);
        outcome.completed += 1;

        // Already logged and classified by the fetch task.
        let Ok(response) = result else {
            return;
        };

        let mut state = self.subscriptions.lock();
        if !state.is_fetchable(&partition) {
            debug!(partition = %partition, "discarding fetch for partition no longer fetchable");
            if !state.is_assigned(&partition) {
                self.ctx.cursors.remove(&partition);
            }
            return;
        }

        match response.next_cursor.filter(|c| !c.is_empty()) {
            Some(token) => self.ctx.cursors.insert(partition.clone(), Cursor::new(token)),
            None => {
                self.ctx.cursors.remove(&partition);
            }
        }

        let bytes: usize = response.records.iter().map(|r| r.data.len()).sum();
        self.ctx
            .metrics
            .record_fetch(response.records.len() as u64, bytes as u64);

        if let Some(last) = response.records.last() {
            let next = last.sequence_number + 1;
            let current = state.position(&partition).ok().flatten();
            if current.map_or(true, |c| next > c) {
                if let Err(e) = state.set_position(&partition, next) {
                    warn!(partition = %partition, error = %e, "failed to advance position");
                }
            }
        }

        outcome
            .records
            .entry(partition)
            .or_default()
            .extend(response.records);
    }

    /// Drops the outstanding fetch and the cursor of a paused partition.
    pub fn pause(&mut self, partition: &PartitionKey) {
        self.invalidate(partition);
    }

    /// Drops the outstanding fetch and the cursor of `partition`, so the
    /// next cycle refreshes its cursor at the current position.
    pub fn invalidate(&mut self, partition: &PartitionKey) {
        if let Some(flight) = self.in_flight.remove(partition) {
            flight.handle.abort();
            debug!(partition = %partition, id = flight.id, "fetch aborted");
        }
        self.ctx.cursors.remove(partition);
    }

    /// Aborts every outstanding fetch and drops all cursors.
    pub fn shutdown(&mut self) {
        for (_, flight) in self.in_flight.drain() {
            flight.handle.abort();
        }
        self.ctx.cursors.clear();
        while self.completions.try_recv().is_ok() {}
    }

    /// Drops fetches and cursors of partitions that are no longer assigned
    /// or are paused.
    fn prune(&mut self) {
        let active = self.subscriptions.lock().active_partitions();
        self.in_flight.retain(|partition, flight| {
            let keep = active.contains(partition);
            if !keep {
                flight.handle.abort();
                debug!(partition = %partition, id = flight.id, "dropped fetch of inactive partition");
            }
            keep
        });
        self.ctx.cursors.retain(|p| active.contains(p));
    }
}

impl Drop for Fetcher {
    fn drop(&mut self) {
        for flight in self.in_flight.values() {
            flight.handle.abort();
        }
    }
}

impl fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetcher")
            .field("in_flight", &self.in_flight.len())
            .field("cursors", &self.ctx.cursors.len())
            .field("max_partition_fetch_records", &self.max_partition_fetch_records)
            .finish_non_exhaustive()
    }
}

async fn run_fetch(id: u64, request: GetRecordsRequest, ctx: FetchContext) {
    let partition = request.partition.clone();
    // The semaphore is never closed.
    let _permit = ctx.permits.acquire().await.ok();
    let result = ctx.client.get_records(request).await;

    if let Err(e) = &result {
        ctx.metrics.record_fetch_error();
        match e.kind(&ctx.session_invalid_codes) {
            RemoteErrorKind::SessionInvalid => {
                error!(partition = %partition, error = %e, "cursor or session invalid, requesting rebalance");
                ctx.cursors.remove(&partition);
                ctx.coordinator.request_rebalance();
            }
            RemoteErrorKind::Transient => {
                error!(partition = %partition, error = %e, "fetch failed, retrying next cycle");
            }
        }
    }

    // The receiver lives as long as the fetcher.
    let _ = ctx.completions.send(FetchCompletion {
        id,
        partition,
        result,
    });
}

/// Resolves once shutdown is signalled; never resolves without a signal.
async fn shutdown_signalled(shutdown: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown {
        if rx.wait_for(|stop| *stop).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await;
}
