//! Testing utilities for the consumer.
//!
//! [`MockStreamClient`] serves records from in-memory partition logs and
//! can be scripted with canned responses and errors. [`RecordingListener`]
//! records rebalance callbacks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::RemoteError;
use crate::partition::{OffsetAndMetadata, PartitionKey};
use crate::rebalance::RebalanceListener;
use crate::remote::{GetRecordsRequest, GetRecordsResponse, OffsetRange, Record, StreamClient};

/// Builds `n` records starting at `start`, with payload `"value_{seq}"`.
#[must_use]
pub fn mock_records(start: i64, n: usize) -> Vec<Record> {
    (start..)
        .take(n)
        .map(|seq| Record::new(seq, format!("value_{seq}")))
        .collect()
}

/// Returns the cursor token [`MockStreamClient`] hands out for a position.
#[must_use]
pub fn mock_cursor(partition: &PartitionKey, position: i64) -> String {
    format!("{partition}:{position}")
}

fn position_of(cursor: &str) -> Option<i64> {
    cursor.rsplit_once(':').and_then(|(_, pos)| pos.parse().ok())
}

/// In-memory stream service.
///
/// `get_records` first returns any scripted response queued for the
/// partition; otherwise it reads the partition log from the position
/// encoded in the cursor (see [`mock_cursor`]).
#[derive(Debug)]
pub struct MockStreamClient {
    logs: Mutex<HashMap<PartitionKey, Vec<Record>>>,
    scripted: Mutex<HashMap<PartitionKey, VecDeque<Result<GetRecordsResponse, RemoteError>>>>,
    resolve_errors: Mutex<HashMap<PartitionKey, VecDeque<RemoteError>>>,
    ranges: Mutex<HashMap<PartitionKey, OffsetRange>>,
    committed: Mutex<HashMap<PartitionKey, OffsetAndMetadata>>,
    requests: Mutex<Vec<GetRecordsRequest>>,
    resolved: Mutex<Vec<(PartitionKey, i64)>>,
    get_records_calls: AtomicU64,
    commit_calls: AtomicU64,
    gate: watch::Sender<bool>,
    resolve_gate: watch::Sender<bool>,
}

impl Default for MockStreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStreamClient {
    /// Creates a client with no partitions and an open gate.
    #[must_use]
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        let (resolve_gate, _) = watch::channel(true);
        Self {
            logs: Mutex::new(HashMap::new()),
            scripted: Mutex::new(HashMap::new()),
            resolve_errors: Mutex::new(HashMap::new()),
            ranges: Mutex::new(HashMap::new()),
            committed: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            resolved: Mutex::new(Vec::new()),
            get_records_calls: AtomicU64::new(0),
            commit_calls: AtomicU64::new(0),
            gate,
            resolve_gate,
        }
    }

    /// Appends records to a partition log.
    pub fn append(&self, partition: &PartitionKey, records: Vec<Record>) {
        self.logs
            .lock()
            .entry(partition.clone())
            .or_default()
            .extend(records);
    }

    /// Queues a response returned by the next `get_records` on `partition`.
    pub fn push_response(
        &self,
        partition: &PartitionKey,
        response: Result<GetRecordsResponse, RemoteError>,
    ) {
        self.scripted
            .lock()
            .entry(partition.clone())
            .or_default()
            .push_back(response);
    }

    /// Makes the next `resolve_cursor` on `partition` fail.
    pub fn fail_next_resolve(&self, partition: &PartitionKey, error: RemoteError) {
        self.resolve_errors
            .lock()
            .entry(partition.clone())
            .or_default()
            .push_back(error);
    }

    /// Overrides the offset range reported for a partition.
    pub fn set_offset_range(&self, partition: &PartitionKey, earliest: i64, latest: i64) {
        self.ranges
            .lock()
            .insert(partition.clone(), OffsetRange { earliest, latest });
    }

    /// Seeds a committed offset.
    pub fn set_committed(&self, partition: &PartitionKey, offset: i64) {
        self.committed
            .lock()
            .insert(partition.clone(), OffsetAndMetadata::new(offset));
    }

    /// Returns the committed offsets stored so far.
    #[must_use]
    pub fn committed(&self) -> HashMap<PartitionKey, OffsetAndMetadata> {
        self.committed.lock().clone()
    }

    /// Holds every `get_records` call until [`open_gate`](Self::open_gate).
    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    /// Releases held and future `get_records` calls.
    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    /// Holds every `resolve_cursor` call until
    /// [`open_resolve_gate`](Self::open_resolve_gate).
    pub fn close_resolve_gate(&self) {
        self.resolve_gate.send_replace(false);
    }

    /// Releases held and future `resolve_cursor` calls.
    pub fn open_resolve_gate(&self) {
        self.resolve_gate.send_replace(true);
    }

    /// Returns the number of `get_records` calls received.
    #[must_use]
    pub fn get_records_calls(&self) -> u64 {
        self.get_records_calls.load(Ordering::Relaxed)
    }

    /// Returns the number of `commit_offsets` calls received.
    #[must_use]
    pub fn commit_calls(&self) -> u64 {
        self.commit_calls.load(Ordering::Relaxed)
    }

    /// Returns every `get_records` request received.
    #[must_use]
    pub fn requests(&self) -> Vec<GetRecordsRequest> {
        self.requests.lock().clone()
    }

    /// Returns every `(partition, position)` passed to `resolve_cursor`.
    #[must_use]
    pub fn resolved(&self) -> Vec<(PartitionKey, i64)> {
        self.resolved.lock().clone()
    }

    /// Returns how often a cursor was resolved for `partition`.
    #[must_use]
    pub fn resolve_count(&self, partition: &PartitionKey) -> usize {
        self.resolved
            .lock()
            .iter()
            .filter(|(p, _)| p == partition)
            .count()
    }

    fn read_log(&self, request: &GetRecordsRequest) -> Result<GetRecordsResponse, RemoteError> {
        let from = position_of(&request.cursor).ok_or_else(|| {
            RemoteError::new("DIS.4302", format!("unknown cursor '{}'", request.cursor))
        })?;
        let logs = self.logs.lock();
        let records: Vec<Record> = logs
            .get(&request.partition)
            .map(|log| {
                log.iter()
                    .filter(|r| r.sequence_number >= from)
                    .take(request.limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let next = records.last().map_or(from, |r| r.sequence_number + 1);
        Ok(GetRecordsResponse {
            records,
            next_cursor: Some(mock_cursor(&request.partition, next)),
        })
    }
}

#[async_trait]
impl StreamClient for MockStreamClient {
    async fn get_records(
        &self,
        request: GetRecordsRequest,
    ) -> Result<GetRecordsResponse, RemoteError> {
        self.get_records_calls.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let scripted = self
            .scripted
            .lock()
            .get_mut(&request.partition)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(response) => response,
            None => self.read_log(&request),
        }
    }

    async fn resolve_cursor(
        &self,
        partition: &PartitionKey,
        position: i64,
    ) -> Result<String, RemoteError> {
        self.resolved.lock().push((partition.clone(), position));

        let mut gate = self.resolve_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let error = self
            .resolve_errors
            .lock()
            .get_mut(partition)
            .and_then(VecDeque::pop_front);
        match error {
            Some(e) => Err(e),
            None => Ok(mock_cursor(partition, position)),
        }
    }

    async fn offset_range(&self, partition: &PartitionKey) -> Result<OffsetRange, RemoteError> {
        if let Some(range) = self.ranges.lock().get(partition) {
            return Ok(*range);
        }
        let logs = self.logs.lock();
        let log = logs.get(partition).map(Vec::as_slice).unwrap_or_default();
        Ok(OffsetRange {
            earliest: log.first().map_or(0, |r| r.sequence_number),
            latest: log.last().map_or(0, |r| r.sequence_number + 1),
        })
    }

    async fn committed_offsets(
        &self,
        _group_id: &str,
        partitions: &HashSet<PartitionKey>,
    ) -> Result<HashMap<PartitionKey, OffsetAndMetadata>, RemoteError> {
        Ok(self
            .committed
            .lock()
            .iter()
            .filter(|(p, _)| partitions.contains(*p))
            .map(|(p, o)| (p.clone(), o.clone()))
            .collect())
    }

    async fn commit_offsets(
        &self,
        _group_id: &str,
        offsets: &HashMap<PartitionKey, OffsetAndMetadata>,
    ) -> Result<(), RemoteError> {
        self.commit_calls.fetch_add(1, Ordering::Relaxed);
        self.committed
            .lock()
            .extend(offsets.iter().map(|(p, o)| (p.clone(), o.clone())));
        Ok(())
    }
}

/// Rebalance listener that records every callback.
#[derive(Debug, Default)]
pub struct RecordingListener {
    assigned: Mutex<Vec<HashSet<PartitionKey>>>,
    revoked: Mutex<Vec<HashSet<PartitionKey>>>,
}

impl RecordingListener {
    /// Creates a listener with no recorded callbacks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of `on_partitions_assigned` calls.
    #[must_use]
    pub fn assigned_count(&self) -> usize {
        self.assigned.lock().len()
    }

    /// Returns the number of `on_partitions_revoked` calls.
    #[must_use]
    pub fn revoked_count(&self) -> usize {
        self.revoked.lock().len()
    }

    /// Returns the partitions of the last assigned callback.
    #[must_use]
    pub fn last_assigned(&self) -> HashSet<PartitionKey> {
        self.assigned.lock().last().cloned().unwrap_or_default()
    }

    /// Returns the partitions of the last revoked callback.
    #[must_use]
    pub fn last_revoked(&self) -> HashSet<PartitionKey> {
        self.revoked.lock().last().cloned().unwrap_or_default()
    }
}

impl RebalanceListener for RecordingListener {
    fn on_partitions_assigned(&self, partitions: &HashSet<PartitionKey>) {
        self.assigned.lock().push(partitions.clone());
    }

    fn on_partitions_revoked(&self, partitions: &HashSet<PartitionKey>) {
        self.revoked.lock().push(partitions.clone());
    }
}
