//! Remote stream service interface.
//!
//! The consumer only ever talks to the service through [`StreamClient`]:
//! one paginated read primitive keyed by an opaque cursor, plus the calls
//! needed to obtain cursors and offsets.

use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::RemoteError;
use crate::partition::{OffsetAndMetadata, PartitionKey};

/// A record read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Offset of the record within its partition.
    pub sequence_number: i64,
    /// Producer-supplied routing key.
    pub partition_key: Option<String>,
    /// Raw payload.
    pub data: Bytes,
    /// Append time in milliseconds since the epoch.
    pub timestamp_ms: Option<i64>,
}

impl Record {
    /// Creates a record with no key or timestamp.
    #[must_use]
    pub fn new(sequence_number: i64, data: impl Into<Bytes>) -> Self {
        Self {
            sequence_number,
            partition_key: None,
            data: data.into(),
            timestamp_ms: None,
        }
    }

    /// Sets the routing key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Sets the append timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }
}

/// One paginated read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRecordsRequest {
    /// Partition to read.
    pub partition: PartitionKey,
    /// Cursor token from `resolve_cursor` or a previous response.
    pub cursor: String,
    /// Maximum number of records to return.
    pub limit: usize,
}

/// Result of a paginated read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetRecordsResponse {
    /// Records in sequence order.
    pub records: Vec<Record>,
    /// Cursor for the following read; absent or empty when the service
    /// hands out no continuation.
    pub next_cursor: Option<String>,
}

/// Offsets currently available in a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetRange {
    /// First readable offset.
    pub earliest: i64,
    /// Offset the next appended record will get.
    pub latest: i64,
}

/// Client for the remote stream service.
#[async_trait]
pub trait StreamClient: Send + Sync + fmt::Debug {
    /// Reads the next batch of records at `request.cursor`.
    async fn get_records(&self, request: GetRecordsRequest)
        -> Result<GetRecordsResponse, RemoteError>;

    /// Obtains a cursor positioned at `position`.
    async fn resolve_cursor(
        &self,
        partition: &PartitionKey,
        position: i64,
    ) -> Result<String, RemoteError>;

    /// Returns the readable offset range of a partition.
    async fn offset_range(&self, partition: &PartitionKey) -> Result<OffsetRange, RemoteError>;

    /// Returns offsets committed by `group_id`; partitions without a
    /// commit are absent.
    async fn committed_offsets(
        &self,
        _group_id: &str,
        _partitions: &HashSet<PartitionKey>,
    ) -> Result<HashMap<PartitionKey, OffsetAndMetadata>, RemoteError> {
        Ok(HashMap::new())
    }

    /// Stores offsets for `group_id`.
    async fn commit_offsets(
        &self,
        _group_id: &str,
        _offsets: &HashMap<PartitionKey, OffsetAndMetadata>,
    ) -> Result<(), RemoteError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FixedClient;

    #[async_trait]
    impl StreamClient for FixedClient {
        async fn get_records(
            &self,
            request: GetRecordsRequest,
        ) -> Result<GetRecordsResponse, RemoteError> {
            Ok(GetRecordsResponse {
                records: vec![Record::new(0, "a")],
                next_cursor: Some(format!("{}+1", request.cursor)),
            })
        }

        async fn resolve_cursor(
            &self,
            partition: &PartitionKey,
            position: i64,
        ) -> Result<String, RemoteError> {
            Ok(format!("{partition}@{position}"))
        }

        async fn offset_range(&self, _partition: &PartitionKey) -> Result<OffsetRange, RemoteError> {
            Ok(OffsetRange {
                earliest: 0,
                latest: 10,
            })
        }
    }

    #[test]
    fn test_record_builder() {
        let record = Record::new(7, "payload").with_key("k").with_timestamp(1_000);
        assert_eq!(record.sequence_number, 7);
        assert_eq!(record.partition_key.as_deref(), Some("k"));
        assert_eq!(record.data, Bytes::from("payload"));
        assert_eq!(record.timestamp_ms, Some(1_000));
    }

    #[tokio::test]
    async fn test_default_offset_methods() {
        let client = FixedClient;
        let p0 = PartitionKey::new("events", 0);
        let committed = client
            .committed_offsets("g", &HashSet::from([p0.clone()]))
            .await
            .unwrap();
        assert!(committed.is_empty());
        client.commit_offsets("g", &HashMap::new()).await.unwrap();

        assert_eq!(client.resolve_cursor(&p0, 5).await.unwrap(), "events-0@5");
        let response = client
            .get_records(GetRecordsRequest {
                partition: p0,
                cursor: "C1".into(),
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(response.next_cursor.as_deref(), Some("C1+1"));
    }
}
