//! Partition identity and committed offset types.

use std::fmt;
use std::str::FromStr;

use crate::error::ConsumerError;

/// A stream partition: `(stream, partition index)`.
///
/// Displayed and parsed as `"{stream}-{partition}"`. Stream names may
/// themselves contain `-`; the index is whatever follows the last one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    stream: String,
    partition: i32,
}

impl PartitionKey {
    /// Creates a partition key.
    #[must_use]
    pub fn new(stream: impl Into<String>, partition: i32) -> Self {
        Self {
            stream: stream.into(),
            partition,
        }
    }

    /// Returns the stream (topic) name.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Returns the partition index.
    #[must_use]
    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.stream, self.partition)
    }
}

impl FromStr for PartitionKey {
    type Err = ConsumerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            ConsumerError::InvalidArgument(format!(
                "invalid partition '{s}' (expected '<stream>-<index>')"
            ))
        };
        let dash_pos = s.rfind('-').ok_or_else(invalid)?;
        let stream = &s[..dash_pos];
        if stream.is_empty() {
            return Err(invalid());
        }
        let partition = s[dash_pos + 1..].parse::<i32>().map_err(|_| invalid())?;
        Ok(Self::new(stream, partition))
    }
}

/// A committed offset together with its client metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OffsetAndMetadata {
    /// Next offset to consume.
    pub offset: i64,
    /// Opaque client metadata stored alongside the offset.
    pub metadata: String,
}

impl OffsetAndMetadata {
    /// Creates a committed offset with empty metadata.
    #[must_use]
    pub fn new(offset: i64) -> Self {
        Self {
            offset,
            metadata: String::new(),
        }
    }

    /// Creates a committed offset with metadata.
    #[must_use]
    pub fn with_metadata(offset: i64, metadata: impl Into<String>) -> Self {
        Self {
            offset,
            metadata: metadata.into(),
        }
    }
}
