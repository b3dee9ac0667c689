//! # `LaminarDB` Cursor Consumer
//!
//! Partitioned-log consumer engine for stream services that only expose
//! an opaque, cursor-paginated "get next batch" call per partition.
//!
//! - [`subscription`] - Subscription modes, assignment and positions
//! - [`cursor`] - Cursor cache and the refresh barrier
//! - [`coordinator`] - Position resolution, cursor refresh, rebalance requests
//! - [`fetcher`] - Concurrent fetch dispatch and completion draining
//! - [`consumer`] - Poll-based facade
//! - [`testing`] - Mock stream client and recording listener
//!
//! ## Architecture
//!
//! ```text
//!   CursorConsumer::poll()
//!     │
//!     ├─ Fetcher::send_fetch_requests()
//!     │    ├─ Coordinator::update_fetch_positions()   missing positions
//!     │    ├─ Coordinator::seek() ×N ── RefreshBarrier  absent/expired cursors
//!     │    └─ spawn get_records() per fetchable partition (Semaphore-bounded)
//!     │
//!     └─ Fetcher::fetch_records(timeout)
//!          └─ drain mpsc completions → positions, cursors, records
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Common test patterns that are acceptable
#![cfg_attr(
    test,
    allow(
        clippy::field_reassign_with_default,
        clippy::manual_let_else,
        clippy::needless_return,
        clippy::unreadable_literal,
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        clippy::no_effect_underscore_binding,
        clippy::too_many_lines,
        unused_mut
    )
)]

/// Consumer error types.
pub mod error;

/// Partition identifiers and committed offsets.
pub mod partition;

/// Consumer configuration types.
pub mod config;

/// Consumer metrics types.
pub mod metrics;

/// Partition cursors and the refresh barrier.
pub mod cursor;

/// Rebalance listener callbacks.
pub mod rebalance;

/// Subscription and assignment state.
pub mod subscription;

/// Remote stream service interface.
pub mod remote;

/// Position resolution, cursor refresh and rebalance signaling.
pub mod coordinator;

/// Concurrent fetch dispatch.
pub mod fetcher;

/// Poll-based consumer facade.
pub mod consumer;

/// Testing utilities (mock stream client, helpers).
pub mod testing;

pub use config::{ConsumerConfig, ConsumerProperties, OffsetResetStrategy};
pub use consumer::{ConsumerRecords, CursorConsumer};
pub use coordinator::{Coordinator, StreamCoordinator};
pub use error::{ConsumerError, RemoteError, RemoteErrorKind};
pub use fetcher::{FetchOutcome, Fetcher};
pub use partition::{OffsetAndMetadata, PartitionKey};
pub use rebalance::{FnRebalanceListener, NoopRebalanceListener, RebalanceListener};
pub use remote::{GetRecordsRequest, GetRecordsResponse, OffsetRange, Record, StreamClient};
pub use subscription::{SharedSubscriptionState, SubscriptionState, SubscriptionType};
