//! Rebalance listener callbacks.
//!
//! [`RebalanceListener`] is invoked synchronously by
//! [`SubscriptionState`](crate::subscription::SubscriptionState) when a
//! group-managed assignment changes. Callbacks run while the subscription
//! lock is held, so they must not call back into the consumer.

use std::collections::HashSet;
use std::fmt;

use crate::partition::PartitionKey;

/// Receives partition assignment changes under group management.
pub trait RebalanceListener: Send + Sync {
    /// Called with partitions newly assigned to this consumer.
    fn on_partitions_assigned(&self, partitions: &HashSet<PartitionKey>);

    /// Called with partitions taken away from this consumer.
    fn on_partitions_revoked(&self, partitions: &HashSet<PartitionKey>);
}

/// Listener that ignores every callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRebalanceListener;

impl RebalanceListener for NoopRebalanceListener {
    fn on_partitions_assigned(&self, _partitions: &HashSet<PartitionKey>) {}

    fn on_partitions_revoked(&self, _partitions: &HashSet<PartitionKey>) {}
}

type PartitionCallback = Box<dyn Fn(&HashSet<PartitionKey>) + Send + Sync>;

/// Listener built from a pair of closures.
pub struct FnRebalanceListener {
    on_assigned: PartitionCallback,
    on_revoked: PartitionCallback,
}

impl FnRebalanceListener {
    /// Creates a listener from assigned/revoked closures.
    pub fn new<A, R>(on_assigned: A, on_revoked: R) -> Self
    where
        A: Fn(&HashSet<PartitionKey>) + Send + Sync + 'static,
        R: Fn(&HashSet<PartitionKey>) + Send + Sync + 'static,
    {
        Self {
            on_assigned: Box::new(on_assigned),
            on_revoked: Box::new(on_revoked),
        }
    }
}

impl RebalanceListener for FnRebalanceListener {
    fn on_partitions_assigned(&self, partitions: &HashSet<PartitionKey>) {
        (self.on_assigned)(partitions);
    }

    fn on_partitions_revoked(&self, partitions: &HashSet<PartitionKey>) {
        (self.on_revoked)(partitions);
    }
}

impl fmt::Debug for FnRebalanceListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnRebalanceListener").finish_non_exhaustive()
    }
}
