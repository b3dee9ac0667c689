//! Subscription and assignment state.
//!
//! [`SubscriptionState`] is the authoritative record of how the consumer
//! is subscribed, which partitions it owns, and where each owned partition
//! stands (position, committed offset, pause flag, pending reset).
//!
//! # Subscription modes
//!
//! ```text
//!            subscribe(topics)             subscribe_pattern(re)
//!   AutoTopics <──────────── None ──────────────> AutoPattern
//!                             │
//!                             │ assign_from_user(partitions)
//!                             ▼
//!                        UserAssigned
//! ```
//!
//! Moving between the three non-`None` modes requires an `unsubscribe()`
//! first; any other transition fails with `ConsumerError::InvalidState`
//! before state is touched.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, info};

use crate::config::OffsetResetStrategy;
use crate::error::ConsumerError;
use crate::partition::{OffsetAndMetadata, PartitionKey};
use crate::rebalance::RebalanceListener;

/// Subscription state shared between the driver, fetcher and coordinator.
pub type SharedSubscriptionState = Arc<Mutex<SubscriptionState>>;

/// The tag of a [`SubscriptionMode`], used for transition checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionType {
    /// Not subscribed and nothing assigned.
    None,
    /// Group-managed, subscribed to an explicit topic list.
    AutoTopics,
    /// Group-managed, subscribed to a topic pattern.
    AutoPattern,
    /// Partitions assigned directly by the user.
    UserAssigned,
}

impl fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionType::None => "NONE",
            SubscriptionType::AutoTopics => "AUTO_TOPICS",
            SubscriptionType::AutoPattern => "AUTO_PATTERN",
            SubscriptionType::UserAssigned => "USER_ASSIGNED",
        };
        f.write_str(s)
    }
}

/// How the consumer obtains its partitions.
#[derive(Debug, Clone)]
pub enum SubscriptionMode {
    /// Not subscribed.
    None,
    /// Subscribed to an explicit topic list.
    AutoTopics(BTreeSet<String>),
    /// Subscribed to every topic matching `pattern`; `topics` is the
    /// currently matched set reported through `change_subscription`.
    AutoPattern {
        /// Topic name pattern.
        pattern: Regex,
        /// Topics currently matched by the pattern.
        topics: BTreeSet<String>,
    },
    /// Partitions assigned by the user.
    UserAssigned,
}

impl SubscriptionMode {
    /// Returns the tag of this mode.
    #[must_use]
    pub fn subscription_type(&self) -> SubscriptionType {
        match self {
            SubscriptionMode::None => SubscriptionType::None,
            SubscriptionMode::AutoTopics(_) => SubscriptionType::AutoTopics,
            SubscriptionMode::AutoPattern { .. } => SubscriptionType::AutoPattern,
            SubscriptionMode::UserAssigned => SubscriptionType::UserAssigned,
        }
    }

    fn is_auto(&self) -> bool {
        matches!(
            self,
            SubscriptionMode::AutoTopics(_) | SubscriptionMode::AutoPattern { .. }
        )
    }

    fn covers(&self, stream: &str) -> bool {
        match self {
            SubscriptionMode::AutoTopics(topics) => topics.contains(stream),
            SubscriptionMode::AutoPattern { pattern, topics } => {
                topics.contains(stream) || pattern.is_match(stream)
            }
            SubscriptionMode::None | SubscriptionMode::UserAssigned => false,
        }
    }
}

/// Per-partition consumption state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionState {
    /// Next offset to deliver, once known.
    pub position: Option<i64>,
    /// Last committed offset.
    pub committed: Option<OffsetAndMetadata>,
    /// Whether fetching is suspended by the user.
    pub paused: bool,
    /// Pending offset reset and the strategy it must use.
    pub reset: Option<OffsetResetStrategy>,
}

impl PartitionState {
    fn has_valid_position(&self) -> bool {
        self.position.is_some()
    }

    fn is_fetchable(&self) -> bool {
        !self.paused && self.has_valid_position() && self.reset.is_none()
    }

    fn seek(&mut self, offset: i64) {
        self.position = Some(offset);
        self.reset = None;
    }

    fn await_reset(&mut self, strategy: OffsetResetStrategy) {
        self.reset = Some(strategy);
        self.position = None;
    }
}

/// Subscription mode, assignment, and per-partition positions.
pub struct SubscriptionState {
    mode: SubscriptionMode,
    assignment: HashMap<PartitionKey, PartitionState>,
    listener: Option<Arc<dyn RebalanceListener>>,
    default_reset_strategy: OffsetResetStrategy,
    needs_partition_assignment: bool,
    needs_fetch_committed_offsets: bool,
    assignment_generation: u64,
}

impl SubscriptionState {
    /// Creates an unsubscribed state.
    ///
    /// `default_reset_strategy` is used by `need_offset_reset` and for
    /// partitions without a committed offset.
    #[must_use]
    pub fn new(default_reset_strategy: OffsetResetStrategy) -> Self {
        Self {
            mode: SubscriptionMode::None,
            assignment: HashMap::new(),
            listener: None,
            default_reset_strategy,
            needs_partition_assignment: true,
            needs_fetch_committed_offsets: false,
            assignment_generation: 0,
        }
    }

    /// Wraps a new state for sharing.
    #[must_use]
    pub fn shared(default_reset_strategy: OffsetResetStrategy) -> SharedSubscriptionState {
        Arc::new(Mutex::new(Self::new(default_reset_strategy)))
    }

    fn ensure_mode(&self, requested: SubscriptionType) -> Result<(), ConsumerError> {
        let current = self.mode.subscription_type();
        if current != SubscriptionType::None && current != requested {
            return Err(ConsumerError::InvalidState(format!(
                "subscription to topics, patterns and assignment of partitions are mutually \
                 exclusive (current mode {current}, requested {requested})"
            )));
        }
        Ok(())
    }

    fn assigned_state(&self, partition: &PartitionKey) -> Result<&PartitionState, ConsumerError> {
        self.assignment
            .get(partition)
            .ok_or_else(|| ConsumerError::not_assigned(partition))
    }

    fn assigned_state_mut(
        &mut self,
        partition: &PartitionKey,
    ) -> Result<&mut PartitionState, ConsumerError> {
        self.assignment
            .get_mut(partition)
            .ok_or_else(|| ConsumerError::not_assigned(partition))
    }

    /// Replaces the assignment, keeping state for retained partitions.
    ///
    /// Returns `(added, removed)`.
    fn replace_assignment(
        &mut self,
        partitions: &HashSet<PartitionKey>,
    ) -> (HashSet<PartitionKey>, HashSet<PartitionKey>) {
        let removed: HashSet<PartitionKey> = self
            .assignment
            .keys()
            .filter(|p| !partitions.contains(*p))
            .cloned()
            .collect();
        let added: HashSet<PartitionKey> = partitions
            .iter()
            .filter(|p| !self.assignment.contains_key(*p))
            .cloned()
            .collect();

        self.assignment.retain(|p, _| partitions.contains(p));
        for partition in &added {
            self.assignment
                .insert(partition.clone(), PartitionState::default());
        }
        (added, removed)
    }

    /// Subscribes to an explicit topic list under group management.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if partitions were assigned by
    /// the user or a pattern subscription is active.
    pub fn subscribe<I, S>(
        &mut self,
        topics: I,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), ConsumerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_mode(SubscriptionType::AutoTopics)?;
        let topics: BTreeSet<String> = topics.into_iter().map(Into::into).collect();
        info!(topics = ?topics, "subscribed to topics");
        self.mode = SubscriptionMode::AutoTopics(topics);
        self.listener = Some(listener);
        self.needs_partition_assignment = true;
        Ok(())
    }

    /// Subscribes to every topic matching `pattern` under group management.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if partitions were assigned by
    /// the user or a topic-list subscription is active.
    pub fn subscribe_pattern(
        &mut self,
        pattern: Regex,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), ConsumerError> {
        self.ensure_mode(SubscriptionType::AutoPattern)?;
        info!(pattern = %pattern, "subscribed to topic pattern");
        let topics = match std::mem::replace(&mut self.mode, SubscriptionMode::None) {
            SubscriptionMode::AutoPattern { topics, .. } => topics,
            _ => BTreeSet::new(),
        };
        self.mode = SubscriptionMode::AutoPattern { pattern, topics };
        self.listener = Some(listener);
        self.needs_partition_assignment = true;
        Ok(())
    }

    /// Updates the topic set matched by the active pattern subscription.
    ///
    /// The assignment is left alone until the next rebalance.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` unless subscribed by pattern.
    pub fn change_subscription<I, S>(&mut self, topics: I) -> Result<(), ConsumerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mode = self.mode.subscription_type();
        let SubscriptionMode::AutoPattern {
            topics: current, ..
        } = &mut self.mode
        else {
            return Err(ConsumerError::InvalidState(format!(
                "change_subscription requires a pattern subscription (current mode {mode})"
            )));
        };
        let topics: BTreeSet<String> = topics.into_iter().map(Into::into).collect();
        if *current != topics {
            debug!(topics = ?topics, "pattern subscription matched topics changed");
            *current = topics;
            self.needs_partition_assignment = true;
        }
        Ok(())
    }

    /// Assigns partitions directly, bypassing group management.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if a group-managed
    /// subscription is active.
    pub fn assign_from_user<I>(&mut self, partitions: I) -> Result<(), ConsumerError>
    where
        I: IntoIterator<Item = PartitionKey>,
    {
        self.ensure_mode(SubscriptionType::UserAssigned)?;
        let partitions: HashSet<PartitionKey> = partitions.into_iter().collect();
        self.mode = SubscriptionMode::UserAssigned;
        let (added, removed) = self.replace_assignment(&partitions);
        info!(
            assigned = partitions.len(),
            added = added.len(),
            removed = removed.len(),
            "user assignment updated"
        );
        self.needs_partition_assignment = false;
        self.needs_fetch_committed_offsets = true;
        Ok(())
    }

    /// Installs the assignment computed by the group after a rebalance.
    ///
    /// The rebalance listener sees the revoked partitions, then the newly
    /// assigned ones; empty sets are not reported.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` outside group management and
    /// `ConsumerError::InvalidArgument` if a partition's stream is not part
    /// of the subscription.
    pub fn assign_from_subscribed<I>(&mut self, partitions: I) -> Result<(), ConsumerError>
    where
        I: IntoIterator<Item = PartitionKey>,
    {
        if !self.mode.is_auto() {
            return Err(ConsumerError::InvalidState(format!(
                "assign_from_subscribed requires a group-managed subscription (current mode {})",
                self.mode.subscription_type()
            )));
        }
        let partitions: HashSet<PartitionKey> = partitions.into_iter().collect();
        if let Some(stray) = partitions.iter().find(|p| !self.mode.covers(p.stream())) {
            return Err(ConsumerError::InvalidArgument(format!(
                "assigned partition {stray} is not part of the subscription"
            )));
        }

        let (added, removed) = self.replace_assignment(&partitions);
        self.needs_partition_assignment = false;
        self.needs_fetch_committed_offsets = true;
        self.assignment_generation += 1;
        info!(
            generation = self.assignment_generation,
            assigned = partitions.len(),
            added = added.len(),
            revoked = removed.len(),
            "group assignment updated"
        );

        if let Some(listener) = &self.listener {
            if !removed.is_empty() {
                listener.on_partitions_revoked(&removed);
            }
            if !added.is_empty() {
                listener.on_partitions_assigned(&added);
            }
        }
        Ok(())
    }

    /// Drops the subscription, the assignment and all partition state.
    ///
    /// Under group management the listener is told the whole assignment
    /// is revoked.
    pub fn unsubscribe(&mut self) {
        if self.mode.is_auto() && !self.assignment.is_empty() {
            if let Some(listener) = &self.listener {
                let revoked: HashSet<PartitionKey> = self.assignment.keys().cloned().collect();
                listener.on_partitions_revoked(&revoked);
            }
        }
        info!(mode = %self.mode.subscription_type(), "unsubscribed");
        self.mode = SubscriptionMode::None;
        self.assignment.clear();
        self.listener = None;
        self.needs_partition_assignment = true;
        self.needs_fetch_committed_offsets = false;
    }

    /// Moves the position of an assigned partition, clearing any pending reset.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if the partition is not
    /// assigned, `ConsumerError::InvalidArgument` for a negative offset.
    pub fn seek(&mut self, partition: &PartitionKey, offset: i64) -> Result<(), ConsumerError> {
        if offset < 0 {
            return Err(ConsumerError::InvalidArgument(format!(
                "seek offset must not be negative (partition {partition}, offset {offset})"
            )));
        }
        self.assigned_state_mut(partition)?.seek(offset);
        Ok(())
    }

    /// Marks a partition for reset with the default strategy.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if the partition is not assigned.
    pub fn need_offset_reset(&mut self, partition: &PartitionKey) -> Result<(), ConsumerError> {
        let strategy = self.default_reset_strategy;
        self.need_offset_reset_with(partition, strategy)
    }

    /// Marks a partition for reset with an explicit strategy.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if the partition is not assigned.
    pub fn need_offset_reset_with(
        &mut self,
        partition: &PartitionKey,
        strategy: OffsetResetStrategy,
    ) -> Result<(), ConsumerError> {
        self.assigned_state_mut(partition)?.await_reset(strategy);
        Ok(())
    }

    /// Returns the position of an assigned partition.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if the partition is not assigned.
    pub fn position(&self, partition: &PartitionKey) -> Result<Option<i64>, ConsumerError> {
        Ok(self.assigned_state(partition)?.position)
    }

    /// Advances the position of a partition that already has a valid one.
    ///
    /// While a reset is pending only `seek` may set the position.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if the partition is not
    /// assigned, a reset is pending, or it has no current position.
    pub fn set_position(&mut self, partition: &PartitionKey, offset: i64) -> Result<(), ConsumerError> {
        let state = self.assigned_state_mut(partition)?;
        if state.reset.is_some() || !state.has_valid_position() {
            return Err(ConsumerError::InvalidState(format!(
                "cannot set a new position for {partition} without a valid current position"
            )));
        }
        state.position = Some(offset);
        Ok(())
    }

    /// Returns the committed offset of an assigned partition.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if the partition is not assigned.
    pub fn committed(
        &self,
        partition: &PartitionKey,
    ) -> Result<Option<OffsetAndMetadata>, ConsumerError> {
        Ok(self.assigned_state(partition)?.committed.clone())
    }

    /// Records the committed offset of an assigned partition.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if the partition is not assigned.
    pub fn set_committed(
        &mut self,
        partition: &PartitionKey,
        committed: OffsetAndMetadata,
    ) -> Result<(), ConsumerError> {
        self.assigned_state_mut(partition)?.committed = Some(committed);
        Ok(())
    }

    /// Suspends fetching from a partition.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if the partition is not assigned.
    pub fn pause(&mut self, partition: &PartitionKey) -> Result<(), ConsumerError> {
        self.assigned_state_mut(partition)?.paused = true;
        Ok(())
    }

    /// Resumes fetching from a partition.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::InvalidState` if the partition is not assigned.
    pub fn resume(&mut self, partition: &PartitionKey) -> Result<(), ConsumerError> {
        self.assigned_state_mut(partition)?.paused = false;
        Ok(())
    }

    /// Returns `true` if the partition is assigned and paused.
    #[must_use]
    pub fn is_paused(&self, partition: &PartitionKey) -> bool {
        self.assignment.get(partition).is_some_and(|s| s.paused)
    }

    /// Returns all paused partitions.
    #[must_use]
    pub fn paused_partitions(&self) -> HashSet<PartitionKey> {
        self.assignment
            .iter()
            .filter(|(_, s)| s.paused)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Returns all assigned partitions.
    #[must_use]
    pub fn assigned_partitions(&self) -> HashSet<PartitionKey> {
        self.assignment.keys().cloned().collect()
    }

    /// Returns assigned partitions that are not paused.
    #[must_use]
    pub fn active_partitions(&self) -> HashSet<PartitionKey> {
        self.assignment
            .iter()
            .filter(|(_, s)| !s.paused)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Returns partitions that are assigned, not paused, positioned and not awaiting reset.
    #[must_use]
    pub fn fetchable_partitions(&self) -> HashSet<PartitionKey> {
        self.assignment
            .iter()
            .filter(|(_, s)| s.is_fetchable())
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Returns assigned partitions without a position.
    #[must_use]
    pub fn missing_fetch_positions(&self) -> HashSet<PartitionKey> {
        self.assignment
            .iter()
            .filter(|(_, s)| !s.has_valid_position())
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Returns `true` if every assigned partition has a position.
    #[must_use]
    pub fn has_all_fetch_positions(&self) -> bool {
        self.assignment.values().all(PartitionState::has_valid_position)
    }

    /// Returns `true` if the partition is assigned.
    #[must_use]
    pub fn is_assigned(&self, partition: &PartitionKey) -> bool {
        self.assignment.contains_key(partition)
    }

    /// Returns `true` if the partition can be fetched from.
    #[must_use]
    pub fn is_fetchable(&self, partition: &PartitionKey) -> bool {
        self.assignment
            .get(partition)
            .is_some_and(PartitionState::is_fetchable)
    }

    /// Returns `true` if the partition is assigned and awaiting a reset.
    #[must_use]
    pub fn is_offset_reset_needed(&self, partition: &PartitionKey) -> bool {
        self.assignment
            .get(partition)
            .is_some_and(|s| s.reset.is_some())
    }

    /// Returns the strategy of a pending reset.
    #[must_use]
    pub fn reset_strategy(&self, partition: &PartitionKey) -> Option<OffsetResetStrategy> {
        self.assignment.get(partition).and_then(|s| s.reset)
    }

    /// Returns the strategy used when no committed offset exists.
    #[must_use]
    pub fn default_reset_strategy(&self) -> OffsetResetStrategy {
        self.default_reset_strategy
    }

    /// Returns `true` until the group assigns partitions for the current subscription.
    #[must_use]
    pub fn partition_assignment_needed(&self) -> bool {
        self.needs_partition_assignment
    }

    /// Returns `true` if partitions come from group management.
    #[must_use]
    pub fn partitions_auto_assigned(&self) -> bool {
        self.mode.is_auto()
    }

    /// Returns `true` if committed offsets should be re-read for the assignment.
    #[must_use]
    pub fn refresh_commits_needed(&self) -> bool {
        self.needs_fetch_committed_offsets
    }

    /// Marks committed offsets as refreshed.
    pub fn commits_refreshed(&mut self) {
        self.needs_fetch_committed_offsets = false;
    }

    /// Returns the current subscription mode tag.
    #[must_use]
    pub fn subscription_type(&self) -> SubscriptionType {
        self.mode.subscription_type()
    }

    /// Returns the current subscription mode.
    #[must_use]
    pub fn mode(&self) -> &SubscriptionMode {
        &self.mode
    }

    /// Returns the subscribed topics (the matched set for pattern subscriptions).
    #[must_use]
    pub fn subscription(&self) -> BTreeSet<String> {
        match &self.mode {
            SubscriptionMode::AutoTopics(topics) | SubscriptionMode::AutoPattern { topics, .. } => {
                topics.clone()
            }
            SubscriptionMode::None | SubscriptionMode::UserAssigned => BTreeSet::new(),
        }
    }

    /// Returns the subscription pattern, if subscribed by pattern.
    #[must_use]
    pub fn pattern(&self) -> Option<&Regex> {
        match &self.mode {
            SubscriptionMode::AutoPattern { pattern, .. } => Some(pattern),
            _ => None,
        }
    }

    /// Returns the number of group assignments installed so far.
    #[must_use]
    pub fn assignment_generation(&self) -> u64 {
        self.assignment_generation
    }

    /// Returns the positions of all positioned partitions, ready to commit.
    #[must_use]
    pub fn all_consumed(&self) -> HashMap<PartitionKey, OffsetAndMetadata> {
        self.assignment
            .iter()
            .filter_map(|(p, s)| s.position.map(|pos| (p.clone(), OffsetAndMetadata::new(pos))))
            .collect()
    }
}

impl fmt::Debug for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionState")
            .field("mode", &self.mode.subscription_type())
            .field("assigned", &self.assignment.len())
            .field("generation", &self.assignment_generation)
            .field("default_reset_strategy", &self.default_reset_strategy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingListener;

    const TOPIC: &str = "test";
    const TOPIC1: &str = "test1";

    fn state() -> SubscriptionState {
        SubscriptionState::new(OffsetResetStrategy::Earliest)
    }

    fn tp0() -> PartitionKey {
        PartitionKey::new(TOPIC, 0)
    }

    fn tp1() -> PartitionKey {
        PartitionKey::new(TOPIC, 1)
    }

    fn listener() -> Arc<RecordingListener> {
        Arc::new(RecordingListener::new())
    }

    fn all_match() -> Regex {
        Regex::new(".*").unwrap()
    }

    fn assert_all_positions(state: &SubscriptionState, tp: &PartitionKey, offset: i64) {
        assert_eq!(state.committed(tp).unwrap().unwrap().offset, offset);
        assert_eq!(state.position(tp).unwrap(), Some(offset));
    }

    #[test]
    fn test_partition_assignment() {
        let mut state = state();
        state.assign_from_user([tp0()]).unwrap();
        assert_eq!(state.assigned_partitions(), HashSet::from([tp0()]));
        assert!(!state.partition_assignment_needed());
        assert!(!state.has_all_fetch_positions());
        assert!(state.refresh_commits_needed());

        state.set_committed(&tp0(), OffsetAndMetadata::new(1)).unwrap();
        state.seek(&tp0(), 1).unwrap();
        assert!(state.is_fetchable(&tp0()));
        assert_all_positions(&state, &tp0(), 1);

        state.assign_from_user([]).unwrap();
        assert!(state.assigned_partitions().is_empty());
        assert!(!state.is_assigned(&tp0()));
        assert!(!state.is_fetchable(&tp0()));
    }

    #[test]
    fn test_user_reassignment_keeps_retained_state() {
        let mut state = state();
        state.assign_from_user([tp0(), tp1()]).unwrap();
        state.seek(&tp0(), 42).unwrap();
        state.seek(&tp1(), 7).unwrap();

        let tp2 = PartitionKey::new(TOPIC, 2);
        state.assign_from_user([tp0(), tp2.clone()]).unwrap();
        assert_eq!(state.position(&tp0()).unwrap(), Some(42));
        assert_eq!(state.position(&tp2).unwrap(), None);
        assert!(state.position(&tp1()).is_err());
    }

    #[test]
    fn test_partition_reset() {
        let mut state = state();
        state.assign_from_user([tp0()]).unwrap();
        state.seek(&tp0(), 5).unwrap();
        assert_eq!(state.position(&tp0()).unwrap(), Some(5));

        state.need_offset_reset(&tp0()).unwrap();
        assert!(!state.is_fetchable(&tp0()));
        assert!(state.is_offset_reset_needed(&tp0()));
        assert_eq!(state.reset_strategy(&tp0()), Some(OffsetResetStrategy::Earliest));
        assert_eq!(state.position(&tp0()).unwrap(), None);

        // seek clears the reset and makes the partition fetchable again
        state.seek(&tp0(), 0).unwrap();
        assert!(state.is_fetchable(&tp0()));
        assert!(!state.is_offset_reset_needed(&tp0()));
    }

    #[test]
    fn test_set_position_rejected_during_reset() {
        let mut state = state();
        state.assign_from_user([tp0()]).unwrap();
        state.seek(&tp0(), 5).unwrap();
        state.set_position(&tp0(), 6).unwrap();
        assert_eq!(state.position(&tp0()).unwrap(), Some(6));

        state.need_offset_reset_with(&tp0(), OffsetResetStrategy::Latest).unwrap();
        assert!(matches!(
            state.set_position(&tp0(), 9),
            Err(ConsumerError::InvalidState(_))
        ));
        state.seek(&tp0(), 9).unwrap();
        assert_eq!(state.position(&tp0()).unwrap(), Some(9));
    }

    #[test]
    fn test_topic_subscription() {
        let mut state = state();
        state.subscribe([TOPIC], listener()).unwrap();
        assert_eq!(state.subscription().len(), 1);
        assert!(state.partition_assignment_needed());
        assert!(state.assigned_partitions().is_empty());
        assert!(state.partitions_auto_assigned());

        state.assign_from_subscribed([tp0()]).unwrap();
        state.seek(&tp0(), 1).unwrap();
        state.set_committed(&tp0(), OffsetAndMetadata::new(1)).unwrap();
        assert_all_positions(&state, &tp0(), 1);

        state.assign_from_subscribed([tp1()]).unwrap();
        assert!(state.is_assigned(&tp1()));
        assert!(!state.partition_assignment_needed());
        assert!(!state.is_assigned(&tp0()));
        assert!(!state.is_fetchable(&tp1()));
        assert_eq!(state.assigned_partitions(), HashSet::from([tp1()]));
        assert_eq!(state.assignment_generation(), 2);
    }

    #[test]
    fn test_assign_from_subscribed_notifies_listener() {
        let mut state = state();
        let listener = listener();
        state.subscribe([TOPIC], listener.clone()).unwrap();

        state.assign_from_subscribed([tp0()]).unwrap();
        assert_eq!(listener.assigned_count(), 1);
        assert_eq!(listener.revoked_count(), 0);
        assert_eq!(listener.last_assigned(), HashSet::from([tp0()]));

        state.assign_from_subscribed([tp0(), tp1()]).unwrap();
        assert_eq!(listener.assigned_count(), 2);
        assert_eq!(listener.last_assigned(), HashSet::from([tp1()]));
        assert_eq!(listener.revoked_count(), 0);

        state.assign_from_subscribed([tp1()]).unwrap();
        assert_eq!(listener.revoked_count(), 1);
        assert_eq!(listener.last_revoked(), HashSet::from([tp0()]));
        assert_eq!(listener.assigned_count(), 2);

        state.unsubscribe();
        assert_eq!(listener.revoked_count(), 2);
        assert_eq!(listener.last_revoked(), HashSet::from([tp1()]));
    }

    #[test]
    fn test_user_assignment_does_not_notify_listener() {
        let mut state = state();
        let listener = listener();
        state.subscribe([TOPIC], listener.clone()).unwrap();
        state.unsubscribe();
        state.assign_from_user([tp0()]).unwrap();
        state.unsubscribe();
        assert_eq!(listener.assigned_count(), 0);
        assert_eq!(listener.revoked_count(), 0);
    }

    #[test]
    fn test_assign_from_subscribed_rejects_foreign_stream() {
        let mut state = state();
        state.subscribe([TOPIC], listener()).unwrap();
        let err = state
            .assign_from_subscribed([PartitionKey::new("other", 0)])
            .unwrap_err();
        assert!(matches!(err, ConsumerError::InvalidArgument(_)));
        assert!(state.partition_assignment_needed());
    }

    #[test]
    fn test_assign_from_subscribed_requires_auto_mode() {
        let mut state = state();
        assert!(matches!(
            state.assign_from_subscribed([tp0()]),
            Err(ConsumerError::InvalidState(_))
        ));
        state.assign_from_user([tp0()]).unwrap();
        assert!(matches!(
            state.assign_from_subscribed([tp0()]),
            Err(ConsumerError::InvalidState(_))
        ));
    }

    #[test]
    fn test_pattern_assignment_matches_pattern() {
        let mut state = state();
        state
            .subscribe_pattern(Regex::new("^test").unwrap(), listener())
            .unwrap();
        state.assign_from_subscribed([tp0()]).unwrap();
        assert!(state
            .assign_from_subscribed([PartitionKey::new("prod", 0)])
            .is_err());
    }

    #[test]
    fn test_partition_pause() {
        let mut state = state();
        state.assign_from_user([tp0()]).unwrap();
        state.seek(&tp0(), 100).unwrap();
        assert!(state.is_fetchable(&tp0()));

        state.pause(&tp0()).unwrap();
        assert!(!state.is_fetchable(&tp0()));
        assert!(state.is_paused(&tp0()));
        assert!(state.active_partitions().is_empty());
        assert_eq!(state.position(&tp0()).unwrap(), Some(100));

        state.resume(&tp0()).unwrap();
        assert!(state.is_fetchable(&tp0()));
        assert!(state.paused_partitions().is_empty());
    }

    #[test]
    fn test_fetchable_excludes_unpositioned_paused_and_reset() {
        let mut state = state();
        let tp2 = PartitionKey::new(TOPIC, 2);
        let tp3 = PartitionKey::new(TOPIC, 3);
        state
            .assign_from_user([tp0(), tp1(), tp2.clone(), tp3.clone()])
            .unwrap();
        state.seek(&tp0(), 1).unwrap();
        state.seek(&tp1(), 1).unwrap();
        state.pause(&tp1()).unwrap();
        state.seek(&tp3, 1).unwrap();
        state.need_offset_reset(&tp3).unwrap();

        assert_eq!(state.fetchable_partitions(), HashSet::from([tp0()]));
        assert_eq!(state.missing_fetch_positions(), HashSet::from([tp2, tp3]));
        assert!(!state.has_all_fetch_positions());
    }

    #[test]
    fn test_commit_offset_metadata() {
        let mut state = state();
        state.assign_from_user([tp0()]).unwrap();
        state
            .set_committed(&tp0(), OffsetAndMetadata::with_metadata(5, "hi"))
            .unwrap();

        let committed = state.committed(&tp0()).unwrap().unwrap();
        assert_eq!(committed.offset, 5);
        assert_eq!(committed.metadata, "hi");
        assert_eq!(state.position(&tp0()).unwrap(), None);
    }

    #[test]
    fn test_invalid_position_update() {
        let mut state = state();
        state.subscribe([TOPIC], listener()).unwrap();
        state.assign_from_subscribed([tp0()]).unwrap();
        assert!(matches!(
            state.set_position(&tp0(), 0),
            Err(ConsumerError::InvalidState(_))
        ));
    }

    #[test]
    fn test_cant_change_position_for_non_assigned_partition() {
        let mut state = state();
        assert!(matches!(
            state.set_position(&tp0(), 1),
            Err(ConsumerError::InvalidState(_))
        ));
        assert!(state.seek(&tp0(), 1).is_err());
        assert!(state.pause(&tp0()).is_err());
        assert!(state.need_offset_reset(&tp0()).is_err());
        assert!(state.position(&tp0()).is_err());
    }

    #[test]
    fn test_negative_seek_rejected() {
        let mut state = state();
        state.assign_from_user([tp0()]).unwrap();
        assert!(matches!(
            state.seek(&tp0(), -1),
            Err(ConsumerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_cant_subscribe_topics_and_pattern() {
        let mut state = state();
        state.subscribe([TOPIC], listener()).unwrap();
        assert!(matches!(
            state.subscribe_pattern(all_match(), listener()),
            Err(ConsumerError::InvalidState(_))
        ));
    }

    #[test]
    fn test_cant_subscribe_partition_and_pattern() {
        let mut state = state();
        state.assign_from_user([tp0()]).unwrap();
        assert!(state.subscribe_pattern(all_match(), listener()).is_err());
        assert!(state.subscribe([TOPIC], listener()).is_err());
        assert_eq!(state.subscription_type(), SubscriptionType::UserAssigned);
        assert!(state.is_assigned(&tp0()));
    }

    #[test]
    fn test_cant_subscribe_pattern_and_topics() {
        let mut state = state();
        state.subscribe_pattern(all_match(), listener()).unwrap();
        assert!(state.subscribe([TOPIC], listener()).is_err());
    }

    #[test]
    fn test_cant_subscribe_pattern_and_partition() {
        let mut state = state();
        state.subscribe_pattern(all_match(), listener()).unwrap();
        assert!(state.assign_from_user([tp0()]).is_err());
        assert_eq!(state.subscription_type(), SubscriptionType::AutoPattern);
    }

    #[test]
    fn test_resubscribe_same_mode_replaces_topics() {
        let mut state = state();
        state.subscribe([TOPIC], listener()).unwrap();
        state.subscribe([TOPIC1], listener()).unwrap();
        assert_eq!(state.subscription(), BTreeSet::from([TOPIC1.to_string()]));
    }

    #[test]
    fn test_pattern_subscription() {
        let mut state = state();
        state.subscribe_pattern(all_match(), listener()).unwrap();
        state.change_subscription([TOPIC, TOPIC1]).unwrap();
        assert_eq!(state.subscription().len(), 2);
        assert_eq!(state.pattern().map(Regex::as_str), Some(".*"));
    }

    #[test]
    fn test_change_subscription_requires_pattern() {
        let mut state = state();
        assert!(state.change_subscription([TOPIC]).is_err());
        state.subscribe([TOPIC], listener()).unwrap();
        assert!(matches!(
            state.change_subscription([TOPIC1]),
            Err(ConsumerError::InvalidState(_))
        ));
    }

    #[test]
    fn test_change_subscription_keeps_assignment() {
        let mut state = state();
        state.subscribe_pattern(all_match(), listener()).unwrap();
        state.change_subscription([TOPIC]).unwrap();
        state.assign_from_subscribed([tp0()]).unwrap();
        assert!(!state.partition_assignment_needed());

        state.change_subscription([TOPIC1]).unwrap();
        assert!(state.partition_assignment_needed());
        assert!(state.is_assigned(&tp0()));
    }

    #[test]
    fn test_unsubscribe_user_assignment() {
        let mut state = state();
        state.assign_from_user([tp0(), tp1()]).unwrap();
        state.unsubscribe();
        state.subscribe([TOPIC], listener()).unwrap();
        assert_eq!(state.subscription(), BTreeSet::from([TOPIC.to_string()]));
    }

    #[test]
    fn test_unsubscribe_user_subscribe() {
        let mut state = state();
        state.subscribe([TOPIC], listener()).unwrap();
        state.unsubscribe();
        state.assign_from_user([tp0()]).unwrap();
        assert_eq!(state.assigned_partitions(), HashSet::from([tp0()]));
    }

    #[test]
    fn test_unsubscription() {
        let mut state = state();
        state.subscribe_pattern(all_match(), listener()).unwrap();
        state.change_subscription([TOPIC, TOPIC1]).unwrap();
        assert!(state.partition_assignment_needed());

        state.assign_from_subscribed([tp1()]).unwrap();
        assert_eq!(state.assigned_partitions(), HashSet::from([tp1()]));
        assert!(!state.partition_assignment_needed());

        state.unsubscribe();
        assert!(state.subscription().is_empty());
        assert!(state.assigned_partitions().is_empty());
        assert!(state.partition_assignment_needed());

        state.assign_from_user([tp0()]).unwrap();
        assert_eq!(state.assigned_partitions(), HashSet::from([tp0()]));
        assert!(!state.partition_assignment_needed());

        state.unsubscribe();
        assert!(state.subscription().is_empty());
        assert!(state.assigned_partitions().is_empty());
        assert!(state.partition_assignment_needed());
        assert_eq!(state.subscription_type(), SubscriptionType::None);
    }

    #[test]
    fn test_all_consumed() {
        let mut state = state();
        state.assign_from_user([tp0(), tp1()]).unwrap();
        state.seek(&tp0(), 10).unwrap();

        let consumed = state.all_consumed();
        assert_eq!(consumed.len(), 1);
        assert_eq!(consumed[&tp0()].offset, 10);
    }

    #[test]
    fn test_commits_refreshed() {
        let mut state = state();
        assert!(!state.refresh_commits_needed());
        state.assign_from_user([tp0()]).unwrap();
        assert!(state.refresh_commits_needed());
        state.commits_refreshed();
        assert!(!state.refresh_commits_needed());
    }

    /// Mode transitions over every short sequence of operations: a call that
    /// mixes user assignment with group management without an intervening
    /// unsubscribe always fails and leaves the mode unchanged.
    #[test]
    fn test_mode_transitions_exhaustive() {
        #[derive(Clone, Copy, Debug)]
        enum Op {
            Topics,
            Pattern,
            User,
            Unsubscribe,
        }
        let ops = [Op::Topics, Op::Pattern, Op::User, Op::Unsubscribe];

        for a in ops {
            for b in ops {
                for c in ops {
                    let mut state = state();
                    for op in [a, b, c] {
                        let before = state.subscription_type();
                        let (requested, result) = match op {
                            Op::Topics => (
                                SubscriptionType::AutoTopics,
                                state.subscribe([TOPIC], listener()),
                            ),
                            Op::Pattern => (
                                SubscriptionType::AutoPattern,
                                state.subscribe_pattern(all_match(), listener()),
                            ),
                            Op::User => (
                                SubscriptionType::UserAssigned,
                                state.assign_from_user([tp0()]),
                            ),
                            Op::Unsubscribe => {
                                state.unsubscribe();
                                (SubscriptionType::None, Ok(()))
                            }
                        };
                        let compatible = before == SubscriptionType::None
                            || before == requested
                            || requested == SubscriptionType::None;
                        assert_eq!(result.is_ok(), compatible, "{a:?} {b:?} {c:?} at {op:?}");
                        if result.is_err() {
                            assert_eq!(state.subscription_type(), before);
                        } else {
                            assert_eq!(state.subscription_type(), requested);
                        }
                    }
                }
            }
        }
    }
}
