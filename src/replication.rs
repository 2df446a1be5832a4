//! Send planning: interest result + throttles -> per-peer updates
//!
//! The planner is the glue between a matching pass and the transport. For
//! each changed field it asks the throttle whether the change is worth
//! sending and fans it out to the peers interested in the replica:
//!
//! - significant change: sent to every interested peer
//! - insignificant change: sent only to peers that joined interest this
//!   pass, since they have never seen the replica
//!
//! The planner only fans out what it is given. For every replica in
//! `delta.joined` the caller must pass all of its fields in `changes`, not
//! just the ones that changed, or joining peers miss the unchanged ones.
//!
//! Baselines move in [`ReplicationPlanner::commit`], after the transport has
//! actually written the plan. Suppressed values never move a baseline.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::trace;

use crate::interest::ids::{PeerId, ReplicaId};
use crate::interest::result::{InterestDelta, InterestMatchResult};
use crate::metrics::InterestMetrics;
use crate::throttle::{Throttle, ThrottleKey, ThrottleMap};

/// One field value bound for one peer
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate<T> {
    pub replica: ReplicaId,
    pub field: u16,
    pub value: T,
}

/// Statistics about a plan for metrics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlanStats {
    /// Changes that passed their throttle
    pub values_sent: u64,
    /// Changes held back by their throttle
    pub values_suppressed: u64,
    /// Suppressed changes still delivered to newly interested peers
    pub join_deliveries: u64,
    /// Changes for replicas nobody is interested in
    pub unobserved: u64,
}

/// Output of one planning step
#[derive(Debug, Clone)]
pub struct SendPlan<T> {
    per_peer: BTreeMap<PeerId, Vec<FieldUpdate<T>>>,
    /// Significant values, committed to the throttle baselines
    significant: Vec<(ThrottleKey, T)>,
    stats: PlanStats,
}

impl<T> SendPlan<T> {
    fn new() -> Self {
        Self {
            per_peer: BTreeMap::new(),
            significant: Vec::new(),
            stats: PlanStats::default(),
        }
    }

    /// Updates for `peer`, in change order
    pub fn updates_for(&self, peer: PeerId) -> &[FieldUpdate<T>] {
        self.per_peer.get(&peer).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Peers with at least one update, ascending
    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.per_peer.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &[FieldUpdate<T>])> {
        self.per_peer.iter().map(|(peer, updates)| (*peer, updates.as_slice()))
    }

    pub fn stats(&self) -> PlanStats {
        self.stats
    }

    pub fn is_empty(&self) -> bool {
        self.per_peer.is_empty()
    }

    /// Total updates across all peers
    pub fn update_count(&self) -> usize {
        self.per_peer.values().map(Vec::len).sum()
    }
}

/// Builds send plans and commits baselines
#[derive(Debug, Default, Clone)]
pub struct ReplicationPlanner {
    metrics: Option<Arc<InterestMetrics>>,
}

impl ReplicationPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: Arc<InterestMetrics>) -> Self {
        Self { metrics: Some(metrics) }
    }

    /// Plan the sends for `changes` against the current interest state.
    ///
    /// `delta` must be the diff that produced `result` (see
    /// `InterestManager::delta`). Replicas in `delta.joined` need every
    /// field present in `changes`; fields left out are not sent to joining
    /// peers. Pure with respect to `throttles`.
    pub fn plan<T, Th, I>(
        &self,
        result: &InterestMatchResult,
        delta: &InterestDelta,
        throttles: &ThrottleMap<T, Th>,
        changes: I,
    ) -> SendPlan<T>
    where
        T: Clone,
        Th: Throttle<T> + Clone,
        I: IntoIterator<Item = (ThrottleKey, T)>,
    {
        let mut plan = SendPlan::new();

        for (key, value) in changes {
            let Some(peers) = result.get(key.replica).filter(|set| !set.is_empty()) else {
                plan.stats.unobserved += 1;
                continue;
            };

            if throttles.is_significant(&key, &value) {
                for peer in peers.iter() {
                    plan.per_peer.entry(peer).or_default().push(FieldUpdate {
                        replica: key.replica,
                        field: key.field,
                        value: value.clone(),
                    });
                }
                plan.significant.push((key, value));
                plan.stats.values_sent += 1;
            } else {
                plan.stats.values_suppressed += 1;
                for peer in peers.iter().filter(|peer| delta.is_join(key.replica, *peer)) {
                    plan.per_peer.entry(peer).or_default().push(FieldUpdate {
                        replica: key.replica,
                        field: key.field,
                        value: value.clone(),
                    });
                    plan.stats.join_deliveries += 1;
                }
            }
        }

        trace!(
            "Send plan: {} peers, {} sent, {} suppressed, {} unobserved",
            plan.per_peer.len(),
            plan.stats.values_sent,
            plan.stats.values_suppressed,
            plan.stats.unobserved
        );
        plan
    }

    /// The transport wrote `plan`: move each significant field's baseline
    /// once, whatever the number of peers it went to.
    pub fn commit<T, Th>(&self, plan: SendPlan<T>, throttles: &mut ThrottleMap<T, Th>)
    where
        Th: Throttle<T> + Clone,
    {
        if let Some(metrics) = &self.metrics {
            metrics.values_sent.fetch_add(plan.stats.values_sent, Ordering::Relaxed);
            metrics
                .values_suppressed
                .fetch_add(plan.stats.values_suppressed, Ordering::Relaxed);
        }
        for (key, value) in plan.significant {
            throttles.mark_sent(key, value);
        }
    }
}
