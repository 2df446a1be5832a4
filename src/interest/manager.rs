//! Interest manager: owns the registry and runs the matching pass
//!
//! One manager per network session, constructed and owned by the session.
//! Each pass:
//! 1. drains queued commands from other threads,
//! 2. re-runs the matcher of every dirty slot (clean slots reuse their
//!    cached contribution),
//! 3. unions all slot contributions into a fresh `InterestMatchResult`.
//!
//! Direct `&mut self` mutations first apply everything already queued, so
//! queued and direct changes take effect in submission order.
//!
//! Slots are isolated: a matcher that faults contributes nothing for that
//! pass and is retried on the next one. The other slots are unaffected.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::{info, trace, warn};

use crate::config::InterestConfig;
use crate::interest::attribute::AttributeData;
use crate::interest::command::{CommandQueue, InterestCommand, InterestCommandSender};
use crate::interest::error::{HandlerFault, InterestError};
use crate::interest::handler::{run_matcher, HandlerKind, MatcherSettings, PartialMatch};
use crate::interest::ids::{
    InterestHandlerSlot, PeerId, ReplicaId, RuleNetworkId, MAX_HANDLER_SLOTS,
};
use crate::interest::registry::{InterestRegistry, SlotView};
use crate::interest::result::{InterestDelta, InterestMatchResult};
use crate::interest::rule::{InterestRule, RuleFilter};
use crate::metrics::InterestMetrics;

/// What happened during one matching pass
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub pass: u64,
    pub duration: Duration,
    pub commands_applied: usize,
    pub commands_rejected: usize,
    pub handlers_run: usize,
    pub handlers_reused: usize,
    pub faults: Vec<(InterestHandlerSlot, HandlerFault)>,
    pub replicas: usize,
    pub matched_pairs: usize,
}

/// Interest manager for one session
pub struct InterestManager {
    config: InterestConfig,
    settings: MatcherSettings,
    registry: InterestRegistry,
    commands: CommandQueue,
    /// Last successful contribution per slot
    cache: Vec<Option<PartialMatch>>,
    current: InterestMatchResult,
    previous: InterestMatchResult,
    report: PassReport,
    /// Commands applied since the last report
    commands_applied: usize,
    commands_rejected: usize,
    pass_count: u64,
    metrics: Option<Arc<InterestMetrics>>,
}

impl InterestManager {
    pub fn new(config: InterestConfig) -> Self {
        let registry = InterestRegistry::new(config.max_handlers);
        let commands = CommandQueue::new(
            config.command_queue_capacity.max(1),
            registry.allocator().clone(),
        );
        let settings = MatcherSettings {
            grid_cell_size: config.grid_cell_size,
            max_cells_per_attribute: config.max_cells_per_attribute,
            max_query_cells: config.max_query_cells,
        };
        Self {
            config,
            settings,
            registry,
            commands,
            cache: vec![None; MAX_HANDLER_SLOTS],
            current: InterestMatchResult::new(),
            previous: InterestMatchResult::new(),
            report: PassReport::default(),
            commands_applied: 0,
            commands_rejected: 0,
            pass_count: 0,
            metrics: None,
        }
    }

    /// Publish pass statistics into a shared metrics registry
    pub fn with_metrics(mut self, metrics: Arc<InterestMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &InterestConfig {
        &self.config
    }

    pub fn registry(&self) -> &InterestRegistry {
        &self.registry
    }

    /// Handle for producers on other threads
    pub fn command_sender(&self) -> InterestCommandSender {
        self.commands.sender()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    pub fn register_handler(&mut self, kind: HandlerKind) -> Result<InterestHandlerSlot, InterestError> {
        self.registry.register_handler(kind)
    }

    pub fn register_rule(
        &mut self,
        peer: PeerId,
        slot: InterestHandlerSlot,
        filter: RuleFilter,
    ) -> Result<RuleNetworkId, InterestError> {
        self.flush_commands();
        self.registry.register_rule(peer, slot, filter)
    }

    pub fn update_rule(&mut self, net_id: RuleNetworkId, filter: RuleFilter) -> Result<(), InterestError> {
        self.flush_commands();
        self.registry.update_rule(net_id, filter)
    }

    /// Idempotent: unknown ids are ignored
    pub fn unregister_rule(&mut self, net_id: RuleNetworkId) -> bool {
        self.flush_commands();
        self.registry.unregister_rule(net_id)
    }

    /// Rules still in the command queue are not visible until a flush
    pub fn rule(&self, net_id: RuleNetworkId) -> Option<&InterestRule> {
        self.registry.rule(net_id)
    }

    pub fn register_attribute(
        &mut self,
        replica: ReplicaId,
        slot: InterestHandlerSlot,
        data: AttributeData,
    ) -> Result<(), InterestError> {
        self.flush_commands();
        self.registry.register_attribute(replica, slot, data)
    }

    /// Idempotent: unknown keys are ignored
    pub fn unregister_attribute(&mut self, replica: ReplicaId, slot: InterestHandlerSlot) -> bool {
        self.flush_commands();
        self.registry.unregister_attribute(replica, slot)
    }

    /// Session roster: the peer left, drop its rules before the next pass.
    /// Rules queued for the peer before this call are dropped too.
    pub fn remove_peer(&mut self, peer: PeerId) -> usize {
        self.flush_commands();
        self.registry.remove_peer(peer)
    }

    /// Replica lifecycle: the replica was destroyed
    pub fn remove_replica(&mut self, replica: ReplicaId) -> usize {
        self.flush_commands();
        self.registry.remove_replica(replica)
    }

    /// Apply every queued command now, in submission order. Returns how
    /// many were applied; rejected ones are logged and counted.
    pub fn flush_commands(&mut self) -> usize {
        if self.commands.is_empty() {
            return 0;
        }
        let mut applied = 0;
        for command in self.commands.drain() {
            match self.apply_command(command) {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!("Dropping queued interest command: {}", e);
                    self.commands_rejected += 1;
                }
            }
        }
        self.commands_applied += applied;
        applied
    }

    // ========================================================================
    // Matching pass
    // ========================================================================

    /// Run a pass and return the new result. The previous result stays
    /// available through [`previous_result`](Self::previous_result) and
    /// [`delta`](Self::delta) until the next pass.
    pub fn run_matching_pass(&mut self) -> &InterestMatchResult {
        let started = Instant::now();
        self.pass_count += 1;
        let mut report = PassReport {
            pass: self.pass_count,
            ..PassReport::default()
        };

        self.flush_commands();
        report.commands_applied = std::mem::take(&mut self.commands_applied);
        report.commands_rejected = std::mem::take(&mut self.commands_rejected);

        let dirty = self.registry.dirty_slots();
        let views: Vec<SlotView<'_>> = self
            .registry
            .handler_slots()
            .filter(|slot| dirty.contains(*slot) || self.cache[slot.index()].is_none())
            .filter_map(|slot| self.registry.view(slot))
            .collect();
        let total_slots = self.registry.handler_slots().count();
        report.handlers_run = views.len();
        report.handlers_reused = total_slots - views.len();

        let outcomes = run_views(&self.settings, self.config.parallel_handlers, views);

        for (slot, outcome) in outcomes {
            match outcome {
                Ok(partial) => {
                    self.cache[slot.index()] = Some(partial);
                    self.registry.clear_dirty(slot);
                }
                Err(fault) => {
                    warn!("Interest handler at {} faulted, skipping this pass: {}", slot, fault);
                    self.cache[slot.index()] = None;
                    self.registry.mark_dirty(slot);
                    report.faults.push((slot, fault));
                }
            }
        }

        let mut result = InterestMatchResult::with_capacity(self.registry.replica_count());
        for replica in self.registry.replica_ids() {
            result.ensure_replica(replica);
        }
        for slot in self.registry.handler_slots() {
            if let Some(partial) = &self.cache[slot.index()] {
                for (replica, peer) in partial.pairs() {
                    result.insert_match(*replica, *peer);
                }
            }
        }

        report.replicas = result.len();
        report.matched_pairs = result.matched_pairs();
        report.duration = started.elapsed();

        self.previous = std::mem::replace(&mut self.current, result);
        self.publish(&report);
        trace!(
            "Interest pass {}: {} replicas, {} pairs, {} run, {} reused, {} faults in {:?}",
            report.pass,
            report.replicas,
            report.matched_pairs,
            report.handlers_run,
            report.handlers_reused,
            report.faults.len(),
            report.duration
        );
        if self.config.stats_interval > 0 && report.pass % self.config.stats_interval == 0 {
            info!(
                "Interest pass {}: {} rules, {} attributes, {} pairs, {:?}",
                report.pass,
                self.registry.rule_count(),
                self.registry.attribute_count(),
                report.matched_pairs,
                report.duration
            );
        }
        self.report = report;

        &self.current
    }

    fn apply_command(&mut self, command: InterestCommand) -> Result<(), InterestError> {
        match command {
            InterestCommand::AddRule {
                net_id,
                peer,
                slot,
                filter,
            } => self.registry.insert_rule(net_id, peer, slot, filter),
            InterestCommand::UpdateRule { net_id, filter } => self.registry.update_rule(net_id, filter),
            InterestCommand::RemoveRule(net_id) => {
                self.registry.unregister_rule(net_id);
                Ok(())
            }
            InterestCommand::SetAttribute { replica, slot, data } => {
                self.registry.register_attribute(replica, slot, data)
            }
            InterestCommand::RemoveAttribute { replica, slot } => {
                self.registry.unregister_attribute(replica, slot);
                Ok(())
            }
            InterestCommand::RemovePeer(peer) => {
                self.registry.remove_peer(peer);
                Ok(())
            }
            InterestCommand::RemoveReplica(replica) => {
                self.registry.remove_replica(replica);
                Ok(())
            }
        }
    }

    fn publish(&self, report: &PassReport) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        metrics.record_pass_time(report.duration);
        metrics.rules_live.store(self.registry.rule_count() as u64, Ordering::Relaxed);
        metrics.attributes_live.store(self.registry.attribute_count() as u64, Ordering::Relaxed);
        metrics.replicas_tracked.store(report.replicas as u64, Ordering::Relaxed);
        metrics.peers_with_rules.store(self.registry.peer_count() as u64, Ordering::Relaxed);
        metrics.matched_pairs.store(report.matched_pairs as u64, Ordering::Relaxed);
        metrics.handlers_run.fetch_add(report.handlers_run as u64, Ordering::Relaxed);
        metrics.handlers_reused.fetch_add(report.handlers_reused as u64, Ordering::Relaxed);
        metrics.handler_faults.fetch_add(report.faults.len() as u64, Ordering::Relaxed);
        metrics.commands_applied.fetch_add(report.commands_applied as u64, Ordering::Relaxed);
        metrics.commands_rejected.fetch_add(report.commands_rejected as u64, Ordering::Relaxed);

        let delta = self.current.diff(&self.previous);
        metrics.interest_joins.fetch_add(delta.joined.len() as u64, Ordering::Relaxed);
        metrics.interest_leaves.fetch_add(delta.left.len() as u64, Ordering::Relaxed);
    }

    /// Result of the most recent pass
    pub fn current_result(&self) -> &InterestMatchResult {
        &self.current
    }

    /// Result of the pass before that
    pub fn previous_result(&self) -> &InterestMatchResult {
        &self.previous
    }

    /// Join/leave events between the last two passes
    pub fn delta(&self) -> InterestDelta {
        self.current.diff(&self.previous)
    }

    pub fn last_report(&self) -> &PassReport {
        &self.report
    }

    pub fn pass_count(&self) -> u64 {
        self.pass_count
    }
}

impl Default for InterestManager {
    fn default() -> Self {
        Self::new(InterestConfig::default())
    }
}

type SlotOutcome = (InterestHandlerSlot, Result<PartialMatch, HandlerFault>);

fn run_view(settings: &MatcherSettings, view: &SlotView<'_>) -> SlotOutcome {
    (
        view.slot,
        run_matcher(view.kind, settings, &view.rules, &view.attributes),
    )
}

#[cfg(feature = "parallel")]
fn run_views(settings: &MatcherSettings, parallel: bool, views: Vec<SlotView<'_>>) -> Vec<SlotOutcome> {
    if parallel && views.len() > 1 {
        views.par_iter().map(|view| run_view(settings, view)).collect()
    } else {
        views.iter().map(|view| run_view(settings, view)).collect()
    }
}

#[cfg(not(feature = "parallel"))]
fn run_views(settings: &MatcherSettings, _parallel: bool, views: Vec<SlotView<'_>>) -> Vec<SlotOutcome> {
    views.iter().map(|view| run_view(settings, view)).collect()
}
