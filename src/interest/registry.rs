//! Rule and attribute bookkeeping
//!
//! Rules and attributes are partitioned by handler slot. Every mutation of a
//! slot marks it dirty so the next matching pass only re-runs the matchers
//! whose inputs changed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::interest::attribute::{AttributeData, InterestAttribute};
use crate::interest::error::InterestError;
use crate::interest::handler::HandlerKind;
use crate::interest::ids::{
    HandlerMask, InterestHandlerSlot, PeerId, ReplicaId, RuleNetworkId, MAX_HANDLER_SLOTS,
};
use crate::interest::rule::{InterestRule, RuleFilter};

/// Session-scoped rule id source, shared with command senders on other
/// threads. Ids start at 1 and only ever increase.
#[derive(Debug, Clone)]
pub struct RuleIdAllocator {
    next: Arc<AtomicU64>,
}

impl RuleIdAllocator {
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicU64::new(1)),
        }
    }

    #[inline]
    pub fn allocate(&self) -> RuleNetworkId {
        RuleNetworkId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Id the next allocation will return
    pub fn peek(&self) -> RuleNetworkId {
        RuleNetworkId(self.next.load(Ordering::Relaxed))
    }
}

impl Default for RuleIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything registered under one handler slot
#[derive(Debug)]
struct SlotEntry {
    kind: HandlerKind,
    rules: HashMap<RuleNetworkId, InterestRule>,
    attributes: HashMap<ReplicaId, InterestAttribute>,
}

impl SlotEntry {
    fn new(kind: HandlerKind) -> Self {
        Self {
            kind,
            rules: HashMap::new(),
            attributes: HashMap::new(),
        }
    }
}

/// Borrowed view of one slot for a matching pass
pub struct SlotView<'a> {
    pub slot: InterestHandlerSlot,
    pub kind: HandlerKind,
    pub rules: Vec<&'a InterestRule>,
    pub attributes: Vec<&'a InterestAttribute>,
}

/// Live rules and attributes, indexed by slot, peer and replica
#[derive(Debug)]
pub struct InterestRegistry {
    slots: Vec<Option<SlotEntry>>,
    max_handlers: usize,
    /// rule id -> slot holding it
    rule_slots: HashMap<RuleNetworkId, InterestHandlerSlot>,
    /// peer -> its live rules
    peer_rules: HashMap<PeerId, SmallVec<[RuleNetworkId; 4]>>,
    /// replica -> slots it has attributes in
    replica_slots: HashMap<ReplicaId, HandlerMask>,
    ids: RuleIdAllocator,
    dirty: HandlerMask,
}

impl InterestRegistry {
    pub fn new(max_handlers: usize) -> Self {
        Self::with_allocator(max_handlers, RuleIdAllocator::new())
    }

    pub fn with_allocator(max_handlers: usize, ids: RuleIdAllocator) -> Self {
        Self {
            slots: Vec::new(),
            max_handlers: max_handlers.min(MAX_HANDLER_SLOTS),
            rule_slots: HashMap::new(),
            peer_rules: HashMap::new(),
            replica_slots: HashMap::new(),
            ids,
            dirty: HandlerMask::EMPTY,
        }
    }

    pub fn allocator(&self) -> &RuleIdAllocator {
        &self.ids
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    /// Claim the next free slot for a matcher
    pub fn register_handler(&mut self, kind: HandlerKind) -> Result<InterestHandlerSlot, InterestError> {
        if self.slots.len() >= self.max_handlers {
            return Err(InterestError::HandlerLimitReached(self.max_handlers));
        }
        let slot = InterestHandlerSlot::new(self.slots.len())
            .ok_or(InterestError::HandlerLimitReached(self.max_handlers))?;
        self.slots.push(Some(SlotEntry::new(kind)));
        debug!("Registered {:?} handler at {}", kind, slot);
        Ok(slot)
    }

    pub fn handler_kind(&self, slot: InterestHandlerSlot) -> Option<HandlerKind> {
        self.entry(slot).map(|entry| entry.kind)
    }

    /// Registered slots, ascending
    pub fn handler_slots(&self) -> impl Iterator<Item = InterestHandlerSlot> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_some())
            .filter_map(|(index, _)| InterestHandlerSlot::new(index))
    }

    fn entry(&self, slot: InterestHandlerSlot) -> Option<&SlotEntry> {
        self.slots.get(slot.index()).and_then(Option::as_ref)
    }

    fn entry_for(&mut self, slot: InterestHandlerSlot, got: HandlerKind) -> Result<&mut SlotEntry, InterestError> {
        let entry = self
            .slots
            .get_mut(slot.index())
            .and_then(Option::as_mut)
            .ok_or(InterestError::UnknownHandler(slot))?;
        if entry.kind != got {
            return Err(InterestError::KindMismatch {
                slot,
                expected: entry.kind,
                got,
            });
        }
        Ok(entry)
    }

    // ========================================================================
    // Rules
    // ========================================================================

    /// Store a new rule and return its fresh id
    pub fn register_rule(
        &mut self,
        peer: PeerId,
        slot: InterestHandlerSlot,
        filter: RuleFilter,
    ) -> Result<RuleNetworkId, InterestError> {
        self.check_rule(slot, &filter)?;
        let net_id = self.ids.allocate();
        self.insert_rule(net_id, peer, slot, filter)?;
        Ok(net_id)
    }

    /// Store a rule whose id was allocated earlier (queued registration)
    pub(crate) fn insert_rule(
        &mut self,
        net_id: RuleNetworkId,
        peer: PeerId,
        slot: InterestHandlerSlot,
        filter: RuleFilter,
    ) -> Result<(), InterestError> {
        filter.validate()?;
        let entry = self.entry_for(slot, filter.kind())?;
        entry.rules.insert(
            net_id,
            InterestRule {
                peer_id: peer,
                net_id,
                slot,
                filter,
            },
        );
        self.rule_slots.insert(net_id, slot);
        self.peer_rules.entry(peer).or_default().push(net_id);
        self.dirty.insert(slot);
        debug!("Registered {} for {} at {}", net_id, peer, slot);
        Ok(())
    }

    fn check_rule(&self, slot: InterestHandlerSlot, filter: &RuleFilter) -> Result<(), InterestError> {
        filter.validate()?;
        let kind = self.handler_kind(slot).ok_or(InterestError::UnknownHandler(slot))?;
        if kind != filter.kind() {
            return Err(InterestError::KindMismatch {
                slot,
                expected: kind,
                got: filter.kind(),
            });
        }
        Ok(())
    }

    /// Replace a live rule's filter (the peer's camera moved, its tags changed)
    pub fn update_rule(&mut self, net_id: RuleNetworkId, filter: RuleFilter) -> Result<(), InterestError> {
        let slot = *self
            .rule_slots
            .get(&net_id)
            .ok_or(InterestError::UnknownRule(net_id))?;
        filter.validate()?;
        let entry = self.entry_for(slot, filter.kind())?;
        let rule = entry
            .rules
            .get_mut(&net_id)
            .ok_or(InterestError::UnknownRule(net_id))?;
        if rule.filter != filter {
            rule.filter = filter;
            self.dirty.insert(slot);
        }
        Ok(())
    }

    /// Remove a rule. Unknown or already removed ids are a no-op.
    pub fn unregister_rule(&mut self, net_id: RuleNetworkId) -> bool {
        let Some(slot) = self.rule_slots.remove(&net_id) else {
            return false;
        };
        let removed = self
            .slots
            .get_mut(slot.index())
            .and_then(Option::as_mut)
            .and_then(|entry| entry.rules.remove(&net_id));

        if let Some(rule) = removed {
            if let Some(rules) = self.peer_rules.get_mut(&rule.peer_id) {
                rules.retain(|id| *id != net_id);
                if rules.is_empty() {
                    self.peer_rules.remove(&rule.peer_id);
                }
            }
            self.dirty.insert(slot);
            debug!("Unregistered {} of {}", net_id, rule.peer_id);
            true
        } else {
            false
        }
    }

    /// Drop every rule a peer owns. Called when the peer leaves the session.
    pub fn remove_peer(&mut self, peer: PeerId) -> usize {
        let Some(rules) = self.peer_rules.remove(&peer) else {
            return 0;
        };
        let mut removed = 0;
        for net_id in rules {
            if let Some(slot) = self.rule_slots.remove(&net_id) {
                if let Some(entry) = self.slots.get_mut(slot.index()).and_then(Option::as_mut) {
                    if entry.rules.remove(&net_id).is_some() {
                        removed += 1;
                        self.dirty.insert(slot);
                    }
                }
            }
        }
        debug!("Removed {} rules of departed {}", removed, peer);
        removed
    }

    pub fn rule(&self, net_id: RuleNetworkId) -> Option<&InterestRule> {
        let slot = self.rule_slots.get(&net_id)?;
        self.entry(*slot)?.rules.get(&net_id)
    }

    /// Rule ids owned by a peer, ascending
    pub fn rules_for_peer(&self, peer: PeerId) -> Vec<RuleNetworkId> {
        let mut ids: Vec<RuleNetworkId> = self
            .peer_rules
            .get(&peer)
            .map(|rules| rules.to_vec())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn rule_count(&self) -> usize {
        self.rule_slots.len()
    }

    /// Peers with at least one live rule
    pub fn peer_count(&self) -> usize {
        self.peer_rules.len()
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    /// Insert or replace the attribute for (replica, slot). Last write wins.
    pub fn register_attribute(
        &mut self,
        replica: ReplicaId,
        slot: InterestHandlerSlot,
        data: AttributeData,
    ) -> Result<(), InterestError> {
        let entry = self.entry_for(slot, data.kind())?;
        let changed = match entry.attributes.get_mut(&replica) {
            Some(existing) => {
                let changed = existing.data != data;
                existing.data = data;
                changed
            }
            None => {
                entry.attributes.insert(
                    replica,
                    InterestAttribute {
                        replica_id: replica,
                        slot,
                        data,
                    },
                );
                true
            }
        };
        self.replica_slots.entry(replica).or_default().insert(slot);
        if changed {
            self.dirty.insert(slot);
        }
        Ok(())
    }

    /// Remove the attribute for (replica, slot). Unknown keys are a no-op.
    pub fn unregister_attribute(&mut self, replica: ReplicaId, slot: InterestHandlerSlot) -> bool {
        let removed = self
            .slots
            .get_mut(slot.index())
            .and_then(Option::as_mut)
            .and_then(|entry| entry.attributes.remove(&replica))
            .is_some();
        if removed {
            if let Some(mask) = self.replica_slots.get_mut(&replica) {
                mask.remove(slot);
                if mask.is_empty() {
                    self.replica_slots.remove(&replica);
                }
            }
            self.dirty.insert(slot);
        }
        removed
    }

    /// Drop every attribute of a destroyed replica
    pub fn remove_replica(&mut self, replica: ReplicaId) -> usize {
        let Some(mask) = self.replica_slots.remove(&replica) else {
            return 0;
        };
        let mut removed = 0;
        for slot in mask.iter() {
            if let Some(entry) = self.slots.get_mut(slot.index()).and_then(Option::as_mut) {
                if entry.attributes.remove(&replica).is_some() {
                    removed += 1;
                    self.dirty.insert(slot);
                }
            }
        }
        debug!("Removed {} attributes of destroyed {}", removed, replica);
        removed
    }

    pub fn attribute(&self, replica: ReplicaId, slot: InterestHandlerSlot) -> Option<&InterestAttribute> {
        self.entry(slot)?.attributes.get(&replica)
    }

    /// Total attributes across all slots
    pub fn attribute_count(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .map(|entry| entry.attributes.len())
            .sum()
    }

    /// Replicas with at least one attribute
    pub fn replica_ids(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.replica_slots.keys().copied()
    }

    pub fn replica_count(&self) -> usize {
        self.replica_slots.len()
    }

    // ========================================================================
    // Pass support
    // ========================================================================

    pub fn dirty_slots(&self) -> HandlerMask {
        self.dirty
    }

    pub fn mark_dirty(&mut self, slot: InterestHandlerSlot) {
        self.dirty.insert(slot);
    }

    pub fn clear_dirty(&mut self, slot: InterestHandlerSlot) {
        self.dirty.remove(slot);
    }

    /// Borrow one slot's contents for matching
    pub fn view(&self, slot: InterestHandlerSlot) -> Option<SlotView<'_>> {
        let entry = self.entry(slot)?;
        Some(SlotView {
            slot,
            kind: entry.kind,
            rules: entry.rules.values().collect(),
            attributes: entry.attributes.values().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::vec3::Vec3;

    fn registry_with(kinds: &[HandlerKind]) -> (InterestRegistry, Vec<InterestHandlerSlot>) {
        let mut registry = InterestRegistry::new(MAX_HANDLER_SLOTS);
        let slots = kinds
            .iter()
            .map(|kind| registry.register_handler(*kind).unwrap())
            .collect();
        (registry, slots)
    }

    #[test]
    fn test_handler_limit() {
        let mut registry = InterestRegistry::new(2);
        registry.register_handler(HandlerKind::Proximity).unwrap();
        registry.register_handler(HandlerKind::Bitmask).unwrap();
        assert_eq!(
            registry.register_handler(HandlerKind::AlwaysMatch),
            Err(InterestError::HandlerLimitReached(2))
        );
    }

    #[test]
    fn test_rule_ids_strictly_increase() {
        let (mut registry, slots) = registry_with(&[HandlerKind::Bitmask]);
        let mut last = RuleNetworkId(0);
        for i in 0..50u32 {
            let id = registry.register_rule(PeerId(i % 3), slots[0], RuleFilter::Bitmask(1)).unwrap();
            assert!(id > last);
            last = id;
            if i % 2 == 0 {
                registry.unregister_rule(id);
            }
        }
        assert_eq!(registry.rule_count(), 25);
    }

    #[test]
    fn test_rule_kind_mismatch() {
        let (mut registry, slots) = registry_with(&[HandlerKind::Bitmask]);
        let err = registry
            .register_rule(PeerId(1), slots[0], RuleFilter::sphere(Vec3::ZERO, 1.0))
            .unwrap_err();
        assert!(matches!(err, InterestError::KindMismatch { .. }));
        assert_eq!(registry.rule_count(), 0);
    }

    #[test]
    fn test_failed_registration_does_not_burn_id() {
        let (mut registry, slots) = registry_with(&[HandlerKind::Proximity]);
        let before = registry.allocator().peek();
        assert!(registry
            .register_rule(PeerId(1), slots[0], RuleFilter::sphere(Vec3::ZERO, -1.0))
            .is_err());
        assert_eq!(registry.allocator().peek(), before);
    }

    #[test]
    fn test_unknown_slot() {
        let (mut registry, _) = registry_with(&[]);
        let slot = InterestHandlerSlot::new(3).unwrap();
        assert_eq!(
            registry.register_rule(PeerId(1), slot, RuleFilter::All),
            Err(InterestError::UnknownHandler(slot))
        );
        assert_eq!(
            registry.register_attribute(ReplicaId(1), slot, AttributeData::Present),
            Err(InterestError::UnknownHandler(slot))
        );
    }

    #[test]
    fn test_unregister_rule_idempotent() {
        let (mut registry, slots) = registry_with(&[HandlerKind::AlwaysMatch]);
        let keep = registry.register_rule(PeerId(1), slots[0], RuleFilter::All).unwrap();
        let drop = registry.register_rule(PeerId(2), slots[0], RuleFilter::All).unwrap();

        assert!(registry.unregister_rule(drop));
        assert!(!registry.unregister_rule(drop));
        assert!(!registry.unregister_rule(RuleNetworkId(999)));

        assert_eq!(registry.rule_count(), 1);
        assert!(registry.rule(keep).is_some());
        assert_eq!(registry.rules_for_peer(PeerId(1)), vec![keep]);
        assert!(registry.rules_for_peer(PeerId(2)).is_empty());
    }

    #[test]
    fn test_update_rule() {
        let (mut registry, slots) = registry_with(&[HandlerKind::Proximity]);
        let id = registry
            .register_rule(PeerId(1), slots[0], RuleFilter::sphere(Vec3::ZERO, 1.0))
            .unwrap();
        registry.clear_dirty(slots[0]);

        let moved = RuleFilter::sphere(Vec3::new(3.0, 0.0, 0.0), 1.0);
        registry.update_rule(id, moved).unwrap();
        assert_eq!(registry.rule(id).unwrap().filter, moved);
        assert!(registry.dirty_slots().contains(slots[0]));

        registry.unregister_rule(id);
        assert_eq!(registry.update_rule(id, moved), Err(InterestError::UnknownRule(id)));
    }

    #[test]
    fn test_attribute_replace_not_duplicate() {
        let (mut registry, slots) = registry_with(&[HandlerKind::Proximity]);
        let replica = ReplicaId(7);
        registry
            .register_attribute(replica, slots[0], AttributeData::Position(Vec3::ZERO))
            .unwrap();
        registry
            .register_attribute(replica, slots[0], AttributeData::Position(Vec3::ONE))
            .unwrap();

        assert_eq!(registry.attribute_count(), 1);
        assert_eq!(
            registry.attribute(replica, slots[0]).unwrap().data,
            AttributeData::Position(Vec3::ONE)
        );
    }

    #[test]
    fn test_unchanged_attribute_keeps_slot_clean() {
        let (mut registry, slots) = registry_with(&[HandlerKind::Bitmask]);
        registry.register_attribute(ReplicaId(1), slots[0], AttributeData::Bitmask(2)).unwrap();
        registry.clear_dirty(slots[0]);
        registry.register_attribute(ReplicaId(1), slots[0], AttributeData::Bitmask(2)).unwrap();
        assert!(registry.dirty_slots().is_empty());
    }

    #[test]
    fn test_remove_peer_and_replica() {
        let (mut registry, slots) = registry_with(&[HandlerKind::Bitmask, HandlerKind::AlwaysMatch]);
        registry.register_rule(PeerId(1), slots[0], RuleFilter::Bitmask(1)).unwrap();
        registry.register_rule(PeerId(1), slots[1], RuleFilter::All).unwrap();
        registry.register_rule(PeerId(2), slots[1], RuleFilter::All).unwrap();
        registry.register_attribute(ReplicaId(1), slots[0], AttributeData::Bitmask(1)).unwrap();
        registry.register_attribute(ReplicaId(1), slots[1], AttributeData::Present).unwrap();
        registry.register_attribute(ReplicaId(2), slots[1], AttributeData::Present).unwrap();

        assert_eq!(registry.remove_peer(PeerId(1)), 2);
        assert_eq!(registry.remove_peer(PeerId(1)), 0);
        assert_eq!(registry.rule_count(), 1);
        assert_eq!(registry.peer_count(), 1);

        assert_eq!(registry.remove_replica(ReplicaId(1)), 2);
        assert_eq!(registry.remove_replica(ReplicaId(1)), 0);
        assert_eq!(registry.attribute_count(), 1);
        assert_eq!(registry.replica_count(), 1);
    }

    #[test]
    fn test_unregister_attribute_idempotent() {
        let (mut registry, slots) = registry_with(&[HandlerKind::AlwaysMatch]);
        registry.register_attribute(ReplicaId(1), slots[0], AttributeData::Present).unwrap();
        assert!(registry.unregister_attribute(ReplicaId(1), slots[0]));
        assert!(!registry.unregister_attribute(ReplicaId(1), slots[0]));
        assert_eq!(registry.replica_count(), 0);
    }

    #[test]
    fn test_view_contents() {
        let (mut registry, slots) = registry_with(&[HandlerKind::AlwaysMatch]);
        registry.register_rule(PeerId(1), slots[0], RuleFilter::All).unwrap();
        registry.register_attribute(ReplicaId(3), slots[0], AttributeData::Present).unwrap();
        let view = registry.view(slots[0]).unwrap();
        assert_eq!(view.kind, HandlerKind::AlwaysMatch);
        assert_eq!(view.rules.len(), 1);
        assert_eq!(view.attributes.len(), 1);
    }
}
