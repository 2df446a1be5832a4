//! Identifier types for interest management
//!
//! All ids are plain values. Rules and attributes never hold references to
//! peer or replica objects, only these ids, so replica migration or peer
//! teardown elsewhere cannot leave a dangling reference here.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum number of handler slots (one bit each in a `u32` mask)
pub const MAX_HANDLER_SLOTS: usize = 32;

/// Network participant, stable for the lifetime of its session membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u32);

/// Replicated object, stable across ownership migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(pub u64);

/// Session-unique rule id, safe to reference from remote peers.
///
/// Allocated from a monotonically increasing counter and never reused, so a
/// cancelled rule can never be confused with a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleNetworkId(pub u64);

/// Position of a handler in the manager's handler bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct InterestHandlerSlot(u8);

/// Slot index outside the handler mask
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Handler slot {0} out of range")]
pub struct SlotOutOfRange(pub u8);

impl TryFrom<u8> for InterestHandlerSlot {
    type Error = SlotOutOfRange;

    fn try_from(index: u8) -> Result<Self, Self::Error> {
        Self::new(index as usize).ok_or(SlotOutOfRange(index))
    }
}

impl From<InterestHandlerSlot> for u8 {
    fn from(slot: InterestHandlerSlot) -> u8 {
        slot.0
    }
}

impl InterestHandlerSlot {
    /// Returns `None` if `index` does not fit in the handler mask
    pub fn new(index: usize) -> Option<Self> {
        if index < MAX_HANDLER_SLOTS {
            Some(Self(index as u8))
        } else {
            None
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn mask(self) -> HandlerMask {
        HandlerMask(1 << self.0)
    }
}

/// Set of handler slots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HandlerMask(pub u32);

impl HandlerMask {
    pub const EMPTY: HandlerMask = HandlerMask(0);

    #[inline]
    pub fn insert(&mut self, slot: InterestHandlerSlot) {
        self.0 |= slot.mask().0;
    }

    #[inline]
    pub fn remove(&mut self, slot: InterestHandlerSlot) {
        self.0 &= !slot.mask().0;
    }

    #[inline]
    pub fn contains(self, slot: InterestHandlerSlot) -> bool {
        self.0 & slot.mask().0 != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Slots in ascending order
    pub fn iter(self) -> impl Iterator<Item = InterestHandlerSlot> {
        (0..MAX_HANDLER_SLOTS as u8)
            .filter(move |i| self.0 & (1 << i) != 0)
            .map(InterestHandlerSlot)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer:{}", self.0)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "replica:{}", self.0)
    }
}

impl fmt::Display for RuleNetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule:{}", self.0)
    }
}

impl fmt::Display for InterestHandlerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_bounds() {
        assert!(InterestHandlerSlot::new(0).is_some());
        assert!(InterestHandlerSlot::new(31).is_some());
        assert!(InterestHandlerSlot::new(32).is_none());
    }

    #[test]
    fn test_slot_deserialize_checks_range() {
        let slot: InterestHandlerSlot = serde_json::from_str("31").unwrap();
        assert_eq!(slot.index(), 31);
        assert_eq!(serde_json::to_string(&slot).unwrap(), "31");
        assert!(serde_json::from_str::<InterestHandlerSlot>("40").is_err());
        assert_eq!(InterestHandlerSlot::try_from(32u8), Err(SlotOutOfRange(32)));
    }

    #[test]
    fn test_slot_mask() {
        let slot = InterestHandlerSlot::new(5).unwrap();
        assert_eq!(slot.mask(), HandlerMask(0b10_0000));
        assert_eq!(slot.index(), 5);
    }

    #[test]
    fn test_handler_mask_ops() {
        let a = InterestHandlerSlot::new(1).unwrap();
        let b = InterestHandlerSlot::new(30).unwrap();
        let mut mask = HandlerMask::EMPTY;
        assert!(mask.is_empty());

        mask.insert(a);
        mask.insert(b);
        mask.insert(a);
        assert_eq!(mask.len(), 2);
        assert!(mask.contains(a));
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![a, b]);

        mask.remove(a);
        assert!(!mask.contains(a));
        assert!(mask.contains(b));
    }

    #[test]
    fn test_display() {
        assert_eq!(PeerId(3).to_string(), "peer:3");
        assert_eq!(ReplicaId(9).to_string(), "replica:9");
        assert_eq!(RuleNetworkId(12).to_string(), "rule:12");
    }
}
