//! Matching strategies
//!
//! The set of strategies is closed, so it is a plain enum and the pass
//! dispatches with a `match`. Every matcher is a pure function of the
//! rules and attributes of its own slot: no shared scratch state, which is
//! what lets the manager run slots in any order (or in parallel).

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::interest::attribute::{AttributeData, InterestAttribute};
use crate::interest::error::HandlerFault;
use crate::interest::ids::{PeerId, ReplicaId};
use crate::interest::rule::{InterestRule, RuleFilter};
use crate::interest::spatial::SpatialGrid;
use crate::util::vec3::Aabb;

/// Which matcher a slot runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandlerKind {
    /// Sphere/box rules against point/box attributes
    Proximity,
    /// Tag bits: match when `rule & attribute != 0`
    Bitmask,
    /// Every rule sees every attribute in the slot
    AlwaysMatch,
}

/// Tuning shared by all matchers
#[derive(Debug, Clone, Copy)]
pub struct MatcherSettings {
    pub grid_cell_size: f32,
    pub max_cells_per_attribute: u64,
    pub max_query_cells: u64,
}

/// One slot's contribution to the pass: sorted, unique (replica, peer) pairs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialMatch {
    pairs: Vec<(ReplicaId, PeerId)>,
}

impl PartialMatch {
    fn from_pairs(mut pairs: Vec<(ReplicaId, PeerId)>) -> Self {
        pairs.sort_unstable();
        pairs.dedup();
        Self { pairs }
    }

    pub fn pairs(&self) -> &[(ReplicaId, PeerId)] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Run the matcher for `kind` over one slot's rules and attributes
pub fn run_matcher(
    kind: HandlerKind,
    settings: &MatcherSettings,
    rules: &[&InterestRule],
    attributes: &[&InterestAttribute],
) -> Result<PartialMatch, HandlerFault> {
    if rules.is_empty() || attributes.is_empty() {
        return Ok(PartialMatch::default());
    }
    match kind {
        HandlerKind::Proximity => match_proximity(settings, rules, attributes),
        HandlerKind::Bitmask => match_bitmask(rules, attributes),
        HandlerKind::AlwaysMatch => match_always(rules, attributes),
    }
}

// ============================================================================
// Proximity
// ============================================================================

#[inline]
fn filter_matches(filter: &RuleFilter, data: &AttributeData) -> bool {
    match (filter, data) {
        (RuleFilter::Sphere { center, radius }, AttributeData::Position(p)) => {
            center.distance_sq_to(*p) <= radius * radius
        }
        (RuleFilter::Sphere { center, radius }, AttributeData::Bounds(aabb)) => {
            aabb.distance_sq_to_point(*center) <= radius * radius
        }
        (RuleFilter::Volume(volume), AttributeData::Position(p)) => volume.contains_point(*p),
        (RuleFilter::Volume(volume), AttributeData::Bounds(aabb)) => volume.intersects(aabb),
        _ => false,
    }
}

fn match_proximity(
    settings: &MatcherSettings,
    rules: &[&InterestRule],
    attributes: &[&InterestAttribute],
) -> Result<PartialMatch, HandlerFault> {
    let mut grid = SpatialGrid::new(
        settings.grid_cell_size,
        settings.max_cells_per_attribute,
        settings.max_query_cells,
    );

    for (index, attribute) in attributes.iter().enumerate() {
        let bounds: Aabb = attribute.data.bounds().ok_or(HandlerFault::UnexpectedAttribute {
            replica: attribute.replica_id,
            expected: HandlerKind::Proximity,
            got: attribute.data.kind(),
        })?;
        if !bounds.is_finite() {
            return Err(HandlerFault::NonFiniteAttribute(attribute.replica_id));
        }
        if !bounds.is_well_formed() {
            return Err(HandlerFault::MalformedBounds(attribute.replica_id));
        }
        grid.insert(index, &bounds);
    }

    let mut pairs = Vec::new();
    let mut candidates = Vec::new();
    for rule in rules {
        let query = rule.filter.bounds().ok_or(HandlerFault::UnexpectedRule {
            rule: rule.net_id,
            expected: HandlerKind::Proximity,
            got: rule.filter.kind(),
        })?;
        grid.query(&query, &mut candidates);
        for &index in &candidates {
            let attribute = attributes[index];
            if filter_matches(&rule.filter, &attribute.data) {
                pairs.push((attribute.replica_id, rule.peer_id));
            }
        }
    }

    Ok(PartialMatch::from_pairs(pairs))
}

// ============================================================================
// Bitmask
// ============================================================================

fn match_bitmask(
    rules: &[&InterestRule],
    attributes: &[&InterestAttribute],
) -> Result<PartialMatch, HandlerFault> {
    // Peers bucketed per tag bit
    let mut buckets: [SmallVec<[PeerId; 4]>; 32] = std::array::from_fn(|_| SmallVec::new());
    for rule in rules {
        let RuleFilter::Bitmask(mask) = rule.filter else {
            return Err(HandlerFault::UnexpectedRule {
                rule: rule.net_id,
                expected: HandlerKind::Bitmask,
                got: rule.filter.kind(),
            });
        };
        for (bit, bucket) in buckets.iter_mut().enumerate() {
            if mask & (1 << bit) != 0 && !bucket.contains(&rule.peer_id) {
                bucket.push(rule.peer_id);
            }
        }
    }

    let mut pairs = Vec::new();
    for attribute in attributes {
        let AttributeData::Bitmask(mask) = attribute.data else {
            return Err(HandlerFault::UnexpectedAttribute {
                replica: attribute.replica_id,
                expected: HandlerKind::Bitmask,
                got: attribute.data.kind(),
            });
        };
        let mut bits = mask;
        while bits != 0 {
            let bit = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            pairs.extend(buckets[bit].iter().map(|peer| (attribute.replica_id, *peer)));
        }
    }

    Ok(PartialMatch::from_pairs(pairs))
}

// ============================================================================
// Always match
// ============================================================================

fn match_always(
    rules: &[&InterestRule],
    attributes: &[&InterestAttribute],
) -> Result<PartialMatch, HandlerFault> {
    let mut peers: Vec<PeerId> = rules.iter().map(|rule| rule.peer_id).collect();
    peers.sort_unstable();
    peers.dedup();

    let mut pairs = Vec::with_capacity(peers.len() * attributes.len());
    for attribute in attributes {
        pairs.extend(peers.iter().map(|peer| (attribute.replica_id, *peer)));
    }
    Ok(PartialMatch::from_pairs(pairs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interest::ids::{InterestHandlerSlot, RuleNetworkId};
    use crate::util::vec3::Vec3;

    fn settings() -> MatcherSettings {
        MatcherSettings {
            grid_cell_size: 8.0,
            max_cells_per_attribute: 64,
            max_query_cells: 4096,
        }
    }

    fn slot() -> InterestHandlerSlot {
        InterestHandlerSlot::new(0).unwrap()
    }

    fn rule(id: u64, peer: u32, filter: RuleFilter) -> InterestRule {
        InterestRule {
            peer_id: PeerId(peer),
            net_id: RuleNetworkId(id),
            slot: slot(),
            filter,
        }
    }

    fn attr(replica: u64, data: AttributeData) -> InterestAttribute {
        InterestAttribute {
            replica_id: ReplicaId(replica),
            slot: slot(),
            data,
        }
    }

    fn run(kind: HandlerKind, rules: &[InterestRule], attrs: &[InterestAttribute]) -> Result<PartialMatch, HandlerFault> {
        let rules: Vec<&InterestRule> = rules.iter().collect();
        let attrs: Vec<&InterestAttribute> = attrs.iter().collect();
        run_matcher(kind, &settings(), &rules, &attrs)
    }

    #[test]
    fn test_proximity_sphere_inclusive() {
        let rules = [rule(1, 1, RuleFilter::sphere(Vec3::ZERO, 10.0))];
        let attrs = [
            attr(1, AttributeData::Position(Vec3::new(5.0, 0.0, 0.0))),
            attr(2, AttributeData::Position(Vec3::new(50.0, 0.0, 0.0))),
            attr(3, AttributeData::Position(Vec3::new(0.0, 10.0, 0.0))),
        ];
        let result = run(HandlerKind::Proximity, &rules, &attrs).unwrap();
        assert_eq!(
            result.pairs(),
            &[(ReplicaId(1), PeerId(1)), (ReplicaId(3), PeerId(1))]
        );
    }

    #[test]
    fn test_proximity_volume_and_bounds() {
        let volume = Aabb::new(Vec3::ZERO, Vec3::splat(4.0));
        let rules = [
            rule(1, 1, RuleFilter::Volume(volume)),
            rule(2, 2, RuleFilter::sphere(Vec3::new(20.0, 0.0, 0.0), 1.0)),
        ];
        let attrs = [
            // Box straddling the sphere's edge
            attr(1, AttributeData::Bounds(Aabb::new(Vec3::new(17.0, -1.0, -1.0), Vec3::new(19.5, 1.0, 1.0)))),
            // Box overlapping the volume corner
            attr(2, AttributeData::Bounds(Aabb::new(Vec3::splat(3.0), Vec3::splat(6.0)))),
            attr(3, AttributeData::Position(Vec3::splat(5.0))),
        ];
        let result = run(HandlerKind::Proximity, &rules, &attrs).unwrap();
        assert_eq!(
            result.pairs(),
            &[(ReplicaId(1), PeerId(2)), (ReplicaId(2), PeerId(1))]
        );
    }

    #[test]
    fn test_proximity_same_peer_two_rules_deduplicated() {
        let rules = [
            rule(1, 1, RuleFilter::sphere(Vec3::ZERO, 10.0)),
            rule(2, 1, RuleFilter::sphere(Vec3::new(1.0, 0.0, 0.0), 10.0)),
        ];
        let attrs = [attr(1, AttributeData::Position(Vec3::ZERO))];
        let result = run(HandlerKind::Proximity, &rules, &attrs).unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_proximity_inverted_bounds_faults() {
        let rules = [rule(1, 1, RuleFilter::sphere(Vec3::ZERO, 100.0))];
        // One cell wide, min and max swapped on x
        let inverted = Aabb {
            min: Vec3::new(8.0, 0.0, 0.0),
            max: Vec3::new(0.0, 1.0, 1.0),
        };
        let attrs = [
            attr(1, AttributeData::Position(Vec3::ZERO)),
            attr(4, AttributeData::Bounds(inverted)),
        ];
        assert_eq!(
            run(HandlerKind::Proximity, &rules, &attrs),
            Err(HandlerFault::MalformedBounds(ReplicaId(4)))
        );
    }

    #[test]
    fn test_proximity_non_finite_faults() {
        let rules = [rule(1, 1, RuleFilter::sphere(Vec3::ZERO, 10.0))];
        let attrs = [attr(9, AttributeData::Position(Vec3::new(f32::NAN, 0.0, 0.0)))];
        assert_eq!(
            run(HandlerKind::Proximity, &rules, &attrs),
            Err(HandlerFault::NonFiniteAttribute(ReplicaId(9)))
        );
    }

    #[test]
    fn test_bitmask_matching() {
        let rules = [
            rule(1, 1, RuleFilter::Bitmask(0b0001)),
            rule(2, 2, RuleFilter::Bitmask(0b0110)),
            rule(3, 3, RuleFilter::Bitmask(0)),
        ];
        let attrs = [
            attr(1, AttributeData::Bitmask(0b0011)),
            attr(2, AttributeData::Bitmask(0b1000)),
            attr(3, AttributeData::Bitmask(0b0100)),
        ];
        let result = run(HandlerKind::Bitmask, &rules, &attrs).unwrap();
        assert_eq!(
            result.pairs(),
            &[
                (ReplicaId(1), PeerId(1)),
                (ReplicaId(1), PeerId(2)),
                (ReplicaId(3), PeerId(2)),
            ]
        );
    }

    #[test]
    fn test_bitmask_high_bit() {
        let rules = [rule(1, 1, RuleFilter::Bitmask(1 << 31))];
        let attrs = [attr(1, AttributeData::Bitmask(u32::MAX))];
        let result = run(HandlerKind::Bitmask, &rules, &attrs).unwrap();
        assert_eq!(result.pairs(), &[(ReplicaId(1), PeerId(1))]);
    }

    #[test]
    fn test_bitmask_wrong_data_faults() {
        let rules = [rule(1, 1, RuleFilter::Bitmask(1))];
        let attrs = [attr(4, AttributeData::Present)];
        assert!(matches!(
            run(HandlerKind::Bitmask, &rules, &attrs),
            Err(HandlerFault::UnexpectedAttribute { replica: ReplicaId(4), .. })
        ));
    }

    #[test]
    fn test_always_match_cross_product() {
        let rules = [rule(1, 2, RuleFilter::All), rule(2, 1, RuleFilter::All), rule(3, 2, RuleFilter::All)];
        let attrs = [attr(1, AttributeData::Present), attr(2, AttributeData::Present)];
        let result = run(HandlerKind::AlwaysMatch, &rules, &attrs).unwrap();
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn test_empty_inputs_short_circuit() {
        let attrs = [attr(1, AttributeData::Position(Vec3::new(f32::NAN, 0.0, 0.0)))];
        // No rules: nothing to match, and bad data is not inspected
        assert!(run(HandlerKind::Proximity, &[], &attrs).unwrap().is_empty());
    }
}
