//! Per-peer interest rules

use serde::{Deserialize, Serialize};

use crate::interest::error::InterestError;
use crate::interest::handler::HandlerKind;
use crate::interest::ids::{InterestHandlerSlot, PeerId, RuleNetworkId};
use crate::util::vec3::{Aabb, Vec3};

/// What a peer wants to receive
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RuleFilter {
    /// Everything within `radius` of `center` (inclusive)
    Sphere { center: Vec3, radius: f32 },
    /// Everything overlapping a box
    Volume(Aabb),
    /// Everything sharing at least one tag bit
    Bitmask(u32),
    /// Everything in the slot
    All,
}

impl RuleFilter {
    pub fn sphere(center: Vec3, radius: f32) -> Self {
        RuleFilter::Sphere { center, radius }
    }

    /// Handler kind able to evaluate this filter
    pub fn kind(&self) -> HandlerKind {
        match self {
            RuleFilter::Sphere { .. } | RuleFilter::Volume(_) => HandlerKind::Proximity,
            RuleFilter::Bitmask(_) => HandlerKind::Bitmask,
            RuleFilter::All => HandlerKind::AlwaysMatch,
        }
    }

    /// Bounding box of spatial filters
    pub fn bounds(&self) -> Option<Aabb> {
        match self {
            RuleFilter::Sphere { center, radius } => Some(Aabb::from_sphere(*center, *radius)),
            RuleFilter::Volume(aabb) => Some(*aabb),
            RuleFilter::Bitmask(_) | RuleFilter::All => None,
        }
    }

    /// Reject geometry the matchers cannot evaluate
    pub fn validate(&self) -> Result<(), InterestError> {
        match self {
            RuleFilter::Sphere { center, radius } => {
                if !center.is_finite() {
                    return Err(InterestError::InvalidFilter(format!(
                        "sphere center {:?} is not finite",
                        center
                    )));
                }
                if !radius.is_finite() || *radius < 0.0 {
                    return Err(InterestError::InvalidFilter(format!(
                        "sphere radius {} must be finite and >= 0",
                        radius
                    )));
                }
                Ok(())
            }
            RuleFilter::Volume(aabb) => {
                if !aabb.is_finite() || !aabb.is_well_formed() {
                    return Err(InterestError::InvalidFilter(format!(
                        "volume {:?} must be finite with min <= max",
                        aabb
                    )));
                }
                Ok(())
            }
            RuleFilter::Bitmask(_) | RuleFilter::All => Ok(()),
        }
    }
}

/// A live rule owned by the interest manager
#[derive(Debug, Clone, PartialEq)]
pub struct InterestRule {
    pub peer_id: PeerId,
    pub net_id: RuleNetworkId,
    pub slot: InterestHandlerSlot,
    pub filter: RuleFilter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(RuleFilter::sphere(Vec3::ZERO, 1.0).kind(), HandlerKind::Proximity);
        assert_eq!(RuleFilter::Volume(Aabb::default()).kind(), HandlerKind::Proximity);
        assert_eq!(RuleFilter::Bitmask(1).kind(), HandlerKind::Bitmask);
        assert_eq!(RuleFilter::All.kind(), HandlerKind::AlwaysMatch);
    }

    #[test]
    fn test_validate_sphere() {
        assert!(RuleFilter::sphere(Vec3::ZERO, 0.0).validate().is_ok());
        assert!(RuleFilter::sphere(Vec3::ZERO, -1.0).validate().is_err());
        assert!(RuleFilter::sphere(Vec3::ZERO, f32::NAN).validate().is_err());
        assert!(RuleFilter::sphere(Vec3::new(f32::INFINITY, 0.0, 0.0), 1.0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_validate_volume() {
        let good = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert!(RuleFilter::Volume(good).validate().is_ok());

        let inverted = Aabb { min: Vec3::ONE, max: Vec3::ZERO };
        assert!(RuleFilter::Volume(inverted).validate().is_err());
    }

    #[test]
    fn test_sphere_bounds() {
        let bounds = RuleFilter::sphere(Vec3::new(1.0, 2.0, 3.0), 2.0).bounds().unwrap();
        assert_eq!(bounds.min, Vec3::new(-1.0, 0.0, 1.0));
        assert_eq!(bounds.max, Vec3::new(3.0, 4.0, 5.0));
        assert!(RuleFilter::Bitmask(3).bounds().is_none());
    }
}
