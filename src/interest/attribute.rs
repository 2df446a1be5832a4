//! Per-replica matchable data

use serde::{Deserialize, Serialize};

use crate::interest::handler::HandlerKind;
use crate::interest::ids::{InterestHandlerSlot, ReplicaId};
use crate::util::vec3::{Aabb, Vec3};

/// What a replica exposes for rules to match against
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AttributeData {
    Position(Vec3),
    Bounds(Aabb),
    Bitmask(u32),
    /// Participates in an always-match slot
    Present,
}

impl AttributeData {
    pub fn kind(&self) -> HandlerKind {
        match self {
            AttributeData::Position(_) | AttributeData::Bounds(_) => HandlerKind::Proximity,
            AttributeData::Bitmask(_) => HandlerKind::Bitmask,
            AttributeData::Present => HandlerKind::AlwaysMatch,
        }
    }

    /// Spatial extent, a degenerate box for points
    pub fn bounds(&self) -> Option<Aabb> {
        match self {
            AttributeData::Position(p) => Some(Aabb::from_point(*p)),
            AttributeData::Bounds(aabb) => Some(*aabb),
            AttributeData::Bitmask(_) | AttributeData::Present => None,
        }
    }
}

/// At most one per (replica, slot); re-registration replaces
#[derive(Debug, Clone, PartialEq)]
pub struct InterestAttribute {
    pub replica_id: ReplicaId,
    pub slot: InterestHandlerSlot,
    pub data: AttributeData,
}
