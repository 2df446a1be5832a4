//! Replica interest management
//!
//! Peers register rules ("what I want to see"), replicas register attributes
//! ("what I am"). Handler slots pair the two and the manager unions every
//! slot's matches into a replica -> interested peers map once per pass.

pub mod attribute;
pub mod command;
pub mod error;
pub mod handler;
pub mod ids;
pub mod manager;
pub mod registry;
pub mod result;
pub mod rule;
pub mod spatial;

pub use attribute::{AttributeData, InterestAttribute};
pub use command::{InterestCommand, InterestCommandSender};
pub use error::{HandlerFault, InterestError};
pub use handler::HandlerKind;
pub use ids::{InterestHandlerSlot, PeerId, ReplicaId, RuleNetworkId, MAX_HANDLER_SLOTS};
pub use manager::{InterestManager, PassReport};
pub use result::{InterestDelta, InterestMatchResult, InterestPeerSet};
pub use rule::{InterestRule, RuleFilter};
