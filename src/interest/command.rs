//! Lock-free command queue for registry mutations from other threads
//!
//! Gameplay or connection threads hold an `InterestCommandSender` and push
//! registrations without touching the manager. The manager drains the queue
//! at the start of every matching pass, so a pass always runs on a stable
//! snapshot and queued changes become visible on the next pass.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::interest::attribute::AttributeData;
use crate::interest::error::InterestError;
use crate::interest::ids::{InterestHandlerSlot, PeerId, ReplicaId, RuleNetworkId};
use crate::interest::registry::RuleIdAllocator;
use crate::interest::rule::RuleFilter;

/// Default queue capacity (commands buffered between two passes)
pub const DEFAULT_COMMAND_CAPACITY: usize = 4096;

/// Deferred registry mutation
#[derive(Debug, Clone, PartialEq)]
pub enum InterestCommand {
    AddRule {
        net_id: RuleNetworkId,
        peer: PeerId,
        slot: InterestHandlerSlot,
        filter: RuleFilter,
    },
    UpdateRule {
        net_id: RuleNetworkId,
        filter: RuleFilter,
    },
    RemoveRule(RuleNetworkId),
    SetAttribute {
        replica: ReplicaId,
        slot: InterestHandlerSlot,
        data: AttributeData,
    },
    RemoveAttribute {
        replica: ReplicaId,
        slot: InterestHandlerSlot,
    },
    RemovePeer(PeerId),
    RemoveReplica(ReplicaId),
}

/// Receiving side, owned by the manager
pub struct CommandQueue {
    sender: Sender<InterestCommand>,
    receiver: Receiver<InterestCommand>,
    ids: RuleIdAllocator,
    capacity: usize,
}

impl CommandQueue {
    /// `ids` must be the registry's allocator so queued and direct
    /// registrations draw from the same counter.
    pub fn new(capacity: usize, ids: RuleIdAllocator) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            ids,
            capacity,
        }
    }

    /// Create a new sender handle for a producer thread
    pub fn sender(&self) -> InterestCommandSender {
        InterestCommandSender {
            sender: self.sender.clone(),
            ids: self.ids.clone(),
        }
    }

    /// Drain all pending commands, in submission order
    pub fn drain(&self) -> Vec<InterestCommand> {
        self.receiver.try_iter().collect()
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Clonable producer handle
#[derive(Clone)]
pub struct InterestCommandSender {
    sender: Sender<InterestCommand>,
    ids: RuleIdAllocator,
}

impl InterestCommandSender {
    /// Queue a new rule. The id is allocated now so the caller can reference
    /// the rule (or cancel it) before the next pass applies it.
    ///
    /// Filter geometry is checked here; slot/kind errors surface when the
    /// command is applied and are logged there.
    pub fn register_rule(
        &self,
        peer: PeerId,
        slot: InterestHandlerSlot,
        filter: RuleFilter,
    ) -> Result<RuleNetworkId, InterestError> {
        filter.validate()?;
        let net_id = self.ids.allocate();
        self.send(InterestCommand::AddRule {
            net_id,
            peer,
            slot,
            filter,
        })?;
        Ok(net_id)
    }

    pub fn update_rule(&self, net_id: RuleNetworkId, filter: RuleFilter) -> Result<(), InterestError> {
        filter.validate()?;
        self.send(InterestCommand::UpdateRule { net_id, filter })
    }

    pub fn unregister_rule(&self, net_id: RuleNetworkId) -> Result<(), InterestError> {
        self.send(InterestCommand::RemoveRule(net_id))
    }

    pub fn register_attribute(
        &self,
        replica: ReplicaId,
        slot: InterestHandlerSlot,
        data: AttributeData,
    ) -> Result<(), InterestError> {
        self.send(InterestCommand::SetAttribute { replica, slot, data })
    }

    pub fn unregister_attribute(&self, replica: ReplicaId, slot: InterestHandlerSlot) -> Result<(), InterestError> {
        self.send(InterestCommand::RemoveAttribute { replica, slot })
    }

    pub fn remove_peer(&self, peer: PeerId) -> Result<(), InterestError> {
        self.send(InterestCommand::RemovePeer(peer))
    }

    pub fn remove_replica(&self, replica: ReplicaId) -> Result<(), InterestError> {
        self.send(InterestCommand::RemoveReplica(replica))
    }

    /// Submit a command (non-blocking)
    #[inline]
    pub fn send(&self, command: InterestCommand) -> Result<(), InterestError> {
        self.sender.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => InterestError::QueueFull,
            TrySendError::Disconnected(_) => InterestError::QueueDisconnected,
        })
    }
}
