use crate::interest::handler::HandlerKind;
use crate::interest::ids::{InterestHandlerSlot, ReplicaId, RuleNetworkId};

/// Registry, manager and command-queue errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InterestError {
    #[error("No handler registered at {0}")]
    UnknownHandler(InterestHandlerSlot),
    #[error("Handler limit reached ({0} slots)")]
    HandlerLimitReached(usize),
    #[error("{slot} runs a {expected:?} handler, got {got:?} data")]
    KindMismatch {
        slot: InterestHandlerSlot,
        expected: HandlerKind,
        got: HandlerKind,
    },
    #[error("Invalid rule filter: {0}")]
    InvalidFilter(String),
    #[error("Unknown rule {0}")]
    UnknownRule(RuleNetworkId),
    #[error("Interest command queue is full")]
    QueueFull,
    #[error("Interest command queue is disconnected")]
    QueueDisconnected,
}

/// A handler's matcher could not produce a result this pass.
///
/// Faults are isolated per handler: the slot contributes nothing for the
/// pass and is retried on the next one, other slots are unaffected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerFault {
    #[error("Non-finite geometry on {0}")]
    NonFiniteAttribute(ReplicaId),
    #[error("Inverted bounds on {0}")]
    MalformedBounds(ReplicaId),
    #[error("{replica} carries {got:?} data in a {expected:?} handler")]
    UnexpectedAttribute {
        replica: ReplicaId,
        expected: HandlerKind,
        got: HandlerKind,
    },
    #[error("Rule {rule} carries {got:?} filter in a {expected:?} handler")]
    UnexpectedRule {
        rule: RuleNetworkId,
        expected: HandlerKind,
        got: HandlerKind,
    },
}
