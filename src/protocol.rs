//! Wire messages for remote rule management
//!
//! A peer asks the host to add, move or cancel its interest rules. The host
//! answers adds (and any rejection) so the peer learns the assigned
//! `RuleNetworkId`. Updates and cancels are fire-and-forget on success.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::interest::error::InterestError;
use crate::interest::ids::{InterestHandlerSlot, PeerId, RuleNetworkId};
use crate::interest::manager::InterestManager;
use crate::interest::rule::RuleFilter;

/// Messages from peer to host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InterestRequest {
    /// Register a rule in handler slot `slot`
    AddRule {
        request_id: u32,
        slot: u8,
        filter: RuleFilter,
    },
    /// Replace the filter of a rule the peer owns
    UpdateRule {
        request_id: u32,
        rule: RuleNetworkId,
        filter: RuleFilter,
    },
    /// Drop a rule the peer owns
    CancelRule { request_id: u32, rule: RuleNetworkId },
}

impl InterestRequest {
    pub fn request_id(&self) -> u32 {
        match self {
            InterestRequest::AddRule { request_id, .. }
            | InterestRequest::UpdateRule { request_id, .. }
            | InterestRequest::CancelRule { request_id, .. } => *request_id,
        }
    }
}

/// Messages from host to peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InterestReply {
    /// The rule from `AddRule` is live under `rule`
    RuleAssigned { request_id: u32, rule: RuleNetworkId },
    /// The request was refused
    RuleRejected { request_id: u32, reason: String },
}

/// Why a request was refused
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("{peer} does not own {rule}")]
    NotOwner { peer: PeerId, rule: RuleNetworkId },
    #[error("Handler slot {0} out of range")]
    InvalidSlot(u8),
    #[error(transparent)]
    Interest(#[from] InterestError),
}

/// Apply a peer's request to the manager and build the reply, if any.
///
/// A peer may only touch its own rules. Cancelling an id that is already
/// gone is a silent no-op since it races with teardown. Queued commands are
/// applied first so ownership is checked against the latest rules.
pub fn apply_request(
    manager: &mut InterestManager,
    from_peer: PeerId,
    request: InterestRequest,
) -> Option<InterestReply> {
    manager.flush_commands();
    let request_id = request.request_id();
    match handle_request(manager, from_peer, request) {
        Ok(Some(rule)) => Some(InterestReply::RuleAssigned { request_id, rule }),
        Ok(None) => None,
        Err(e) => {
            warn!("Rejected interest request {} from {}: {}", request_id, from_peer, e);
            Some(InterestReply::RuleRejected {
                request_id,
                reason: e.to_string(),
            })
        }
    }
}

fn handle_request(
    manager: &mut InterestManager,
    from_peer: PeerId,
    request: InterestRequest,
) -> Result<Option<RuleNetworkId>, ProtocolError> {
    match request {
        InterestRequest::AddRule { slot, filter, .. } => {
            let slot = InterestHandlerSlot::new(slot as usize).ok_or(ProtocolError::InvalidSlot(slot))?;
            let rule = manager.register_rule(from_peer, slot, filter)?;
            Ok(Some(rule))
        }
        InterestRequest::UpdateRule { rule, filter, .. } => {
            check_owner(manager, from_peer, rule)?;
            manager.update_rule(rule, filter)?;
            Ok(None)
        }
        InterestRequest::CancelRule { rule, .. } => {
            if manager.rule(rule).is_none() {
                debug!("{} cancelled unknown {}", from_peer, rule);
                return Ok(None);
            }
            check_owner(manager, from_peer, rule)?;
            manager.unregister_rule(rule);
            Ok(None)
        }
    }
}

fn check_owner(manager: &InterestManager, peer: PeerId, rule: RuleNetworkId) -> Result<(), ProtocolError> {
    match manager.rule(rule) {
        Some(existing) if existing.peer_id != peer => Err(ProtocolError::NotOwner { peer, rule }),
        Some(_) => Ok(()),
        None => Err(InterestError::UnknownRule(rule).into()),
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a message using bincode (legacy config, fixed-size integers)
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(message, bincode::config::legacy()).map_err(|e| EncodeError(e.to_string()))
}

/// Decode a message using bincode
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, DecodeError> {
    bincode::serde::decode_from_slice(data, bincode::config::legacy())
        .map(|(msg, _)| msg)
        .map_err(|e| DecodeError(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(String);

#[derive(Debug, thiserror::Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(String);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interest::handler::HandlerKind;
    use crate::util::vec3::Vec3;

    fn session() -> (InterestManager, InterestHandlerSlot) {
        let mut manager = InterestManager::default();
        let slot = manager.register_handler(HandlerKind::Proximity).unwrap();
        (manager, slot)
    }

    fn add(request_id: u32, slot: InterestHandlerSlot) -> InterestRequest {
        InterestRequest::AddRule {
            request_id,
            slot: slot.index() as u8,
            filter: RuleFilter::sphere(Vec3::ZERO, 25.0),
        }
    }

    #[test]
    fn test_request_wire_format() {
        let request = InterestRequest::UpdateRule {
            request_id: 4,
            rule: RuleNetworkId(17),
            filter: RuleFilter::Bitmask(0xF0),
        };
        let bytes = encode(&request).unwrap();
        let decoded: InterestRequest = decode(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_truncated_message_fails() {
        let bytes = encode(&InterestReply::RuleAssigned {
            request_id: 1,
            rule: RuleNetworkId(3),
        })
        .unwrap();
        assert!(decode::<InterestReply>(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_add_rule_assigns_id() {
        let (mut manager, slot) = session();
        let reply = apply_request(&mut manager, PeerId(1), add(9, slot));
        let Some(InterestReply::RuleAssigned { request_id, rule }) = reply else {
            panic!("expected RuleAssigned, got {:?}", reply);
        };
        assert_eq!(request_id, 9);
        assert_eq!(manager.rule(rule).unwrap().peer_id, PeerId(1));
    }

    #[test]
    fn test_add_rule_rejected_on_bad_slot() {
        let (mut manager, _) = session();
        let request = InterestRequest::AddRule {
            request_id: 2,
            slot: 40,
            filter: RuleFilter::All,
        };
        let reply = apply_request(&mut manager, PeerId(1), request);
        assert!(matches!(reply, Some(InterestReply::RuleRejected { request_id: 2, .. })));
    }

    #[test]
    fn test_add_rule_rejected_on_kind_mismatch() {
        let (mut manager, slot) = session();
        let request = InterestRequest::AddRule {
            request_id: 3,
            slot: slot.index() as u8,
            filter: RuleFilter::Bitmask(1),
        };
        let reply = apply_request(&mut manager, PeerId(1), request);
        assert!(matches!(reply, Some(InterestReply::RuleRejected { .. })));
        assert_eq!(manager.registry().rule_count(), 0);
    }

    #[test]
    fn test_only_owner_may_update_or_cancel() {
        let (mut manager, slot) = session();
        let Some(InterestReply::RuleAssigned { rule, .. }) = apply_request(&mut manager, PeerId(1), add(1, slot))
        else {
            panic!("add failed");
        };

        let update = InterestRequest::UpdateRule {
            request_id: 2,
            rule,
            filter: RuleFilter::sphere(Vec3::ONE, 5.0),
        };
        let reply = apply_request(&mut manager, PeerId(2), update.clone());
        assert!(matches!(reply, Some(InterestReply::RuleRejected { request_id: 2, .. })));

        let cancel = InterestRequest::CancelRule { request_id: 3, rule };
        assert!(apply_request(&mut manager, PeerId(2), cancel.clone()).is_some());
        assert!(manager.rule(rule).is_some());

        assert_eq!(apply_request(&mut manager, PeerId(1), update), None);
        assert_eq!(manager.rule(rule).unwrap().filter, RuleFilter::sphere(Vec3::ONE, 5.0));
        assert_eq!(apply_request(&mut manager, PeerId(1), cancel), None);
        assert!(manager.rule(rule).is_none());
    }

    #[test]
    fn test_cancel_of_queued_rule_applies() {
        let (mut manager, slot) = session();
        let rule = manager
            .command_sender()
            .register_rule(PeerId(2), slot, RuleFilter::sphere(Vec3::ZERO, 3.0))
            .unwrap();

        let cancel = InterestRequest::CancelRule { request_id: 8, rule };
        assert_eq!(apply_request(&mut manager, PeerId(2), cancel), None);
        manager.run_matching_pass();
        assert!(manager.rule(rule).is_none());
    }

    #[test]
    fn test_cancel_unknown_is_silent() {
        let (mut manager, _) = session();
        let cancel = InterestRequest::CancelRule {
            request_id: 1,
            rule: RuleNetworkId(999),
        };
        assert_eq!(apply_request(&mut manager, PeerId(1), cancel), None);
    }

    #[test]
    fn test_update_unknown_is_rejected() {
        let (mut manager, _) = session();
        let update = InterestRequest::UpdateRule {
            request_id: 5,
            rule: RuleNetworkId(999),
            filter: RuleFilter::sphere(Vec3::ZERO, 1.0),
        };
        assert!(matches!(
            apply_request(&mut manager, PeerId(1), update),
            Some(InterestReply::RuleRejected { request_id: 5, .. })
        ));
    }
}
