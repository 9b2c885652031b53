//! Inbound message dispatch.
//!
//! Decoded payloads are routed by message-number range: KEX traffic to the
//! key exchange driver, 50–79 to authentication, 80–127 to the connection
//! layer. Transport-generic housekeeping (DISCONNECT, IGNORE, DEBUG,
//! UNIMPLEMENTED) is absorbed here, and unknown message numbers produce
//! the mandatory SSH_MSG_UNIMPLEMENTED reply carrying the offending
//! packet's sequence number.
//!
//! Dispatch is pure with respect to I/O: the session drivers call
//! [`dispatch`] from their serialized receive loop and act on the result,
//! which keeps every ordering invariant (sequence numbers, reply order,
//! re-key barriers) in one place.

use crate::ssh::message::{msg, name, DebugMsg, Disconnect, MessageClass, Unimplemented};
use crate::ssh::transport::{SessionPhase, TransportState};
use skiff_platform::{SkiffError, SkiffResult};
use tracing::{debug, trace, warn};

/// Where a payload goes next.
#[derive(Debug)]
pub enum Dispatch {
    /// Key exchange traffic (20–49), including a peer-initiated KEXINIT.
    Kex(Vec<u8>),
    /// SERVICE_REQUEST / SERVICE_ACCEPT.
    Service(Vec<u8>),
    /// User authentication traffic (50–79).
    Auth(Vec<u8>),
    /// Connection protocol traffic (80–127).
    Connection(Vec<u8>),
    /// Handled internally; nothing further to do.
    Consumed,
    /// Send SSH_MSG_UNIMPLEMENTED for this sequence number.
    ReplyUnimplemented(u32),
    /// The peer sent SSH_MSG_DISCONNECT.
    Disconnected {
        /// Reason code.
        reason: u32,
        /// Description text.
        message: String,
    },
}

/// Routes one decoded payload.
///
/// `sequence` is the inbound sequence number of the packet that carried
/// the payload (needed for UNIMPLEMENTED replies). Messages inadmissible
/// in the current phase are fatal, except while closing, where everything
/// is quietly dropped.
pub fn dispatch(
    state: &TransportState,
    sequence: u64,
    payload: Vec<u8>,
) -> SkiffResult<Dispatch> {
    let Some(&number) = payload.first() else {
        return Err(SkiffError::Protocol("empty message payload".to_string()));
    };

    // DISCONNECT is honored in any phase.
    if number == msg::DISCONNECT {
        let disconnect = Disconnect::from_bytes(&payload)?;
        debug!(
            reason = disconnect.reason,
            description = %disconnect.description,
            "peer disconnected"
        );
        return Ok(Dispatch::Disconnected {
            reason: disconnect.reason,
            message: disconnect.description,
        });
    }

    if matches!(
        state.phase(),
        SessionPhase::Closing | SessionPhase::Closed
    ) {
        trace!(number, "dropping message while closing");
        return Ok(Dispatch::Consumed);
    }

    if !state.inbound_allowed(number) {
        return Err(SkiffError::Protocol(format!(
            "{} ({}) not permitted in phase {:?}",
            name(number),
            number,
            state.phase()
        )));
    }

    match MessageClass::of(number) {
        MessageClass::TransportGeneric => match number {
            msg::IGNORE => Ok(Dispatch::Consumed),
            msg::DEBUG => {
                if let Ok(dbg) = DebugMsg::from_bytes(&payload) {
                    debug!(message = %dbg.message, always = dbg.always_display, "peer debug");
                }
                Ok(Dispatch::Consumed)
            }
            msg::UNIMPLEMENTED => {
                if let Ok(un) = Unimplemented::from_bytes(&payload) {
                    warn!(sequence = un.sequence, "peer did not understand our packet");
                }
                Ok(Dispatch::Consumed)
            }
            msg::SERVICE_REQUEST | msg::SERVICE_ACCEPT => Ok(Dispatch::Service(payload)),
            msg::EXT_INFO => {
                // We advertise server-sig-algs but act on nothing inbound.
                trace!("peer EXT_INFO received");
                Ok(Dispatch::Consumed)
            }
            _ => Ok(Dispatch::ReplyUnimplemented(sequence as u32)),
        },
        MessageClass::AlgorithmNegotiation | MessageClass::KexMethod => {
            Ok(Dispatch::Kex(payload))
        }
        MessageClass::AuthGeneric | MessageClass::AuthMethod => Ok(Dispatch::Auth(payload)),
        MessageClass::ConnectionGeneric | MessageClass::Channel => {
            Ok(Dispatch::Connection(payload))
        }
        MessageClass::Reserved | MessageClass::LocalExtension => {
            trace!(number, "unknown message number");
            Ok(Dispatch::ReplyUnimplemented(sequence as u32))
        }
        MessageClass::Invalid => Err(SkiffError::Protocol(
            "message number 0 is not valid".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::message::DisconnectReason;
    use crate::ssh::transport::{Role, SessionConfig};

    fn state_in(phase: SessionPhase) -> TransportState {
        let mut state = TransportState::new(Role::Server, SessionConfig::default());
        use SessionPhase::*;
        let path: &[SessionPhase] = match phase {
            VersionExchange => &[],
            KexInit => &[KexInit],
            KeyExchange => &[KexInit, KeyExchange],
            NewKeys => &[KexInit, KeyExchange, NewKeys],
            Authenticating => &[KexInit, KeyExchange, NewKeys, Authenticating],
            Open => &[KexInit, KeyExchange, NewKeys, Authenticating, Open],
            Rekeying => &[KexInit, KeyExchange, NewKeys, Authenticating, Open, Rekeying],
            Closing => &[Closing],
            Closed => &[Closing, Closed],
        };
        for p in path {
            state.transition(*p).unwrap();
        }
        state
    }

    #[test]
    fn test_disconnect_any_phase() {
        let state = state_in(SessionPhase::KeyExchange);
        let payload = Disconnect::new(DisconnectReason::ByApplication, "bye").to_bytes();
        match dispatch(&state, 0, payload).unwrap() {
            Dispatch::Disconnected { reason, .. } => assert_eq!(reason, 11),
            other => panic!("unexpected dispatch {:?}", other),
        }
    }

    #[test]
    fn test_ignore_and_debug_consumed() {
        let state = state_in(SessionPhase::Open);
        let payload = crate::ssh::message::ignore(b"noise");
        assert!(matches!(
            dispatch(&state, 1, payload).unwrap(),
            Dispatch::Consumed
        ));
    }

    #[test]
    fn test_channel_routing() {
        let state = state_in(SessionPhase::Open);
        let payload = vec![msg::CHANNEL_DATA, 0, 0, 0, 0, 0, 0, 0, 1, 0x58];
        assert!(matches!(
            dispatch(&state, 7, payload).unwrap(),
            Dispatch::Connection(_)
        ));
    }

    #[test]
    fn test_auth_routing() {
        let state = state_in(SessionPhase::Authenticating);
        let payload = vec![msg::USERAUTH_FAILURE, 0, 0, 0, 0, 0];
        assert!(matches!(
            dispatch(&state, 2, payload).unwrap(),
            Dispatch::Auth(_)
        ));
    }

    #[test]
    fn test_out_of_phase_channel_data_fatal() {
        let state = state_in(SessionPhase::Authenticating);
        let payload = vec![msg::CHANNEL_DATA, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(dispatch(&state, 3, payload).is_err());
    }

    #[test]
    fn test_unknown_number_gets_unimplemented() {
        let state = state_in(SessionPhase::Open);
        let payload = vec![200, 1, 2, 3];
        match dispatch(&state, 41, payload).unwrap() {
            Dispatch::ReplyUnimplemented(seq) => assert_eq!(seq, 41),
            other => panic!("unexpected dispatch {:?}", other),
        }
    }

    #[test]
    fn test_rekey_kexinit_routed() {
        let state = state_in(SessionPhase::Open);
        let payload = vec![msg::KEXINIT; 1];
        assert!(matches!(
            dispatch(&state, 9, payload).unwrap(),
            Dispatch::Kex(_)
        ));
    }

    #[test]
    fn test_closing_drops_everything() {
        let state = state_in(SessionPhase::Closing);
        let payload = vec![msg::CHANNEL_DATA, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            dispatch(&state, 4, payload).unwrap(),
            Dispatch::Consumed
        ));
    }

    #[test]
    fn test_empty_payload_rejected() {
        let state = state_in(SessionPhase::Open);
        assert!(dispatch(&state, 0, Vec::new()).is_err());
    }
}
