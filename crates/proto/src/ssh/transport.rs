//! Session state machine and configuration (RFC 4253).
//!
//! A session moves through these phases:
//!
//! ```text
//! VersionExchange -> KexInit -> KeyExchange -> NewKeys -> Authenticating
//!     -> Open <-> Rekeying
//!     -> Closing -> Closed
//! ```
//!
//! Phase gates which inbound message numbers are admissible; the dispatcher
//! consults [`TransportState::inbound_allowed`] before routing. During the
//! first key exchange with strict KEX in effect, nothing but KEX messages
//! and DISCONNECT may arrive before NEWKEYS.
//!
//! Re-keying triggers on any of: bytes on the current keys, packets on the
//! current keys, or elapsed time, all configurable. The session identifier
//! is set by the first exchange and never changes afterwards.

use crate::ssh::kex::NegotiatedAlgorithms;
use crate::ssh::message::{msg, MessageClass};
use skiff_platform::{Clock, SkiffError, SkiffResult};
use std::time::{Duration, Instant};
use tracing::debug;

/// Which side of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The connecting side.
    Client,
    /// The accepting side.
    Server,
}

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Identification lines being exchanged.
    VersionExchange,
    /// Our KEXINIT is out; waiting for (or processing) the peer's.
    KexInit,
    /// Method-specific key exchange messages in flight.
    KeyExchange,
    /// Waiting for NEWKEYS to complete the first exchange.
    NewKeys,
    /// Transport up, user authentication running.
    Authenticating,
    /// Authenticated; connection protocol active.
    Open,
    /// A re-key is in progress on an open session.
    Rekeying,
    /// DISCONNECT sent or received; draining.
    Closing,
    /// Dead.
    Closed,
}

/// Per-session configuration (the knobs from the protocol core's contract).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Software version in the identification line.
    pub identification: String,
    /// KEX preference list.
    pub kex_algorithms: Vec<String>,
    /// Host key algorithm preference list.
    pub host_key_algorithms: Vec<String>,
    /// Cipher preference list (used for both directions).
    pub ciphers: Vec<String>,
    /// MAC preference list (used for both directions).
    pub macs: Vec<String>,
    /// Compression preference list (used for both directions).
    pub compressions: Vec<String>,
    /// Re-key after this many bytes on the current keys.
    pub rekey_bytes_limit: u64,
    /// Re-key after this many packets on the current keys.
    pub rekey_packet_limit: u64,
    /// Re-key after this long on the current keys (zero disables).
    pub rekey_interval: Duration,
    /// Initial window advertised on new channels.
    pub channel_initial_window: u32,
    /// Maximum packet advertised on new channels.
    pub channel_max_packet: u32,
    /// Concurrent channel limit (0 = unlimited).
    pub max_channels: usize,
    /// Failed authentication attempts before disconnect.
    pub max_auth_attempts: u32,
    /// Time allowed for authentication to complete.
    pub auth_timeout: Duration,
    /// Idle timeout (zero disables).
    pub idle_timeout: Duration,
    /// Grace period for draining output at shutdown.
    pub close_wait: Duration,
    /// Whether to offer the strict-KEX extension.
    pub offer_strict_kex: bool,
    /// Whether to advertise willingness to receive SSH_MSG_EXT_INFO
    /// (client side; RFC 8308).
    pub advertise_ext_info: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            identification: format!("Skiff_{}", env!("CARGO_PKG_VERSION")),
            kex_algorithms: vec![
                "mlkem768x25519-sha256".to_string(),
                "curve25519-sha256".to_string(),
                "curve25519-sha256@libssh.org".to_string(),
                "ecdh-sha2-nistp256".to_string(),
                "ecdh-sha2-nistp384".to_string(),
                "ecdh-sha2-nistp521".to_string(),
                "diffie-hellman-group-exchange-sha256".to_string(),
                "diffie-hellman-group16-sha512".to_string(),
                "diffie-hellman-group18-sha512".to_string(),
                "diffie-hellman-group14-sha256".to_string(),
            ],
            host_key_algorithms: vec![
                "ssh-ed25519".to_string(),
                "ecdsa-sha2-nistp256".to_string(),
                "ecdsa-sha2-nistp384".to_string(),
                "ecdsa-sha2-nistp521".to_string(),
                "rsa-sha2-512".to_string(),
                "rsa-sha2-256".to_string(),
            ],
            ciphers: vec![
                "chacha20-poly1305@openssh.com".to_string(),
                "aes256-gcm@openssh.com".to_string(),
                "aes128-gcm@openssh.com".to_string(),
                "aes256-ctr".to_string(),
                "aes128-ctr".to_string(),
            ],
            macs: vec![
                "hmac-sha2-256-etm@openssh.com".to_string(),
                "hmac-sha2-512-etm@openssh.com".to_string(),
                "hmac-sha2-256".to_string(),
                "hmac-sha2-512".to_string(),
                "hmac-sha1".to_string(),
            ],
            compressions: vec!["none".to_string(), "zlib@openssh.com".to_string()],
            rekey_bytes_limit: 1 << 30,
            rekey_packet_limit: 1 << 32,
            rekey_interval: Duration::from_secs(3600),
            channel_initial_window: 2 * 1024 * 1024,
            channel_max_packet: 32 * 1024,
            max_channels: 0,
            max_auth_attempts: 6,
            auth_timeout: Duration::from_secs(120),
            idle_timeout: Duration::ZERO,
            close_wait: Duration::from_secs(15),
            offer_strict_kex: true,
            advertise_ext_info: true,
        }
    }
}

/// Session-level protocol state shared by the client and server drivers.
#[derive(Debug)]
pub struct TransportState {
    role: Role,
    phase: SessionPhase,
    config: SessionConfig,
    session_id: Option<Vec<u8>>,
    negotiated: Option<NegotiatedAlgorithms>,
    strict_kex: bool,
    first_kex_done: bool,
    keys_installed_at: Option<Instant>,
}

impl TransportState {
    /// Creates the state machine in the VersionExchange phase.
    pub fn new(role: Role, config: SessionConfig) -> Self {
        Self {
            role,
            phase: SessionPhase::VersionExchange,
            config,
            session_id: None,
            negotiated: None,
            strict_kex: false,
            first_kex_done: false,
            keys_installed_at: None,
        }
    }

    /// Our role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Moves to `next`, validating the edge.
    pub fn transition(&mut self, next: SessionPhase) -> SkiffResult<()> {
        use SessionPhase::*;
        let valid = matches!(
            (self.phase, next),
            (VersionExchange, KexInit)
                | (KexInit, KeyExchange)
                | (KeyExchange, NewKeys)
                | (NewKeys, Authenticating)
                | (Authenticating, Open)
                | (Open, Rekeying)
                | (Rekeying, Open)
                | (_, Closing)
                | (Closing, Closed)
        ) || self.phase == next;

        if !valid {
            return Err(SkiffError::Protocol(format!(
                "invalid session phase transition {:?} -> {:?}",
                self.phase, next
            )));
        }
        debug!(from = ?self.phase, to = ?next, "session phase");
        self.phase = next;
        Ok(())
    }

    /// True while a key exchange (initial or re-key) is in flight.
    pub fn in_kex(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::KexInit
                | SessionPhase::KeyExchange
                | SessionPhase::NewKeys
                | SessionPhase::Rekeying
        )
    }

    /// Sets the session identifier from the first exchange hash. Later
    /// exchanges never change it.
    pub fn set_session_id(&mut self, exchange_hash: &[u8]) {
        if self.session_id.is_none() {
            self.session_id = Some(exchange_hash.to_vec());
        }
    }

    /// The session identifier, once the first exchange completed.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Records the negotiated algorithm set; latches strict KEX when both
    /// sides advertised it at the first exchange.
    pub fn set_negotiated(&mut self, negotiated: NegotiatedAlgorithms) {
        if !self.first_kex_done {
            self.strict_kex = negotiated.strict_kex;
        }
        self.negotiated = Some(negotiated);
    }

    /// The negotiated algorithm set.
    pub fn negotiated(&self) -> Option<&NegotiatedAlgorithms> {
        self.negotiated.as_ref()
    }

    /// Whether strict KEX is in effect for this session.
    pub fn strict_kex(&self) -> bool {
        self.strict_kex
    }

    /// True after the first NEWKEYS pair completed.
    pub fn first_kex_done(&self) -> bool {
        self.first_kex_done
    }

    /// Marks a key exchange finished (both NEWKEYS processed).
    pub fn mark_kex_complete(&mut self, clock: &dyn Clock) {
        self.first_kex_done = true;
        self.keys_installed_at = Some(clock.now());
    }

    /// Whether the current keys are due for replacement.
    pub fn needs_rekey(
        &self,
        clock: &dyn Clock,
        bytes_on_keys: u64,
        packets_on_keys: u64,
    ) -> bool {
        if self.phase != SessionPhase::Open {
            return false;
        }
        if bytes_on_keys >= self.config.rekey_bytes_limit {
            return true;
        }
        if packets_on_keys >= self.config.rekey_packet_limit {
            return true;
        }
        if !self.config.rekey_interval.is_zero() {
            if let Some(at) = self.keys_installed_at {
                if clock.elapsed_since(at) >= self.config.rekey_interval {
                    return true;
                }
            }
        }
        false
    }

    /// Whether an inbound message number is admissible in the current
    /// phase. Inadmissible messages are fatal protocol errors, except in
    /// Closing/Closed where everything is silently dropped.
    pub fn inbound_allowed(&self, number: u8) -> bool {
        use SessionPhase::*;
        let class = MessageClass::of(number);
        match self.phase {
            VersionExchange => false,
            KexInit | KeyExchange | NewKeys => {
                // Strict first KEX admits only KEX messages and DISCONNECT.
                // Before negotiation we cannot know the peer is strict, so
                // the gate tightens once set_negotiated has latched it.
                if self.strict_kex && !self.first_kex_done {
                    return number == msg::DISCONNECT
                        || matches!(
                            class,
                            MessageClass::AlgorithmNegotiation | MessageClass::KexMethod
                        );
                }
                matches!(
                    class,
                    MessageClass::TransportGeneric
                        | MessageClass::AlgorithmNegotiation
                        | MessageClass::KexMethod
                ) && number != msg::SERVICE_REQUEST
                    && number != msg::SERVICE_ACCEPT
            }
            Rekeying => matches!(
                class,
                MessageClass::TransportGeneric
                    | MessageClass::AlgorithmNegotiation
                    | MessageClass::KexMethod
            ) && !matches!(number, msg::SERVICE_REQUEST | msg::SERVICE_ACCEPT | msg::EXT_INFO),
            Authenticating => matches!(
                class,
                MessageClass::TransportGeneric
                    | MessageClass::AlgorithmNegotiation
                    | MessageClass::KexMethod
                    | MessageClass::AuthGeneric
                    | MessageClass::AuthMethod
            ),
            Open => {
                matches!(
                    class,
                    MessageClass::AlgorithmNegotiation
                        | MessageClass::KexMethod
                        | MessageClass::ConnectionGeneric
                        | MessageClass::Channel
                ) || (class == MessageClass::TransportGeneric
                    && !matches!(number, msg::SERVICE_REQUEST | msg::SERVICE_ACCEPT))
            }
            Closing | Closed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_platform::SystemClock;

    fn open_state() -> TransportState {
        let mut state = TransportState::new(Role::Client, SessionConfig::default());
        state.transition(SessionPhase::KexInit).unwrap();
        state.transition(SessionPhase::KeyExchange).unwrap();
        state.transition(SessionPhase::NewKeys).unwrap();
        state.transition(SessionPhase::Authenticating).unwrap();
        state.transition(SessionPhase::Open).unwrap();
        state
    }

    #[test]
    fn test_normal_progression() {
        let state = open_state();
        assert_eq!(state.phase(), SessionPhase::Open);
        assert!(!state.in_kex());
    }

    #[test]
    fn test_invalid_transition() {
        let mut state = TransportState::new(Role::Client, SessionConfig::default());
        let err = state.transition(SessionPhase::Open).unwrap_err();
        assert!(matches!(err, SkiffError::Protocol(_)));
    }

    #[test]
    fn test_rekey_cycle() {
        let mut state = open_state();
        state.transition(SessionPhase::Rekeying).unwrap();
        assert!(state.in_kex());
        state.transition(SessionPhase::Open).unwrap();
        assert_eq!(state.phase(), SessionPhase::Open);
    }

    #[test]
    fn test_closing_from_anywhere() {
        let mut state = TransportState::new(Role::Server, SessionConfig::default());
        state.transition(SessionPhase::Closing).unwrap();
        state.transition(SessionPhase::Closed).unwrap();
    }

    #[test]
    fn test_session_id_set_once() {
        let mut state = TransportState::new(Role::Client, SessionConfig::default());
        state.set_session_id(&[1; 32]);
        state.set_session_id(&[2; 32]);
        assert_eq!(state.session_id(), Some(&[1u8; 32][..]));
    }

    #[test]
    fn test_needs_rekey_bytes_and_packets() {
        let mut state = open_state();
        let clock = SystemClock;
        state.mark_kex_complete(&clock);

        assert!(!state.needs_rekey(&clock, 0, 0));
        assert!(state.needs_rekey(&clock, 1 << 30, 0));
        assert!(state.needs_rekey(&clock, 0, 1 << 32));
        assert!(!state.needs_rekey(&clock, (1 << 30) - 1, (1 << 32) - 1));
    }

    #[test]
    fn test_needs_rekey_only_when_open() {
        let mut state = TransportState::new(Role::Client, SessionConfig::default());
        let clock = SystemClock;
        state.mark_kex_complete(&clock);
        assert!(!state.needs_rekey(&clock, u64::MAX, u64::MAX));
    }

    #[test]
    fn test_auth_phase_admission() {
        let mut state = TransportState::new(Role::Server, SessionConfig::default());
        state.transition(SessionPhase::KexInit).unwrap();
        state.transition(SessionPhase::KeyExchange).unwrap();
        state.transition(SessionPhase::NewKeys).unwrap();
        state.transition(SessionPhase::Authenticating).unwrap();

        assert!(state.inbound_allowed(msg::USERAUTH_REQUEST));
        assert!(state.inbound_allowed(msg::SERVICE_REQUEST));
        assert!(state.inbound_allowed(msg::IGNORE));
        assert!(state.inbound_allowed(msg::KEXINIT));
        assert!(!state.inbound_allowed(msg::CHANNEL_OPEN));
        assert!(!state.inbound_allowed(msg::CHANNEL_DATA));
    }

    #[test]
    fn test_open_phase_admission() {
        let state = open_state();
        assert!(state.inbound_allowed(msg::CHANNEL_OPEN));
        assert!(state.inbound_allowed(msg::GLOBAL_REQUEST));
        assert!(state.inbound_allowed(msg::KEXINIT));
        assert!(state.inbound_allowed(msg::IGNORE));
        assert!(!state.inbound_allowed(msg::SERVICE_REQUEST));
        assert!(!state.inbound_allowed(msg::USERAUTH_REQUEST));
    }

    #[test]
    fn test_strict_kex_first_exchange_admission() {
        let mut state = TransportState::new(Role::Server, SessionConfig::default());
        state.transition(SessionPhase::KexInit).unwrap();
        let mut negotiated = crate::ssh::kex::NegotiatedAlgorithms {
            kex: "curve25519-sha256".to_string(),
            host_key: "ssh-ed25519".to_string(),
            cipher_c2s: crate::ssh::crypto::CipherAlgorithm::ChaCha20Poly1305,
            cipher_s2c: crate::ssh::crypto::CipherAlgorithm::ChaCha20Poly1305,
            mac_c2s: None,
            mac_s2c: None,
            compression_c2s: crate::ssh::compress::CompressionAlgorithm::None,
            compression_s2c: crate::ssh::compress::CompressionAlgorithm::None,
            strict_kex: true,
            peer_wants_ext_info: false,
            peer_guess_wrong: false,
        };
        negotiated.strict_kex = true;
        state.set_negotiated(negotiated);
        assert!(state.strict_kex());

        state.transition(SessionPhase::KeyExchange).unwrap();
        // Strict first KEX: IGNORE is fatal, KEX messages and DISCONNECT
        // are fine.
        assert!(!state.inbound_allowed(msg::IGNORE));
        assert!(!state.inbound_allowed(msg::DEBUG));
        assert!(state.inbound_allowed(msg::KEXINIT));
        assert!(state.inbound_allowed(30));
        assert!(state.inbound_allowed(msg::DISCONNECT));
    }

    #[test]
    fn test_rekey_phase_blocks_higher_layers() {
        let mut state = open_state();
        state.transition(SessionPhase::Rekeying).unwrap();
        assert!(state.inbound_allowed(msg::KEXINIT));
        assert!(state.inbound_allowed(30));
        assert!(state.inbound_allowed(msg::IGNORE));
        assert!(!state.inbound_allowed(msg::CHANNEL_DATA));
        assert!(!state.inbound_allowed(msg::GLOBAL_REQUEST));
    }
}
