//! Low-level session connection shared by the client and server drivers.
//!
//! [`SshConnection`] owns the injected byte stream, the packet codec, and
//! the transport state machine, and drives the parts of the protocol that
//! are identical on both sides: identification exchange, key exchange and
//! re-key (including the strict-KEX and wrong-guess rules), the outbound
//! re-key barrier (higher-layer payloads queue until NEWKEYS completes),
//! and DISCONNECT handling.
//!
//! Everything here runs on the session's single task; sequence numbers and
//! reply ordering fall out of that serialization.

use crate::ssh::crypto::{CipherContext, MacKey};
use crate::ssh::dispatcher::{dispatch, Dispatch};
use crate::ssh::hostkey::{self, HostKey, HostKeyVerdict, HostKeyVerifier};
use crate::ssh::kex::{self, KexInit, NegotiatedAlgorithms};
use crate::ssh::kex_dh::{
    self, ExchangeSides, GexParams, HashAlgorithm, HashInputs, KexFamily, KexMethod, KexSecret,
    SharedSecret,
};
use crate::ssh::message::{self, msg, DisconnectReason, MessageClass, Unimplemented};
use crate::ssh::packet::PacketCodec;
use crate::ssh::transport::{Role, SessionConfig, SessionPhase, TransportState};
use crate::ssh::version::{self, Version};
use skiff_platform::{Clock, SecureRandom, SkiffError, SkiffResult};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// A routed inbound event for the driver above.
#[derive(Debug)]
pub enum Event {
    /// Key exchange payload (a peer KEXINIT here means a re-key request).
    Kex(Vec<u8>),
    /// SERVICE_REQUEST / SERVICE_ACCEPT payload.
    Service(Vec<u8>),
    /// Authentication payload.
    Auth(Vec<u8>),
    /// Connection protocol payload.
    Connection(Vec<u8>),
}

/// The shared low-level connection.
pub struct SshConnection<S> {
    stream: S,
    codec: PacketCodec,
    state: TransportState,
    rng: Box<dyn SecureRandom>,
    clock: Box<dyn Clock>,

    local_ident: Vec<u8>,
    peer_ident: Vec<u8>,
    /// Pre-banner lines the peer sent before its identification.
    pub banner_lines: Vec<String>,

    discard_next_kex_packet: bool,

    deferred: VecDeque<Vec<u8>>,
    disconnect_sent: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> SshConnection<S> {
    /// Wraps an established bidirectional stream. No bytes are exchanged
    /// until [`SshConnection::exchange_identification`].
    pub fn new(
        stream: S,
        role: Role,
        config: SessionConfig,
        rng: Box<dyn SecureRandom>,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            stream,
            codec: PacketCodec::new(),
            state: TransportState::new(role, config),
            rng,
            clock,
            local_ident: Vec::new(),
            peer_ident: Vec::new(),
            banner_lines: Vec::new(),
            discard_next_kex_packet: false,
            deferred: VecDeque::new(),
            disconnect_sent: false,
        }
    }

    /// The transport state machine.
    pub fn state(&self) -> &TransportState {
        &self.state
    }

    /// Mutable access for the driver above.
    pub fn state_mut(&mut self) -> &mut TransportState {
        &mut self.state
    }

    /// The packet codec (sequence numbers, traffic counters).
    pub fn codec(&self) -> &PacketCodec {
        &self.codec
    }

    /// Activates delayed compression (USERAUTH_SUCCESS seen).
    pub fn activate_delayed_compression(&mut self) {
        self.codec.activate_delayed_compression();
    }

    /// Sends our identification line and reads the peer's.
    pub async fn exchange_identification(&mut self) -> SkiffResult<()> {
        let ours = Version::new(&self.state.config().identification.clone(), None);
        let wire = ours.to_wire_format();
        self.local_ident = wire[..wire.len() - 2].to_vec();
        self.stream.write_all(&wire).await?;
        self.stream.flush().await?;

        let peer = version::read_peer_identification(&mut self.stream).await?;
        self.peer_ident = peer.raw_line;
        self.banner_lines = peer.banner_lines;
        Ok(())
    }

    /// The peer's software version (valid after identification).
    pub fn peer_version(&self) -> String {
        String::from_utf8_lossy(&self.peer_ident).into_owned()
    }

    fn ident_pair(&self) -> (&[u8], &[u8]) {
        match self.state.role() {
            Role::Client => (&self.local_ident, &self.peer_ident),
            Role::Server => (&self.peer_ident, &self.local_ident),
        }
    }

    // --- sending ---------------------------------------------------------

    /// Sends a payload, honoring the re-key barrier: higher-layer payloads
    /// (numbers >= 50) queue while a key exchange is in flight and flush
    /// when the new keys are installed.
    pub async fn send_payload(&mut self, payload: Vec<u8>) -> SkiffResult<()> {
        let number = *payload.first().ok_or_else(|| {
            SkiffError::Protocol("refusing to send an empty payload".to_string())
        })?;
        if self.state.in_kex()
            && !matches!(
                MessageClass::of(number),
                MessageClass::TransportGeneric
                    | MessageClass::AlgorithmNegotiation
                    | MessageClass::KexMethod
            )
        {
            trace!(number, "deferring payload during key exchange");
            self.deferred.push_back(payload);
            return Ok(());
        }
        self.send_now(&payload).await
    }

    async fn send_now(&mut self, payload: &[u8]) -> SkiffResult<()> {
        let wire = self.codec.seal(payload, self.rng.as_mut())?;
        self.stream.write_all(&wire).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn flush_deferred(&mut self) -> SkiffResult<()> {
        while let Some(payload) = self.deferred.pop_front() {
            self.send_now(&payload).await?;
        }
        Ok(())
    }

    /// Sends SSH_MSG_DISCONNECT exactly once and moves to Closing.
    pub async fn send_disconnect(
        &mut self,
        reason: DisconnectReason,
        description: &str,
    ) -> SkiffResult<()> {
        if self.disconnect_sent {
            return Ok(());
        }
        self.disconnect_sent = true;
        let payload = message::Disconnect::new(reason, description).to_bytes();
        // Best effort: the peer may already be gone.
        let _ = self.send_now(&payload).await;
        let _ = self.state.transition(SessionPhase::Closing);
        Ok(())
    }

    /// Maps a fatal error to the DISCONNECT it warrants, sends it, and
    /// returns the error.
    pub async fn fail(&mut self, err: SkiffError) -> SkiffError {
        let (reason, text) = match &err {
            SkiffError::Security(m) => (DisconnectReason::MacError, m.clone()),
            SkiffError::KeyExchange(m) => (DisconnectReason::KeyExchangeFailed, m.clone()),
            SkiffError::Protocol(m) => (DisconnectReason::ProtocolError, m.clone()),
            SkiffError::Timeout(m) => (DisconnectReason::ByApplication, m.clone()),
            _ => return err,
        };
        let _ = self.send_disconnect(reason, &text).await;
        err
    }

    // --- receiving -------------------------------------------------------

    /// Returns the next routed event, absorbing transport housekeeping.
    pub async fn next_event(&mut self) -> SkiffResult<Event> {
        loop {
            let Some(payload) = self.codec.next_payload() else {
                let mut buf = [0u8; 4096];
                let n = self.stream.read(&mut buf).await?;
                if n == 0 {
                    return Err(SkiffError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "peer closed the transport",
                    )));
                }
                self.codec.feed(&buf[..n])?;
                continue;
            };

            let sequence = self.codec.last_recv_sequence();

            // A wrong optimistic guess: exactly one KEX-range packet is
            // discarded before the real method message.
            if self.discard_next_kex_packet {
                if let Some(&number) = payload.first() {
                    if MessageClass::of(number) == MessageClass::KexMethod {
                        debug!(number, "discarding wrongly guessed first KEX packet");
                        self.discard_next_kex_packet = false;
                        continue;
                    }
                }
            }

            match dispatch(&self.state, sequence, payload)? {
                Dispatch::Consumed => continue,
                Dispatch::ReplyUnimplemented(sequence) => {
                    let reply = Unimplemented { sequence }.to_bytes();
                    self.send_now(&reply).await?;
                    continue;
                }
                Dispatch::Disconnected { reason, message } => {
                    let _ = self.state.transition(SessionPhase::Closing);
                    return Err(SkiffError::Disconnected { reason, message });
                }
                Dispatch::Kex(payload) => return Ok(Event::Kex(payload)),
                Dispatch::Service(payload) => return Ok(Event::Service(payload)),
                Dispatch::Auth(payload) => return Ok(Event::Auth(payload)),
                Dispatch::Connection(payload) => return Ok(Event::Connection(payload)),
            }
        }
    }

    /// Waits for a KEX-class payload (used inside the exchange drivers).
    async fn next_kex_payload(&mut self) -> SkiffResult<Vec<u8>> {
        match self.next_event().await? {
            Event::Kex(payload) => Ok(payload),
            other => Err(SkiffError::Protocol(format!(
                "expected key exchange traffic, got {:?}",
                other
            ))),
        }
    }

    // --- key exchange ----------------------------------------------------

    /// True when the traffic thresholds call for a re-key.
    pub fn needs_rekey(&self) -> bool {
        let send = self.codec.send_traffic();
        let recv = self.codec.recv_traffic();
        self.state.needs_rekey(
            self.clock.as_ref(),
            send.bytes.max(recv.bytes),
            send.packets.max(recv.packets),
        )
    }

    fn begin_kex_phase(&mut self) -> SkiffResult<()> {
        match self.state.phase() {
            SessionPhase::VersionExchange => self.state.transition(SessionPhase::KexInit),
            SessionPhase::Open => self.state.transition(SessionPhase::Rekeying),
            // Already mid-exchange (peer KEXINIT arrived first).
            _ => Ok(()),
        }
    }

    async fn send_our_kexinit(&mut self) -> SkiffResult<Vec<u8>> {
        let config = self.state.config().clone();
        let our_kexinit = KexInit::new(
            self.state.role(),
            &config.kex_algorithms,
            &config.host_key_algorithms,
            &config.ciphers,
            &config.macs,
            &config.compressions,
            config.offer_strict_kex,
            config.advertise_ext_info,
            self.rng.as_mut(),
        );
        let payload = our_kexinit.to_bytes();
        self.send_now(&payload).await?;
        Ok(payload)
    }

    /// Negotiates from both KEXINITs and records the result.
    fn negotiate(
        &mut self,
        our_payload: &[u8],
        peer_payload: &[u8],
    ) -> SkiffResult<(NegotiatedAlgorithms, KexMethod)> {
        let ours = KexInit::from_bytes(our_payload)?;
        let peers = KexInit::from_bytes(peer_payload)?;
        let (client, server) = match self.state.role() {
            Role::Client => (&ours, &peers),
            Role::Server => (&peers, &ours),
        };
        let negotiated = kex::negotiate(self.state.role(), client, server)?;
        if negotiated.peer_guess_wrong {
            self.discard_next_kex_packet = true;
        }
        let method = kex_dh::method_from_name(&negotiated.kex).ok_or_else(|| {
            SkiffError::KeyExchange(format!("negotiated unknown method {:?}", negotiated.kex))
        })?;
        self.state.set_negotiated(negotiated.clone());
        if self.state.phase() == SessionPhase::KexInit {
            self.state.transition(SessionPhase::KeyExchange)?;
        }
        Ok((negotiated, method))
    }

    /// Builds both cipher contexts for the freshly derived keys.
    fn derive_contexts(
        &mut self,
        hash: HashAlgorithm,
        k: &SharedSecret,
        h: &[u8],
        negotiated: &NegotiatedAlgorithms,
    ) -> SkiffResult<(CipherContext, CipherContext)> {
        self.state.set_session_id(h);
        let session_id = self
            .state
            .session_id()
            .expect("session id was just set")
            .to_vec();

        let derive = |client_to_server: bool| {
            let (cipher, mac) = if client_to_server {
                (negotiated.cipher_c2s, negotiated.mac_c2s)
            } else {
                (negotiated.cipher_s2c, negotiated.mac_s2c)
            };
            let keys = kex_dh::derive_direction_keys(
                hash,
                k,
                h,
                &session_id,
                client_to_server,
                cipher.iv_size().max(1),
                cipher.key_size(),
                mac.map_or(0, |m| m.key_size()).max(1),
            );
            let mac_key = match mac {
                Some(m) => Some(MacKey::new(m, &keys.mac)?),
                None => None,
            };
            CipherContext::new(cipher, &keys.key, &keys.iv, mac_key)
        };

        let c2s = derive(true)?;
        let s2c = derive(false)?;
        Ok(match self.state.role() {
            Role::Client => (c2s, s2c),  // (outbound, inbound)
            Role::Server => (s2c, c2s),
        })
    }

    /// Sends our NEWKEYS and installs the outbound context; then waits for
    /// the peer's NEWKEYS and installs the inbound context.
    async fn newkeys_handshake(
        &mut self,
        outbound: CipherContext,
        inbound: CipherContext,
        negotiated: &NegotiatedAlgorithms,
    ) -> SkiffResult<()> {
        let (comp_out, comp_in) = match self.state.role() {
            Role::Client => (negotiated.compression_c2s, negotiated.compression_s2c),
            Role::Server => (negotiated.compression_s2c, negotiated.compression_c2s),
        };

        if self.state.phase() == SessionPhase::KeyExchange {
            self.state.transition(SessionPhase::NewKeys)?;
        }
        self.send_now(&kex::newkeys()).await?;
        self.codec.install_outbound(outbound, comp_out);
        if self.state.strict_kex() {
            self.codec.reset_send_sequence();
        }

        let payload = self.next_kex_payload().await?;
        if payload.first() != Some(&msg::NEWKEYS) {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_NEWKEYS, got {:?}",
                payload.first()
            )));
        }
        // Reset before installing: the install replays any bytes the peer
        // pipelined behind its NEWKEYS, which already use the new counter.
        if self.state.strict_kex() {
            self.codec.reset_recv_sequence();
        }
        self.codec.install_inbound(inbound, comp_in)?;

        self.state.mark_kex_complete(self.clock.as_ref());
        let next = if self.state.phase() == SessionPhase::Rekeying {
            SessionPhase::Open
        } else {
            SessionPhase::Authenticating
        };
        self.state.transition(next)?;
        self.flush_deferred().await?;
        Ok(())
    }

    /// Runs a full key exchange as the client. `peer_kexinit` carries the
    /// peer's KEXINIT when the peer initiated the exchange.
    pub async fn run_kex_client(
        &mut self,
        host: &str,
        verifier: &dyn HostKeyVerifier,
        peer_kexinit: Option<Vec<u8>>,
    ) -> SkiffResult<()> {
        self.begin_kex_phase()?;
        let our_payload = self.send_our_kexinit().await?;

        let peer_payload = match peer_kexinit {
            Some(payload) => payload,
            None => {
                let payload = self.next_kex_payload().await?;
                if payload.first() != Some(&msg::KEXINIT) {
                    return Err(SkiffError::Protocol(
                        "expected the peer's KEXINIT".to_string(),
                    ));
                }
                payload
            }
        };

        let (negotiated, method) = self.negotiate(&our_payload, &peer_payload)?;
        let (client_ident, server_ident) = {
            let (c, s) = self.ident_pair();
            (c.to_vec(), s.to_vec())
        };
        let inputs = HashInputs {
            client_ident: &client_ident,
            server_ident: &server_ident,
            client_kexinit: &our_payload,
            server_kexinit: &peer_payload,
        };

        let (k, h, host_key_blob, signature_blob) = if method.family.is_group_exchange() {
            self.client_gex(method, &inputs).await?
        } else {
            self.client_one_round(method, &inputs).await?
        };

        // Host key verification: policy first, then the signature over H.
        match verifier
            .check(host, &negotiated.host_key, &host_key_blob)
            .await
        {
            HostKeyVerdict::Trusted => {}
            HostKeyVerdict::Unknown => {
                let err = SkiffError::KeyExchange(format!(
                    "host key for {} is not known",
                    host
                ));
                let _ = self
                    .send_disconnect(DisconnectReason::HostKeyNotVerifiable, "unknown host key")
                    .await;
                return Err(err);
            }
            HostKeyVerdict::Revoked => {
                let _ = self
                    .send_disconnect(DisconnectReason::HostKeyNotVerifiable, "revoked host key")
                    .await;
                return Err(SkiffError::KeyExchange(format!(
                    "host key for {} is revoked",
                    host
                )));
            }
        }
        hostkey::verify_signature(&negotiated.host_key, &host_key_blob, &h, &signature_blob)?;
        debug!(fingerprint = %hostkey::fingerprint(&host_key_blob), "host key verified");

        let (outbound, inbound) = self.derive_contexts(method.hash, &k, &h, &negotiated)?;
        self.newkeys_handshake(outbound, inbound, &negotiated).await
    }

    async fn client_one_round(
        &mut self,
        method: KexMethod,
        inputs: &HashInputs<'_>,
    ) -> SkiffResult<(SharedSecret, Vec<u8>, Vec<u8>, Vec<u8>)> {
        let secret = KexSecret::generate(method.family, self.rng.as_mut())?;
        let our_public = secret.public().to_vec();
        self.send_now(&kex_dh::init_payload(method.family, &our_public))
            .await?;

        let payload = self.next_kex_payload().await?;
        let reply = kex_dh::parse_reply(method.family, &payload, msg::KEX_REPLY_31)?;

        let k = secret.exchange(&reply.server_public, method.hash)?;
        let sides = if method.family.uses_mpint_public() {
            ExchangeSides::Mpints {
                e: our_public,
                f: reply.server_public.clone(),
            }
        } else {
            ExchangeSides::Strings {
                client: our_public,
                server: reply.server_public.clone(),
            }
        };
        let h = kex_dh::exchange_hash(method.hash, inputs, &reply.host_key_blob, &sides, &k);
        Ok((k, h, reply.host_key_blob, reply.signature_blob))
    }

    async fn client_gex(
        &mut self,
        method: KexMethod,
        inputs: &HashInputs<'_>,
    ) -> SkiffResult<(SharedSecret, Vec<u8>, Vec<u8>, Vec<u8>)> {
        let params = GexParams::default_client();
        self.send_now(&kex_dh::gex_request_payload(&params)).await?;

        let payload = self.next_kex_payload().await?;
        let (p, g) = kex_dh::parse_gex_group(&payload)?;
        let group = kex_dh::group_from_prime(&p, &g)?;

        let secret = KexSecret::generate_dh(group, self.rng.as_mut());
        let e = secret.public().to_vec();
        self.send_now(&kex_dh::gex_init_payload(&e)).await?;

        let payload = self.next_kex_payload().await?;
        let reply = kex_dh::parse_reply(
            KexFamily::DhGex,
            &payload,
            msg::KEX_DH_GEX_REPLY,
        )?;

        let k = secret.exchange(&reply.server_public, method.hash)?;
        let sides = ExchangeSides::Gex {
            params,
            p: p.to_bytes_be(),
            g: g.to_bytes_be(),
            e,
            f: reply.server_public.clone(),
        };
        let h = kex_dh::exchange_hash(method.hash, inputs, &reply.host_key_blob, &sides, &k);
        Ok((k, h, reply.host_key_blob, reply.signature_blob))
    }

    /// Runs a full key exchange as the server.
    pub async fn run_kex_server(
        &mut self,
        host_keys: &[Arc<dyn HostKey>],
        peer_kexinit: Option<Vec<u8>>,
    ) -> SkiffResult<()> {
        self.begin_kex_phase()?;
        let our_payload = self.send_our_kexinit().await?;

        let peer_payload = match peer_kexinit {
            Some(payload) => payload,
            None => {
                let payload = self.next_kex_payload().await?;
                if payload.first() != Some(&msg::KEXINIT) {
                    return Err(SkiffError::Protocol(
                        "expected the peer's KEXINIT".to_string(),
                    ));
                }
                payload
            }
        };

        let (negotiated, method) = self.negotiate(&our_payload, &peer_payload)?;

        let algorithm = hostkey::HostKeyAlgorithm::from_name(&negotiated.host_key)
            .ok_or_else(|| {
                SkiffError::KeyExchange(format!(
                    "negotiated unknown host key algorithm {:?}",
                    negotiated.host_key
                ))
            })?;
        let host_key = host_keys
            .iter()
            .find(|k| k.algorithms().contains(&algorithm))
            .ok_or_else(|| {
                SkiffError::KeyExchange(format!(
                    "no host key available for {}",
                    negotiated.host_key
                ))
            })?
            .clone();

        let (client_ident, server_ident) = {
            let (c, s) = self.ident_pair();
            (c.to_vec(), s.to_vec())
        };
        let inputs = HashInputs {
            client_ident: &client_ident,
            server_ident: &server_ident,
            client_kexinit: &peer_payload,
            server_kexinit: &our_payload,
        };

        let (k, h) = if method.family.is_group_exchange() {
            self.server_gex(method, &inputs, host_key.as_ref(), algorithm)
                .await?
        } else {
            self.server_one_round(method, &inputs, host_key.as_ref(), algorithm)
                .await?
        };

        let (outbound, inbound) = self.derive_contexts(method.hash, &k, &h, &negotiated)?;
        self.newkeys_handshake(outbound, inbound, &negotiated).await?;

        // RFC 8308: advertise acceptable signature algorithms once, right
        // after the first NEWKEYS, when the client asked for it. After a
        // re-key the phase is Open again and nothing is sent.
        if negotiated.peer_wants_ext_info && self.state.phase() == SessionPhase::Authenticating {
            let algorithms: Vec<String> = host_keys
                .iter()
                .flat_map(|k| k.algorithms())
                .map(|a| a.name().to_string())
                .collect();
            self.send_now(&message::ext_info_server_sig_algs(&algorithms))
                .await?;
        }
        Ok(())
    }

    async fn server_one_round(
        &mut self,
        method: KexMethod,
        inputs: &HashInputs<'_>,
        host_key: &dyn HostKey,
        algorithm: hostkey::HostKeyAlgorithm,
    ) -> SkiffResult<(SharedSecret, Vec<u8>)> {
        let payload = self.next_kex_payload().await?;
        let client_public = kex_dh::parse_init(method.family, &payload)?;

        let (server_public, k) = match method.family {
            KexFamily::MlKem768X25519 => {
                kex_dh::mlkem_server_respond(&client_public, method.hash, self.rng.as_mut())?
            }
            family => {
                let secret = KexSecret::generate(family, self.rng.as_mut())?;
                let server_public = secret.public().to_vec();
                let k = secret.exchange(&client_public, method.hash)?;
                (server_public, k)
            }
        };

        let host_key_blob = host_key.public_key_blob();
        let sides = if method.family.uses_mpint_public() {
            ExchangeSides::Mpints {
                e: client_public,
                f: server_public.clone(),
            }
        } else {
            ExchangeSides::Strings {
                client: client_public,
                server: server_public.clone(),
            }
        };
        let h = kex_dh::exchange_hash(method.hash, inputs, &host_key_blob, &sides, &k);
        let signature = host_key.sign(algorithm, &h)?;

        self.send_now(&kex_dh::reply_payload(
            method.family,
            &host_key_blob,
            &server_public,
            &signature,
        ))
        .await?;
        Ok((k, h))
    }

    async fn server_gex(
        &mut self,
        method: KexMethod,
        inputs: &HashInputs<'_>,
        host_key: &dyn HostKey,
        algorithm: hostkey::HostKeyAlgorithm,
    ) -> SkiffResult<(SharedSecret, Vec<u8>)> {
        let payload = self.next_kex_payload().await?;
        let params = kex_dh::parse_gex_request(&payload)?;
        let group = kex_dh::select_gex_group(&params)?;
        debug!(bits = group.bits, "group exchange: serving group");
        self.send_now(&kex_dh::gex_group_payload(group)).await?;

        let payload = self.next_kex_payload().await?;
        let e = kex_dh::parse_gex_init(&payload)?;

        let secret = KexSecret::generate_dh(group, self.rng.as_mut());
        let f = secret.public().to_vec();
        let k = secret.exchange(&e, method.hash)?;

        let host_key_blob = host_key.public_key_blob();
        let sides = ExchangeSides::Gex {
            params,
            p: group.prime.to_bytes_be(),
            g: num_bigint::BigUint::from(group.generator).to_bytes_be(),
            e,
            f: f.clone(),
        };
        let h = kex_dh::exchange_hash(method.hash, inputs, &host_key_blob, &sides, &k);
        let signature = host_key.sign(algorithm, &h)?;

        self.send_now(&kex_dh::gex_reply_payload(&host_key_blob, &f, &signature))
            .await?;
        Ok((k, h))
    }

    /// Initiates a re-key from the Open phase (threshold hit or caller
    /// request). The exchange itself runs through the same path as the
    /// initial one.
    pub async fn initiate_rekey_client(
        &mut self,
        host: &str,
        verifier: &dyn HostKeyVerifier,
    ) -> SkiffResult<()> {
        debug!("initiating re-key");
        self.run_kex_client(host, verifier, None).await
    }

    /// Server-side re-key initiation.
    pub async fn initiate_rekey_server(
        &mut self,
        host_keys: &[Arc<dyn HostKey>],
    ) -> SkiffResult<()> {
        debug!("initiating re-key");
        self.run_kex_server(host_keys, None).await
    }

    /// Gracefully closes: sends DISCONNECT(BY_APPLICATION) and shuts the
    /// stream down, bounded by `close_wait`.
    pub async fn close(&mut self) -> SkiffResult<()> {
        let close_wait = self.state.config().close_wait;
        self.send_disconnect(DisconnectReason::ByApplication, "closed by application")
            .await?;
        let _ = tokio::time::timeout(close_wait, self.stream.shutdown()).await;
        let _ = self.state.transition(SessionPhase::Closed);
        Ok(())
    }
}

impl<S> std::fmt::Debug for SshConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("phase", &self.state.phase())
            .field("codec", &self.codec)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::{AcceptAllVerifier, Ed25519HostKey};
    use skiff_platform::{OsRandom, SystemClock};

    fn connection_pair() -> (
        SshConnection<tokio::io::DuplexStream>,
        SshConnection<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let client = SshConnection::new(
            a,
            Role::Client,
            SessionConfig::default(),
            Box::new(OsRandom),
            Box::new(SystemClock),
        );
        let server = SshConnection::new(
            b,
            Role::Server,
            SessionConfig::default(),
            Box::new(OsRandom),
            Box::new(SystemClock),
        );
        (client, server)
    }

    #[tokio::test]
    async fn test_identification_exchange() {
        let (mut client, mut server) = connection_pair();
        let (c, s) = tokio::join!(
            client.exchange_identification(),
            server.exchange_identification()
        );
        c.unwrap();
        s.unwrap();
        assert!(client.peer_version().starts_with("SSH-2.0-Skiff_"));
        assert!(server.peer_version().starts_with("SSH-2.0-Skiff_"));
    }

    #[tokio::test]
    async fn test_full_kex_over_duplex() {
        let (mut client, mut server) = connection_pair();
        let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate(&mut OsRandom));
        let host_keys = vec![host_key];

        let (c, s) = tokio::join!(
            async {
                client.exchange_identification().await?;
                client
                    .run_kex_client("test.example", &AcceptAllVerifier, None)
                    .await
            },
            async {
                server.exchange_identification().await?;
                server.run_kex_server(&host_keys, None).await
            }
        );
        c.unwrap();
        s.unwrap();

        // Both sides derived the same session id.
        assert_eq!(client.state().session_id(), server.state().session_id());
        assert!(client.state().session_id().is_some());
        assert_eq!(
            client.state().phase(),
            SessionPhase::Authenticating
        );
    }
}
