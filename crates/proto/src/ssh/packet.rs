//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (length determined by the negotiated MAC/AEAD)
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does not count itself or the MAC
//! - `packet_length` must lie in [5, 35000]
//! - padding is at least 4 bytes and at most 255
//! - the padded region is a multiple of the cipher block size (minimum 8)
//!
//! The [`PacketCodec`] owns both directions of a session's framing: cipher
//! contexts, compression contexts, and the per-direction sequence counters.
//! Counters are kept as `u64` internally; only the low 32 bits ever reach
//! the wire (in MAC inputs). They are never reset by a re-key — only the
//! strict-KEX extension resets them, explicitly.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::packet::PacketCodec;
//! use skiff_platform::OsRandom;
//!
//! let mut sender = PacketCodec::new();
//! let mut receiver = PacketCodec::new();
//! let mut rng = OsRandom;
//!
//! let wire = sender.seal(&[20, 1, 2, 3], &mut rng).unwrap();
//! receiver.feed(&wire).unwrap();
//! assert_eq!(receiver.next_payload(), Some(vec![20, 1, 2, 3]));
//! ```

use crate::ssh::compress::{CompressionAlgorithm, Compressor, Decompressor};
use crate::ssh::crypto::{CipherContext, MAX_PACKET_LENGTH, MIN_PACKET_LENGTH, MIN_PADDING};
use skiff_platform::{SecureRandom, SkiffError, SkiffResult};
use std::collections::VecDeque;
use tracing::trace;

/// Incremental parser for one inbound packet.
///
/// Bytes are pushed as they arrive; the parser buffers until the packet
/// (including its MAC) is complete, then hands the raw bytes to the cipher
/// context for opening.
#[derive(Debug, Default)]
pub struct PacketParser {
    /// Total wire size once known: 4 + packet_length + mac_len.
    wire_length: Option<usize>,
    raw: Vec<u8>,
}

impl PacketParser {
    /// Creates a parser with no buffered bytes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes toward the current packet.
    ///
    /// Returns `Ok(None)` while incomplete, or `Ok(Some((consumed, content)))`
    /// once a packet is complete, where `content` is the decrypted
    /// `padding_length || payload || padding` region. `consumed` is how many
    /// of `bytes` were used; the caller re-feeds the remainder.
    pub fn feed(
        &mut self,
        bytes: &[u8],
        ctx: &mut CipherContext,
        sequence: u64,
    ) -> SkiffResult<Option<(usize, Vec<u8>)>> {
        let mut consumed = 0;

        let wire_length = match self.wire_length {
            Some(len) => len,
            None => {
                let want = 4 - self.raw.len();
                let take = want.min(bytes.len());
                self.raw.extend_from_slice(&bytes[..take]);
                consumed += take;
                if self.raw.len() < 4 {
                    return Ok(None);
                }

                let first4: [u8; 4] = self.raw[..4].try_into().expect("4 bytes buffered");
                let packet_length = ctx.open_length(&first4, sequence) as usize;

                if !(MIN_PACKET_LENGTH..=MAX_PACKET_LENGTH).contains(&packet_length) {
                    return Err(SkiffError::Protocol(format!(
                        "packet_length {} outside [{}, {}]",
                        packet_length, MIN_PACKET_LENGTH, MAX_PACKET_LENGTH
                    )));
                }

                let wire_length = 4 + packet_length + ctx.mac_len();
                self.wire_length = Some(wire_length);
                wire_length
            }
        };

        let bytes = &bytes[consumed..];
        let want = wire_length - self.raw.len();
        let take = want.min(bytes.len());
        self.raw.extend_from_slice(&bytes[..take]);
        consumed += take;

        if self.raw.len() < wire_length {
            return Ok(None);
        }

        let raw = std::mem::take(&mut self.raw);
        self.wire_length = None;
        let content = ctx.open(raw, sequence)?;

        // content = padding_length || payload || padding
        let Some(&padding_length) = content.first() else {
            return Err(SkiffError::Protocol("empty packet body".to_string()));
        };
        let padding_length = padding_length as usize;
        if padding_length < MIN_PADDING {
            return Err(SkiffError::Protocol(format!(
                "padding_length {} below minimum {}",
                padding_length, MIN_PADDING
            )));
        }
        if padding_length + 1 > content.len() {
            return Err(SkiffError::Protocol(
                "padding longer than packet".to_string(),
            ));
        }

        Ok(Some((consumed, content)))
    }
}

/// Traffic counters for one direction since the last key installation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrafficCounters {
    /// Bytes processed under the current keys.
    pub bytes: u64,
    /// Packets processed under the current keys.
    pub packets: u64,
}

/// Frames, encrypts, and multiplexes payloads for one session.
pub struct PacketCodec {
    send_ctx: CipherContext,
    send_seq: u64,
    send_comp: Compressor,
    send_traffic: TrafficCounters,

    recv_ctx: CipherContext,
    recv_seq: u64,
    recv_comp: Decompressor,
    recv_traffic: TrafficCounters,

    parser: PacketParser,
    pending: VecDeque<Vec<u8>>,

    /// Set once an inbound NEWKEYS has been parsed: every following byte
    /// belongs to the next key epoch and must not touch the old cipher
    /// context. Buffered here until [`PacketCodec::install_inbound`].
    awaiting_inbound_keys: bool,
    holdback: Vec<u8>,
}

impl std::fmt::Debug for PacketCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCodec")
            .field("send_seq", &self.send_seq)
            .field("recv_seq", &self.recv_seq)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCodec {
    /// Creates a codec in the pre-NEWKEYS plaintext state.
    pub fn new() -> Self {
        Self {
            send_ctx: CipherContext::plaintext(),
            send_seq: 0,
            send_comp: Compressor::new(CompressionAlgorithm::None),
            send_traffic: TrafficCounters::default(),
            recv_ctx: CipherContext::plaintext(),
            recv_seq: 0,
            recv_comp: Decompressor::new(CompressionAlgorithm::None),
            recv_traffic: TrafficCounters::default(),
            parser: PacketParser::new(),
            pending: VecDeque::new(),
            awaiting_inbound_keys: false,
            holdback: Vec::new(),
        }
    }

    /// Seals one payload into wire bytes, advancing the outbound sequence
    /// counter by exactly one.
    pub fn seal(
        &mut self,
        payload: &[u8],
        rng: &mut dyn SecureRandom,
    ) -> SkiffResult<Vec<u8>> {
        let compressed = self.send_comp.compress(payload)?;
        let wire = self.send_ctx.seal(&compressed, self.send_seq, rng)?;
        self.send_seq = self.send_seq.wrapping_add(1);
        self.send_traffic.bytes += wire.len() as u64;
        self.send_traffic.packets += 1;
        Ok(wire)
    }

    /// Feeds inbound stream bytes; complete payloads queue up for
    /// [`PacketCodec::next_payload`].
    ///
    /// Decoding suspends after an inbound NEWKEYS: anything already read
    /// beyond it is buffered and decoded only once the next keys are
    /// installed, so a peer may pipeline NEWKEYS with re-keyed traffic.
    pub fn feed(&mut self, bytes: &[u8]) -> SkiffResult<()> {
        if self.awaiting_inbound_keys {
            self.holdback.extend_from_slice(bytes);
            return Ok(());
        }
        self.feed_inner(bytes)
    }

    fn feed_inner(&mut self, mut bytes: &[u8]) -> SkiffResult<()> {
        while !bytes.is_empty() {
            let Some((consumed, content)) =
                self.parser.feed(bytes, &mut self.recv_ctx, self.recv_seq)?
            else {
                return Ok(());
            };
            bytes = &bytes[consumed..];

            self.recv_seq = self.recv_seq.wrapping_add(1);
            self.recv_traffic.bytes += content.len() as u64 + 4;
            self.recv_traffic.packets += 1;

            let padding_length = content[0] as usize;
            let payload = &content[1..content.len() - padding_length];
            let payload = self.recv_comp.decompress(payload)?;
            if payload.is_empty() {
                // Legal framing, nothing to dispatch.
                trace!("discarding packet with empty payload");
                continue;
            }
            let is_newkeys = payload == [crate::ssh::message::msg::NEWKEYS];
            self.pending.push_back(payload);
            if is_newkeys {
                self.awaiting_inbound_keys = true;
                self.holdback.extend_from_slice(bytes);
                return Ok(());
            }
        }
        Ok(())
    }

    /// Pops the next complete inbound payload, in arrival order.
    pub fn next_payload(&mut self) -> Option<Vec<u8>> {
        self.pending.pop_front()
    }

    /// Installs new outbound keys (called when our NEWKEYS is sent).
    pub fn install_outbound(&mut self, ctx: CipherContext, compression: CompressionAlgorithm) {
        let already_active = self.send_comp.is_active();
        self.send_ctx = ctx;
        self.send_comp = Compressor::new(compression);
        if compression.is_delayed() && already_active {
            // Re-key after auth: delayed compression stays on.
            self.send_comp.activate_delayed();
        }
        self.send_traffic = TrafficCounters::default();
    }

    /// Installs new inbound keys (called when the peer's NEWKEYS arrives)
    /// and resumes decoding of any bytes held back behind it.
    pub fn install_inbound(
        &mut self,
        ctx: CipherContext,
        compression: CompressionAlgorithm,
    ) -> SkiffResult<()> {
        let already_active = self.recv_comp.is_active();
        self.recv_ctx = ctx;
        self.recv_comp = Decompressor::new(compression);
        if compression.is_delayed() && already_active {
            self.recv_comp.activate_delayed();
        }
        self.recv_traffic = TrafficCounters::default();
        self.awaiting_inbound_keys = false;
        let held = std::mem::take(&mut self.holdback);
        if held.is_empty() {
            Ok(())
        } else {
            self.feed_inner(&held)
        }
    }

    /// Activates delayed (`zlib@openssh.com`) compression in both
    /// directions; called when USERAUTH_SUCCESS is sent or received.
    pub fn activate_delayed_compression(&mut self) {
        self.send_comp.activate_delayed();
        self.recv_comp.activate_delayed();
    }

    /// Strict-KEX: reset the outbound sequence counter (on NEWKEYS sent).
    pub fn reset_send_sequence(&mut self) {
        self.send_seq = 0;
    }

    /// Strict-KEX: reset the inbound sequence counter (on NEWKEYS received).
    pub fn reset_recv_sequence(&mut self) {
        self.recv_seq = 0;
    }

    /// Next outbound sequence number.
    pub fn send_sequence(&self) -> u64 {
        self.send_seq
    }

    /// Next expected inbound sequence number.
    pub fn recv_sequence(&self) -> u64 {
        self.recv_seq
    }

    /// The sequence number of the most recently received packet.
    pub fn last_recv_sequence(&self) -> u64 {
        self.recv_seq.wrapping_sub(1)
    }

    /// Outbound traffic under the current keys.
    pub fn send_traffic(&self) -> TrafficCounters {
        self.send_traffic
    }

    /// Inbound traffic under the current keys.
    pub fn recv_traffic(&self) -> TrafficCounters {
        self.recv_traffic
    }

    /// True while the outbound direction is still unencrypted.
    pub fn send_is_plaintext(&self) -> bool {
        self.send_ctx.is_plaintext()
    }
}
