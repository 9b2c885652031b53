//! Cipher and MAC pipeline for the binary packet protocol.
//!
//! This module implements the per-direction transformation between plaintext
//! packets and wire bytes for every supported algorithm family:
//!
//! - `chacha20-poly1305@openssh.com` — AEAD with a dedicated 32-byte length
//!   key; the packet length is encrypted separately and the Poly1305 tag
//!   covers encrypted length and body (PROTOCOL.chacha20poly1305)
//! - `aes128-gcm@openssh.com`, `aes256-gcm@openssh.com` — AEAD per RFC 5647;
//!   the length stays cleartext and is authenticated as AAD, the 12-byte
//!   nonce carries an invocation counter in its low 8 bytes
//! - `aes128-ctr`, `aes256-ctr` — RFC 4344 counter mode with an HMAC, in
//!   both the classic (MAC over plaintext, length encrypted) and
//!   `-etm@openssh.com` (MAC over ciphertext, length cleartext) disciplines
//!
//! Sequence numbers are owned by the packet codec and passed in; a cipher
//! context never counts packets itself, so re-keying cannot desynchronize
//! the MAC stream.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::crypto::CipherAlgorithm;
//!
//! let algo = CipherAlgorithm::from_name("chacha20-poly1305@openssh.com").unwrap();
//! assert!(algo.is_aead());
//! assert_eq!(algo.key_size(), 64);
//! ```

use aes_gcm::aead::AeadMutInPlace;
use aes_gcm::KeyInit;
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use skiff_platform::{SecureRandom, SkiffError, SkiffResult};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

/// Minimum padding (RFC 4253 Section 6).
pub const MIN_PADDING: usize = 4;

/// Smallest legal `packet_length` value.
pub const MIN_PACKET_LENGTH: usize = 5;

/// Largest total packet size an implementation must accept (RFC 4253 6.1).
pub const MAX_PACKET_LENGTH: usize = 35000;

/// `chacha20-poly1305@openssh.com` uses the 64-bit-nonce ChaCha20 variant.
type SshChaCha20 = chacha20::ChaCha20Legacy;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Cipher algorithm negotiated for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// ChaCha20-Poly1305 AEAD (OpenSSH construction).
    ChaCha20Poly1305,
    /// AES-128-GCM AEAD.
    Aes128Gcm,
    /// AES-256-GCM AEAD.
    Aes256Gcm,
    /// AES-128-CTR stream cipher, requires a separate MAC.
    Aes128Ctr,
    /// AES-256-CTR stream cipher, requires a separate MAC.
    Aes256Ctr,
}

impl CipherAlgorithm {
    /// Returns the wire name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305@openssh.com",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
        }
    }

    /// Parses a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "chacha20-poly1305@openssh.com" => Some(CipherAlgorithm::ChaCha20Poly1305),
            "aes128-gcm@openssh.com" => Some(CipherAlgorithm::Aes128Gcm),
            "aes256-gcm@openssh.com" => Some(CipherAlgorithm::Aes256Gcm),
            "aes128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "aes256-ctr" => Some(CipherAlgorithm::Aes256Ctr),
            _ => None,
        }
    }

    /// Bytes of key material consumed from the KDF.
    pub fn key_size(&self) -> usize {
        match self {
            // 32 for the main key, 32 for the length key.
            CipherAlgorithm::ChaCha20Poly1305 => 64,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes128Ctr => 16,
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::Aes256Ctr => 32,
        }
    }

    /// Bytes of IV material consumed from the KDF.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 0,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => 12,
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => 16,
        }
    }

    /// Padding alignment block size. ChaCha20 is treated as 8 (RFC 4253
    /// floor) because it is a stream cipher.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 8,
            _ => 16,
        }
    }

    /// Authentication tag length appended by AEAD modes.
    pub fn tag_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305
            | CipherAlgorithm::Aes128Gcm
            | CipherAlgorithm::Aes256Gcm => 16,
            _ => 0,
        }
    }

    /// True for AEAD modes (MAC is implied by the cipher).
    pub fn is_aead(&self) -> bool {
        self.tag_size() > 0
    }
}

/// MAC algorithm for non-AEAD ciphers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA1, MAC over plaintext.
    HmacSha1,
    /// HMAC-SHA2-256, MAC over plaintext.
    HmacSha256,
    /// HMAC-SHA2-512, MAC over plaintext.
    HmacSha512,
    /// HMAC-SHA1, encrypt-then-MAC.
    HmacSha1Etm,
    /// HMAC-SHA2-256, encrypt-then-MAC.
    HmacSha256Etm,
    /// HMAC-SHA2-512, encrypt-then-MAC.
    HmacSha512Etm,
}

impl MacAlgorithm {
    /// Returns the wire name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha1 => "hmac-sha1",
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
            MacAlgorithm::HmacSha1Etm => "hmac-sha1-etm@openssh.com",
            MacAlgorithm::HmacSha256Etm => "hmac-sha2-256-etm@openssh.com",
            MacAlgorithm::HmacSha512Etm => "hmac-sha2-512-etm@openssh.com",
        }
    }

    /// Parses a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha1" => Some(MacAlgorithm::HmacSha1),
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            "hmac-sha1-etm@openssh.com" => Some(MacAlgorithm::HmacSha1Etm),
            "hmac-sha2-256-etm@openssh.com" => Some(MacAlgorithm::HmacSha256Etm),
            "hmac-sha2-512-etm@openssh.com" => Some(MacAlgorithm::HmacSha512Etm),
            _ => None,
        }
    }

    /// Bytes of key material consumed from the KDF.
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1 | MacAlgorithm::HmacSha1Etm => 20,
            MacAlgorithm::HmacSha256 | MacAlgorithm::HmacSha256Etm => 32,
            MacAlgorithm::HmacSha512 | MacAlgorithm::HmacSha512Etm => 64,
        }
    }

    /// Length of the tag on the wire.
    pub fn mac_size(&self) -> usize {
        self.key_size()
    }

    /// True for encrypt-then-MAC variants.
    pub fn is_etm(&self) -> bool {
        matches!(
            self,
            MacAlgorithm::HmacSha1Etm | MacAlgorithm::HmacSha256Etm | MacAlgorithm::HmacSha512Etm
        )
    }
}

/// Keyed MAC state for one direction.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a MAC key from derived key material.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> SkiffResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(SkiffError::Security(format!(
                "insufficient MAC key material: need {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }
        Ok(Self {
            algorithm,
            key: key_material[..algorithm.key_size()].to_vec(),
        })
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }

    /// Computes the MAC over `sequence_number || data`.
    ///
    /// Only the low 32 bits of the sequence counter go on the wire-facing
    /// MAC input (RFC 4253 Section 6.4).
    pub fn compute(&self, sequence: u64, data: &[u8]) -> Vec<u8> {
        let seq = (sequence as u32).to_be_bytes();
        match self.algorithm {
            MacAlgorithm::HmacSha1 | MacAlgorithm::HmacSha1Etm => {
                let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(&self.key)
                    .expect("HMAC accepts any key length");
                mac.update(&seq);
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha256 | MacAlgorithm::HmacSha256Etm => {
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.key)
                    .expect("HMAC accepts any key length");
                mac.update(&seq);
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha512 | MacAlgorithm::HmacSha512Etm => {
                let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(&self.key)
                    .expect("HMAC accepts any key length");
                mac.update(&seq);
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Verifies a received MAC in constant time.
    pub fn verify(&self, sequence: u64, data: &[u8], received: &[u8]) -> SkiffResult<()> {
        let computed = self.compute(sequence, data);
        if computed.len() != received.len() {
            return Err(SkiffError::Security("MAC length mismatch".to_string()));
        }
        if bool::from(computed.as_slice().ct_eq(received)) {
            Ok(())
        } else {
            Err(SkiffError::Security("MAC verification failed".to_string()))
        }
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

enum CipherState {
    Plaintext,
    ChaCha20 {
        main_key: Zeroizing<[u8; 32]>,
        header_key: Zeroizing<[u8; 32]>,
    },
    Aes128Gcm {
        cipher: Box<aes_gcm::Aes128Gcm>,
        nonce: [u8; 12],
    },
    Aes256Gcm {
        cipher: Box<aes_gcm::Aes256Gcm>,
        nonce: [u8; 12],
    },
    Aes128Ctr {
        cipher: Box<Aes128Ctr>,
        pending_len: Option<[u8; 4]>,
    },
    Aes256Ctr {
        cipher: Box<Aes256Ctr>,
        pending_len: Option<[u8; 4]>,
    },
}

/// Cipher pipeline state for one direction of one session.
///
/// Constructed from derived key material at NEWKEYS and replaced wholesale
/// on re-key; the old state's keys are zeroized on drop.
pub struct CipherContext {
    algorithm: Option<CipherAlgorithm>,
    state: CipherState,
    mac: Option<MacKey>,
}

impl std::fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherContext")
            .field("algorithm", &self.algorithm)
            .field("mac", &self.mac)
            .finish()
    }
}

impl CipherContext {
    /// The unencrypted context in effect before the first NEWKEYS.
    pub fn plaintext() -> Self {
        Self {
            algorithm: None,
            state: CipherState::Plaintext,
            mac: None,
        }
    }

    /// Builds a context from derived key material.
    ///
    /// `mac` must be `Some` exactly when the cipher is not AEAD.
    pub fn new(
        algorithm: CipherAlgorithm,
        key: &[u8],
        iv: &[u8],
        mac: Option<MacKey>,
    ) -> SkiffResult<Self> {
        if key.len() < algorithm.key_size() {
            return Err(SkiffError::Security(format!(
                "insufficient cipher key material for {}: need {}, got {}",
                algorithm.name(),
                algorithm.key_size(),
                key.len()
            )));
        }
        if iv.len() < algorithm.iv_size() {
            return Err(SkiffError::Security(format!(
                "insufficient IV material for {}: need {}, got {}",
                algorithm.name(),
                algorithm.iv_size(),
                iv.len()
            )));
        }
        if algorithm.is_aead() != mac.is_none() {
            return Err(SkiffError::Config(format!(
                "cipher {} {} a separate MAC",
                algorithm.name(),
                if algorithm.is_aead() {
                    "does not take"
                } else {
                    "requires"
                }
            )));
        }

        let state = match algorithm {
            CipherAlgorithm::ChaCha20Poly1305 => {
                let mut main = [0u8; 32];
                let mut header = [0u8; 32];
                main.copy_from_slice(&key[..32]);
                header.copy_from_slice(&key[32..64]);
                CipherState::ChaCha20 {
                    main_key: Zeroizing::new(main),
                    header_key: Zeroizing::new(header),
                }
            }
            CipherAlgorithm::Aes128Gcm => {
                let mut nonce = [0u8; 12];
                nonce.copy_from_slice(&iv[..12]);
                CipherState::Aes128Gcm {
                    cipher: Box::new(aes_gcm::Aes128Gcm::new_from_slice(&key[..16]).expect(
                        "AES-128-GCM key length checked above",
                    )),
                    nonce,
                }
            }
            CipherAlgorithm::Aes256Gcm => {
                let mut nonce = [0u8; 12];
                nonce.copy_from_slice(&iv[..12]);
                CipherState::Aes256Gcm {
                    cipher: Box::new(aes_gcm::Aes256Gcm::new_from_slice(&key[..32]).expect(
                        "AES-256-GCM key length checked above",
                    )),
                    nonce,
                }
            }
            CipherAlgorithm::Aes128Ctr => CipherState::Aes128Ctr {
                cipher: Box::new(
                    Aes128Ctr::new_from_slices(&key[..16], &iv[..16])
                        .expect("AES-CTR key/IV lengths checked above"),
                ),
                pending_len: None,
            },
            CipherAlgorithm::Aes256Ctr => CipherState::Aes256Ctr {
                cipher: Box::new(
                    Aes256Ctr::new_from_slices(&key[..32], &iv[..16])
                        .expect("AES-CTR key/IV lengths checked above"),
                ),
                pending_len: None,
            },
        };

        Ok(Self {
            algorithm: Some(algorithm),
            state,
            mac,
        })
    }

    /// True before the first NEWKEYS.
    pub fn is_plaintext(&self) -> bool {
        matches!(self.state, CipherState::Plaintext)
    }

    /// Padding alignment block for outbound packets.
    pub fn block_size(&self) -> usize {
        self.algorithm.map_or(8, |a| a.block_size())
    }

    /// Whether the 4 length bytes are excluded from padding alignment
    /// (AEAD and ETM modes leave the length outside the encrypted body).
    pub fn length_excluded_from_padding(&self) -> bool {
        match self.algorithm {
            Some(CipherAlgorithm::ChaCha20Poly1305)
            | Some(CipherAlgorithm::Aes128Gcm)
            | Some(CipherAlgorithm::Aes256Gcm) => true,
            Some(CipherAlgorithm::Aes128Ctr) | Some(CipherAlgorithm::Aes256Ctr) => self
                .mac
                .as_ref()
                .is_some_and(|m| m.algorithm().is_etm()),
            None => false,
        }
    }

    /// Bytes following the `packet_length` body on the wire (MAC or tag).
    pub fn mac_len(&self) -> usize {
        match self.algorithm {
            Some(a) if a.is_aead() => a.tag_size(),
            Some(_) => self.mac.as_ref().map_or(0, |m| m.algorithm().mac_size()),
            None => 0,
        }
    }

    /// Recovers the `packet_length` field from the first four wire bytes.
    ///
    /// For classic CTR mode this consumes keystream; the decrypted bytes
    /// are retained for MAC verification in [`CipherContext::open`].
    pub fn open_length(&mut self, first4: &[u8; 4], sequence: u64) -> u32 {
        match &mut self.state {
            CipherState::Plaintext
            | CipherState::Aes128Gcm { .. }
            | CipherState::Aes256Gcm { .. } => u32::from_be_bytes(*first4),
            CipherState::ChaCha20 { header_key, .. } => {
                let nonce: chacha20::LegacyNonce = sequence.to_be_bytes().into();
                let mut cipher =
                    SshChaCha20::new(chacha20::Key::from_slice(&**header_key), &nonce);
                let mut len = *first4;
                cipher.apply_keystream(&mut len);
                u32::from_be_bytes(len)
            }
            CipherState::Aes128Ctr {
                cipher,
                pending_len,
            } => {
                let etm = self
                    .mac
                    .as_ref()
                    .is_some_and(|m| m.algorithm().is_etm());
                if etm {
                    u32::from_be_bytes(*first4)
                } else {
                    let mut len = *first4;
                    cipher.apply_keystream(&mut len);
                    *pending_len = Some(len);
                    u32::from_be_bytes(len)
                }
            }
            CipherState::Aes256Ctr {
                cipher,
                pending_len,
            } => {
                let etm = self
                    .mac
                    .as_ref()
                    .is_some_and(|m| m.algorithm().is_etm());
                if etm {
                    u32::from_be_bytes(*first4)
                } else {
                    let mut len = *first4;
                    cipher.apply_keystream(&mut len);
                    *pending_len = Some(len);
                    u32::from_be_bytes(len)
                }
            }
        }
    }

    /// Opens a complete wire packet.
    ///
    /// `raw` is the full packet: 4 length bytes (as received), the body of
    /// `packet_length` bytes, and the trailing MAC/tag. Returns the
    /// plaintext content `padding_length || payload || padding`.
    pub fn open(&mut self, mut raw: Vec<u8>, sequence: u64) -> SkiffResult<Vec<u8>> {
        let mac_len = self.mac_len();
        if raw.len() < 4 + mac_len {
            return Err(SkiffError::Protocol("packet shorter than its MAC".to_string()));
        }
        let body_end = raw.len() - mac_len;

        match &mut self.state {
            CipherState::Plaintext => Ok(raw[4..].to_vec()),
            CipherState::ChaCha20 {
                main_key,
                header_key: _,
            } => {
                let nonce: chacha20::LegacyNonce = sequence.to_be_bytes().into();
                let mut cipher = SshChaCha20::new(chacha20::Key::from_slice(&**main_key), &nonce);

                let mut poly_key = Zeroizing::new([0u8; poly1305::KEY_SIZE]);
                cipher.apply_keystream(poly_key.as_mut());

                let expected = poly1305::Poly1305::new(poly1305::Key::from_slice(&*poly_key))
                    .compute_unpadded(&raw[..body_end]);
                if !bool::from(expected.as_slice().ct_eq(&raw[body_end..])) {
                    return Err(SkiffError::Security(
                        "MAC verification failed (poly1305)".to_string(),
                    ));
                }

                // Content is encrypted starting at ChaCha block 1.
                cipher.seek(64u64);
                cipher.apply_keystream(&mut raw[4..body_end]);
                Ok(raw[4..body_end].to_vec())
            }
            CipherState::Aes128Gcm { cipher, nonce } => {
                let (aad, rest) = raw.split_at_mut(4);
                let (body, tag) = rest.split_at_mut(body_end - 4);
                cipher
                    .decrypt_in_place_detached(
                        aes_gcm::Nonce::from_slice(&nonce[..]),
                        aad,
                        body,
                        aes_gcm::Tag::from_slice(tag),
                    )
                    .map_err(|_| {
                        SkiffError::Security("MAC verification failed (GCM)".to_string())
                    })?;
                increment_invocation_counter(nonce);
                Ok(body.to_vec())
            }
            CipherState::Aes256Gcm { cipher, nonce } => {
                let (aad, rest) = raw.split_at_mut(4);
                let (body, tag) = rest.split_at_mut(body_end - 4);
                cipher
                    .decrypt_in_place_detached(
                        aes_gcm::Nonce::from_slice(&nonce[..]),
                        aad,
                        body,
                        aes_gcm::Tag::from_slice(tag),
                    )
                    .map_err(|_| {
                        SkiffError::Security("MAC verification failed (GCM)".to_string())
                    })?;
                increment_invocation_counter(nonce);
                Ok(body.to_vec())
            }
            CipherState::Aes128Ctr {
                cipher,
                pending_len,
            } => Self::open_ctr(
                cipher.as_mut(),
                pending_len,
                &self.mac,
                raw,
                body_end,
                sequence,
            ),
            CipherState::Aes256Ctr {
                cipher,
                pending_len,
            } => Self::open_ctr(
                cipher.as_mut(),
                pending_len,
                &self.mac,
                raw,
                body_end,
                sequence,
            ),
        }
    }

    fn open_ctr<C: StreamCipher>(
        cipher: &mut C,
        pending_len: &mut Option<[u8; 4]>,
        mac: &Option<MacKey>,
        mut raw: Vec<u8>,
        body_end: usize,
        sequence: u64,
    ) -> SkiffResult<Vec<u8>> {
        let mac_key = mac
            .as_ref()
            .ok_or_else(|| SkiffError::Config("CTR cipher without a MAC".to_string()))?;

        if mac_key.algorithm().is_etm() {
            // Verify over the cleartext length and the ciphertext body,
            // then decrypt.
            mac_key.verify(sequence, &raw[..body_end], &raw[body_end..])?;
            cipher.apply_keystream(&mut raw[4..body_end]);
            Ok(raw[4..body_end].to_vec())
        } else {
            // The length bytes were already decrypted by open_length.
            let plain_len = pending_len.take().ok_or_else(|| {
                SkiffError::Protocol("packet body opened before its length".to_string())
            })?;
            cipher.apply_keystream(&mut raw[4..body_end]);
            let mut plaintext_packet = Vec::with_capacity(body_end);
            plaintext_packet.extend_from_slice(&plain_len);
            plaintext_packet.extend_from_slice(&raw[4..body_end]);
            mac_key.verify(sequence, &plaintext_packet, &raw[body_end..])?;
            Ok(raw[4..body_end].to_vec())
        }
    }

    /// Seals a payload into a complete wire packet.
    ///
    /// `payload` is the (already compressed) message payload; padding is
    /// generated from `rng` per the RFC 4253 rule against this context's
    /// block size and length discipline.
    pub fn seal(
        &mut self,
        payload: &[u8],
        sequence: u64,
        rng: &mut dyn SecureRandom,
    ) -> SkiffResult<Vec<u8>> {
        let block = self.block_size();
        let len_bytes = if self.length_excluded_from_padding() {
            0
        } else {
            4
        };

        // Smallest padding >= 4 aligning the covered region to the block.
        let covered = len_bytes + 1 + payload.len();
        let mut padding = (block - covered % block) % block;
        while padding < MIN_PADDING {
            padding += block;
        }
        debug_assert!(padding <= 255);

        let packet_length = 1 + payload.len() + padding;
        if packet_length > MAX_PACKET_LENGTH {
            return Err(SkiffError::Protocol(format!(
                "outbound packet too large: {} bytes",
                packet_length
            )));
        }

        let mut plain = Vec::with_capacity(4 + packet_length);
        plain.extend_from_slice(&(packet_length as u32).to_be_bytes());
        plain.push(padding as u8);
        plain.extend_from_slice(payload);
        let pad_start = plain.len();
        plain.resize(pad_start + padding, 0);
        rng.fill_bytes(&mut plain[pad_start..]);

        match &mut self.state {
            CipherState::Plaintext => Ok(plain),
            CipherState::ChaCha20 {
                main_key,
                header_key,
            } => {
                let nonce: chacha20::LegacyNonce = sequence.to_be_bytes().into();
                let mut main_cipher =
                    SshChaCha20::new(chacha20::Key::from_slice(&**main_key), &nonce);

                let mut poly_key = Zeroizing::new([0u8; poly1305::KEY_SIZE]);
                main_cipher.apply_keystream(poly_key.as_mut());

                let mut len_cipher =
                    SshChaCha20::new(chacha20::Key::from_slice(&**header_key), &nonce);
                len_cipher.apply_keystream(&mut plain[..4]);

                main_cipher.seek(64u64);
                main_cipher.apply_keystream(&mut plain[4..]);

                let tag = poly1305::Poly1305::new(poly1305::Key::from_slice(&*poly_key))
                    .compute_unpadded(&plain);
                plain.extend_from_slice(tag.as_slice());
                Ok(plain)
            }
            CipherState::Aes128Gcm { cipher, nonce } => {
                let (aad, body) = plain.split_at_mut(4);
                let tag = cipher
                    .encrypt_in_place_detached(aes_gcm::Nonce::from_slice(&nonce[..]), aad, body)
                    .map_err(|_| SkiffError::Security("GCM encryption failed".to_string()))?;
                increment_invocation_counter(nonce);
                plain.extend_from_slice(&tag);
                Ok(plain)
            }
            CipherState::Aes256Gcm { cipher, nonce } => {
                let (aad, body) = plain.split_at_mut(4);
                let tag = cipher
                    .encrypt_in_place_detached(aes_gcm::Nonce::from_slice(&nonce[..]), aad, body)
                    .map_err(|_| SkiffError::Security("GCM encryption failed".to_string()))?;
                increment_invocation_counter(nonce);
                plain.extend_from_slice(&tag);
                Ok(plain)
            }
            CipherState::Aes128Ctr { cipher, .. } => {
                Self::seal_ctr(cipher.as_mut(), &self.mac, plain, sequence)
            }
            CipherState::Aes256Ctr { cipher, .. } => {
                Self::seal_ctr(cipher.as_mut(), &self.mac, plain, sequence)
            }
        }
    }

    fn seal_ctr<C: StreamCipher>(
        cipher: &mut C,
        mac: &Option<MacKey>,
        mut plain: Vec<u8>,
        sequence: u64,
    ) -> SkiffResult<Vec<u8>> {
        let mac_key = mac
            .as_ref()
            .ok_or_else(|| SkiffError::Config("CTR cipher without a MAC".to_string()))?;

        if mac_key.algorithm().is_etm() {
            cipher.apply_keystream(&mut plain[4..]);
            let tag = mac_key.compute(sequence, &plain);
            plain.extend_from_slice(&tag);
            Ok(plain)
        } else {
            let tag = mac_key.compute(sequence, &plain);
            cipher.apply_keystream(&mut plain[..]);
            plain.extend_from_slice(&tag);
            Ok(plain)
        }
    }
}

/// Increments the 64-bit invocation counter in the low bytes of a GCM
/// nonce (RFC 5647 Section 7.1).
fn increment_invocation_counter(nonce: &mut [u8; 12]) {
    let mut counter = u64::from_be_bytes(nonce[4..12].try_into().expect("8 bytes"));
    counter = counter.wrapping_add(1);
    nonce[4..12].copy_from_slice(&counter.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRandom(u8);
    impl SecureRandom for FixedRandom {
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(self.0);
        }
    }

    fn round_trip(cipher: CipherAlgorithm, mac: Option<MacAlgorithm>, payload: &[u8]) {
        let key = vec![0x11; cipher.key_size()];
        let iv = vec![0x22; cipher.iv_size().max(1)];
        let mac_key = |alg: MacAlgorithm| MacKey::new(alg, &vec![0x33; alg.key_size()]).unwrap();

        let mut send = CipherContext::new(cipher, &key, &iv, mac.map(mac_key)).unwrap();
        let mut recv = CipherContext::new(cipher, &key, &iv, mac.map(mac_key)).unwrap();
        let mut rng = FixedRandom(0xAA);

        for seq in 0..3u64 {
            let wire = send.seal(payload, seq, &mut rng).unwrap();

            let first4: [u8; 4] = wire[..4].try_into().unwrap();
            let packet_length = recv.open_length(&first4, seq) as usize;
            assert_eq!(wire.len(), 4 + packet_length + recv.mac_len());

            let content = recv.open(wire, seq).unwrap();
            let padding = content[0] as usize;
            assert!(padding >= MIN_PADDING);
            assert_eq!(&content[1..content.len() - padding], payload);
        }
    }

    #[test]
    fn test_plaintext_round_trip() {
        round_trip_plaintext(b"plaintext payload");
    }

    fn round_trip_plaintext(payload: &[u8]) {
        let mut send = CipherContext::plaintext();
        let mut recv = CipherContext::plaintext();
        let mut rng = FixedRandom(0);

        let wire = send.seal(payload, 0, &mut rng).unwrap();
        // Alignment invariant: total length is a multiple of 8.
        assert_eq!(wire.len() % 8, 0);

        let first4: [u8; 4] = wire[..4].try_into().unwrap();
        let packet_length = recv.open_length(&first4, 0) as usize;
        assert_eq!(wire.len(), 4 + packet_length);

        let content = recv.open(wire, 0).unwrap();
        let padding = content[0] as usize;
        assert!(padding >= MIN_PADDING);
        assert_eq!(&content[1..content.len() - padding], payload);
    }

    #[test]
    fn test_chacha20_round_trip() {
        round_trip(CipherAlgorithm::ChaCha20Poly1305, None, b"chacha payload");
    }

    #[test]
    fn test_aes128_gcm_round_trip() {
        round_trip(CipherAlgorithm::Aes128Gcm, None, b"gcm payload");
    }

    #[test]
    fn test_aes256_gcm_round_trip() {
        round_trip(CipherAlgorithm::Aes256Gcm, None, b"gcm payload 256");
    }

    #[test]
    fn test_aes128_ctr_hmac_round_trip() {
        round_trip(
            CipherAlgorithm::Aes128Ctr,
            Some(MacAlgorithm::HmacSha256),
            b"ctr classic payload",
        );
    }

    #[test]
    fn test_aes256_ctr_etm_round_trip() {
        round_trip(
            CipherAlgorithm::Aes256Ctr,
            Some(MacAlgorithm::HmacSha256Etm),
            b"ctr etm payload",
        );
    }

    #[test]
    fn test_aes256_ctr_sha512_round_trip() {
        round_trip(
            CipherAlgorithm::Aes256Ctr,
            Some(MacAlgorithm::HmacSha512),
            b"ctr sha512",
        );
    }

    #[test]
    fn test_chacha20_rejects_tampering() {
        let key = vec![0x11; 64];
        let mut send = CipherContext::new(CipherAlgorithm::ChaCha20Poly1305, &key, &[], None)
            .unwrap();
        let mut recv = CipherContext::new(CipherAlgorithm::ChaCha20Poly1305, &key, &[], None)
            .unwrap();
        let mut rng = FixedRandom(0);

        let mut wire = send.seal(b"payload", 0, &mut rng).unwrap();
        let mid = wire.len() / 2;
        wire[mid] ^= 0x01;

        let first4: [u8; 4] = wire[..4].try_into().unwrap();
        let _ = recv.open_length(&first4, 0);
        let err = recv.open(wire, 0).unwrap_err();
        assert!(matches!(err, SkiffError::Security(_)));
    }

    #[test]
    fn test_wrong_sequence_number_fails() {
        let key = vec![0x11; 64];
        let mut send = CipherContext::new(CipherAlgorithm::ChaCha20Poly1305, &key, &[], None)
            .unwrap();
        let mut recv = CipherContext::new(CipherAlgorithm::ChaCha20Poly1305, &key, &[], None)
            .unwrap();
        let mut rng = FixedRandom(0);

        let wire = send.seal(b"payload", 5, &mut rng).unwrap();
        let first4: [u8; 4] = wire[..4].try_into().unwrap();
        let _ = recv.open_length(&first4, 6);
        assert!(recv.open(wire, 6).is_err());
    }

    #[test]
    fn test_mac_key_round_trip() {
        let mac = MacKey::new(MacAlgorithm::HmacSha256, &[0x42; 32]).unwrap();
        let tag = mac.compute(7, b"data");
        assert_eq!(tag.len(), 32);
        assert!(mac.verify(7, b"data", &tag).is_ok());
        assert!(mac.verify(8, b"data", &tag).is_err());
        assert!(mac.verify(7, b"datb", &tag).is_err());
    }

    #[test]
    fn test_algorithm_tables() {
        assert_eq!(
            CipherAlgorithm::from_name("aes256-ctr"),
            Some(CipherAlgorithm::Aes256Ctr)
        );
        assert_eq!(CipherAlgorithm::ChaCha20Poly1305.block_size(), 8);
        assert_eq!(CipherAlgorithm::Aes128Gcm.block_size(), 16);
        assert!(CipherAlgorithm::Aes256Gcm.is_aead());
        assert!(!CipherAlgorithm::Aes128Ctr.is_aead());
        assert!(MacAlgorithm::HmacSha256Etm.is_etm());
        assert_eq!(MacAlgorithm::HmacSha512.mac_size(), 64);
    }

    #[test]
    fn test_padding_alignment_excluding_length() {
        // GCM excludes the 4 length bytes from alignment, so
        // 1 + payload + padding must be a multiple of 16.
        let key = vec![0x11; 32];
        let iv = vec![0x22; 12];
        let mut send =
            CipherContext::new(CipherAlgorithm::Aes256Gcm, &key, &iv, None).unwrap();
        let mut rng = FixedRandom(0);
        let wire = send.seal(b"0123456789", 0, &mut rng).unwrap();
        let packet_length = u32::from_be_bytes(wire[..4].try_into().unwrap()) as usize;
        assert_eq!(packet_length % 16, 0);
    }
}
