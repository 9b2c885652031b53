//! Key exchange negotiation (RFC 4253 Section 7).
//!
//! Both sides open with SSH_MSG_KEXINIT carrying a random cookie and ten
//! preference lists. For every list the negotiated algorithm is the first
//! entry of the client's list that the server also offers. The key exchange
//! method additionally requires a compatible host-key algorithm: one that
//! can sign (all modern methods), and for legacy encrypting exchanges one
//! that can encrypt — the constraint machinery is kept even though no
//! encrypting method is registered.
//!
//! Two OpenSSH extensions ride in the kex name-list:
//!
//! - `kex-strict-c-v00@openssh.com` / `kex-strict-s-v00@openssh.com`
//!   (strict KEX): when both sides advertise, sequence numbers reset at
//!   NEWKEYS and nothing but KEX messages may precede it
//! - `ext-info-c` / `ext-info-s` (RFC 8308): willingness to receive
//!   SSH_MSG_EXT_INFO
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::kex::first_match;
//!
//! let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
//! let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
//! assert_eq!(first_match(&client, &server), Some("aes256-ctr".to_string()));
//! ```

use crate::ssh::compress::CompressionAlgorithm;
use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
use crate::ssh::message::msg;
use crate::ssh::transport::Role;
use crate::ssh::wire::{Reader, Writer};
use skiff_platform::{SecureRandom, SkiffError, SkiffResult};
use tracing::debug;

/// Strict-KEX marker a client places in its kex list.
pub const STRICT_KEX_CLIENT: &str = "kex-strict-c-v00@openssh.com";
/// Strict-KEX marker a server places in its kex list.
pub const STRICT_KEX_SERVER: &str = "kex-strict-s-v00@openssh.com";
/// EXT_INFO marker a client places in its kex list.
pub const EXT_INFO_CLIENT: &str = "ext-info-c";
/// EXT_INFO marker a server places in its kex list.
pub const EXT_INFO_SERVER: &str = "ext-info-s";

/// SSH_MSG_KEXINIT (RFC 4253 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// 16 random bytes.
    pub cookie: [u8; 16],
    /// Key exchange methods, most preferred first.
    pub kex_algorithms: Vec<String>,
    /// Host key algorithms.
    pub server_host_key_algorithms: Vec<String>,
    /// Ciphers, client to server.
    pub encryption_client_to_server: Vec<String>,
    /// Ciphers, server to client.
    pub encryption_server_to_client: Vec<String>,
    /// MACs, client to server.
    pub mac_client_to_server: Vec<String>,
    /// MACs, server to client.
    pub mac_server_to_client: Vec<String>,
    /// Compression, client to server.
    pub compression_client_to_server: Vec<String>,
    /// Compression, server to client.
    pub compression_server_to_client: Vec<String>,
    /// Languages, client to server (normally empty).
    pub languages_client_to_server: Vec<String>,
    /// Languages, server to client (normally empty).
    pub languages_server_to_client: Vec<String>,
    /// Whether a guessed first KEX packet follows.
    pub first_kex_packet_follows: bool,
}

impl KexInit {
    /// Builds our KEXINIT from preference lists, appending the strict-KEX
    /// and EXT_INFO markers for our role.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: Role,
        kex: &[String],
        host_keys: &[String],
        ciphers: &[String],
        macs: &[String],
        compressions: &[String],
        offer_strict_kex: bool,
        offer_ext_info: bool,
        rng: &mut dyn SecureRandom,
    ) -> Self {
        let mut cookie = [0u8; 16];
        rng.fill_bytes(&mut cookie);

        let mut kex_algorithms = kex.to_vec();
        match role {
            Role::Client => {
                if offer_strict_kex {
                    kex_algorithms.push(STRICT_KEX_CLIENT.to_string());
                }
                if offer_ext_info {
                    kex_algorithms.push(EXT_INFO_CLIENT.to_string());
                }
            }
            Role::Server => {
                if offer_strict_kex {
                    kex_algorithms.push(STRICT_KEX_SERVER.to_string());
                }
            }
        }

        Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms: host_keys.to_vec(),
            encryption_client_to_server: ciphers.to_vec(),
            encryption_server_to_client: ciphers.to_vec(),
            mac_client_to_server: macs.to_vec(),
            mac_server_to_client: macs.to_vec(),
            compression_client_to_server: compressions.to_vec(),
            compression_server_to_client: compressions.to_vec(),
            languages_client_to_server: Vec::new(),
            languages_server_to_client: Vec::new(),
            first_kex_packet_follows: false,
        }
    }

    /// Serializes the full message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(msg::KEXINIT);
        w.put_raw(&self.cookie);
        w.put_name_list(&self.kex_algorithms);
        w.put_name_list(&self.server_host_key_algorithms);
        w.put_name_list(&self.encryption_client_to_server);
        w.put_name_list(&self.encryption_server_to_client);
        w.put_name_list(&self.mac_client_to_server);
        w.put_name_list(&self.mac_server_to_client);
        w.put_name_list(&self.compression_client_to_server);
        w.put_name_list(&self.compression_server_to_client);
        w.put_name_list(&self.languages_client_to_server);
        w.put_name_list(&self.languages_server_to_client);
        w.put_bool(self.first_kex_packet_follows);
        w.put_u32(0); // Reserved.
        w.finish()
    }

    /// Parses a KEXINIT payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != msg::KEXINIT {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_KEXINIT, got {}",
                kind
            )));
        }
        let cookie = r.read_array::<16>()?;
        let kex_algorithms = r.read_name_list()?;
        let server_host_key_algorithms = r.read_name_list()?;
        let encryption_client_to_server = r.read_name_list()?;
        let encryption_server_to_client = r.read_name_list()?;
        let mac_client_to_server = r.read_name_list()?;
        let mac_server_to_client = r.read_name_list()?;
        let compression_client_to_server = r.read_name_list()?;
        let compression_server_to_client = r.read_name_list()?;
        let languages_client_to_server = r.read_name_list()?;
        let languages_server_to_client = r.read_name_list()?;
        let first_kex_packet_follows = r.read_bool()?;
        let _reserved = r.read_u32()?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_client_to_server,
            encryption_server_to_client,
            mac_client_to_server,
            mac_server_to_client,
            compression_client_to_server,
            compression_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }

    fn offers(&self, name: &str) -> bool {
        self.kex_algorithms.iter().any(|a| a == name)
    }
}

/// The algorithm set agreed by a pair of KEXINIT messages.
#[derive(Debug, Clone)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method name.
    pub kex: String,
    /// Host key algorithm name.
    pub host_key: String,
    /// Cipher, client to server.
    pub cipher_c2s: CipherAlgorithm,
    /// Cipher, server to client.
    pub cipher_s2c: CipherAlgorithm,
    /// MAC, client to server (`None` when the cipher is AEAD).
    pub mac_c2s: Option<MacAlgorithm>,
    /// MAC, server to client (`None` when the cipher is AEAD).
    pub mac_s2c: Option<MacAlgorithm>,
    /// Compression, client to server.
    pub compression_c2s: CompressionAlgorithm,
    /// Compression, server to client.
    pub compression_s2c: CompressionAlgorithm,
    /// Both sides advertised strict KEX.
    pub strict_kex: bool,
    /// The peer is willing to receive SSH_MSG_EXT_INFO.
    pub peer_wants_ext_info: bool,
    /// The peer guessed its first KEX packet and guessed wrong: one
    /// KEX-range message must be discarded.
    pub peer_guess_wrong: bool,
}

/// Capabilities a key exchange method demands of the host key.
fn kex_requires_encryption_capable(kex: &str) -> bool {
    // RFC 4432 RSA key exchange would require an encryption-capable host
    // key. No such method is registered; see DESIGN notes.
    kex.starts_with("rsa")
}

fn hostkey_is_signature_capable(_name: &str) -> bool {
    // Every registered host key algorithm signs.
    true
}

fn hostkey_is_encryption_capable(_name: &str) -> bool {
    false
}

/// Returns the first entry in `client` that also appears in `server`
/// (RFC 4253 Section 7.1).
pub fn first_match(client: &[String], server: &[String]) -> Option<String> {
    client
        .iter()
        .find(|&c| server.contains(c))
        .cloned()
}

fn is_marker(name: &str) -> bool {
    matches!(
        name,
        STRICT_KEX_CLIENT | STRICT_KEX_SERVER | EXT_INFO_CLIENT | EXT_INFO_SERVER
    )
}

/// Negotiates the full algorithm set from the two KEXINIT messages.
///
/// `our_role` identifies which message is ours; the selection rule is
/// always expressed from the client's preference order.
pub fn negotiate(
    our_role: Role,
    client: &KexInit,
    server: &KexInit,
) -> SkiffResult<NegotiatedAlgorithms> {
    // Key exchange: first client preference the server offers, for which a
    // compatible host key can also be negotiated.
    let client_kexes: Vec<&String> = client
        .kex_algorithms
        .iter()
        .filter(|k| !is_marker(k))
        .collect();

    let mut kex = None;
    let mut host_key = None;
    for candidate in client_kexes {
        if !server.kex_algorithms.contains(candidate) {
            continue;
        }
        let compatible_host_key = client
            .server_host_key_algorithms
            .iter()
            .find(|&hk| {
                server.server_host_key_algorithms.contains(hk)
                    && hostkey_is_signature_capable(hk)
                    && (!kex_requires_encryption_capable(candidate)
                        || hostkey_is_encryption_capable(hk))
            })
            .cloned();
        if let Some(hk) = compatible_host_key {
            kex = Some(candidate.clone());
            host_key = Some(hk);
            break;
        }
    }
    let kex = kex.ok_or_else(|| {
        SkiffError::KeyExchange(format!(
            "no common key exchange algorithm: client {:?}, server {:?}",
            client.kex_algorithms, server.kex_algorithms
        ))
    })?;
    let host_key = host_key.ok_or_else(|| {
        SkiffError::KeyExchange("no compatible host key algorithm".to_string())
    })?;

    let cipher_name_c2s = first_match(
        &client.encryption_client_to_server,
        &server.encryption_client_to_server,
    )
    .ok_or_else(|| {
        SkiffError::KeyExchange("no common client-to-server cipher".to_string())
    })?;
    let cipher_name_s2c = first_match(
        &client.encryption_server_to_client,
        &server.encryption_server_to_client,
    )
    .ok_or_else(|| {
        SkiffError::KeyExchange("no common server-to-client cipher".to_string())
    })?;

    let cipher_c2s = CipherAlgorithm::from_name(&cipher_name_c2s).ok_or_else(|| {
        SkiffError::KeyExchange(format!("unsupported cipher {:?}", cipher_name_c2s))
    })?;
    let cipher_s2c = CipherAlgorithm::from_name(&cipher_name_s2c).ok_or_else(|| {
        SkiffError::KeyExchange(format!("unsupported cipher {:?}", cipher_name_s2c))
    })?;

    // A MAC is only meaningful for non-AEAD ciphers; AEAD modes imply
    // their own integrity protection.
    let mac_c2s = negotiate_mac(
        cipher_c2s,
        &client.mac_client_to_server,
        &server.mac_client_to_server,
    )?;
    let mac_s2c = negotiate_mac(
        cipher_s2c,
        &client.mac_server_to_client,
        &server.mac_server_to_client,
    )?;

    let compression_c2s = negotiate_compression(
        &client.compression_client_to_server,
        &server.compression_client_to_server,
    )?;
    let compression_s2c = negotiate_compression(
        &client.compression_server_to_client,
        &server.compression_server_to_client,
    )?;

    let strict_kex = client.offers(STRICT_KEX_CLIENT) && server.offers(STRICT_KEX_SERVER);

    let peer_wants_ext_info = match our_role {
        Role::Server => client.offers(EXT_INFO_CLIENT),
        Role::Client => server.offers(EXT_INFO_SERVER),
    };

    // RFC 4253 section 7: the peer's guess was right only if both the kex
    // and host key algorithms match its first preferences.
    let peer = match our_role {
        Role::Client => server,
        Role::Server => client,
    };
    let peer_guess_wrong = peer.first_kex_packet_follows
        && !(peer
            .kex_algorithms
            .iter()
            .find(|k| !is_marker(k))
            .is_some_and(|first| *first == kex)
            && peer
                .server_host_key_algorithms
                .first()
                .is_some_and(|first| *first == host_key));

    let negotiated = NegotiatedAlgorithms {
        kex,
        host_key,
        cipher_c2s,
        cipher_s2c,
        mac_c2s,
        mac_s2c,
        compression_c2s,
        compression_s2c,
        strict_kex,
        peer_wants_ext_info,
        peer_guess_wrong,
    };
    debug!(
        kex = %negotiated.kex,
        host_key = %negotiated.host_key,
        cipher_c2s = %negotiated.cipher_c2s.name(),
        cipher_s2c = %negotiated.cipher_s2c.name(),
        strict = negotiated.strict_kex,
        "negotiated algorithms"
    );
    Ok(negotiated)
}

fn negotiate_mac(
    cipher: CipherAlgorithm,
    client: &[String],
    server: &[String],
) -> SkiffResult<Option<MacAlgorithm>> {
    if cipher.is_aead() {
        return Ok(None);
    }
    let name = first_match(client, server)
        .ok_or_else(|| SkiffError::KeyExchange("no common MAC algorithm".to_string()))?;
    let mac = MacAlgorithm::from_name(&name)
        .ok_or_else(|| SkiffError::KeyExchange(format!("unsupported MAC {:?}", name)))?;
    Ok(Some(mac))
}

fn negotiate_compression(
    client: &[String],
    server: &[String],
) -> SkiffResult<CompressionAlgorithm> {
    let name = first_match(client, server)
        .ok_or_else(|| SkiffError::KeyExchange("no common compression algorithm".to_string()))?;
    CompressionAlgorithm::from_name(&name)
        .ok_or_else(|| SkiffError::KeyExchange(format!("unsupported compression {:?}", name)))
}

/// Builds the single-byte SSH_MSG_NEWKEYS payload.
pub fn newkeys() -> Vec<u8> {
    vec![msg::NEWKEYS]
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRandom;
    impl SecureRandom for FixedRandom {
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0x7f);
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn test_kexinit(role: Role, strict: bool) -> KexInit {
        KexInit::new(
            role,
            &names(&["curve25519-sha256", "diffie-hellman-group14-sha256"]),
            &names(&["ssh-ed25519", "rsa-sha2-512"]),
            &names(&["chacha20-poly1305@openssh.com", "aes256-ctr"]),
            &names(&["hmac-sha2-256", "hmac-sha2-512"]),
            &names(&["none"]),
            strict,
            true,
            &mut FixedRandom,
        )
    }

    #[test]
    fn test_kexinit_round_trip_preserves_order() {
        let original = test_kexinit(Role::Client, true);
        let bytes = original.to_bytes();
        assert_eq!(bytes[0], msg::KEXINIT);

        let parsed = KexInit::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, original);
        assert_eq!(parsed.kex_algorithms, original.kex_algorithms);
    }

    #[test]
    fn test_client_marker_insertion() {
        let client = test_kexinit(Role::Client, true);
        assert!(client.offers(STRICT_KEX_CLIENT));
        assert!(client.offers(EXT_INFO_CLIENT));
        assert!(!client.offers(STRICT_KEX_SERVER));

        let server = test_kexinit(Role::Server, true);
        assert!(server.offers(STRICT_KEX_SERVER));
        assert!(!server.offers(EXT_INFO_CLIENT));
    }

    #[test]
    fn test_negotiate_basic() {
        let client = test_kexinit(Role::Client, true);
        let server = test_kexinit(Role::Server, true);

        let negotiated = negotiate(Role::Server, &client, &server).unwrap();
        assert_eq!(negotiated.kex, "curve25519-sha256");
        assert_eq!(negotiated.host_key, "ssh-ed25519");
        assert_eq!(negotiated.cipher_c2s, CipherAlgorithm::ChaCha20Poly1305);
        assert_eq!(negotiated.mac_c2s, None); // AEAD
        assert!(negotiated.strict_kex);
        assert!(negotiated.peer_wants_ext_info);
        assert!(!negotiated.peer_guess_wrong);
    }

    #[test]
    fn test_negotiate_client_preference_wins() {
        let mut client = test_kexinit(Role::Client, false);
        client.encryption_client_to_server = names(&["aes256-ctr", "chacha20-poly1305@openssh.com"]);
        let server = test_kexinit(Role::Server, false);

        let negotiated = negotiate(Role::Server, &client, &server).unwrap();
        assert_eq!(negotiated.cipher_c2s, CipherAlgorithm::Aes256Ctr);
        assert_eq!(negotiated.mac_c2s, Some(MacAlgorithm::HmacSha256));
    }

    #[test]
    fn test_negotiate_no_common_kex() {
        let mut client = test_kexinit(Role::Client, false);
        client.kex_algorithms = names(&["ecdh-sha2-nistp521"]);
        let server = test_kexinit(Role::Server, false);

        let err = negotiate(Role::Server, &client, &server).unwrap_err();
        assert!(matches!(err, SkiffError::KeyExchange(_)));
    }

    #[test]
    fn test_strict_kex_requires_both_markers() {
        let client = test_kexinit(Role::Client, true);
        let server = test_kexinit(Role::Server, false);
        let negotiated = negotiate(Role::Server, &client, &server).unwrap();
        assert!(!negotiated.strict_kex);
    }

    #[test]
    fn test_wrong_guess_detected() {
        let mut client = test_kexinit(Role::Client, false);
        // Client guesses its first preference, but the server only offers
        // the client's second choice.
        client.first_kex_packet_follows = true;
        let mut server = test_kexinit(Role::Server, false);
        server.kex_algorithms = names(&["diffie-hellman-group14-sha256"]);

        let negotiated = negotiate(Role::Server, &client, &server).unwrap();
        assert_eq!(negotiated.kex, "diffie-hellman-group14-sha256");
        assert!(negotiated.peer_guess_wrong);
    }

    #[test]
    fn test_right_guess_not_discarded() {
        let mut client = test_kexinit(Role::Client, false);
        client.first_kex_packet_follows = true;
        let server = test_kexinit(Role::Server, false);

        let negotiated = negotiate(Role::Server, &client, &server).unwrap();
        assert!(!negotiated.peer_guess_wrong);
    }

    #[test]
    fn test_newkeys_payload() {
        assert_eq!(newkeys(), vec![21]);
    }
}
