//! Key exchange methods (RFC 4253, RFC 4419, RFC 5656, RFC 8268, RFC 8731).
//!
//! Implemented method families:
//!
//! - `curve25519-sha256` and `curve25519-sha256@libssh.org` (RFC 8731)
//! - `ecdh-sha2-nistp256` / `-nistp384` / `-nistp521` (RFC 5656)
//! - classic Diffie-Hellman over the fixed groups 1, 14, 15, 16, 17, 18
//!   (RFC 4253, RFC 8268; primes from RFC 2409 and RFC 3526)
//! - `diffie-hellman-group-exchange-sha1` / `-sha256` (RFC 4419)
//! - `mlkem768x25519-sha256` — PQ/T hybrid combining ML-KEM-768 with
//!   X25519 (draft-ietf-sshm-mlkem-hybrid-kex)
//!
//! Every exchange produces a shared secret `K` and the method's exchange
//! hash `H = HASH(V_C || V_S || I_C || I_S || K_S || [method] || K)`. For
//! the hybrid method `K` is the hash of both component secrets and is
//! encoded as a string rather than an mpint, per the draft.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::kex_dh::{derive_key, HashAlgorithm, SharedSecret};
//!
//! let k = SharedSecret::mpint(vec![0x42; 32]);
//! let key = derive_key(HashAlgorithm::Sha256, &k, &[1; 32], &[2; 32], b'C', 32);
//! assert_eq!(key.len(), 32);
//! ```

use crate::ssh::message::msg;
use crate::ssh::wire::{Reader, Writer};
use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{EncodedSizeUser, KemCore, MlKem768};
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use skiff_platform::{SecureRandom, SkiffError, SkiffResult};
use zeroize::Zeroizing;

/// ML-KEM-768 encapsulation key length.
pub const MLKEM768_EK_LEN: usize = 1184;
/// ML-KEM-768 ciphertext length.
pub const MLKEM768_CT_LEN: usize = 1088;
/// X25519 public key length.
pub const X25519_LEN: usize = 32;

/// Hash function underlying a key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1 (legacy methods only).
    Sha1,
    /// SHA-256.
    Sha256,
    /// SHA-384.
    Sha384,
    /// SHA-512.
    Sha512,
}

impl HashAlgorithm {
    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// One-shot digest.
    pub fn hash(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// A fixed Diffie-Hellman group.
pub struct DhGroup {
    /// Modulus size in bits.
    pub bits: u32,
    /// Prime modulus.
    pub prime: &'static Lazy<BigUint>,
    /// Generator.
    pub generator: u32,
}

const GROUP1_PRIME: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381",
    "FFFFFFFFFFFFFFFF",
);

const GROUP14_PRIME: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

const GROUP15_PRIME: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA051015728E",
    "5A8AAAC42DAD33170D04507A33A85521ABDF1CBA64ECFB85",
    "0458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7ABF5AE",
    "8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA",
    "06D98A0864D87602733EC86A64521F2B18177B200CBBE117",
    "577A615D6C770988C0BAD946E208E24FA074E5AB3143DB5B",
    "FCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF",
);

const GROUP16_PRIME: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AAAC42DAD33170D04507A33A85521ABDF1CBA64",
    "ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7",
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6B",
    "F12FFA06D98A0864D87602733EC86A64521F2B18177B200C",
    "BBE117577A615D6C770988C0BAD946E208E24FA074E5AB31",
    "43DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7",
    "88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA",
    "2583E9CA2AD44CE8DBBBC2DB04DE8EF92E8EFC141FBECAA6",
    "287C59474E6BC05D99B2964FA090C3A2233BA186515BE7ED",
    "1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9",
    "93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C934063199",
    "FFFFFFFFFFFFFFFF",
);

const GROUP17_PRIME: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AAAC42DAD33170D04507A33A85521ABDF1CBA64",
    "ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7",
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6B",
    "F12FFA06D98A0864D87602733EC86A64521F2B18177B200C",
    "BBE117577A615D6C770988C0BAD946E208E24FA074E5AB31",
    "43DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7",
    "88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA",
    "2583E9CA2AD44CE8DBBBC2DB04DE8EF92E8EFC141FBECAA6",
    "287C59474E6BC05D99B2964FA090C3A2233BA186515BE7ED",
    "1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9",
    "93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C93402849236C3FAB4D27C7026C1D4DCB2602646DEC9751E763DBA37BDF8FF9406AD9E530EE5DB382F413001AEB06A53ED9027D831179727B0865A8918DA3EDBEBCF9B14ED44CE6CBACED4BB1BDB7F1447E6CC254B332051512BD7AF426FB8F401378CD2BF5983CA01C64B92ECF032EA15D1721D03F482D7CE6E74FEF6D55E702F46980C82B5A84031900B1C9E59E7C97FBEC7E8F323A97A7E36CC88BE0F1D45B7FF585AC54BD407B22B4154AACC8F6D7EBF48E1D814CC5ED20F8037E0A79715EEF29BE32806A1D58BB7C5DA76F550AA3D8A1FBFF0EB19CCB1A313D55CDA56C9EC2EF29632387FE8D76E3C0468043E8F663F4860EE12BF2D5B0B7474D6E694F91E6DCC4024FFFFFFFFFFFFFFFF",
);

const GROUP18_PRIME: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AAAC42DAD33170D04507A33A85521ABDF1CBA64",
    "ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7",
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6B",
    "F12FFA06D98A0864D87602733EC86A64521F2B18177B200C",
    "BBE117577A615D6C770988C0BAD946E208E24FA074E5AB31",
    "43DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7",
    "88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA",
    "2583E9CA2AD44CE8DBBBC2DB04DE8EF92E8EFC141FBECAA6",
    "287C59474E6BC05D99B2964FA090C3A2233BA186515BE7ED",
    "1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9",
    "93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C93402849236C3FAB4D27C7026C1D4DCB2602646DEC9751E763DBA37BDF8FF9406AD9E530EE5DB382F413001AEB06A53ED9027D831179727B0865A8918DA3EDBEBCF9B14ED44CE6CBACED4BB1BDB7F1447E6CC254B332051512BD7AF426FB8F401378CD2BF5983CA01C64B92ECF032EA15D1721D03F482D7CE6E74FEF6D55E702F46980C82B5A84031900B1C9E59E7C97FBEC7E8F323A97A7E36CC88BE0F1D45B7FF585AC54BD407B22B4154AACC8F6D7EBF48E1D814CC5ED20F8037E0A79715EEF29BE32806A1D58BB7C5DA76F550AA3D8A1FBFF0EB19CCB1A313D55CDA56C9EC2EF29632387FE8D76E3C0468043E8F663F4860EE12BF2D5B0B7474D6E694F91E6DBE115974A3926F12FEE5E438777CB6A932DF8CD8BEC4D073B931BA3BC832B68D9DD300741FA7BF8AFC47ED2576F6936BA424663AAB639C5AE4F5683423B4742BF1C978238F16CBE39D652DE3FDB8BEFC848AD922222E04A4037C0713EB57A81A23F0C73473FC646CEA306B4BCBC8862F8385DDFA9D4B7FA2C087E879683303ED5BDD3A062B3CF5B3A278A66D2A13F83F44F82DDF310EE074AB6A364597E899A0255DC164F31CC50846851DF9AB48195DED7EA1B1D510BD7EE74D73FAF36BC31ECFA268359046F4EB879F924009438B481C6CD7889A002ED5EE382BC9190DA6FC026E479558E4475677E9AA9E3050E2765694DFC81F56E880B96E7160C980DD98EDD3DFFFFFFFFFFFFFFFFF",
);

static GROUP1_P: Lazy<BigUint> =
    Lazy::new(|| BigUint::parse_bytes(GROUP1_PRIME.as_bytes(), 16).expect("valid prime hex"));
static GROUP14_P: Lazy<BigUint> =
    Lazy::new(|| BigUint::parse_bytes(GROUP14_PRIME.as_bytes(), 16).expect("valid prime hex"));
static GROUP15_P: Lazy<BigUint> =
    Lazy::new(|| BigUint::parse_bytes(GROUP15_PRIME.as_bytes(), 16).expect("valid prime hex"));
static GROUP16_P: Lazy<BigUint> =
    Lazy::new(|| BigUint::parse_bytes(GROUP16_PRIME.as_bytes(), 16).expect("valid prime hex"));
static GROUP17_P: Lazy<BigUint> =
    Lazy::new(|| BigUint::parse_bytes(GROUP17_PRIME.as_bytes(), 16).expect("valid prime hex"));
static GROUP18_P: Lazy<BigUint> =
    Lazy::new(|| BigUint::parse_bytes(GROUP18_PRIME.as_bytes(), 16).expect("valid prime hex"));

/// Oakley Group 2 (RFC 2409), 1024-bit.
pub static DH_GROUP1: DhGroup = DhGroup {
    bits: 1024,
    prime: &GROUP1_P,
    generator: 2,
};
/// RFC 3526 group 14, 2048-bit.
pub static DH_GROUP14: DhGroup = DhGroup {
    bits: 2048,
    prime: &GROUP14_P,
    generator: 2,
};
/// RFC 3526 group 15, 3072-bit.
pub static DH_GROUP15: DhGroup = DhGroup {
    bits: 3072,
    prime: &GROUP15_P,
    generator: 2,
};
/// RFC 3526 group 16, 4096-bit.
pub static DH_GROUP16: DhGroup = DhGroup {
    bits: 4096,
    prime: &GROUP16_P,
    generator: 2,
};
/// RFC 3526 group 17, 6144-bit.
pub static DH_GROUP17: DhGroup = DhGroup {
    bits: 6144,
    prime: &GROUP17_P,
    generator: 2,
};
/// RFC 3526 group 18, 8192-bit.
pub static DH_GROUP18: DhGroup = DhGroup {
    bits: 8192,
    prime: &GROUP18_P,
    generator: 2,
};

impl std::fmt::Debug for DhGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhGroup")
            .field("bits", &self.bits)
            .field("generator", &self.generator)
            .finish()
    }
}

/// Family of a key exchange method.
#[derive(Debug, Clone, Copy)]
pub enum KexFamily {
    /// X25519 (RFC 8731).
    Curve25519,
    /// NIST P-256 ECDH.
    EcdhP256,
    /// NIST P-384 ECDH.
    EcdhP384,
    /// NIST P-521 ECDH.
    EcdhP521,
    /// Classic DH over a fixed group.
    DhGroup(&'static DhGroup),
    /// DH with server-chosen group (RFC 4419).
    DhGex,
    /// ML-KEM-768 + X25519 hybrid.
    MlKem768X25519,
}

impl KexFamily {
    /// Whether ephemeral publics are encoded as mpints (classic DH) rather
    /// than strings (everything elliptic or hybrid).
    pub fn uses_mpint_public(&self) -> bool {
        matches!(self, KexFamily::DhGroup(_) | KexFamily::DhGex)
    }

    /// Whether the exchange runs the RFC 4419 group-exchange handshake.
    pub fn is_group_exchange(&self) -> bool {
        matches!(self, KexFamily::DhGex)
    }
}

/// A key exchange method: wire name, family, and hash.
#[derive(Debug, Clone, Copy)]
pub struct KexMethod {
    /// Wire name.
    pub name: &'static str,
    /// Method family.
    pub family: KexFamily,
    /// Hash function.
    pub hash: HashAlgorithm,
}

/// Resolves a negotiated name to its method.
pub fn method_from_name(name: &str) -> Option<KexMethod> {
    let m = |name, family, hash| Some(KexMethod { name, family, hash });
    match name {
        "curve25519-sha256" => m("curve25519-sha256", KexFamily::Curve25519, HashAlgorithm::Sha256),
        "curve25519-sha256@libssh.org" => m(
            "curve25519-sha256@libssh.org",
            KexFamily::Curve25519,
            HashAlgorithm::Sha256,
        ),
        "mlkem768x25519-sha256" => m(
            "mlkem768x25519-sha256",
            KexFamily::MlKem768X25519,
            HashAlgorithm::Sha256,
        ),
        "ecdh-sha2-nistp256" => m("ecdh-sha2-nistp256", KexFamily::EcdhP256, HashAlgorithm::Sha256),
        "ecdh-sha2-nistp384" => m("ecdh-sha2-nistp384", KexFamily::EcdhP384, HashAlgorithm::Sha384),
        "ecdh-sha2-nistp521" => m("ecdh-sha2-nistp521", KexFamily::EcdhP521, HashAlgorithm::Sha512),
        "diffie-hellman-group1-sha1" => m(
            "diffie-hellman-group1-sha1",
            KexFamily::DhGroup(&DH_GROUP1),
            HashAlgorithm::Sha1,
        ),
        "diffie-hellman-group14-sha1" => m(
            "diffie-hellman-group14-sha1",
            KexFamily::DhGroup(&DH_GROUP14),
            HashAlgorithm::Sha1,
        ),
        "diffie-hellman-group14-sha256" => m(
            "diffie-hellman-group14-sha256",
            KexFamily::DhGroup(&DH_GROUP14),
            HashAlgorithm::Sha256,
        ),
        "diffie-hellman-group15-sha512" => m(
            "diffie-hellman-group15-sha512",
            KexFamily::DhGroup(&DH_GROUP15),
            HashAlgorithm::Sha512,
        ),
        "diffie-hellman-group16-sha512" => m(
            "diffie-hellman-group16-sha512",
            KexFamily::DhGroup(&DH_GROUP16),
            HashAlgorithm::Sha512,
        ),
        "diffie-hellman-group17-sha512" => m(
            "diffie-hellman-group17-sha512",
            KexFamily::DhGroup(&DH_GROUP17),
            HashAlgorithm::Sha512,
        ),
        "diffie-hellman-group18-sha512" => m(
            "diffie-hellman-group18-sha512",
            KexFamily::DhGroup(&DH_GROUP18),
            HashAlgorithm::Sha512,
        ),
        "diffie-hellman-group-exchange-sha1" => m(
            "diffie-hellman-group-exchange-sha1",
            KexFamily::DhGex,
            HashAlgorithm::Sha1,
        ),
        "diffie-hellman-group-exchange-sha256" => m(
            "diffie-hellman-group-exchange-sha256",
            KexFamily::DhGex,
            HashAlgorithm::Sha256,
        ),
        _ => None,
    }
}

/// The shared secret K with its wire encoding discipline.
pub enum SharedSecret {
    /// Encoded as an mpint (every classic and ECDH method).
    Mpint(Zeroizing<Vec<u8>>),
    /// Encoded as a string (hybrid PQ methods).
    Blob(Zeroizing<Vec<u8>>),
}

impl SharedSecret {
    /// Wraps magnitude bytes for mpint encoding.
    pub fn mpint(bytes: Vec<u8>) -> Self {
        SharedSecret::Mpint(Zeroizing::new(bytes))
    }

    /// Wraps bytes for string encoding.
    pub fn blob(bytes: Vec<u8>) -> Self {
        SharedSecret::Blob(Zeroizing::new(bytes))
    }

    /// Encodes K as it appears in hash inputs and key derivation.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            SharedSecret::Mpint(bytes) => w.put_mpint(bytes),
            SharedSecret::Blob(bytes) => w.put_string(bytes),
        }
        w.finish()
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// Adapts an injected [`SecureRandom`] to the `rand_core` traits the
/// dalek / RustCrypto key generators expect.
pub struct RngAdapter<'a>(pub &'a mut dyn SecureRandom);

impl rand::CryptoRng for RngAdapter<'_> {}
impl rand::RngCore for RngAdapter<'_> {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.0.fill_bytes(&mut buf);
        u32::from_le_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.0.fill_bytes(&mut buf);
        u64::from_le_bytes(buf)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.fill_bytes(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.0.fill_bytes(dest);
        Ok(())
    }
}

type MlKemDecapsKey = <MlKem768 as KemCore>::DecapsulationKey;
type MlKemEncapsKey = <MlKem768 as KemCore>::EncapsulationKey;

/// An ephemeral key exchange secret for one run of one method.
pub enum KexSecret {
    /// X25519 ephemeral.
    X25519 {
        /// Consumed by the exchange.
        secret: x25519_dalek::EphemeralSecret,
        /// 32-byte public.
        public: Vec<u8>,
    },
    /// P-256 ephemeral.
    P256 {
        /// Consumed by the exchange.
        secret: p256::ecdh::EphemeralSecret,
        /// SEC1 uncompressed point.
        public: Vec<u8>,
    },
    /// P-384 ephemeral.
    P384 {
        /// Consumed by the exchange.
        secret: p384::ecdh::EphemeralSecret,
        /// SEC1 uncompressed point.
        public: Vec<u8>,
    },
    /// P-521 ephemeral.
    P521 {
        /// Consumed by the exchange.
        secret: p521::ecdh::EphemeralSecret,
        /// SEC1 uncompressed point.
        public: Vec<u8>,
    },
    /// Classic DH ephemeral.
    Dh {
        /// The group in use.
        group: &'static DhGroup,
        /// Private exponent.
        x: BigUint,
        /// g^x mod p, big-endian.
        public: Vec<u8>,
    },
    /// Hybrid client state: ML-KEM decapsulation key plus X25519.
    MlKemClient {
        /// KEM decapsulation key.
        dk: Box<MlKemDecapsKey>,
        /// X25519 component.
        x25519: x25519_dalek::EphemeralSecret,
        /// C_INIT: ek || x25519 public.
        public: Vec<u8>,
    },
}

impl std::fmt::Debug for KexSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KexSecret(<redacted>)")
    }
}

impl KexSecret {
    /// Generates an ephemeral secret for `family`.
    pub fn generate(family: KexFamily, rng: &mut dyn SecureRandom) -> SkiffResult<Self> {
        match family {
            KexFamily::Curve25519 => {
                let secret = x25519_dalek::EphemeralSecret::random_from_rng(RngAdapter(rng));
                let public = x25519_dalek::PublicKey::from(&secret).as_bytes().to_vec();
                Ok(KexSecret::X25519 { secret, public })
            }
            KexFamily::EcdhP256 => {
                let secret = p256::ecdh::EphemeralSecret::random(&mut RngAdapter(rng));
                let public = p256::EncodedPoint::from(secret.public_key())
                    .as_bytes()
                    .to_vec();
                Ok(KexSecret::P256 { secret, public })
            }
            KexFamily::EcdhP384 => {
                let secret = p384::ecdh::EphemeralSecret::random(&mut RngAdapter(rng));
                let public = p384::EncodedPoint::from(secret.public_key())
                    .as_bytes()
                    .to_vec();
                Ok(KexSecret::P384 { secret, public })
            }
            KexFamily::EcdhP521 => {
                let secret = p521::ecdh::EphemeralSecret::random(&mut RngAdapter(rng));
                let public = p521::EncodedPoint::from(secret.public_key())
                    .as_bytes()
                    .to_vec();
                Ok(KexSecret::P521 { secret, public })
            }
            KexFamily::DhGroup(group) => Ok(Self::generate_dh(group, rng)),
            KexFamily::DhGex => Err(SkiffError::KeyExchange(
                "group-exchange secret needs the negotiated group".to_string(),
            )),
            KexFamily::MlKem768X25519 => {
                let (dk, ek) = MlKem768::generate(&mut RngAdapter(rng));
                let x25519 = x25519_dalek::EphemeralSecret::random_from_rng(RngAdapter(rng));
                let mut public = ek.as_bytes().to_vec();
                public.extend_from_slice(x25519_dalek::PublicKey::from(&x25519).as_bytes());
                Ok(KexSecret::MlKemClient {
                    dk: Box::new(dk),
                    x25519,
                    public,
                })
            }
        }
    }

    /// Generates a classic DH ephemeral for a specific group (used both by
    /// the fixed-group methods and by group exchange).
    pub fn generate_dh(group: &'static DhGroup, rng: &mut dyn SecureRandom) -> Self {
        let p = &**group.prime;
        // 1 < x < p-1.
        let x = RngAdapter(rng).gen_biguint_range(&BigUint::from(2u32), &(p - 1u32));
        let public = BigUint::from(group.generator).modpow(&x, p).to_bytes_be();
        KexSecret::Dh { group, x, public }
    }

    /// The public value to transmit (Q_C/Q_S, e/f, or C_INIT).
    pub fn public(&self) -> &[u8] {
        match self {
            KexSecret::X25519 { public, .. }
            | KexSecret::P256 { public, .. }
            | KexSecret::P384 { public, .. }
            | KexSecret::P521 { public, .. }
            | KexSecret::Dh { public, .. }
            | KexSecret::MlKemClient { public, .. } => public,
        }
    }

    /// Completes the exchange against the peer's public value, producing K.
    ///
    /// For the hybrid method the peer value is the server's S_REPLY
    /// (ciphertext || X25519 public) and `hash` combines the two component
    /// secrets.
    pub fn exchange(self, peer_public: &[u8], hash: HashAlgorithm) -> SkiffResult<SharedSecret> {
        match self {
            KexSecret::X25519 { secret, .. } => {
                let peer: [u8; 32] = peer_public.try_into().map_err(|_| {
                    SkiffError::KeyExchange(format!(
                        "X25519 public key must be 32 bytes, got {}",
                        peer_public.len()
                    ))
                })?;
                let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(peer));
                Ok(SharedSecret::mpint(shared.as_bytes().to_vec()))
            }
            KexSecret::P256 { secret, .. } => {
                let peer = p256::PublicKey::from_sec1_bytes(peer_public).map_err(|_| {
                    SkiffError::KeyExchange("invalid P-256 public key".to_string())
                })?;
                let shared = secret.diffie_hellman(&peer);
                Ok(SharedSecret::mpint(shared.raw_secret_bytes().to_vec()))
            }
            KexSecret::P384 { secret, .. } => {
                let peer = p384::PublicKey::from_sec1_bytes(peer_public).map_err(|_| {
                    SkiffError::KeyExchange("invalid P-384 public key".to_string())
                })?;
                let shared = secret.diffie_hellman(&peer);
                Ok(SharedSecret::mpint(shared.raw_secret_bytes().to_vec()))
            }
            KexSecret::P521 { secret, .. } => {
                let peer = p521::PublicKey::from_sec1_bytes(peer_public).map_err(|_| {
                    SkiffError::KeyExchange("invalid P-521 public key".to_string())
                })?;
                let shared = secret.diffie_hellman(&peer);
                Ok(SharedSecret::mpint(shared.raw_secret_bytes().to_vec()))
            }
            KexSecret::Dh { group, x, .. } => {
                let p = &**group.prime;
                let peer = BigUint::from_bytes_be(peer_public);
                // RFC 4253 section 8: 1 < e < p-1.
                if peer <= BigUint::from(1u32) || peer >= p - 1u32 {
                    return Err(SkiffError::KeyExchange(
                        "DH public value out of range".to_string(),
                    ));
                }
                let k = peer.modpow(&x, p);
                Ok(SharedSecret::mpint(k.to_bytes_be()))
            }
            KexSecret::MlKemClient { dk, x25519, .. } => {
                if peer_public.len() != MLKEM768_CT_LEN + X25519_LEN {
                    return Err(SkiffError::KeyExchange(format!(
                        "hybrid S_REPLY must be {} bytes, got {}",
                        MLKEM768_CT_LEN + X25519_LEN,
                        peer_public.len()
                    )));
                }
                let ct = ml_kem::Ciphertext::<MlKem768>::try_from(&peer_public[..MLKEM768_CT_LEN])
                    .map_err(|_| {
                        SkiffError::KeyExchange("malformed ML-KEM ciphertext".to_string())
                    })?;
                let ss_pq = dk.decapsulate(&ct).map_err(|_| {
                    SkiffError::KeyExchange("ML-KEM decapsulation failed".to_string())
                })?;

                let peer_x: [u8; 32] = peer_public[MLKEM768_CT_LEN..].try_into().expect("32 bytes");
                let ss_ec = x25519.diffie_hellman(&x25519_dalek::PublicKey::from(peer_x));

                let mut combined = Vec::with_capacity(64);
                combined.extend_from_slice(ss_pq.as_slice());
                combined.extend_from_slice(ss_ec.as_bytes());
                let k = hash.hash(&combined);
                Ok(SharedSecret::blob(k))
            }
        }
    }
}

/// Server half of the hybrid exchange: encapsulate to the client's KEM key
/// and do the X25519 half. Returns (S_REPLY, K).
pub fn mlkem_server_respond(
    client_init: &[u8],
    hash: HashAlgorithm,
    rng: &mut dyn SecureRandom,
) -> SkiffResult<(Vec<u8>, SharedSecret)> {
    if client_init.len() != MLKEM768_EK_LEN + X25519_LEN {
        return Err(SkiffError::KeyExchange(format!(
            "hybrid C_INIT must be {} bytes, got {}",
            MLKEM768_EK_LEN + X25519_LEN,
            client_init.len()
        )));
    }
    let ek_bytes = ml_kem::Encoded::<MlKemEncapsKey>::try_from(&client_init[..MLKEM768_EK_LEN])
        .map_err(|_| SkiffError::KeyExchange("malformed ML-KEM encapsulation key".to_string()))?;
    let ek = MlKemEncapsKey::from_bytes(&ek_bytes);
    let (ct, ss_pq) = ek
        .encapsulate(&mut RngAdapter(rng))
        .map_err(|_| SkiffError::KeyExchange("ML-KEM encapsulation failed".to_string()))?;

    let client_x: [u8; 32] = client_init[MLKEM768_EK_LEN..].try_into().expect("32 bytes");
    let server_secret = x25519_dalek::EphemeralSecret::random_from_rng(RngAdapter(rng));
    let server_public = x25519_dalek::PublicKey::from(&server_secret);
    let ss_ec = server_secret.diffie_hellman(&x25519_dalek::PublicKey::from(client_x));

    let mut reply = Vec::with_capacity(MLKEM768_CT_LEN + X25519_LEN);
    reply.extend_from_slice(ct.as_slice());
    reply.extend_from_slice(server_public.as_bytes());

    let mut combined = Vec::with_capacity(64);
    combined.extend_from_slice(ss_pq.as_slice());
    combined.extend_from_slice(ss_ec.as_bytes());
    let k = hash.hash(&combined);

    Ok((reply, SharedSecret::blob(k)))
}

// --- group exchange (RFC 4419) ------------------------------------------

/// Client bounds for group exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GexParams {
    /// Minimum acceptable modulus bits.
    pub min: u32,
    /// Preferred modulus bits.
    pub preferred: u32,
    /// Maximum acceptable modulus bits.
    pub max: u32,
}

impl GexParams {
    /// The bounds this implementation requests.
    pub fn default_client() -> Self {
        Self {
            min: 2048,
            preferred: 3072,
            max: 8192,
        }
    }
}

/// Picks the largest fixed group fitting the client's bounds.
pub fn select_gex_group(params: &GexParams) -> SkiffResult<&'static DhGroup> {
    if params.min > params.preferred || params.preferred > params.max {
        return Err(SkiffError::Protocol(format!(
            "inconsistent group-exchange bounds {} <= {} <= {}",
            params.min, params.preferred, params.max
        )));
    }
    let candidates: [&'static DhGroup; 5] = [
        &DH_GROUP18,
        &DH_GROUP17,
        &DH_GROUP16,
        &DH_GROUP15,
        &DH_GROUP14,
    ];
    // Best fit: the largest group not exceeding the preference, else the
    // smallest group within the maximum.
    for group in candidates {
        if group.bits <= params.preferred && group.bits >= params.min {
            return Ok(group);
        }
    }
    for group in candidates.iter().rev() {
        if group.bits >= params.min && group.bits <= params.max {
            return Ok(group);
        }
    }
    Err(SkiffError::KeyExchange(format!(
        "no fixed group within [{}, {}] bits",
        params.min, params.max
    )))
}

/// Finds the fixed group whose prime equals `p` (server-provided moduli
/// outside the fixed set are rejected; a made-up group is indistinguishable
/// from a trapdoored one).
pub fn group_from_prime(p: &BigUint, generator: &BigUint) -> SkiffResult<&'static DhGroup> {
    let candidates: [&'static DhGroup; 5] = [
        &DH_GROUP14,
        &DH_GROUP15,
        &DH_GROUP16,
        &DH_GROUP17,
        &DH_GROUP18,
    ];
    for group in candidates {
        if &**group.prime == p && BigUint::from(group.generator) == *generator {
            return Ok(group);
        }
    }
    Err(SkiffError::KeyExchange(
        "server offered an unrecognized group-exchange modulus".to_string(),
    ))
}

// --- message payloads ----------------------------------------------------

/// Builds the method INIT payload (message 30).
pub fn init_payload(family: KexFamily, public: &[u8]) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u8(msg::KEX_INIT_30);
    if family.uses_mpint_public() {
        w.put_mpint(public);
    } else {
        w.put_string(public);
    }
    w.finish()
}

/// Parses the method INIT payload, returning the client public value.
pub fn parse_init(family: KexFamily, payload: &[u8]) -> SkiffResult<Vec<u8>> {
    let mut r = Reader::new(payload);
    let kind = r.read_u8()?;
    if kind != msg::KEX_INIT_30 {
        return Err(SkiffError::Protocol(format!(
            "expected KEX method INIT (30), got {}",
            kind
        )));
    }
    let public = if family.uses_mpint_public() {
        r.read_mpint()?
    } else {
        r.read_string()?
    };
    Ok(public.to_vec())
}

/// Builds the method REPLY payload (message 31).
pub fn reply_payload(
    family: KexFamily,
    host_key_blob: &[u8],
    server_public: &[u8],
    signature_blob: &[u8],
) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u8(msg::KEX_REPLY_31);
    w.put_string(host_key_blob);
    if family.uses_mpint_public() {
        w.put_mpint(server_public);
    } else {
        w.put_string(server_public);
    }
    w.put_string(signature_blob);
    w.finish()
}

/// Parsed method REPLY.
#[derive(Debug)]
pub struct KexReply {
    /// Server host key blob (K_S).
    pub host_key_blob: Vec<u8>,
    /// Server ephemeral public (f, Q_S, or S_REPLY).
    pub server_public: Vec<u8>,
    /// Signature blob over the exchange hash.
    pub signature_blob: Vec<u8>,
}

/// Parses the method REPLY payload (message 31 or GEX 33).
pub fn parse_reply(family: KexFamily, payload: &[u8], expected_kind: u8) -> SkiffResult<KexReply> {
    let mut r = Reader::new(payload);
    let kind = r.read_u8()?;
    if kind != expected_kind {
        return Err(SkiffError::Protocol(format!(
            "expected KEX method REPLY ({}), got {}",
            expected_kind, kind
        )));
    }
    let host_key_blob = r.read_string()?.to_vec();
    let server_public = if family.uses_mpint_public() {
        r.read_mpint()?.to_vec()
    } else {
        r.read_string()?.to_vec()
    };
    let signature_blob = r.read_string()?.to_vec();
    Ok(KexReply {
        host_key_blob,
        server_public,
        signature_blob,
    })
}

/// Builds SSH_MSG_KEX_DH_GEX_REQUEST (message 34).
pub fn gex_request_payload(params: &GexParams) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u8(msg::KEX_DH_GEX_REQUEST);
    w.put_u32(params.min);
    w.put_u32(params.preferred);
    w.put_u32(params.max);
    w.finish()
}

/// Parses SSH_MSG_KEX_DH_GEX_REQUEST.
pub fn parse_gex_request(payload: &[u8]) -> SkiffResult<GexParams> {
    let mut r = Reader::new(payload);
    let kind = r.read_u8()?;
    if kind != msg::KEX_DH_GEX_REQUEST {
        return Err(SkiffError::Protocol(format!(
            "expected SSH_MSG_KEX_DH_GEX_REQUEST, got {}",
            kind
        )));
    }
    Ok(GexParams {
        min: r.read_u32()?,
        preferred: r.read_u32()?,
        max: r.read_u32()?,
    })
}

/// Builds SSH_MSG_KEX_DH_GEX_GROUP (message 31).
pub fn gex_group_payload(group: &DhGroup) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u8(msg::KEX_REPLY_31);
    w.put_mpint(&group.prime.to_bytes_be());
    w.put_mpint(&BigUint::from(group.generator).to_bytes_be());
    w.finish()
}

/// Parses SSH_MSG_KEX_DH_GEX_GROUP into (p, g).
pub fn parse_gex_group(payload: &[u8]) -> SkiffResult<(BigUint, BigUint)> {
    let mut r = Reader::new(payload);
    let kind = r.read_u8()?;
    if kind != msg::KEX_REPLY_31 {
        return Err(SkiffError::Protocol(format!(
            "expected SSH_MSG_KEX_DH_GEX_GROUP, got {}",
            kind
        )));
    }
    let p = BigUint::from_bytes_be(r.read_mpint()?);
    let g = BigUint::from_bytes_be(r.read_mpint()?);
    Ok((p, g))
}

/// Builds SSH_MSG_KEX_DH_GEX_INIT (message 32).
pub fn gex_init_payload(public: &[u8]) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u8(msg::KEX_DH_GEX_INIT);
    w.put_mpint(public);
    w.finish()
}

/// Parses SSH_MSG_KEX_DH_GEX_INIT.
pub fn parse_gex_init(payload: &[u8]) -> SkiffResult<Vec<u8>> {
    let mut r = Reader::new(payload);
    let kind = r.read_u8()?;
    if kind != msg::KEX_DH_GEX_INIT {
        return Err(SkiffError::Protocol(format!(
            "expected SSH_MSG_KEX_DH_GEX_INIT, got {}",
            kind
        )));
    }
    Ok(r.read_mpint()?.to_vec())
}

/// Builds SSH_MSG_KEX_DH_GEX_REPLY (message 33).
pub fn gex_reply_payload(host_key_blob: &[u8], f: &[u8], signature_blob: &[u8]) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u8(msg::KEX_DH_GEX_REPLY);
    w.put_string(host_key_blob);
    w.put_mpint(f);
    w.put_string(signature_blob);
    w.finish()
}

// --- exchange hash and key derivation ------------------------------------

/// Identification and KEXINIT blobs common to every exchange hash.
#[derive(Debug, Clone, Copy)]
pub struct HashInputs<'a> {
    /// Client identification line, without CR LF.
    pub client_ident: &'a [u8],
    /// Server identification line, without CR LF.
    pub server_ident: &'a [u8],
    /// Full client KEXINIT payload.
    pub client_kexinit: &'a [u8],
    /// Full server KEXINIT payload.
    pub server_kexinit: &'a [u8],
}

/// Method-specific middle section of the exchange hash.
#[derive(Debug)]
pub enum ExchangeSides {
    /// Strings Q_C, Q_S (ECDH per RFC 5656) or C_INIT, S_REPLY (hybrid).
    Strings {
        /// Client public value.
        client: Vec<u8>,
        /// Server public value.
        server: Vec<u8>,
    },
    /// Mpints e, f (classic DH per RFC 4253).
    Mpints {
        /// Client public value.
        e: Vec<u8>,
        /// Server public value.
        f: Vec<u8>,
    },
    /// Group exchange (RFC 4419): bounds, group, then e and f.
    Gex {
        /// Requested bounds.
        params: GexParams,
        /// Modulus magnitude.
        p: Vec<u8>,
        /// Generator magnitude.
        g: Vec<u8>,
        /// Client public value.
        e: Vec<u8>,
        /// Server public value.
        f: Vec<u8>,
    },
}

/// Computes the exchange hash H.
pub fn exchange_hash(
    hash: HashAlgorithm,
    inputs: &HashInputs<'_>,
    host_key_blob: &[u8],
    sides: &ExchangeSides,
    k: &SharedSecret,
) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_string(inputs.client_ident);
    w.put_string(inputs.server_ident);
    w.put_string(inputs.client_kexinit);
    w.put_string(inputs.server_kexinit);
    w.put_string(host_key_blob);
    match sides {
        ExchangeSides::Strings { client, server } => {
            w.put_string(client);
            w.put_string(server);
        }
        ExchangeSides::Mpints { e, f } => {
            w.put_mpint(e);
            w.put_mpint(f);
        }
        ExchangeSides::Gex { params, p, g, e, f } => {
            w.put_u32(params.min);
            w.put_u32(params.preferred);
            w.put_u32(params.max);
            w.put_mpint(p);
            w.put_mpint(g);
            w.put_mpint(e);
            w.put_mpint(f);
        }
    }
    w.put_raw(&k.encode());
    hash.hash(&w.finish())
}

/// Derives key material per RFC 4253 Section 7.2.
///
/// `K1 = HASH(K || H || X || session_id)`, then
/// `K_{n+1} = HASH(K || H || K1 || ... || K_n)` until enough bytes exist.
pub fn derive_key(
    hash: HashAlgorithm,
    k: &SharedSecret,
    exchange_hash: &[u8],
    session_id: &[u8],
    label: u8,
    length: usize,
) -> Zeroizing<Vec<u8>> {
    let k_encoded = k.encode();
    let mut out: Zeroizing<Vec<u8>> = Zeroizing::new(Vec::with_capacity(length));

    let mut first = Vec::new();
    first.extend_from_slice(&k_encoded);
    first.extend_from_slice(exchange_hash);
    first.push(label);
    first.extend_from_slice(session_id);
    out.extend_from_slice(&hash.hash(&first));

    while out.len() < length {
        let mut next = Vec::new();
        next.extend_from_slice(&k_encoded);
        next.extend_from_slice(exchange_hash);
        next.extend_from_slice(&out);
        let block = hash.hash(&next);
        out.extend_from_slice(&block);
    }

    out.truncate(length);
    out
}

/// Derived key material for one direction.
pub struct DirectionKeys {
    /// Initial IV.
    pub iv: Zeroizing<Vec<u8>>,
    /// Encryption key.
    pub key: Zeroizing<Vec<u8>>,
    /// Integrity key (unused by AEAD ciphers).
    pub mac: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DirectionKeys(<redacted>)")
    }
}

/// Derives the (IV, key, MAC key) triple for one direction.
///
/// Labels per RFC 4253: client-to-server uses 'A'/'C'/'E', server-to-client
/// 'B'/'D'/'F'.
pub fn derive_direction_keys(
    hash: HashAlgorithm,
    k: &SharedSecret,
    exchange_hash: &[u8],
    session_id: &[u8],
    client_to_server: bool,
    iv_len: usize,
    key_len: usize,
    mac_len: usize,
) -> DirectionKeys {
    let (iv_label, key_label, mac_label) = if client_to_server {
        (b'A', b'C', b'E')
    } else {
        (b'B', b'D', b'F')
    };
    DirectionKeys {
        iv: derive_key(hash, k, exchange_hash, session_id, iv_label, iv_len),
        key: derive_key(hash, k, exchange_hash, session_id, key_label, key_len),
        mac: derive_key(hash, k, exchange_hash, session_id, mac_label, mac_len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_platform::OsRandom;

    #[test]
    fn test_method_table() {
        assert!(method_from_name("curve25519-sha256").is_some());
        assert!(method_from_name("curve25519-sha256@libssh.org").is_some());
        assert!(method_from_name("mlkem768x25519-sha256").is_some());
        assert!(method_from_name("diffie-hellman-group18-sha512").is_some());
        assert!(method_from_name("diffie-hellman-group-exchange-sha256").is_some());
        assert!(method_from_name("rsa1024-sha1").is_none());

        let m = method_from_name("ecdh-sha2-nistp384").unwrap();
        assert_eq!(m.hash, HashAlgorithm::Sha384);
        assert!(!m.family.uses_mpint_public());

        let m = method_from_name("diffie-hellman-group14-sha256").unwrap();
        assert!(m.family.uses_mpint_public());
    }

    #[test]
    fn test_group_primes_parse() {
        assert_eq!(DH_GROUP1.prime.bits(), 1024);
        assert_eq!(DH_GROUP14.prime.bits(), 2048);
        assert_eq!(DH_GROUP15.prime.bits(), 3072);
        assert_eq!(DH_GROUP16.prime.bits(), 4096);
        assert_eq!(DH_GROUP17.prime.bits(), 6144);
        assert_eq!(DH_GROUP18.prime.bits(), 8192);
    }

    #[test]
    fn test_curve25519_agreement() {
        let mut rng = OsRandom;
        let a = KexSecret::generate(KexFamily::Curve25519, &mut rng).unwrap();
        let b = KexSecret::generate(KexFamily::Curve25519, &mut rng).unwrap();
        let a_pub = a.public().to_vec();
        let b_pub = b.public().to_vec();

        let ka = a.exchange(&b_pub, HashAlgorithm::Sha256).unwrap();
        let kb = b.exchange(&a_pub, HashAlgorithm::Sha256).unwrap();
        assert_eq!(ka.encode(), kb.encode());
    }

    #[test]
    fn test_ecdh_p256_agreement() {
        let mut rng = OsRandom;
        let a = KexSecret::generate(KexFamily::EcdhP256, &mut rng).unwrap();
        let b = KexSecret::generate(KexFamily::EcdhP256, &mut rng).unwrap();
        let a_pub = a.public().to_vec();
        let b_pub = b.public().to_vec();
        // SEC1 uncompressed point: 0x04 || x || y.
        assert_eq!(a_pub.len(), 65);

        let ka = a.exchange(&b_pub, HashAlgorithm::Sha256).unwrap();
        let kb = b.exchange(&a_pub, HashAlgorithm::Sha256).unwrap();
        assert_eq!(ka.encode(), kb.encode());
    }

    #[test]
    fn test_dh_group14_agreement() {
        let mut rng = OsRandom;
        let a = KexSecret::generate_dh(&DH_GROUP14, &mut rng);
        let b = KexSecret::generate_dh(&DH_GROUP14, &mut rng);
        let a_pub = a.public().to_vec();
        let b_pub = b.public().to_vec();

        let ka = a.exchange(&b_pub, HashAlgorithm::Sha256).unwrap();
        let kb = b.exchange(&a_pub, HashAlgorithm::Sha256).unwrap();
        assert_eq!(ka.encode(), kb.encode());
    }

    #[test]
    fn test_dh_rejects_degenerate_public() {
        let mut rng = OsRandom;
        let a = KexSecret::generate_dh(&DH_GROUP14, &mut rng);
        assert!(a.exchange(&[1], HashAlgorithm::Sha256).is_err());

        let b = KexSecret::generate_dh(&DH_GROUP14, &mut rng);
        let p_minus_1 = (&**DH_GROUP14.prime - 1u32).to_bytes_be();
        assert!(b.exchange(&p_minus_1, HashAlgorithm::Sha256).is_err());
    }

    #[test]
    fn test_mlkem_hybrid_agreement() {
        let mut rng = OsRandom;
        let client = KexSecret::generate(KexFamily::MlKem768X25519, &mut rng).unwrap();
        let c_init = client.public().to_vec();
        assert_eq!(c_init.len(), MLKEM768_EK_LEN + X25519_LEN);

        let (s_reply, k_server) =
            mlkem_server_respond(&c_init, HashAlgorithm::Sha256, &mut rng).unwrap();
        assert_eq!(s_reply.len(), MLKEM768_CT_LEN + X25519_LEN);

        let k_client = client.exchange(&s_reply, HashAlgorithm::Sha256).unwrap();
        assert_eq!(k_client.encode(), k_server.encode());
        // Hybrid K is a 32-byte string, not an mpint.
        assert!(matches!(k_client, SharedSecret::Blob(_)));
    }

    #[test]
    fn test_derive_key_deterministic_and_labelled() {
        let k = SharedSecret::mpint(vec![0x42; 32]);
        let h = [0x01u8; 32];
        let sid = [0x02u8; 32];

        let a1 = derive_key(HashAlgorithm::Sha256, &k, &h, &sid, b'A', 32);
        let a2 = derive_key(HashAlgorithm::Sha256, &k, &h, &sid, b'A', 32);
        let c = derive_key(HashAlgorithm::Sha256, &k, &h, &sid, b'C', 32);
        assert_eq!(&*a1, &*a2);
        assert_ne!(&*a1, &*c);

        // Iterated extension, and the long key's prefix matches the short.
        let long = derive_key(HashAlgorithm::Sha256, &k, &h, &sid, b'C', 96);
        assert_eq!(long.len(), 96);
        assert_eq!(&long[..32], &c[..]);
    }

    #[test]
    fn test_exchange_hash_sensitivity() {
        let k = SharedSecret::mpint(vec![7; 32]);
        let inputs = HashInputs {
            client_ident: b"SSH-2.0-A",
            server_ident: b"SSH-2.0-B",
            client_kexinit: b"ic",
            server_kexinit: b"is",
        };
        let sides = ExchangeSides::Strings {
            client: vec![1; 32],
            server: vec![2; 32],
        };
        let h1 = exchange_hash(HashAlgorithm::Sha256, &inputs, b"hostkey", &sides, &k);
        assert_eq!(h1.len(), 32);

        let h2 = exchange_hash(HashAlgorithm::Sha256, &inputs, b"hostkey2", &sides, &k);
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_gex_group_selection() {
        let group = select_gex_group(&GexParams {
            min: 2048,
            preferred: 3072,
            max: 8192,
        })
        .unwrap();
        assert_eq!(group.bits, 3072);

        let group = select_gex_group(&GexParams {
            min: 1024,
            preferred: 2048,
            max: 4096,
        })
        .unwrap();
        assert_eq!(group.bits, 2048);

        // Preference below every group we serve: fall back to the smallest
        // group within the maximum.
        let group = select_gex_group(&GexParams {
            min: 1024,
            preferred: 1024,
            max: 2048,
        })
        .unwrap();
        assert_eq!(group.bits, 2048);

        assert!(select_gex_group(&GexParams {
            min: 4096,
            preferred: 2048,
            max: 2048,
        })
        .is_err());
    }

    #[test]
    fn test_gex_payload_round_trips() {
        let params = GexParams::default_client();
        let parsed = parse_gex_request(&gex_request_payload(&params)).unwrap();
        assert_eq!(parsed, params);

        let payload = gex_group_payload(&DH_GROUP14);
        let (p, g) = parse_gex_group(&payload).unwrap();
        assert_eq!(p, **DH_GROUP14.prime);
        assert_eq!(g, BigUint::from(2u32));
        let group = group_from_prime(&p, &g).unwrap();
        assert_eq!(group.bits, 2048);
    }

    #[test]
    fn test_init_reply_round_trips() {
        let family = KexFamily::Curve25519;
        let payload = init_payload(family, &[9; 32]);
        assert_eq!(parse_init(family, &payload).unwrap(), vec![9; 32]);

        let payload = reply_payload(family, b"ks", &[8; 32], b"sig");
        let reply = parse_reply(family, &payload, msg::KEX_REPLY_31).unwrap();
        assert_eq!(reply.host_key_blob, b"ks");
        assert_eq!(reply.server_public, vec![8; 32]);
        assert_eq!(reply.signature_blob, b"sig");

        // Classic DH uses mpints; a public with the high bit set survives.
        let family = KexFamily::DhGroup(&DH_GROUP14);
        let e = vec![0x80, 0x01, 0x02];
        let payload = init_payload(family, &e);
        assert_eq!(parse_init(family, &payload).unwrap(), e);
    }
}
