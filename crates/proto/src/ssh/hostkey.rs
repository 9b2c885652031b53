//! Host key algorithms (RFC 4253 Section 6.6, RFC 8332, RFC 5656).
//!
//! The server proves its identity by signing the exchange hash with its
//! host key; the client verifies the signature against the key blob `K_S`
//! and consults a [`HostKeyVerifier`] policy (the known-hosts store itself
//! is a collaborator outside this crate).
//!
//! Supported algorithms:
//!
//! - `ssh-ed25519`
//! - `rsa-sha2-256`, `rsa-sha2-512` (RFC 8332), plus legacy `ssh-rsa`
//!   signature verification for old peers
//! - `ecdsa-sha2-nistp256`, `ecdsa-sha2-nistp384`, `ecdsa-sha2-nistp521`
//!
//! Key generation is limited to what tests and demos need; persistent key
//! storage, file formats, and agent protocols are out of scope.

use crate::ssh::kex_dh::RngAdapter;
use crate::ssh::wire::{Reader, Writer};
use ed25519_dalek::Verifier;
use rsa::traits::PublicKeyParts;
use rsa::Pkcs1v15Sign;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use signature::Signer;
use skiff_platform::{SecureRandom, SkiffError, SkiffResult};

/// A host key signature algorithm name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKeyAlgorithm {
    /// Ed25519.
    SshEd25519,
    /// RSA with SHA-256 (RFC 8332).
    RsaSha2_256,
    /// RSA with SHA-512 (RFC 8332).
    RsaSha2_512,
    /// Legacy RSA with SHA-1. Verification only.
    SshRsa,
    /// ECDSA over P-256 with SHA-256.
    EcdsaP256,
    /// ECDSA over P-384 with SHA-384.
    EcdsaP384,
    /// ECDSA over P-521 with SHA-512.
    EcdsaP521,
}

impl HostKeyAlgorithm {
    /// Returns the wire name.
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::RsaSha2_256 => "rsa-sha2-256",
            HostKeyAlgorithm::RsaSha2_512 => "rsa-sha2-512",
            HostKeyAlgorithm::SshRsa => "ssh-rsa",
            HostKeyAlgorithm::EcdsaP256 => "ecdsa-sha2-nistp256",
            HostKeyAlgorithm::EcdsaP384 => "ecdsa-sha2-nistp384",
            HostKeyAlgorithm::EcdsaP521 => "ecdsa-sha2-nistp521",
        }
    }

    /// Parses a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-ed25519" => Some(HostKeyAlgorithm::SshEd25519),
            "rsa-sha2-256" => Some(HostKeyAlgorithm::RsaSha2_256),
            "rsa-sha2-512" => Some(HostKeyAlgorithm::RsaSha2_512),
            "ssh-rsa" => Some(HostKeyAlgorithm::SshRsa),
            "ecdsa-sha2-nistp256" => Some(HostKeyAlgorithm::EcdsaP256),
            "ecdsa-sha2-nistp384" => Some(HostKeyAlgorithm::EcdsaP384),
            "ecdsa-sha2-nistp521" => Some(HostKeyAlgorithm::EcdsaP521),
            _ => None,
        }
    }

    /// The key-blob type identifier for this signature algorithm. RFC 8332
    /// RSA variants share the `ssh-rsa` blob format.
    pub fn key_blob_type(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::RsaSha2_256
            | HostKeyAlgorithm::RsaSha2_512
            | HostKeyAlgorithm::SshRsa => "ssh-rsa",
            other => other.name(),
        }
    }
}

/// A server host key: exposes the public blob and signs exchange hashes.
pub trait HostKey: Send + Sync {
    /// Signature algorithms this key can produce, preferred first.
    fn algorithms(&self) -> Vec<HostKeyAlgorithm>;

    /// The public key blob `K_S`.
    fn public_key_blob(&self) -> Vec<u8>;

    /// Signs `data`, returning the SSH signature blob for `algorithm`.
    fn sign(&self, algorithm: HostKeyAlgorithm, data: &[u8]) -> SkiffResult<Vec<u8>>;

    /// SHA-256 fingerprint of the public key blob.
    fn fingerprint(&self) -> String {
        fingerprint(&self.public_key_blob())
    }
}

/// SHA-256 fingerprint of a public key blob.
pub fn fingerprint(blob: &[u8]) -> String {
    format!("SHA256:{}", hex::encode(Sha256::digest(blob)))
}

/// Ed25519 host key.
pub struct Ed25519HostKey {
    signing_key: ed25519_dalek::SigningKey,
}

impl Ed25519HostKey {
    /// Generates a fresh key.
    pub fn generate(rng: &mut dyn SecureRandom) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::generate(&mut RngAdapter(rng)),
        }
    }

    /// Restores a key from its 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }
}

impl HostKey for Ed25519HostKey {
    fn algorithms(&self) -> Vec<HostKeyAlgorithm> {
        vec![HostKeyAlgorithm::SshEd25519]
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_string(b"ssh-ed25519");
        w.put_string(self.signing_key.verifying_key().as_bytes());
        w.finish()
    }

    fn sign(&self, algorithm: HostKeyAlgorithm, data: &[u8]) -> SkiffResult<Vec<u8>> {
        if algorithm != HostKeyAlgorithm::SshEd25519 {
            return Err(SkiffError::Config(format!(
                "Ed25519 key cannot sign as {}",
                algorithm.name()
            )));
        }
        let signature = self.signing_key.sign(data);
        let mut w = Writer::new();
        w.put_string(b"ssh-ed25519");
        w.put_string(&signature.to_bytes());
        Ok(w.finish())
    }
}

/// RSA host key (RFC 8332 signature algorithms).
pub struct RsaHostKey {
    private: rsa::RsaPrivateKey,
}

impl RsaHostKey {
    /// Generates a fresh key of `bits` modulus size.
    pub fn generate(rng: &mut dyn SecureRandom, bits: usize) -> SkiffResult<Self> {
        let private = rsa::RsaPrivateKey::new(&mut RngAdapter(rng), bits)
            .map_err(|e| SkiffError::Security(format!("RSA key generation failed: {}", e)))?;
        Ok(Self { private })
    }

    /// Wraps an existing private key.
    pub fn from_private(private: rsa::RsaPrivateKey) -> Self {
        Self { private }
    }
}

impl HostKey for RsaHostKey {
    fn algorithms(&self) -> Vec<HostKeyAlgorithm> {
        vec![
            HostKeyAlgorithm::RsaSha2_512,
            HostKeyAlgorithm::RsaSha2_256,
        ]
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let public = self.private.to_public_key();
        let mut w = Writer::new();
        w.put_string(b"ssh-rsa");
        w.put_mpint(&public.e().to_bytes_be());
        w.put_mpint(&public.n().to_bytes_be());
        w.finish()
    }

    fn sign(&self, algorithm: HostKeyAlgorithm, data: &[u8]) -> SkiffResult<Vec<u8>> {
        let (scheme, hashed) = match algorithm {
            HostKeyAlgorithm::RsaSha2_256 => (
                Pkcs1v15Sign::new::<Sha256>(),
                Sha256::digest(data).to_vec(),
            ),
            HostKeyAlgorithm::RsaSha2_512 => (
                Pkcs1v15Sign::new::<Sha512>(),
                Sha512::digest(data).to_vec(),
            ),
            other => {
                return Err(SkiffError::Config(format!(
                    "RSA key does not sign as {}",
                    other.name()
                )))
            }
        };
        let signature = self
            .private
            .sign(scheme, &hashed)
            .map_err(|e| SkiffError::Security(format!("RSA signing failed: {}", e)))?;
        let mut w = Writer::new();
        w.put_string(algorithm.name().as_bytes());
        w.put_string(&signature);
        Ok(w.finish())
    }
}

macro_rules! ecdsa_host_key {
    ($name:ident, $curve:ident, $alg:expr, $curve_id:literal) => {
        /// ECDSA host key.
        pub struct $name {
            signing_key: $curve::ecdsa::SigningKey,
        }

        impl $name {
            /// Generates a fresh key.
            pub fn generate(rng: &mut dyn SecureRandom) -> Self {
                Self {
                    signing_key: $curve::ecdsa::SigningKey::random(&mut RngAdapter(rng)),
                }
            }
        }

        impl HostKey for $name {
            fn algorithms(&self) -> Vec<HostKeyAlgorithm> {
                vec![$alg]
            }

            fn public_key_blob(&self) -> Vec<u8> {
                let verifying = $curve::ecdsa::VerifyingKey::from(&self.signing_key);
                let point = verifying.to_encoded_point(false);
                let mut w = Writer::new();
                w.put_string($alg.name().as_bytes());
                w.put_string($curve_id.as_bytes());
                w.put_string(point.as_bytes());
                w.finish()
            }

            fn sign(&self, algorithm: HostKeyAlgorithm, data: &[u8]) -> SkiffResult<Vec<u8>> {
                if algorithm != $alg {
                    return Err(SkiffError::Config(format!(
                        "{} key cannot sign as {}",
                        $alg.name(),
                        algorithm.name()
                    )));
                }
                let signature: $curve::ecdsa::Signature = self.signing_key.sign(data);
                let (r, s) = signature.split_bytes();

                let mut inner = Writer::new();
                inner.put_mpint(&r);
                inner.put_mpint(&s);

                let mut w = Writer::new();
                w.put_string($alg.name().as_bytes());
                w.put_string(&inner.finish());
                Ok(w.finish())
            }
        }
    };
}

ecdsa_host_key!(EcdsaP256HostKey, p256, HostKeyAlgorithm::EcdsaP256, "nistp256");
ecdsa_host_key!(EcdsaP384HostKey, p384, HostKeyAlgorithm::EcdsaP384, "nistp384");
ecdsa_host_key!(EcdsaP521HostKey, p521, HostKeyAlgorithm::EcdsaP521, "nistp521");

/// Verifies a signature blob over `data` against a public key blob.
///
/// `algorithm` is the negotiated host key algorithm name; the key blob and
/// signature blob carry their own identifiers which must be consistent
/// with it.
pub fn verify_signature(
    algorithm: &str,
    public_key_blob: &[u8],
    data: &[u8],
    signature_blob: &[u8],
) -> SkiffResult<()> {
    let algorithm = HostKeyAlgorithm::from_name(algorithm).ok_or_else(|| {
        SkiffError::KeyExchange(format!("unsupported host key algorithm {:?}", algorithm))
    })?;

    let mut key = Reader::new(public_key_blob);
    let blob_type = key.read_utf8()?;
    if blob_type != algorithm.key_blob_type() {
        return Err(SkiffError::KeyExchange(format!(
            "host key blob type {:?} does not match negotiated {}",
            blob_type,
            algorithm.name()
        )));
    }

    let mut sig = Reader::new(signature_blob);
    let sig_type = sig.read_utf8()?;
    if sig_type != algorithm.name() {
        return Err(SkiffError::KeyExchange(format!(
            "signature type {:?} does not match negotiated {}",
            sig_type,
            algorithm.name()
        )));
    }
    let sig_bytes = sig.read_string()?;

    match algorithm {
        HostKeyAlgorithm::SshEd25519 => {
            let public: [u8; 32] = key.read_string()?.try_into().map_err(|_| {
                SkiffError::KeyExchange("Ed25519 public key must be 32 bytes".to_string())
            })?;
            let public = ed25519_dalek::VerifyingKey::from_bytes(&public)
                .map_err(|e| SkiffError::KeyExchange(format!("bad Ed25519 key: {}", e)))?;
            let signature: [u8; 64] = sig_bytes.try_into().map_err(|_| {
                SkiffError::KeyExchange("Ed25519 signature must be 64 bytes".to_string())
            })?;
            public
                .verify_strict(data, &ed25519_dalek::Signature::from_bytes(&signature))
                .map_err(|_| SkiffError::KeyExchange("host key signature invalid".to_string()))
        }
        HostKeyAlgorithm::RsaSha2_256 | HostKeyAlgorithm::RsaSha2_512 | HostKeyAlgorithm::SshRsa => {
            let e = rsa::BigUint::from_bytes_be(key.read_mpint()?);
            let n = rsa::BigUint::from_bytes_be(key.read_mpint()?);
            let public = rsa::RsaPublicKey::new(n, e)
                .map_err(|e| SkiffError::KeyExchange(format!("bad RSA key: {}", e)))?;
            let (scheme, hashed) = match algorithm {
                HostKeyAlgorithm::RsaSha2_256 => (
                    Pkcs1v15Sign::new::<Sha256>(),
                    Sha256::digest(data).to_vec(),
                ),
                HostKeyAlgorithm::RsaSha2_512 => (
                    Pkcs1v15Sign::new::<Sha512>(),
                    Sha512::digest(data).to_vec(),
                ),
                _ => (Pkcs1v15Sign::new::<Sha1>(), Sha1::digest(data).to_vec()),
            };
            public
                .verify(scheme, &hashed, sig_bytes)
                .map_err(|_| SkiffError::KeyExchange("host key signature invalid".to_string()))
        }
        HostKeyAlgorithm::EcdsaP256 => verify_ecdsa_p256(&mut key, data, sig_bytes),
        HostKeyAlgorithm::EcdsaP384 => verify_ecdsa_p384(&mut key, data, sig_bytes),
        HostKeyAlgorithm::EcdsaP521 => verify_ecdsa_p521(&mut key, data, sig_bytes),
    }
}

macro_rules! ecdsa_verify_fn {
    ($name:ident, $curve:ident, $curve_id:literal, $field_len:literal) => {
        fn $name(key: &mut Reader<'_>, data: &[u8], sig_bytes: &[u8]) -> SkiffResult<()> {
            let found_curve = key.read_utf8()?;
            if found_curve != $curve_id {
                return Err(SkiffError::KeyExchange(format!(
                    "curve identifier {:?} does not match {}",
                    found_curve, $curve_id
                )));
            }
            let q = key.read_string()?;
            let verifying = $curve::ecdsa::VerifyingKey::from_sec1_bytes(q)
                .map_err(|_| SkiffError::KeyExchange("bad ECDSA public key".to_string()))?;

            let mut inner = Reader::new(sig_bytes);
            let r = inner.read_mpint()?;
            let s = inner.read_mpint()?;
            if r.len() > $field_len || s.len() > $field_len {
                return Err(SkiffError::KeyExchange(
                    "ECDSA scalar longer than the field".to_string(),
                ));
            }
            let mut r_padded = $curve::FieldBytes::default();
            r_padded[$field_len - r.len()..].copy_from_slice(r);
            let mut s_padded = $curve::FieldBytes::default();
            s_padded[$field_len - s.len()..].copy_from_slice(s);

            let signature = $curve::ecdsa::Signature::from_scalars(r_padded, s_padded)
                .map_err(|_| SkiffError::KeyExchange("bad ECDSA signature scalars".to_string()))?;

            Verifier::verify(&verifying, data, &signature)
                .map_err(|_| SkiffError::KeyExchange("host key signature invalid".to_string()))
        }
    };
}

ecdsa_verify_fn!(verify_ecdsa_p256, p256, "nistp256", 32);
ecdsa_verify_fn!(verify_ecdsa_p384, p384, "nistp384", 48);
ecdsa_verify_fn!(verify_ecdsa_p521, p521, "nistp521", 66);

/// Verdict from the host key policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyVerdict {
    /// The key matches what is known for this host.
    Trusted,
    /// The host is not known. Callers decide whether to continue.
    Unknown,
    /// The key is known revoked; the connection must fail.
    Revoked,
}

/// Client-side host key policy (the known-hosts store collaborator).
#[async_trait::async_trait]
pub trait HostKeyVerifier: Send + Sync {
    /// Judges the host key offered for `host`.
    async fn check(&self, host: &str, algorithm: &str, key_blob: &[u8]) -> HostKeyVerdict;
}

/// Accepts every host key. Test and demo use only.
pub struct AcceptAllVerifier;

#[async_trait::async_trait]
impl HostKeyVerifier for AcceptAllVerifier {
    async fn check(&self, _host: &str, _algorithm: &str, _key_blob: &[u8]) -> HostKeyVerdict {
        HostKeyVerdict::Trusted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_platform::OsRandom;

    #[test]
    fn test_algorithm_names() {
        assert_eq!(HostKeyAlgorithm::SshEd25519.name(), "ssh-ed25519");
        assert_eq!(
            HostKeyAlgorithm::from_name("rsa-sha2-512"),
            Some(HostKeyAlgorithm::RsaSha2_512)
        );
        assert_eq!(HostKeyAlgorithm::RsaSha2_256.key_blob_type(), "ssh-rsa");
        assert_eq!(
            HostKeyAlgorithm::EcdsaP384.key_blob_type(),
            "ecdsa-sha2-nistp384"
        );
    }

    #[test]
    fn test_ed25519_sign_verify() {
        let key = Ed25519HostKey::generate(&mut OsRandom);
        let blob = key.public_key_blob();
        let sig = key.sign(HostKeyAlgorithm::SshEd25519, b"exchange hash").unwrap();

        verify_signature("ssh-ed25519", &blob, b"exchange hash", &sig).unwrap();
        assert!(verify_signature("ssh-ed25519", &blob, b"tampered", &sig).is_err());
    }

    #[test]
    fn test_ed25519_fingerprint_stable() {
        let key = Ed25519HostKey::from_seed(&[7u8; 32]);
        let fp1 = key.fingerprint();
        let fp2 = key.fingerprint();
        assert_eq!(fp1, fp2);
        assert!(fp1.starts_with("SHA256:"));
    }

    #[test]
    fn test_ecdsa_p256_sign_verify() {
        let key = EcdsaP256HostKey::generate(&mut OsRandom);
        let blob = key.public_key_blob();
        let sig = key.sign(HostKeyAlgorithm::EcdsaP256, b"hash").unwrap();

        verify_signature("ecdsa-sha2-nistp256", &blob, b"hash", &sig).unwrap();
        assert!(verify_signature("ecdsa-sha2-nistp256", &blob, b"other", &sig).is_err());
    }

    #[test]
    fn test_ecdsa_p384_sign_verify() {
        let key = EcdsaP384HostKey::generate(&mut OsRandom);
        let blob = key.public_key_blob();
        let sig = key.sign(HostKeyAlgorithm::EcdsaP384, b"hash").unwrap();
        verify_signature("ecdsa-sha2-nistp384", &blob, b"hash", &sig).unwrap();
    }

    #[test]
    fn test_rsa_sign_verify() {
        // RSA keygen is slow; one 2048-bit key covers both digests.
        let key = RsaHostKey::generate(&mut OsRandom, 2048).unwrap();
        let blob = key.public_key_blob();

        let sig = key.sign(HostKeyAlgorithm::RsaSha2_256, b"hash").unwrap();
        verify_signature("rsa-sha2-256", &blob, b"hash", &sig).unwrap();

        let sig = key.sign(HostKeyAlgorithm::RsaSha2_512, b"hash").unwrap();
        verify_signature("rsa-sha2-512", &blob, b"hash", &sig).unwrap();

        assert!(verify_signature("rsa-sha2-256", &blob, b"hash", &sig).is_err());
    }

    #[test]
    fn test_wrong_algorithm_rejected() {
        let key = Ed25519HostKey::generate(&mut OsRandom);
        assert!(key.sign(HostKeyAlgorithm::RsaSha2_256, b"x").is_err());

        let blob = key.public_key_blob();
        let sig = key.sign(HostKeyAlgorithm::SshEd25519, b"x").unwrap();
        // Negotiated algorithm does not match the blob type.
        assert!(verify_signature("ecdsa-sha2-nistp256", &blob, b"x", &sig).is_err());
    }

    #[tokio::test]
    async fn test_accept_all_verifier() {
        let verdict = AcceptAllVerifier.check("example.org", "ssh-ed25519", b"blob").await;
        assert_eq!(verdict, HostKeyVerdict::Trusted);
    }
}
