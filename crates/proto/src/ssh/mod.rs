//! SSH (Secure Shell) protocol implementation.
//!
//! This module implements the SSH transport, authentication, and
//! connection protocols according to RFC 4251-4254 and the OpenSSH
//! extensions in common use.
//!
//! # Architecture
//!
//! The implementation is layered, leaves first:
//!
//! 1. **Wire primitives** ([`wire`]) - RFC 4251 encodings
//! 2. **Binary packet protocol** ([`packet`], [`crypto`], [`compress`]) -
//!    framing, the cipher/MAC pipeline, and payload compression
//! 3. **Key exchange** ([`kex`], [`kex_dh`], [`hostkey`]) - negotiation,
//!    the method exchanges, host key signatures, key derivation
//! 4. **Authentication** ([`auth`]) - RFC 4252/4256 messages
//! 5. **Connection layer** ([`connection`], [`channel`]) - channel
//!    multiplexing with window flow control
//! 6. **Session machinery** ([`transport`], [`dispatcher`],
//!    [`connection_mgr`]) - the phase machine, message routing, re-keying
//! 7. **Drivers** ([`client`], [`server`]) - async sessions over any
//!    injected byte stream
//!
//! # Security Considerations
//!
//! - All packet parsing validates size limits (max 35000 bytes)
//! - MAC verification and password checks use constant-time comparisons
//! - Key material is zeroized on drop
//! - Modern algorithms first: ML-KEM/X25519 hybrid, ChaCha20-Poly1305,
//!   Ed25519
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::packet::PacketCodec;
//! use skiff_platform::OsRandom;
//!
//! let mut codec = PacketCodec::new();
//! let wire = codec.seal(&[2, 0, 0, 0, 0], &mut OsRandom).unwrap();
//! assert_eq!(wire.len() % 8, 0);
//! ```

pub mod auth;
pub mod channel;
pub mod client;
pub mod compress;
pub mod connection;
pub mod connection_mgr;
pub mod crypto;
pub mod dispatcher;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod message;
pub mod packet;
pub mod server;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use auth::{AuthMethod, AuthRequest};
pub use channel::{Channel, ChannelMux, ChannelState, MuxConfig};
pub use client::{ChannelEvent, ClientConfig, CommandOutput, PromptHandler, SshClient};
pub use compress::CompressionAlgorithm;
pub use connection::{ChannelOpenFailureReason, ChannelRequestType, ChannelType};
pub use crypto::{CipherAlgorithm, CipherContext, MacAlgorithm, MacKey};
pub use hostkey::{
    fingerprint, verify_signature, AcceptAllVerifier, EcdsaP256HostKey, EcdsaP384HostKey,
    EcdsaP521HostKey, Ed25519HostKey, HostKey, HostKeyAlgorithm, HostKeyVerdict, HostKeyVerifier,
    RsaHostKey,
};
pub use kex::{KexInit, NegotiatedAlgorithms};
pub use kex_dh::{derive_key, HashAlgorithm, KexSecret, SharedSecret};
pub use message::{msg, DisconnectReason, MessageClass};
pub use packet::PacketCodec;
pub use server::{
    AuthOutcome, AuthProvider, ExecOutcome, KiRound, ServerConfig, SessionHandler,
    SshServerSession, StaticPasswordAuth,
};
pub use transport::{Role, SessionConfig, SessionPhase, TransportState};
pub use version::Version;
