//! Protocol implementations for the Skiff stack.
//!
//! This crate provides a Rust implementation of the SSH protocol suite:
//!
//! - **SSH** (Secure Shell) - RFC 4251-4254 transport, authentication, and
//!   connection protocols, with the OpenSSH strict-KEX, ETM, and hybrid
//!   post-quantum key exchange extensions
//!
//! # Features
//!
//! - `ssh` (default) - SSH protocol support (client + server)
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::wire::{Reader, Writer};
//!
//! let mut w = Writer::new();
//! w.put_string(b"ssh-userauth");
//! let buf = w.finish();
//!
//! let mut r = Reader::new(&buf);
//! assert_eq!(r.read_string().unwrap(), b"ssh-userauth");
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted RustCrypto / dalek libraries
//! - Constant-time operations for MAC and credential comparison
//! - Secure memory handling with `zeroize`
//! - No `unsafe` code
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
