//! Payload compression (RFC 4253 Section 6.2).
//!
//! Compression applies to the payload only, before encryption, and is
//! stateful: both sides keep a single zlib stream per direction for the
//! lifetime of the keys, ending each packet with a partial flush.
//!
//! Supported algorithms:
//!
//! - `none`
//! - `zlib` — active from NEWKEYS
//! - `zlib@openssh.com` — negotiated at KEX but "delayed": activated only
//!   once USERAUTH_SUCCESS has been sent or received
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::compress::CompressionAlgorithm;
//!
//! let algo = CompressionAlgorithm::from_name("zlib@openssh.com").unwrap();
//! assert!(algo.is_delayed());
//! ```

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use skiff_platform::{SkiffError, SkiffResult};

/// Upper bound on a decompressed payload. Inbound packets are already
/// capped at 35000 bytes; this bounds what they may inflate into.
const MAX_DECOMPRESSED_PAYLOAD: usize = 256 * 1024;

/// Compression algorithm negotiated in KEXINIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// No compression.
    None,
    /// zlib, active immediately after NEWKEYS.
    Zlib,
    /// zlib, delayed until authentication succeeds (OpenSSH extension).
    ZlibOpenSsh,
}

impl CompressionAlgorithm {
    /// Returns the wire name.
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::ZlibOpenSsh => "zlib@openssh.com",
        }
    }

    /// Parses a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionAlgorithm::None),
            "zlib" => Some(CompressionAlgorithm::Zlib),
            "zlib@openssh.com" => Some(CompressionAlgorithm::ZlibOpenSsh),
            _ => None,
        }
    }

    /// True for algorithms that only activate after USERAUTH_SUCCESS.
    pub fn is_delayed(&self) -> bool {
        matches!(self, CompressionAlgorithm::ZlibOpenSsh)
    }
}

/// Outbound compression state for one direction.
pub struct Compressor {
    algorithm: CompressionAlgorithm,
    /// Present once the algorithm is active.
    stream: Option<Compress>,
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("algorithm", &self.algorithm)
            .field("active", &self.stream.is_some())
            .finish()
    }
}

impl Compressor {
    /// Creates the outbound state; non-delayed algorithms activate at once.
    pub fn new(algorithm: CompressionAlgorithm) -> Self {
        let stream = match algorithm {
            CompressionAlgorithm::Zlib => Some(Compress::new(Compression::default(), true)),
            _ => None,
        };
        Self { algorithm, stream }
    }

    /// Activates a delayed algorithm (called on USERAUTH_SUCCESS).
    pub fn activate_delayed(&mut self) {
        if self.algorithm.is_delayed() && self.stream.is_none() {
            self.stream = Some(Compress::new(Compression::default(), true));
        }
    }

    /// Returns true once packets are actually being compressed.
    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    /// Compresses a payload, ending with a partial flush so the peer can
    /// decode the packet without waiting for more data.
    pub fn compress(&mut self, payload: &[u8]) -> SkiffResult<Vec<u8>> {
        let Some(stream) = &mut self.stream else {
            return Ok(payload.to_vec());
        };

        let mut out = Vec::with_capacity(payload.len() + 64);
        let mut input = payload;
        loop {
            if out.len() == out.capacity() {
                out.reserve(4096);
            }
            let before_in = stream.total_in();
            let before_out = stream.total_out();
            stream
                .compress_vec(input, &mut out, FlushCompress::Partial)
                .map_err(|e| SkiffError::Protocol(format!("compression failed: {}", e)))?;
            let consumed = (stream.total_in() - before_in) as usize;
            let produced = (stream.total_out() - before_out) as usize;
            input = &input[consumed..];

            if input.is_empty() && produced == 0 && out.len() < out.capacity() {
                return Ok(out);
            }
        }
    }
}

/// Inbound decompression state for one direction.
pub struct Decompressor {
    algorithm: CompressionAlgorithm,
    stream: Option<Decompress>,
}

impl std::fmt::Debug for Decompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decompressor")
            .field("algorithm", &self.algorithm)
            .field("active", &self.stream.is_some())
            .finish()
    }
}

impl Decompressor {
    /// Creates the inbound state; non-delayed algorithms activate at once.
    pub fn new(algorithm: CompressionAlgorithm) -> Self {
        let stream = match algorithm {
            CompressionAlgorithm::Zlib => Some(Decompress::new(true)),
            _ => None,
        };
        Self { algorithm, stream }
    }

    /// Activates a delayed algorithm (called on USERAUTH_SUCCESS).
    pub fn activate_delayed(&mut self) {
        if self.algorithm.is_delayed() && self.stream.is_none() {
            self.stream = Some(Decompress::new(true));
        }
    }

    /// Returns true once packets are actually being decompressed.
    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    /// Decompresses a payload, bounded by [`MAX_DECOMPRESSED_PAYLOAD`].
    pub fn decompress(&mut self, payload: &[u8]) -> SkiffResult<Vec<u8>> {
        let Some(stream) = &mut self.stream else {
            return Ok(payload.to_vec());
        };

        let mut out = Vec::with_capacity(payload.len() * 2 + 64);
        let mut input = payload;
        loop {
            if out.len() == out.capacity() {
                out.reserve(4096);
            }
            if out.capacity() > MAX_DECOMPRESSED_PAYLOAD {
                return Err(SkiffError::Protocol(format!(
                    "decompressed payload exceeds {} bytes",
                    MAX_DECOMPRESSED_PAYLOAD
                )));
            }
            let before_in = stream.total_in();
            let before_out = stream.total_out();
            let status = stream
                .decompress_vec(input, &mut out, FlushDecompress::None)
                .map_err(|e| SkiffError::Protocol(format!("decompression failed: {}", e)))?;
            let consumed = (stream.total_in() - before_in) as usize;
            let produced = (stream.total_out() - before_out) as usize;
            input = &input[consumed..];

            if matches!(status, Status::StreamEnd) {
                return Err(SkiffError::Protocol(
                    "peer terminated the compression stream mid-session".to_string(),
                ));
            }
            if input.is_empty() && produced == 0 && out.len() < out.capacity() {
                return Ok(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_names() {
        assert_eq!(CompressionAlgorithm::None.name(), "none");
        assert_eq!(CompressionAlgorithm::Zlib.name(), "zlib");
        assert_eq!(
            CompressionAlgorithm::ZlibOpenSsh.name(),
            "zlib@openssh.com"
        );
        assert_eq!(
            CompressionAlgorithm::from_name("zlib"),
            Some(CompressionAlgorithm::Zlib)
        );
        assert_eq!(CompressionAlgorithm::from_name("lz4"), None);
    }

    #[test]
    fn test_none_passthrough() {
        let mut c = Compressor::new(CompressionAlgorithm::None);
        let mut d = Decompressor::new(CompressionAlgorithm::None);
        let payload = b"uncompressed".to_vec();
        assert_eq!(c.compress(&payload).unwrap(), payload);
        assert_eq!(d.decompress(&payload).unwrap(), payload);
    }

    #[test]
    fn test_zlib_round_trip_multiple_packets() {
        let mut c = Compressor::new(CompressionAlgorithm::Zlib);
        let mut d = Decompressor::new(CompressionAlgorithm::Zlib);

        // The stream carries state across packets, so each one must decode
        // against the shared dictionary.
        for payload in [
            b"first payload first payload".to_vec(),
            b"second payload second payload".to_vec(),
            vec![0x5a; 4096],
        ] {
            let compressed = c.compress(&payload).unwrap();
            let restored = d.decompress(&compressed).unwrap();
            assert_eq!(restored, payload);
        }
    }

    #[test]
    fn test_delayed_inactive_until_activated() {
        let mut c = Compressor::new(CompressionAlgorithm::ZlibOpenSsh);
        assert!(!c.is_active());
        let payload = b"plaintext before auth".to_vec();
        assert_eq!(c.compress(&payload).unwrap(), payload);

        c.activate_delayed();
        assert!(c.is_active());
        let compressed = c.compress(&payload).unwrap();

        let mut d = Decompressor::new(CompressionAlgorithm::ZlibOpenSsh);
        d.activate_delayed();
        assert_eq!(d.decompress(&compressed).unwrap(), payload);
    }

    #[test]
    fn test_empty_payload() {
        let mut c = Compressor::new(CompressionAlgorithm::Zlib);
        let mut d = Decompressor::new(CompressionAlgorithm::Zlib);
        let compressed = c.compress(b"").unwrap();
        assert_eq!(d.decompress(&compressed).unwrap(), b"");
    }
}
