//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! Each side sends an identification line before any packet:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may precede its identification with free-form banner lines;
//! those are tolerated (up to [`MAX_PRE_BANNER_LINES`]) and surfaced to the
//! caller. Each line is limited to 255 bytes including the CR LF.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::version::Version;
//!
//! let version = Version::new("Skiff_0.4.0", None);
//! assert_eq!(version.to_string(), "SSH-2.0-Skiff_0.4.0");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_9.6\r\n").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_9.6");
//! ```

use skiff_platform::{SkiffError, SkiffResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Maximum length of an identification line including CR LF (RFC 4253).
pub const MAX_LINE_LENGTH: usize = 255;

/// Maximum number of pre-banner lines tolerated before the `SSH-` line.
pub const MAX_PRE_BANNER_LINES: usize = 64;

/// SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Protocol version, "2.0" (or "1.99" from compatible peers).
    proto_version: String,
    /// Software version, e.g. "Skiff_0.4.0".
    software_version: String,
    /// Optional comments after the first space.
    comments: Option<String>,
}

impl Version {
    /// Creates a new version with protocol version "2.0".
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Default identification for this crate.
    pub fn default_skiff() -> Self {
        Self::new(&format!("Skiff_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an identification line (with or without trailing CR LF).
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] for oversized lines, lines not
    /// starting with `SSH-`, unsupported protocol versions, or embedded
    /// null bytes.
    pub fn parse(line: &str) -> SkiffResult<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.len() > MAX_LINE_LENGTH {
            return Err(SkiffError::Protocol(format!(
                "identification line too long: {} bytes (max {})",
                line.len(),
                MAX_LINE_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(SkiffError::Protocol(
                "identification line contains a null byte".to_string(),
            ));
        }

        if !line.starts_with("SSH-") {
            return Err(SkiffError::Protocol(format!(
                "identification line must start with 'SSH-': {:?}",
                line
            )));
        }

        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 {
            return Err(SkiffError::Protocol(format!(
                "malformed identification line: {:?}",
                line
            )));
        }

        let proto_version = parts[1];
        let rest = parts[2];

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(SkiffError::Protocol(format!(
                "unsupported protocol version {:?} (need 2.0)",
                proto_version
            )));
        }

        let (software_version, comments) = match rest.find(' ') {
            Some(pos) => (
                rest[..pos].to_string(),
                Some(rest[pos + 1..].trim().to_string()),
            ),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Returns the protocol version component.
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version component.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Wire encoding with trailing CR LF.
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Outcome of reading the peer's identification.
#[derive(Debug)]
pub struct PeerIdentification {
    /// Parsed version line.
    pub version: Version,
    /// The raw identification line, without CR LF. Needed verbatim for the
    /// exchange hash (V_C / V_S).
    pub raw_line: Vec<u8>,
    /// Pre-banner lines received before the identification, if any.
    pub banner_lines: Vec<String>,
}

/// Reads the peer's identification line from the stream, one byte at a
/// time, tolerating pre-banner text.
///
/// Reading byte-wise is deliberate: the identification is the only part of
/// the protocol that is line-delimited, and over-reading here would swallow
/// the first binary packet.
pub async fn read_peer_identification<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> SkiffResult<PeerIdentification> {
    let mut banner_lines = Vec::new();

    loop {
        let line = read_line(stream).await?;
        if line.starts_with(b"SSH-") {
            let text = std::str::from_utf8(&line).map_err(|_| {
                SkiffError::Protocol("identification line is not valid UTF-8".to_string())
            })?;
            let version = Version::parse(text)?;
            debug!(identification = %text, "peer identification");
            return Ok(PeerIdentification {
                version,
                raw_line: line,
                banner_lines,
            });
        }

        if banner_lines.len() >= MAX_PRE_BANNER_LINES {
            return Err(SkiffError::Protocol(format!(
                "no identification line within {} pre-banner lines",
                MAX_PRE_BANNER_LINES
            )));
        }
        let text = String::from_utf8_lossy(&line).into_owned();
        debug!(line = %text, "pre-banner line");
        banner_lines.push(text);
    }
}

async fn read_line<S: AsyncRead + Unpin>(stream: &mut S) -> SkiffResult<Vec<u8>> {
    let mut line = Vec::with_capacity(64);
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(line);
        }
        line.push(byte[0]);
        if line.len() > MAX_LINE_LENGTH {
            return Err(SkiffError::Protocol(format!(
                "identification line exceeds {} bytes",
                MAX_LINE_LENGTH
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_display() {
        let version = Version::new("Skiff_0.4.0", None);
        assert_eq!(version.to_string(), "SSH-2.0-Skiff_0.4.0");

        let with_comments = Version::new("Skiff_0.4.0", Some("testing"));
        assert_eq!(with_comments.to_string(), "SSH-2.0-Skiff_0.4.0 testing");
    }

    #[test]
    fn test_version_parse() {
        let version = Version::parse("SSH-2.0-OpenSSH_9.6").unwrap();
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.software(), "OpenSSH_9.6");
        assert_eq!(version.comments(), None);
    }

    #[test]
    fn test_version_parse_comments_and_crlf() {
        let version = Version::parse("SSH-2.0-OpenSSH_9.6 Ubuntu-3ubuntu13\r\n").unwrap();
        assert_eq!(version.software(), "OpenSSH_9.6");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu13"));
    }

    #[test]
    fn test_version_parse_199() {
        let version = Version::parse("SSH-1.99-Legacy").unwrap();
        assert_eq!(version.proto_version(), "1.99");
    }

    #[test]
    fn test_version_parse_rejects() {
        assert!(Version::parse("HTTP/1.1 200 OK").is_err());
        assert!(Version::parse("SSH-1.5-Ancient").is_err());
        assert!(Version::parse(&format!("SSH-2.0-{}", "x".repeat(300))).is_err());
        assert!(Version::parse("SSH-2.0-bad\0bad").is_err());
    }

    #[test]
    fn test_wire_format() {
        let version = Version::new("Skiff_0.4.0", None);
        assert_eq!(version.to_wire_format(), b"SSH-2.0-Skiff_0.4.0\r\n");
    }

    #[tokio::test]
    async fn test_read_identification_plain() {
        let data = b"SSH-2.0-TestPeer_1.0\r\n".to_vec();
        let mut cursor = std::io::Cursor::new(data);
        let ident = read_peer_identification(&mut cursor).await.unwrap();
        assert_eq!(ident.version.software(), "TestPeer_1.0");
        assert_eq!(ident.raw_line, b"SSH-2.0-TestPeer_1.0");
        assert!(ident.banner_lines.is_empty());
    }

    #[tokio::test]
    async fn test_read_identification_with_banner() {
        let data = b"Welcome to example.org\r\nNo fishing\r\nSSH-2.0-TestPeer_1.0\r\n".to_vec();
        let mut cursor = std::io::Cursor::new(data);
        let ident = read_peer_identification(&mut cursor).await.unwrap();
        assert_eq!(ident.banner_lines.len(), 2);
        assert_eq!(ident.banner_lines[0], "Welcome to example.org");
        assert_eq!(ident.version.software(), "TestPeer_1.0");
    }

    #[tokio::test]
    async fn test_read_identification_bare_lf() {
        let data = b"SSH-2.0-TestPeer_1.0\n".to_vec();
        let mut cursor = std::io::Cursor::new(data);
        let ident = read_peer_identification(&mut cursor).await.unwrap();
        assert_eq!(ident.raw_line, b"SSH-2.0-TestPeer_1.0");
    }
}
