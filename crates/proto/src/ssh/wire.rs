//! SSH wire-format primitives (RFC 4251 Section 5).
//!
//! Every SSH message is built from a small set of primitive encodings:
//!
//! ```text
//! byte       single octet
//! boolean    single octet, 0 = FALSE, anything else = TRUE
//! uint32     4 bytes, big-endian
//! uint64     8 bytes, big-endian
//! string     uint32 length followed by that many bytes
//! mpint      two's-complement big integer as a string; a leading zero byte
//!            is inserted when the high bit of the magnitude is set; zero
//!            is encoded as the empty string
//! name-list  comma-separated ASCII names inside a string
//! ```
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::wire::{Reader, Writer};
//!
//! let mut w = Writer::new();
//! w.put_u32(42);
//! w.put_string(b"ssh-connection");
//!
//! let buf = w.finish();
//! let mut r = Reader::new(&buf);
//! assert_eq!(r.read_u32().unwrap(), 42);
//! assert_eq!(r.read_string().unwrap(), b"ssh-connection");
//! ```

use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};

/// Bounded reader over a message payload.
///
/// Every accessor validates that enough bytes remain; a truncated message
/// produces a [`SkiffError::Protocol`] instead of a panic.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Returns true if every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> SkiffResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(SkiffError::Protocol(format!(
                "message truncated: wanted {} bytes at offset {}, {} remain",
                len,
                self.offset,
                self.remaining()
            )));
        }
        let out = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(out)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> SkiffResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a boolean (RFC 4251: any non-zero value is TRUE).
    pub fn read_bool(&mut self) -> SkiffResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a big-endian uint32.
    pub fn read_u32(&mut self) -> SkiffResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian uint64.
    pub fn read_u64(&mut self) -> SkiffResult<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    /// Reads a fixed-size byte array (e.g. the 16-byte KEXINIT cookie).
    pub fn read_array<const N: usize>(&mut self) -> SkiffResult<[u8; N]> {
        let b = self.take(N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(b);
        Ok(arr)
    }

    /// Reads a `string`: uint32 length followed by the bytes.
    pub fn read_string(&mut self) -> SkiffResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Reads a `string` and validates it as UTF-8.
    pub fn read_utf8(&mut self) -> SkiffResult<String> {
        let bytes = self.read_string()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| SkiffError::Protocol("string contains invalid UTF-8".to_string()))
    }

    /// Reads an `mpint` as its raw magnitude bytes (leading zero stripped).
    pub fn read_mpint(&mut self) -> SkiffResult<&'a [u8]> {
        let bytes = self.read_string()?;
        if let Some(first) = bytes.first() {
            if *first & 0x80 != 0 {
                return Err(SkiffError::Protocol(
                    "negative mpint not permitted here".to_string(),
                ));
            }
        }
        // Strip the sign byte if one was inserted.
        Ok(match bytes {
            [0, rest @ ..] => rest,
            other => other,
        })
    }

    /// Reads a `name-list` into its comma-separated components.
    pub fn read_name_list(&mut self) -> SkiffResult<Vec<String>> {
        let bytes = self.read_string()?;
        if !bytes.is_ascii() {
            return Err(SkiffError::Protocol(
                "name-list contains non-ASCII bytes".to_string(),
            ));
        }
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|_| SkiffError::Protocol("name-list contains invalid UTF-8".to_string()))?;
        Ok(text.split(',').map(String::from).collect())
    }

    /// Returns the unconsumed tail of the payload.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.offset..];
        self.offset = self.data.len();
        out
    }
}

/// Writer that accumulates a message payload.
#[derive(Debug, Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Appends a single byte.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    /// Appends a boolean as 0/1.
    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    /// Appends a big-endian uint32.
    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    /// Appends a big-endian uint64.
    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    /// Appends raw bytes without a length prefix.
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Appends a `string`: uint32 length followed by the bytes.
    pub fn put_string(&mut self, bytes: &[u8]) {
        self.buf.put_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
    }

    /// Appends an `mpint` from magnitude bytes.
    ///
    /// Leading zero bytes are stripped, and a zero byte is prepended when
    /// the high bit of the first magnitude byte is set. Zero encodes as the
    /// empty string.
    pub fn put_mpint(&mut self, magnitude: &[u8]) {
        let trimmed = strip_leading_zeros(magnitude);
        if trimmed.is_empty() {
            self.buf.put_u32(0);
            return;
        }
        let pad = trimmed[0] & 0x80 != 0;
        self.buf.put_u32((trimmed.len() + pad as usize) as u32);
        if pad {
            self.buf.put_u8(0);
        }
        self.buf.put_slice(trimmed);
    }

    /// Appends a `name-list`.
    pub fn put_name_list<S: AsRef<str>>(&mut self, names: &[S]) {
        let joined = names
            .iter()
            .map(|n| n.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.put_string(joined.as_bytes());
    }

    /// Consumes the writer and returns the payload.
    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    /// Current length of the accumulated payload.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Strips leading zero bytes from a magnitude.
pub fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let mut out = bytes;
    while let [0, rest @ ..] = out {
        out = rest;
    }
    out
}

/// Encodes magnitude bytes as a standalone `mpint` (used in hash inputs).
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_mpint(magnitude);
    w.finish()
}

/// Encodes bytes as a standalone `string` (used in hash inputs).
pub fn encode_string(bytes: &[u8]) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_string(bytes);
    w.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u32_round_trip() {
        let mut w = Writer::new();
        w.put_u32(0xdead_beef);
        let buf = w.finish();
        assert_eq!(buf, vec![0xde, 0xad, 0xbe, 0xef]);

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_u32().unwrap(), 0xdead_beef);
        assert!(r.is_empty());
    }

    #[test]
    fn test_string_round_trip() {
        let mut w = Writer::new();
        w.put_string(b"hello");
        let buf = w.finish();

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_string().unwrap(), b"hello");
    }

    #[test]
    fn test_truncated_string() {
        let data = vec![0, 0, 0, 10, b'x'];
        let mut r = Reader::new(&data);
        assert!(r.read_string().is_err());
    }

    #[test]
    fn test_mpint_zero() {
        let mut w = Writer::new();
        w.put_mpint(&[]);
        assert_eq!(w.finish(), vec![0, 0, 0, 0]);

        let mut w = Writer::new();
        w.put_mpint(&[0, 0]);
        assert_eq!(w.finish(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_mpint_high_bit_padding() {
        // RFC 4251 section 5 example: 0x80 encodes with a leading zero.
        let mut w = Writer::new();
        w.put_mpint(&[0x80]);
        assert_eq!(w.finish(), vec![0, 0, 0, 2, 0x00, 0x80]);
    }

    #[test]
    fn test_mpint_strips_leading_zeros() {
        let mut w = Writer::new();
        w.put_mpint(&[0x00, 0x00, 0x12, 0x34]);
        assert_eq!(w.finish(), vec![0, 0, 0, 2, 0x12, 0x34]);
    }

    #[test]
    fn test_mpint_read_back() {
        let mut w = Writer::new();
        w.put_mpint(&[0xff, 0x01]);
        let buf = w.finish();
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_mpint().unwrap(), &[0xff, 0x01]);
    }

    #[test]
    fn test_name_list_round_trip() {
        let names = vec!["curve25519-sha256", "ecdh-sha2-nistp256"];
        let mut w = Writer::new();
        w.put_name_list(&names);
        let buf = w.finish();

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_name_list().unwrap(), names);
    }

    #[test]
    fn test_name_list_empty() {
        let mut w = Writer::new();
        w.put_name_list::<&str>(&[]);
        let buf = w.finish();

        let mut r = Reader::new(&buf);
        assert!(r.read_name_list().unwrap().is_empty());
    }

    #[test]
    fn test_bool_nonzero_is_true() {
        let mut r = Reader::new(&[7]);
        assert!(r.read_bool().unwrap());
    }

    #[test]
    fn test_array_and_u64() {
        let mut w = Writer::new();
        w.put_raw(&[1; 16]);
        w.put_u64(1 << 40);
        let buf = w.finish();

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_array::<16>().unwrap(), [1u8; 16]);
        assert_eq!(r.read_u64().unwrap(), 1 << 40);
    }
}
