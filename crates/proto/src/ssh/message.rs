//! SSH protocol message numbers and transport-generic messages (RFC 4253).
//!
//! Message numbers are allocated in ranges (RFC 4251 Section 7):
//!
//! - **1–19** transport layer generic (disconnect, ignore, debug, service)
//! - **20–29** algorithm negotiation (KEXINIT, NEWKEYS)
//! - **30–49** key exchange method specific (meaning depends on the method)
//! - **50–59** user authentication generic
//! - **60–79** user authentication method specific
//! - **80–89** connection protocol generic (global requests)
//! - **90–127** channel related
//!
//! Numbers 30–49 and 60–79 are context dependent: `30` is KEXDH_INIT for
//! classic Diffie-Hellman, KEX_ECDH_INIT for ECDH, and the hybrid INIT for
//! ML-KEM exchanges; `60` is USERAUTH_PK_OK during publickey authentication
//! and USERAUTH_INFO_REQUEST during keyboard-interactive.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::message::{msg, MessageClass};
//!
//! assert_eq!(msg::KEXINIT, 20);
//! assert_eq!(MessageClass::of(94), MessageClass::Channel);
//! ```

use crate::ssh::wire::{Reader, Writer};
use skiff_platform::{SkiffError, SkiffResult};

/// SSH message numbers (RFC 4250 Section 4.1).
pub mod msg {
    /// SSH_MSG_DISCONNECT
    pub const DISCONNECT: u8 = 1;
    /// SSH_MSG_IGNORE
    pub const IGNORE: u8 = 2;
    /// SSH_MSG_UNIMPLEMENTED
    pub const UNIMPLEMENTED: u8 = 3;
    /// SSH_MSG_DEBUG
    pub const DEBUG: u8 = 4;
    /// SSH_MSG_SERVICE_REQUEST
    pub const SERVICE_REQUEST: u8 = 5;
    /// SSH_MSG_SERVICE_ACCEPT
    pub const SERVICE_ACCEPT: u8 = 6;
    /// SSH_MSG_EXT_INFO (RFC 8308)
    pub const EXT_INFO: u8 = 7;

    /// SSH_MSG_KEXINIT
    pub const KEXINIT: u8 = 20;
    /// SSH_MSG_NEWKEYS
    pub const NEWKEYS: u8 = 21;

    /// SSH_MSG_KEXDH_INIT / SSH_MSG_KEX_ECDH_INIT / hybrid INIT
    pub const KEX_INIT_30: u8 = 30;
    /// SSH_MSG_KEXDH_REPLY / SSH_MSG_KEX_ECDH_REPLY / SSH_MSG_KEX_DH_GEX_GROUP
    pub const KEX_REPLY_31: u8 = 31;
    /// SSH_MSG_KEX_DH_GEX_INIT
    pub const KEX_DH_GEX_INIT: u8 = 32;
    /// SSH_MSG_KEX_DH_GEX_REPLY
    pub const KEX_DH_GEX_REPLY: u8 = 33;
    /// SSH_MSG_KEX_DH_GEX_REQUEST
    pub const KEX_DH_GEX_REQUEST: u8 = 34;

    /// SSH_MSG_USERAUTH_REQUEST
    pub const USERAUTH_REQUEST: u8 = 50;
    /// SSH_MSG_USERAUTH_FAILURE
    pub const USERAUTH_FAILURE: u8 = 51;
    /// SSH_MSG_USERAUTH_SUCCESS
    pub const USERAUTH_SUCCESS: u8 = 52;
    /// SSH_MSG_USERAUTH_BANNER
    pub const USERAUTH_BANNER: u8 = 53;

    /// SSH_MSG_USERAUTH_PK_OK / SSH_MSG_USERAUTH_INFO_REQUEST /
    /// SSH_MSG_USERAUTH_PASSWD_CHANGEREQ (context dependent)
    pub const USERAUTH_60: u8 = 60;
    /// SSH_MSG_USERAUTH_INFO_RESPONSE
    pub const USERAUTH_INFO_RESPONSE: u8 = 61;

    /// SSH_MSG_GLOBAL_REQUEST
    pub const GLOBAL_REQUEST: u8 = 80;
    /// SSH_MSG_REQUEST_SUCCESS
    pub const REQUEST_SUCCESS: u8 = 81;
    /// SSH_MSG_REQUEST_FAILURE
    pub const REQUEST_FAILURE: u8 = 82;

    /// SSH_MSG_CHANNEL_OPEN
    pub const CHANNEL_OPEN: u8 = 90;
    /// SSH_MSG_CHANNEL_OPEN_CONFIRMATION
    pub const CHANNEL_OPEN_CONFIRMATION: u8 = 91;
    /// SSH_MSG_CHANNEL_OPEN_FAILURE
    pub const CHANNEL_OPEN_FAILURE: u8 = 92;
    /// SSH_MSG_CHANNEL_WINDOW_ADJUST
    pub const CHANNEL_WINDOW_ADJUST: u8 = 93;
    /// SSH_MSG_CHANNEL_DATA
    pub const CHANNEL_DATA: u8 = 94;
    /// SSH_MSG_CHANNEL_EXTENDED_DATA
    pub const CHANNEL_EXTENDED_DATA: u8 = 95;
    /// SSH_MSG_CHANNEL_EOF
    pub const CHANNEL_EOF: u8 = 96;
    /// SSH_MSG_CHANNEL_CLOSE
    pub const CHANNEL_CLOSE: u8 = 97;
    /// SSH_MSG_CHANNEL_REQUEST
    pub const CHANNEL_REQUEST: u8 = 98;
    /// SSH_MSG_CHANNEL_SUCCESS
    pub const CHANNEL_SUCCESS: u8 = 99;
    /// SSH_MSG_CHANNEL_FAILURE
    pub const CHANNEL_FAILURE: u8 = 100;
}

/// Coarse classification of a message number by its allocation range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// 1–19: disconnect, ignore, debug, unimplemented, service messages.
    TransportGeneric,
    /// 20–29: KEXINIT and NEWKEYS.
    AlgorithmNegotiation,
    /// 30–49: key exchange method specific.
    KexMethod,
    /// 50–59: user authentication generic.
    AuthGeneric,
    /// 60–79: user authentication method specific.
    AuthMethod,
    /// 80–89: global requests.
    ConnectionGeneric,
    /// 90–127: channel messages.
    Channel,
    /// 128–191: reserved for client protocols.
    Reserved,
    /// 192–255: local extensions.
    LocalExtension,
    /// 0 is not a valid message number.
    Invalid,
}

impl MessageClass {
    /// Classifies a message number.
    pub fn of(number: u8) -> Self {
        match number {
            0 => MessageClass::Invalid,
            1..=19 => MessageClass::TransportGeneric,
            20..=29 => MessageClass::AlgorithmNegotiation,
            30..=49 => MessageClass::KexMethod,
            50..=59 => MessageClass::AuthGeneric,
            60..=79 => MessageClass::AuthMethod,
            80..=89 => MessageClass::ConnectionGeneric,
            90..=127 => MessageClass::Channel,
            128..=191 => MessageClass::Reserved,
            192..=255 => MessageClass::LocalExtension,
        }
    }
}

/// Returns a printable name for a message number, for logging.
pub fn name(number: u8) -> &'static str {
    match number {
        msg::DISCONNECT => "SSH_MSG_DISCONNECT",
        msg::IGNORE => "SSH_MSG_IGNORE",
        msg::UNIMPLEMENTED => "SSH_MSG_UNIMPLEMENTED",
        msg::DEBUG => "SSH_MSG_DEBUG",
        msg::SERVICE_REQUEST => "SSH_MSG_SERVICE_REQUEST",
        msg::SERVICE_ACCEPT => "SSH_MSG_SERVICE_ACCEPT",
        msg::EXT_INFO => "SSH_MSG_EXT_INFO",
        msg::KEXINIT => "SSH_MSG_KEXINIT",
        msg::NEWKEYS => "SSH_MSG_NEWKEYS",
        msg::KEX_INIT_30 => "SSH_MSG_KEX_INIT(30)",
        msg::KEX_REPLY_31 => "SSH_MSG_KEX_REPLY(31)",
        msg::KEX_DH_GEX_INIT => "SSH_MSG_KEX_DH_GEX_INIT",
        msg::KEX_DH_GEX_REPLY => "SSH_MSG_KEX_DH_GEX_REPLY",
        msg::KEX_DH_GEX_REQUEST => "SSH_MSG_KEX_DH_GEX_REQUEST",
        msg::USERAUTH_REQUEST => "SSH_MSG_USERAUTH_REQUEST",
        msg::USERAUTH_FAILURE => "SSH_MSG_USERAUTH_FAILURE",
        msg::USERAUTH_SUCCESS => "SSH_MSG_USERAUTH_SUCCESS",
        msg::USERAUTH_BANNER => "SSH_MSG_USERAUTH_BANNER",
        msg::USERAUTH_60 => "SSH_MSG_USERAUTH(60)",
        msg::USERAUTH_INFO_RESPONSE => "SSH_MSG_USERAUTH_INFO_RESPONSE",
        msg::GLOBAL_REQUEST => "SSH_MSG_GLOBAL_REQUEST",
        msg::REQUEST_SUCCESS => "SSH_MSG_REQUEST_SUCCESS",
        msg::REQUEST_FAILURE => "SSH_MSG_REQUEST_FAILURE",
        msg::CHANNEL_OPEN => "SSH_MSG_CHANNEL_OPEN",
        msg::CHANNEL_OPEN_CONFIRMATION => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
        msg::CHANNEL_OPEN_FAILURE => "SSH_MSG_CHANNEL_OPEN_FAILURE",
        msg::CHANNEL_WINDOW_ADJUST => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
        msg::CHANNEL_DATA => "SSH_MSG_CHANNEL_DATA",
        msg::CHANNEL_EXTENDED_DATA => "SSH_MSG_CHANNEL_EXTENDED_DATA",
        msg::CHANNEL_EOF => "SSH_MSG_CHANNEL_EOF",
        msg::CHANNEL_CLOSE => "SSH_MSG_CHANNEL_CLOSE",
        msg::CHANNEL_REQUEST => "SSH_MSG_CHANNEL_REQUEST",
        msg::CHANNEL_SUCCESS => "SSH_MSG_CHANNEL_SUCCESS",
        msg::CHANNEL_FAILURE => "SSH_MSG_CHANNEL_FAILURE",
        _ => "SSH_MSG_UNKNOWN",
    }
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectReason {
    /// SSH_DISCONNECT_HOST_NOT_ALLOWED_TO_CONNECT
    HostNotAllowedToConnect = 1,
    /// SSH_DISCONNECT_PROTOCOL_ERROR
    ProtocolError = 2,
    /// SSH_DISCONNECT_KEY_EXCHANGE_FAILED
    KeyExchangeFailed = 3,
    /// SSH_DISCONNECT_RESERVED
    Reserved = 4,
    /// SSH_DISCONNECT_MAC_ERROR
    MacError = 5,
    /// SSH_DISCONNECT_COMPRESSION_ERROR
    CompressionError = 6,
    /// SSH_DISCONNECT_SERVICE_NOT_AVAILABLE
    ServiceNotAvailable = 7,
    /// SSH_DISCONNECT_PROTOCOL_VERSION_NOT_SUPPORTED
    ProtocolVersionNotSupported = 8,
    /// SSH_DISCONNECT_HOST_KEY_NOT_VERIFIABLE
    HostKeyNotVerifiable = 9,
    /// SSH_DISCONNECT_CONNECTION_LOST
    ConnectionLost = 10,
    /// SSH_DISCONNECT_BY_APPLICATION
    ByApplication = 11,
    /// SSH_DISCONNECT_TOO_MANY_CONNECTIONS
    TooManyConnections = 12,
    /// SSH_DISCONNECT_AUTH_CANCELLED_BY_USER
    AuthCancelledByUser = 13,
    /// SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE
    NoMoreAuthMethodsAvailable = 14,
    /// SSH_DISCONNECT_ILLEGAL_USER_NAME
    IllegalUserName = 15,
}

impl DisconnectReason {
    /// Converts a wire code to a reason, if known.
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::HostNotAllowedToConnect,
            2 => Self::ProtocolError,
            3 => Self::KeyExchangeFailed,
            4 => Self::Reserved,
            5 => Self::MacError,
            6 => Self::CompressionError,
            7 => Self::ServiceNotAvailable,
            8 => Self::ProtocolVersionNotSupported,
            9 => Self::HostKeyNotVerifiable,
            10 => Self::ConnectionLost,
            11 => Self::ByApplication,
            12 => Self::TooManyConnections,
            13 => Self::AuthCancelledByUser,
            14 => Self::NoMoreAuthMethodsAvailable,
            15 => Self::IllegalUserName,
            _ => return None,
        })
    }
}

/// SSH_MSG_DISCONNECT (RFC 4253 Section 11.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code.
    pub reason: u32,
    /// Human-readable description (may be empty).
    pub description: String,
    /// RFC 3066 language tag (almost always empty).
    pub language: String,
}

impl Disconnect {
    /// Creates a disconnect message for a known reason.
    pub fn new(reason: DisconnectReason, description: &str) -> Self {
        Self {
            reason: reason as u32,
            description: description.to_string(),
            language: String::new(),
        }
    }

    /// Serializes to a message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(msg::DISCONNECT);
        w.put_u32(self.reason);
        w.put_string(self.description.as_bytes());
        w.put_string(self.language.as_bytes());
        w.finish()
    }

    /// Parses from a message payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != msg::DISCONNECT {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_DISCONNECT, got {}",
                kind
            )));
        }
        Ok(Self {
            reason: r.read_u32()?,
            description: String::from_utf8_lossy(r.read_string()?).into_owned(),
            language: String::from_utf8_lossy(r.read_string()?).into_owned(),
        })
    }
}

/// SSH_MSG_UNIMPLEMENTED (RFC 4253 Section 11.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unimplemented {
    /// Sequence number of the packet that was not understood.
    pub sequence: u32,
}

impl Unimplemented {
    /// Serializes to a message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(msg::UNIMPLEMENTED);
        w.put_u32(self.sequence);
        w.finish()
    }

    /// Parses from a message payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != msg::UNIMPLEMENTED {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_UNIMPLEMENTED, got {}",
                kind
            )));
        }
        Ok(Self {
            sequence: r.read_u32()?,
        })
    }
}

/// SSH_MSG_DEBUG (RFC 4253 Section 11.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMsg {
    /// Whether the message should always be displayed.
    pub always_display: bool,
    /// Debug text.
    pub message: String,
    /// Language tag.
    pub language: String,
}

impl DebugMsg {
    /// Parses from a message payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != msg::DEBUG {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_DEBUG, got {}",
                kind
            )));
        }
        Ok(Self {
            always_display: r.read_bool()?,
            message: String::from_utf8_lossy(r.read_string()?).into_owned(),
            language: String::from_utf8_lossy(r.read_string()?).into_owned(),
        })
    }
}

/// Builds an SSH_MSG_IGNORE payload.
pub fn ignore(data: &[u8]) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u8(msg::IGNORE);
    w.put_string(data);
    w.finish()
}

/// Builds an SSH_MSG_SERVICE_REQUEST payload (RFC 4253 Section 10).
pub fn service_request(service: &str) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u8(msg::SERVICE_REQUEST);
    w.put_string(service.as_bytes());
    w.finish()
}

/// Builds an SSH_MSG_SERVICE_ACCEPT payload.
pub fn service_accept(service: &str) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u8(msg::SERVICE_ACCEPT);
    w.put_string(service.as_bytes());
    w.finish()
}

/// Parses the service name out of SERVICE_REQUEST or SERVICE_ACCEPT.
pub fn parse_service(data: &[u8], expected_kind: u8) -> SkiffResult<String> {
    let mut r = Reader::new(data);
    let kind = r.read_u8()?;
    if kind != expected_kind {
        return Err(SkiffError::Protocol(format!(
            "expected {} ({}), got {} ({})",
            name(expected_kind),
            expected_kind,
            name(kind),
            kind
        )));
    }
    r.read_utf8()
}

/// Builds an SSH_MSG_EXT_INFO payload advertising `server-sig-algs`
/// (RFC 8308 Section 3.1).
pub fn ext_info_server_sig_algs(algorithms: &[String]) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u8(msg::EXT_INFO);
    w.put_u32(1);
    w.put_string(b"server-sig-algs");
    w.put_name_list(algorithms);
    w.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_class_ranges() {
        assert_eq!(MessageClass::of(1), MessageClass::TransportGeneric);
        assert_eq!(MessageClass::of(20), MessageClass::AlgorithmNegotiation);
        assert_eq!(MessageClass::of(30), MessageClass::KexMethod);
        assert_eq!(MessageClass::of(50), MessageClass::AuthGeneric);
        assert_eq!(MessageClass::of(60), MessageClass::AuthMethod);
        assert_eq!(MessageClass::of(80), MessageClass::ConnectionGeneric);
        assert_eq!(MessageClass::of(94), MessageClass::Channel);
        assert_eq!(MessageClass::of(127), MessageClass::Channel);
        assert_eq!(MessageClass::of(128), MessageClass::Reserved);
        assert_eq!(MessageClass::of(200), MessageClass::LocalExtension);
        assert_eq!(MessageClass::of(0), MessageClass::Invalid);
    }

    #[test]
    fn test_disconnect_round_trip() {
        let original = Disconnect::new(DisconnectReason::ProtocolError, "bad padding");
        let bytes = original.to_bytes();
        assert_eq!(bytes[0], msg::DISCONNECT);

        let parsed = Disconnect::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, original);
        assert_eq!(parsed.reason, 2);
    }

    #[test]
    fn test_unimplemented_round_trip() {
        let original = Unimplemented { sequence: 1234 };
        let parsed = Unimplemented::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(parsed.sequence, 1234);
    }

    #[test]
    fn test_service_round_trip() {
        let bytes = service_request("ssh-userauth");
        let service = parse_service(&bytes, msg::SERVICE_REQUEST).unwrap();
        assert_eq!(service, "ssh-userauth");

        let bytes = service_accept("ssh-userauth");
        let service = parse_service(&bytes, msg::SERVICE_ACCEPT).unwrap();
        assert_eq!(service, "ssh-userauth");
    }

    #[test]
    fn test_service_wrong_kind() {
        let bytes = service_request("ssh-userauth");
        assert!(parse_service(&bytes, msg::SERVICE_ACCEPT).is_err());
    }

    #[test]
    fn test_disconnect_reason_codes() {
        assert_eq!(DisconnectReason::ProtocolError as u32, 2);
        assert_eq!(DisconnectReason::MacError as u32, 5);
        assert_eq!(DisconnectReason::HostKeyNotVerifiable as u32, 9);
        assert_eq!(
            DisconnectReason::from_u32(14),
            Some(DisconnectReason::NoMoreAuthMethodsAvailable)
        );
        assert_eq!(DisconnectReason::from_u32(99), None);
    }

    #[test]
    fn test_ext_info() {
        let payload = ext_info_server_sig_algs(&["ssh-ed25519".to_string()]);
        assert_eq!(payload[0], msg::EXT_INFO);
    }
}
