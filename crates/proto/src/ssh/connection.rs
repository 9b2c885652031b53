//! Connection protocol messages (RFC 4254).
//!
//! Channels multiplex independent data streams over one authenticated
//! transport. This module is the wire layer only: message structs with
//! their encodings. Channel state and flow control live in
//! [`crate::ssh::channel`].
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::connection::{ChannelOpen, ChannelType};
//!
//! let open = ChannelOpen::new(ChannelType::Session, 0, 2 * 1024 * 1024, 32768);
//! let bytes = open.to_bytes();
//! assert_eq!(bytes[0], 90);
//! ```

use crate::ssh::message::msg;
use crate::ssh::wire::{Reader, Writer};
use skiff_platform::{SkiffError, SkiffResult};

/// SSH_EXTENDED_DATA_STDERR (RFC 4254 Section 5.2).
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Channel type carried by CHANNEL_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Interactive session (shell, exec, subsystem).
    Session,
    /// Locally initiated forwarded connection.
    DirectTcpip {
        /// Target host.
        host: String,
        /// Target port.
        port: u32,
        /// Originator address.
        originator_address: String,
        /// Originator port.
        originator_port: u32,
    },
    /// Connection arriving on a remotely forwarded listener.
    ForwardedTcpip {
        /// Address that was connected.
        connected_address: String,
        /// Port that was connected.
        connected_port: u32,
        /// Originator address.
        originator_address: String,
        /// Originator port.
        originator_port: u32,
    },
    /// X11 forwarding channel.
    X11 {
        /// Originator address.
        originator_address: String,
        /// Originator port.
        originator_port: u32,
    },
    /// A type this implementation does not know; carried through so the
    /// receiver can reject it with UNKNOWN_CHANNEL_TYPE.
    Other {
        /// Wire name.
        name: String,
        /// Raw type-specific data.
        data: Vec<u8>,
    },
}

impl ChannelType {
    /// Returns the wire name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip { .. } => "direct-tcpip",
            ChannelType::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelType::X11 { .. } => "x11",
            ChannelType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type and its data.
    pub channel_type: ChannelType,
    /// Sender's channel id.
    pub sender_channel: u32,
    /// Bytes the sender will accept before a window adjust.
    pub initial_window: u32,
    /// Largest packet the sender will accept.
    pub max_packet: u32,
}

impl ChannelOpen {
    /// Creates a CHANNEL_OPEN.
    pub fn new(
        channel_type: ChannelType,
        sender_channel: u32,
        initial_window: u32,
        max_packet: u32,
    ) -> Self {
        Self {
            channel_type,
            sender_channel,
            initial_window,
            max_packet,
        }
    }

    /// Serializes the full message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(msg::CHANNEL_OPEN);
        w.put_string(self.channel_type.name().as_bytes());
        w.put_u32(self.sender_channel);
        w.put_u32(self.initial_window);
        w.put_u32(self.max_packet);
        match &self.channel_type {
            ChannelType::Session => {}
            ChannelType::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            } => {
                w.put_string(host.as_bytes());
                w.put_u32(*port);
                w.put_string(originator_address.as_bytes());
                w.put_u32(*originator_port);
            }
            ChannelType::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => {
                w.put_string(connected_address.as_bytes());
                w.put_u32(*connected_port);
                w.put_string(originator_address.as_bytes());
                w.put_u32(*originator_port);
            }
            ChannelType::X11 {
                originator_address,
                originator_port,
            } => {
                w.put_string(originator_address.as_bytes());
                w.put_u32(*originator_port);
            }
            ChannelType::Other { data, .. } => {
                w.put_raw(data);
            }
        }
        w.finish()
    }

    /// Parses a CHANNEL_OPEN payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != msg::CHANNEL_OPEN {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_CHANNEL_OPEN, got {}",
                kind
            )));
        }
        let type_name = r.read_utf8()?;
        let sender_channel = r.read_u32()?;
        let initial_window = r.read_u32()?;
        let max_packet = r.read_u32()?;

        let channel_type = match type_name.as_str() {
            "session" => ChannelType::Session,
            "direct-tcpip" => ChannelType::DirectTcpip {
                host: r.read_utf8()?,
                port: r.read_u32()?,
                originator_address: r.read_utf8()?,
                originator_port: r.read_u32()?,
            },
            "forwarded-tcpip" => ChannelType::ForwardedTcpip {
                connected_address: r.read_utf8()?,
                connected_port: r.read_u32()?,
                originator_address: r.read_utf8()?,
                originator_port: r.read_u32()?,
            },
            "x11" => ChannelType::X11 {
                originator_address: r.read_utf8()?,
                originator_port: r.read_u32()?,
            },
            _ => ChannelType::Other {
                name: type_name.clone(),
                data: r.rest().to_vec(),
            },
        };

        Ok(Self {
            channel_type,
            sender_channel,
            initial_window,
            max_packet,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// The opener's channel id.
    pub recipient_channel: u32,
    /// Our channel id.
    pub sender_channel: u32,
    /// Bytes we will accept before a window adjust.
    pub initial_window: u32,
    /// Largest packet we will accept.
    pub max_packet: u32,
}

impl ChannelOpenConfirmation {
    /// Serializes the full message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(msg::CHANNEL_OPEN_CONFIRMATION);
        w.put_u32(self.recipient_channel);
        w.put_u32(self.sender_channel);
        w.put_u32(self.initial_window);
        w.put_u32(self.max_packet);
        w.finish()
    }

    /// Parses a CHANNEL_OPEN_CONFIRMATION payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != msg::CHANNEL_OPEN_CONFIRMATION {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_CHANNEL_OPEN_CONFIRMATION, got {}",
                kind
            )));
        }
        Ok(Self {
            recipient_channel: r.read_u32()?,
            sender_channel: r.read_u32()?,
            initial_window: r.read_u32()?,
            max_packet: r.read_u32()?,
        })
    }
}

/// CHANNEL_OPEN_FAILURE reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// SSH_OPEN_ADMINISTRATIVELY_PROHIBITED
    AdministrativelyProhibited = 1,
    /// SSH_OPEN_CONNECT_FAILED
    ConnectFailed = 2,
    /// SSH_OPEN_UNKNOWN_CHANNEL_TYPE
    UnknownChannelType = 3,
    /// SSH_OPEN_RESOURCE_SHORTAGE
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts from the wire code.
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::AdministrativelyProhibited,
            2 => Self::ConnectFailed,
            3 => Self::UnknownChannelType,
            4 => Self::ResourceShortage,
            _ => return None,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// The opener's channel id.
    pub recipient_channel: u32,
    /// Reason code.
    pub reason: u32,
    /// Description text.
    pub description: String,
    /// Language tag.
    pub language: String,
}

impl ChannelOpenFailure {
    /// Creates a failure for a known reason.
    pub fn new(
        recipient_channel: u32,
        reason: ChannelOpenFailureReason,
        description: &str,
    ) -> Self {
        Self {
            recipient_channel,
            reason: reason as u32,
            description: description.to_string(),
            language: String::new(),
        }
    }

    /// Serializes the full message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(msg::CHANNEL_OPEN_FAILURE);
        w.put_u32(self.recipient_channel);
        w.put_u32(self.reason);
        w.put_string(self.description.as_bytes());
        w.put_string(self.language.as_bytes());
        w.finish()
    }

    /// Parses a CHANNEL_OPEN_FAILURE payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != msg::CHANNEL_OPEN_FAILURE {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_CHANNEL_OPEN_FAILURE, got {}",
                kind
            )));
        }
        Ok(Self {
            recipient_channel: r.read_u32()?,
            reason: r.read_u32()?,
            description: String::from_utf8_lossy(r.read_string()?).into_owned(),
            language: String::from_utf8_lossy(r.read_string()?).into_owned(),
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    /// Receiver's channel id.
    pub recipient_channel: u32,
    /// Bytes to add to the window.
    pub additional_bytes: u32,
}

impl ChannelWindowAdjust {
    /// Serializes the full message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(msg::CHANNEL_WINDOW_ADJUST);
        w.put_u32(self.recipient_channel);
        w.put_u32(self.additional_bytes);
        w.finish()
    }

    /// Parses a CHANNEL_WINDOW_ADJUST payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != msg::CHANNEL_WINDOW_ADJUST {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_CHANNEL_WINDOW_ADJUST, got {}",
                kind
            )));
        }
        Ok(Self {
            recipient_channel: r.read_u32()?,
            additional_bytes: r.read_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Receiver's channel id.
    pub recipient_channel: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl ChannelData {
    /// Serializes the full message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(msg::CHANNEL_DATA);
        w.put_u32(self.recipient_channel);
        w.put_string(&self.data);
        w.finish()
    }

    /// Parses a CHANNEL_DATA payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != msg::CHANNEL_DATA {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_CHANNEL_DATA, got {}",
                kind
            )));
        }
        Ok(Self {
            recipient_channel: r.read_u32()?,
            data: r.read_string()?.to_vec(),
        })
    }
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    /// Receiver's channel id.
    pub recipient_channel: u32,
    /// Data type code; only stderr (1) is defined by the base protocol.
    pub data_type: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Serializes the full message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(msg::CHANNEL_EXTENDED_DATA);
        w.put_u32(self.recipient_channel);
        w.put_u32(self.data_type);
        w.put_string(&self.data);
        w.finish()
    }

    /// Parses a CHANNEL_EXTENDED_DATA payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != msg::CHANNEL_EXTENDED_DATA {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_CHANNEL_EXTENDED_DATA, got {}",
                kind
            )));
        }
        Ok(Self {
            recipient_channel: r.read_u32()?,
            data_type: r.read_u32()?,
            data: r.read_string()?.to_vec(),
        })
    }
}

/// Builds one of the id-only channel messages (EOF, CLOSE, SUCCESS,
/// FAILURE).
pub fn channel_id_message(kind: u8, recipient_channel: u32) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u8(kind);
    w.put_u32(recipient_channel);
    w.finish()
}

/// Parses one of the id-only channel messages.
pub fn parse_channel_id_message(data: &[u8], expected_kind: u8) -> SkiffResult<u32> {
    let mut r = Reader::new(data);
    let kind = r.read_u8()?;
    if kind != expected_kind {
        return Err(SkiffError::Protocol(format!(
            "expected channel message {}, got {}",
            expected_kind, kind
        )));
    }
    r.read_u32()
}

/// Channel request types (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// Request a pseudo-terminal.
    PtyReq {
        /// TERM environment value.
        term: String,
        /// Width in columns.
        cols: u32,
        /// Height in rows.
        rows: u32,
        /// Width in pixels.
        width_px: u32,
        /// Height in pixels.
        height_px: u32,
        /// Encoded terminal modes.
        modes: Vec<u8>,
    },
    /// Set an environment variable.
    Env {
        /// Variable name.
        name: String,
        /// Variable value.
        value: String,
    },
    /// Start the user's shell.
    Shell,
    /// Execute a command.
    Exec {
        /// Command line.
        command: String,
    },
    /// Start a subsystem (e.g. sftp).
    Subsystem {
        /// Subsystem name.
        name: String,
    },
    /// Terminal dimensions changed.
    WindowChange {
        /// Width in columns.
        cols: u32,
        /// Height in rows.
        rows: u32,
        /// Width in pixels.
        width_px: u32,
        /// Height in pixels.
        height_px: u32,
    },
    /// Deliver a signal to the remote process.
    Signal {
        /// Signal name without the SIG prefix.
        name: String,
    },
    /// Remote process exited with a status.
    ExitStatus {
        /// Exit status.
        status: u32,
    },
    /// Remote process was killed by a signal.
    ExitSignal {
        /// Signal name without the SIG prefix.
        name: String,
        /// Whether a core was dumped.
        core_dumped: bool,
        /// Error message.
        message: String,
        /// Language tag.
        language: String,
    },
    /// A request type this implementation does not know.
    Other {
        /// Wire name.
        name: String,
        /// Raw type-specific data.
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the wire name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::WindowChange { .. } => "window-change",
            ChannelRequestType::Signal { .. } => "signal",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST (RFC 4254 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Receiver's channel id.
    pub recipient_channel: u32,
    /// Whether a SUCCESS/FAILURE reply is expected.
    pub want_reply: bool,
    /// The request.
    pub request: ChannelRequestType,
}

impl ChannelRequest {
    /// Serializes the full message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(msg::CHANNEL_REQUEST);
        w.put_u32(self.recipient_channel);
        w.put_string(self.request.name().as_bytes());
        w.put_bool(self.want_reply);
        match &self.request {
            ChannelRequestType::PtyReq {
                term,
                cols,
                rows,
                width_px,
                height_px,
                modes,
            } => {
                w.put_string(term.as_bytes());
                w.put_u32(*cols);
                w.put_u32(*rows);
                w.put_u32(*width_px);
                w.put_u32(*height_px);
                w.put_string(modes);
            }
            ChannelRequestType::Env { name, value } => {
                w.put_string(name.as_bytes());
                w.put_string(value.as_bytes());
            }
            ChannelRequestType::Shell => {}
            ChannelRequestType::Exec { command } => {
                w.put_string(command.as_bytes());
            }
            ChannelRequestType::Subsystem { name } => {
                w.put_string(name.as_bytes());
            }
            ChannelRequestType::WindowChange {
                cols,
                rows,
                width_px,
                height_px,
            } => {
                w.put_u32(*cols);
                w.put_u32(*rows);
                w.put_u32(*width_px);
                w.put_u32(*height_px);
            }
            ChannelRequestType::Signal { name } => {
                w.put_string(name.as_bytes());
            }
            ChannelRequestType::ExitStatus { status } => {
                w.put_u32(*status);
            }
            ChannelRequestType::ExitSignal {
                name,
                core_dumped,
                message,
                language,
            } => {
                w.put_string(name.as_bytes());
                w.put_bool(*core_dumped);
                w.put_string(message.as_bytes());
                w.put_string(language.as_bytes());
            }
            ChannelRequestType::Other { data, .. } => {
                w.put_raw(data);
            }
        }
        w.finish()
    }

    /// Parses a CHANNEL_REQUEST payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != msg::CHANNEL_REQUEST {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_CHANNEL_REQUEST, got {}",
                kind
            )));
        }
        let recipient_channel = r.read_u32()?;
        let name = r.read_utf8()?;
        let want_reply = r.read_bool()?;

        let request = match name.as_str() {
            "pty-req" => ChannelRequestType::PtyReq {
                term: r.read_utf8()?,
                cols: r.read_u32()?,
                rows: r.read_u32()?,
                width_px: r.read_u32()?,
                height_px: r.read_u32()?,
                modes: r.read_string()?.to_vec(),
            },
            "env" => ChannelRequestType::Env {
                name: r.read_utf8()?,
                value: r.read_utf8()?,
            },
            "shell" => ChannelRequestType::Shell,
            "exec" => ChannelRequestType::Exec {
                command: r.read_utf8()?,
            },
            "subsystem" => ChannelRequestType::Subsystem {
                name: r.read_utf8()?,
            },
            "window-change" => ChannelRequestType::WindowChange {
                cols: r.read_u32()?,
                rows: r.read_u32()?,
                width_px: r.read_u32()?,
                height_px: r.read_u32()?,
            },
            "signal" => ChannelRequestType::Signal {
                name: r.read_utf8()?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                status: r.read_u32()?,
            },
            "exit-signal" => ChannelRequestType::ExitSignal {
                name: r.read_utf8()?,
                core_dumped: r.read_bool()?,
                message: String::from_utf8_lossy(r.read_string()?).into_owned(),
                language: String::from_utf8_lossy(r.read_string()?).into_owned(),
            },
            _ => ChannelRequestType::Other {
                name: name.clone(),
                data: r.rest().to_vec(),
            },
        };

        Ok(Self {
            recipient_channel,
            want_reply,
            request,
        })
    }
}

/// Global request types (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequestType {
    /// Start listening on the remote side.
    TcpipForward {
        /// Address to bind.
        address: String,
        /// Port to bind (0 lets the peer choose).
        port: u32,
    },
    /// Stop a remote listener.
    CancelTcpipForward {
        /// Bound address.
        address: String,
        /// Bound port.
        port: u32,
    },
    /// A request type this implementation does not know.
    Other {
        /// Wire name.
        name: String,
        /// Raw type-specific data.
        data: Vec<u8>,
    },
}

impl GlobalRequestType {
    /// Returns the wire name.
    pub fn name(&self) -> &str {
        match self {
            GlobalRequestType::TcpipForward { .. } => "tcpip-forward",
            GlobalRequestType::CancelTcpipForward { .. } => "cancel-tcpip-forward",
            GlobalRequestType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_GLOBAL_REQUEST (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Whether a reply is expected.
    pub want_reply: bool,
    /// The request.
    pub request: GlobalRequestType,
}

impl GlobalRequest {
    /// Serializes the full message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(msg::GLOBAL_REQUEST);
        w.put_string(self.request.name().as_bytes());
        w.put_bool(self.want_reply);
        match &self.request {
            GlobalRequestType::TcpipForward { address, port }
            | GlobalRequestType::CancelTcpipForward { address, port } => {
                w.put_string(address.as_bytes());
                w.put_u32(*port);
            }
            GlobalRequestType::Other { data, .. } => {
                w.put_raw(data);
            }
        }
        w.finish()
    }

    /// Parses a GLOBAL_REQUEST payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != msg::GLOBAL_REQUEST {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_GLOBAL_REQUEST, got {}",
                kind
            )));
        }
        let name = r.read_utf8()?;
        let want_reply = r.read_bool()?;
        let request = match name.as_str() {
            "tcpip-forward" => GlobalRequestType::TcpipForward {
                address: r.read_utf8()?,
                port: r.read_u32()?,
            },
            "cancel-tcpip-forward" => GlobalRequestType::CancelTcpipForward {
                address: r.read_utf8()?,
                port: r.read_u32()?,
            },
            _ => GlobalRequestType::Other {
                name: name.clone(),
                data: r.rest().to_vec(),
            },
        };
        Ok(Self {
            want_reply,
            request,
        })
    }
}

/// Builds SSH_MSG_REQUEST_SUCCESS with optional response data (e.g. the
/// bound port for a `tcpip-forward` with port 0).
pub fn request_success(data: &[u8]) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u8(msg::REQUEST_SUCCESS);
    w.put_raw(data);
    w.finish()
}

/// Builds SSH_MSG_REQUEST_FAILURE.
pub fn request_failure() -> Vec<u8> {
    vec![msg::REQUEST_FAILURE]
}
