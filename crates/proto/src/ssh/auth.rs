//! User authentication protocol messages (RFC 4252, RFC 4256).
//!
//! Message 60 is context dependent: during a publickey exchange it is
//! USERAUTH_PK_OK, during keyboard-interactive it is USERAUTH_INFO_REQUEST,
//! and after a password request it may be USERAUTH_PASSWD_CHANGEREQ. The
//! session drivers parse it according to the method they just sent.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::auth::{AuthMethod, AuthRequest};
//!
//! let request = AuthRequest::new(
//!     "alice",
//!     "ssh-connection",
//!     AuthMethod::Password {
//!         password: "hunter2".to_string(),
//!         new_password: None,
//!     },
//! );
//! let bytes = request.to_bytes();
//! assert_eq!(bytes[0], 50);
//! ```

use crate::ssh::message::msg;
use crate::ssh::wire::{Reader, Writer};
use skiff_platform::{SkiffError, SkiffResult};
use zeroize::Zeroize;

/// The service requested after authentication.
pub const CONNECTION_SERVICE: &str = "ssh-connection";
/// The authentication service itself.
pub const USERAUTH_SERVICE: &str = "ssh-userauth";

/// Authentication method carried by a USERAUTH_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// The "none" method: probes which methods the server accepts.
    None,
    /// Password authentication; `new_password` is set for a password
    /// change (RFC 4252 Section 8).
    Password {
        /// Current password.
        password: String,
        /// Replacement password for a change request.
        new_password: Option<String>,
    },
    /// Public key authentication. Without a signature this is a probe the
    /// server answers with USERAUTH_PK_OK.
    PublicKey {
        /// Signature algorithm name (e.g. "ssh-ed25519").
        algorithm: String,
        /// Public key blob.
        public_key: Vec<u8>,
        /// Signature over the session-bound request, when present.
        signature: Option<Vec<u8>>,
    },
    /// Keyboard-interactive (RFC 4256).
    KeyboardInteractive {
        /// Language tag (deprecated, normally empty).
        language: String,
        /// Comma-separated submethod hints.
        submethods: String,
    },
    /// Host-based authentication (RFC 4252 Section 9).
    HostBased {
        /// Signature algorithm name.
        algorithm: String,
        /// Client host key blob.
        host_key: Vec<u8>,
        /// Client host name (FQDN).
        hostname: String,
        /// User name on the client host.
        local_user: String,
        /// Signature over the session-bound request.
        signature: Vec<u8>,
    },
    /// A method this implementation does not support (e.g.
    /// `gssapi-with-mic`); servers answer it with USERAUTH_FAILURE.
    Other {
        /// Method name.
        name: String,
        /// Raw method-specific fields.
        data: Vec<u8>,
    },
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password { .. } => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
            AuthMethod::HostBased { .. } => "hostbased",
            AuthMethod::Other { name, .. } => name,
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        if let AuthMethod::Password {
            password,
            new_password,
        } = self
        {
            password.zeroize();
            if let Some(p) = new_password {
                p.zeroize();
            }
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// User name to authenticate as.
    pub user_name: String,
    /// Service to start, normally "ssh-connection".
    pub service_name: String,
    /// The method and its fields.
    pub method: AuthMethod,
}

impl AuthRequest {
    /// Creates a request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Serializes the full message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(msg::USERAUTH_REQUEST);
        w.put_string(self.user_name.as_bytes());
        w.put_string(self.service_name.as_bytes());
        w.put_string(self.method.name().as_bytes());
        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password {
                password,
                new_password,
            } => {
                w.put_bool(new_password.is_some());
                w.put_string(password.as_bytes());
                if let Some(new_password) = new_password {
                    w.put_string(new_password.as_bytes());
                }
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                w.put_bool(signature.is_some());
                w.put_string(algorithm.as_bytes());
                w.put_string(public_key);
                if let Some(signature) = signature {
                    w.put_string(signature);
                }
            }
            AuthMethod::KeyboardInteractive {
                language,
                submethods,
            } => {
                w.put_string(language.as_bytes());
                w.put_string(submethods.as_bytes());
            }
            AuthMethod::HostBased {
                algorithm,
                host_key,
                hostname,
                local_user,
                signature,
            } => {
                w.put_string(algorithm.as_bytes());
                w.put_string(host_key);
                w.put_string(hostname.as_bytes());
                w.put_string(local_user.as_bytes());
                w.put_string(signature);
            }
            AuthMethod::Other { data, .. } => {
                w.put_raw(data);
            }
        }
        w.finish()
    }

    /// Parses a USERAUTH_REQUEST payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != msg::USERAUTH_REQUEST {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_USERAUTH_REQUEST, got {}",
                kind
            )));
        }
        let user_name = r.read_utf8()?;
        let service_name = r.read_utf8()?;
        let method_name = r.read_utf8()?;

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                let change = r.read_bool()?;
                let password = r.read_utf8()?;
                let new_password = if change { Some(r.read_utf8()?) } else { None };
                AuthMethod::Password {
                    password,
                    new_password,
                }
            }
            "publickey" => {
                let signed = r.read_bool()?;
                let algorithm = r.read_utf8()?;
                let public_key = r.read_string()?.to_vec();
                let signature = if signed {
                    Some(r.read_string()?.to_vec())
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            "keyboard-interactive" => AuthMethod::KeyboardInteractive {
                language: r.read_utf8()?,
                submethods: r.read_utf8()?,
            },
            "hostbased" => AuthMethod::HostBased {
                algorithm: r.read_utf8()?,
                host_key: r.read_string()?.to_vec(),
                hostname: r.read_utf8()?,
                local_user: r.read_utf8()?,
                signature: r.read_string()?.to_vec(),
            },
            _ => AuthMethod::Other {
                name: method_name.clone(),
                data: r.rest().to_vec(),
            },
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    /// Methods that can productively continue.
    pub methods_can_continue: Vec<String>,
    /// True when the request succeeded but more methods are required.
    pub partial_success: bool,
}

impl AuthFailure {
    /// Creates a failure message.
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Serializes the full message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(msg::USERAUTH_FAILURE);
        w.put_name_list(&self.methods_can_continue);
        w.put_bool(self.partial_success);
        w.finish()
    }

    /// Parses a USERAUTH_FAILURE payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != msg::USERAUTH_FAILURE {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_USERAUTH_FAILURE, got {}",
                kind
            )));
        }
        Ok(Self {
            methods_can_continue: r.read_name_list()?,
            partial_success: r.read_bool()?,
        })
    }
}

/// Builds the single-byte SSH_MSG_USERAUTH_SUCCESS payload.
pub fn success() -> Vec<u8> {
    vec![msg::USERAUTH_SUCCESS]
}

/// SSH_MSG_USERAUTH_BANNER (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    /// Banner text.
    pub message: String,
    /// Language tag.
    pub language: String,
}

impl AuthBanner {
    /// Serializes the full message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(msg::USERAUTH_BANNER);
        w.put_string(self.message.as_bytes());
        w.put_string(self.language.as_bytes());
        w.finish()
    }

    /// Parses a USERAUTH_BANNER payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != msg::USERAUTH_BANNER {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_USERAUTH_BANNER, got {}",
                kind
            )));
        }
        Ok(Self {
            message: String::from_utf8_lossy(r.read_string()?).into_owned(),
            language: String::from_utf8_lossy(r.read_string()?).into_owned(),
        })
    }
}

/// SSH_MSG_USERAUTH_PK_OK (message 60 in a publickey context).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    /// Echoed algorithm name.
    pub algorithm: String,
    /// Echoed public key blob.
    pub public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Serializes the full message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(msg::USERAUTH_60);
        w.put_string(self.algorithm.as_bytes());
        w.put_string(&self.public_key);
        w.finish()
    }

    /// Parses a USERAUTH_PK_OK payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != msg::USERAUTH_60 {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_USERAUTH_PK_OK, got {}",
                kind
            )));
        }
        Ok(Self {
            algorithm: r.read_utf8()?,
            public_key: r.read_string()?.to_vec(),
        })
    }
}

/// One prompt of a keyboard-interactive round (RFC 4256 Section 3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoPrompt {
    /// Prompt text.
    pub prompt: String,
    /// Whether the response may be echoed.
    pub echo: bool,
}

/// SSH_MSG_USERAUTH_INFO_REQUEST (message 60 in a keyboard-interactive
/// context).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    /// Round title.
    pub name: String,
    /// Instructions to display.
    pub instruction: String,
    /// Language tag.
    pub language: String,
    /// Prompts for this round; may be empty.
    pub prompts: Vec<InfoPrompt>,
}

impl InfoRequest {
    /// Serializes the full message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(msg::USERAUTH_60);
        w.put_string(self.name.as_bytes());
        w.put_string(self.instruction.as_bytes());
        w.put_string(self.language.as_bytes());
        w.put_u32(self.prompts.len() as u32);
        for prompt in &self.prompts {
            w.put_string(prompt.prompt.as_bytes());
            w.put_bool(prompt.echo);
        }
        w.finish()
    }

    /// Parses a USERAUTH_INFO_REQUEST payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != msg::USERAUTH_60 {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_USERAUTH_INFO_REQUEST, got {}",
                kind
            )));
        }
        let name = r.read_utf8()?;
        let instruction = r.read_utf8()?;
        let language = r.read_utf8()?;
        let count = r.read_u32()? as usize;
        if count > 64 {
            return Err(SkiffError::Protocol(format!(
                "unreasonable prompt count {}",
                count
            )));
        }
        let mut prompts = Vec::with_capacity(count);
        for _ in 0..count {
            prompts.push(InfoPrompt {
                prompt: r.read_utf8()?,
                echo: r.read_bool()?,
            });
        }
        Ok(Self {
            name,
            instruction,
            language,
            prompts,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE (RFC 4256 Section 3.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoResponse {
    /// One response per prompt, in order.
    pub responses: Vec<String>,
}

impl InfoResponse {
    /// Serializes the full message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(msg::USERAUTH_INFO_RESPONSE);
        w.put_u32(self.responses.len() as u32);
        for response in &self.responses {
            w.put_string(response.as_bytes());
        }
        w.finish()
    }

    /// Parses a USERAUTH_INFO_RESPONSE payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != msg::USERAUTH_INFO_RESPONSE {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_USERAUTH_INFO_RESPONSE, got {}",
                kind
            )));
        }
        let count = r.read_u32()? as usize;
        if count > 64 {
            return Err(SkiffError::Protocol(format!(
                "unreasonable response count {}",
                count
            )));
        }
        let mut responses = Vec::with_capacity(count);
        for _ in 0..count {
            responses.push(r.read_utf8()?);
        }
        Ok(Self { responses })
    }
}

impl Drop for InfoResponse {
    fn drop(&mut self) {
        for response in &mut self.responses {
            response.zeroize();
        }
    }
}

/// SSH_MSG_USERAUTH_PASSWD_CHANGEREQ (message 60 after a password
/// request, RFC 4252 Section 8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdChangeReq {
    /// Prompt to display.
    pub prompt: String,
    /// Language tag.
    pub language: String,
}

impl PasswdChangeReq {
    /// Serializes the full message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(msg::USERAUTH_60);
        w.put_string(self.prompt.as_bytes());
        w.put_string(self.language.as_bytes());
        w.finish()
    }

    /// Parses a USERAUTH_PASSWD_CHANGEREQ payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = Reader::new(data);
        let kind = r.read_u8()?;
        if kind != msg::USERAUTH_60 {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_USERAUTH_PASSWD_CHANGEREQ, got {}",
                kind
            )));
        }
        Ok(Self {
            prompt: r.read_utf8()?,
            language: String::from_utf8_lossy(r.read_string()?).into_owned(),
        })
    }
}

/// Builds the data a publickey signature covers (RFC 4252 Section 7):
/// the session identifier followed by the request up to the key blob.
pub fn publickey_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key: &[u8],
) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_string(session_id);
    w.put_u8(msg::USERAUTH_REQUEST);
    w.put_string(user_name.as_bytes());
    w.put_string(service_name.as_bytes());
    w.put_string(b"publickey");
    w.put_bool(true);
    w.put_string(algorithm.as_bytes());
    w.put_string(public_key);
    w.finish()
}

/// Builds the data a hostbased signature covers (RFC 4252 Section 9).
pub fn hostbased_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    host_key: &[u8],
    hostname: &str,
    local_user: &str,
) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_string(session_id);
    w.put_u8(msg::USERAUTH_REQUEST);
    w.put_string(user_name.as_bytes());
    w.put_string(service_name.as_bytes());
    w.put_string(b"hostbased");
    w.put_string(algorithm.as_bytes());
    w.put_string(host_key);
    w.put_string(hostname.as_bytes());
    w.put_string(local_user.as_bytes());
    w.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_request_round_trip() {
        let request = AuthRequest::new(
            "alice",
            CONNECTION_SERVICE,
            AuthMethod::Password {
                password: "hunter2".to_string(),
                new_password: None,
            },
        );
        let bytes = request.to_bytes();
        assert_eq!(bytes[0], msg::USERAUTH_REQUEST);

        let parsed = AuthRequest::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.user_name, "alice");
        assert_eq!(parsed.service_name, "ssh-connection");
        assert_eq!(parsed.method.name(), "password");
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_password_change_round_trip() {
        let request = AuthRequest::new(
            "alice",
            CONNECTION_SERVICE,
            AuthMethod::Password {
                password: "old".to_string(),
                new_password: Some("new".to_string()),
            },
        );
        let parsed = AuthRequest::from_bytes(&request.to_bytes()).unwrap();
        match &parsed.method {
            AuthMethod::Password { new_password, .. } => {
                assert_eq!(new_password.as_deref(), Some("new"));
            }
            other => panic!("unexpected method {:?}", other),
        }
    }

    #[test]
    fn test_publickey_probe_round_trip() {
        let request = AuthRequest::new(
            "bob",
            CONNECTION_SERVICE,
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".to_string(),
                public_key: vec![1, 2, 3],
                signature: None,
            },
        );
        let parsed = AuthRequest::from_bytes(&request.to_bytes()).unwrap();
        match &parsed.method {
            AuthMethod::PublicKey { signature, .. } => assert!(signature.is_none()),
            other => panic!("unexpected method {:?}", other),
        }
    }

    #[test]
    fn test_hostbased_round_trip() {
        let request = AuthRequest::new(
            "op",
            CONNECTION_SERVICE,
            AuthMethod::HostBased {
                algorithm: "ssh-ed25519".to_string(),
                host_key: vec![9; 8],
                hostname: "client.example.org".to_string(),
                local_user: "operator".to_string(),
                signature: vec![7; 16],
            },
        );
        let parsed = AuthRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_failure_round_trip() {
        let failure = AuthFailure::new(
            vec!["publickey".to_string(), "password".to_string()],
            true,
        );
        let parsed = AuthFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert_eq!(parsed.methods_can_continue, failure.methods_can_continue);
        assert!(parsed.partial_success);
    }

    #[test]
    fn test_info_request_round_trip() {
        let request = InfoRequest {
            name: "Second factor".to_string(),
            instruction: "Enter the code from your token".to_string(),
            language: String::new(),
            prompts: vec![
                InfoPrompt {
                    prompt: "Code: ".to_string(),
                    echo: false,
                },
                InfoPrompt {
                    prompt: "Serial: ".to_string(),
                    echo: true,
                },
            ],
        };
        let parsed = InfoRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_info_response_round_trip() {
        let response = InfoResponse {
            responses: vec!["123456".to_string()],
        };
        let parsed = InfoResponse::from_bytes(&response.to_bytes()).unwrap();
        assert_eq!(parsed.responses, vec!["123456".to_string()]);
    }

    #[test]
    fn test_pk_ok_round_trip() {
        let pk_ok = AuthPkOk {
            algorithm: "ssh-ed25519".to_string(),
            public_key: vec![4; 51],
        };
        let parsed = AuthPkOk::from_bytes(&pk_ok.to_bytes()).unwrap();
        assert_eq!(parsed, pk_ok);
    }

    #[test]
    fn test_banner_round_trip() {
        let banner = AuthBanner {
            message: "Authorized use only".to_string(),
            language: String::new(),
        };
        let parsed = AuthBanner::from_bytes(&banner.to_bytes()).unwrap();
        assert_eq!(parsed, banner);
    }

    #[test]
    fn test_signature_data_binds_session() {
        let a = publickey_signature_data(&[1; 32], "u", "ssh-connection", "ssh-ed25519", b"key");
        let b = publickey_signature_data(&[2; 32], "u", "ssh-connection", "ssh-ed25519", b"key");
        assert_ne!(a, b);
        // The request prefix after the session id is identical.
        assert_eq!(a[36..], b[36..]);
    }

    #[test]
    fn test_success_payload() {
        assert_eq!(success(), vec![52]);
    }

    #[test]
    fn test_unknown_method_carried_through() {
        let mut w = Writer::new();
        w.put_u8(msg::USERAUTH_REQUEST);
        w.put_string(b"user");
        w.put_string(b"ssh-connection");
        w.put_string(b"gssapi-with-mic");
        w.put_u32(0);
        let parsed = AuthRequest::from_bytes(&w.finish()).unwrap();
        assert_eq!(parsed.method.name(), "gssapi-with-mic");
        match &parsed.method {
            AuthMethod::Other { data, .. } => assert_eq!(data.len(), 4),
            other => panic!("unexpected method {:?}", other),
        }
    }
}
