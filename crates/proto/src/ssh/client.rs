//! SSH client session driver.
//!
//! [`SshClient`] drives a full client session over any injected
//! `AsyncRead + AsyncWrite` stream: identification, key exchange, the
//! `ssh-userauth` service, channels, and re-keying. Socket management
//! belongs to the caller; tests run entire sessions over in-memory duplex
//! pipes.
//!
//! # Example
//!
//! ```rust,no_run
//! use skiff_proto::ssh::client::{ClientConfig, SshClient};
//! use skiff_proto::ssh::hostkey::AcceptAllVerifier;
//! use std::sync::Arc;
//!
//! # async fn example() -> skiff_platform::SkiffResult<()> {
//! let stream = tokio::net::TcpStream::connect("203.0.113.5:22").await?;
//! let mut config = ClientConfig::default();
//! config.host_key_verifier = Arc::new(AcceptAllVerifier);
//!
//! let mut client = SshClient::connect(stream, "203.0.113.5", config).await?;
//! client.authenticate_password("alice", "hunter2").await?;
//! let output = client.run_command("uname -a").await?;
//! println!("{}", String::from_utf8_lossy(&output.stdout));
//! # Ok(())
//! # }
//! ```

use crate::ssh::auth::{
    self, AuthBanner, AuthFailure, AuthMethod, AuthPkOk, AuthRequest, InfoRequest, InfoResponse,
    CONNECTION_SERVICE, USERAUTH_SERVICE,
};
use crate::ssh::channel::{ChannelMux, MuxConfig};
use crate::ssh::connection::{
    self, ChannelData, ChannelExtendedData, ChannelOpen, ChannelOpenConfirmation,
    ChannelOpenFailure, ChannelRequest, ChannelRequestType, ChannelType, ChannelWindowAdjust,
    GlobalRequest, GlobalRequestType,
};
use crate::ssh::connection_mgr::{Event, SshConnection};
use crate::ssh::hostkey::{AcceptAllVerifier, HostKey, HostKeyVerifier};
use crate::ssh::message::{msg, DisconnectReason};
use crate::ssh::transport::{Role, SessionConfig, SessionPhase};
use crate::ssh::wire::Reader;
use skiff_platform::{OsRandom, SkiffError, SkiffResult, SystemClock};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Answers keyboard-interactive prompt rounds (the user credential
/// collaborator).
#[async_trait::async_trait]
pub trait PromptHandler: Send + Sync {
    /// Returns one answer per prompt, in order.
    async fn answer(&self, name: &str, instruction: &str, prompts: &[auth::InfoPrompt])
        -> SkiffResult<Vec<String>>;
}

/// Client configuration.
pub struct ClientConfig {
    /// Core session options.
    pub session: SessionConfig,
    /// Host key policy. The default accepts everything and is only
    /// suitable for tests.
    pub host_key_verifier: Arc<dyn HostKeyVerifier>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            host_key_verifier: Arc::new(AcceptAllVerifier),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("session", &self.session)
            .finish()
    }
}

/// An event surfaced from the connection layer.
#[derive(Debug)]
pub enum ChannelEvent {
    /// Channel open confirmed by the peer.
    Confirmed {
        /// Our channel id.
        id: u32,
    },
    /// Channel open rejected by the peer.
    OpenFailed {
        /// Our channel id (already freed).
        id: u32,
        /// Reason code.
        reason: u32,
        /// Description.
        description: String,
    },
    /// A want-reply request succeeded.
    RequestSuccess {
        /// Our channel id.
        id: u32,
        /// The request name that was resolved.
        request: String,
    },
    /// A want-reply request failed.
    RequestFailure {
        /// Our channel id.
        id: u32,
        /// The request name that was resolved.
        request: String,
    },
    /// Data arrived.
    Data {
        /// Our channel id.
        id: u32,
        /// Payload.
        data: Vec<u8>,
    },
    /// Extended (stderr) data arrived.
    ExtendedData {
        /// Our channel id.
        id: u32,
        /// Data type code.
        data_type: u32,
        /// Payload.
        data: Vec<u8>,
    },
    /// The peer sent EOF.
    Eof {
        /// Our channel id.
        id: u32,
    },
    /// The channel is fully closed and its id freed.
    Closed {
        /// The freed channel id.
        id: u32,
    },
    /// The remote process exited.
    ExitStatus {
        /// Our channel id.
        id: u32,
        /// Exit status.
        status: u32,
    },
    /// A global request we answered (reported for observability).
    GlobalRequestAnswered {
        /// Request name.
        request: String,
    },
}

/// Output of [`SshClient::run_command`].
#[derive(Debug, Default)]
pub struct CommandOutput {
    /// Collected stdout bytes.
    pub stdout: Vec<u8>,
    /// Collected stderr bytes.
    pub stderr: Vec<u8>,
    /// Exit status, when the server reported one.
    pub exit_status: Option<u32>,
}

/// A client session.
pub struct SshClient<S> {
    conn: SshConnection<S>,
    host: String,
    verifier: Arc<dyn HostKeyVerifier>,
    mux: ChannelMux,
    authenticated: bool,
    username: Option<String>,
    banners: Vec<String>,
    pending: VecDeque<ChannelEvent>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> SshClient<S> {
    /// Establishes the transport: identification exchange, key exchange,
    /// and the `ssh-userauth` service request.
    pub async fn connect(stream: S, host: &str, config: ClientConfig) -> SkiffResult<Self> {
        let mux = ChannelMux::new(MuxConfig {
            initial_window: config.session.channel_initial_window,
            max_packet: config.session.channel_max_packet,
            max_channels: config.session.max_channels,
        });
        let mut conn = SshConnection::new(
            stream,
            Role::Client,
            config.session,
            Box::new(OsRandom),
            Box::new(SystemClock),
        );

        conn.exchange_identification().await?;
        if let Err(err) = conn
            .run_kex_client(host, config.host_key_verifier.as_ref(), None)
            .await
        {
            return Err(conn.fail(err).await);
        }

        // Request the authentication service.
        conn.send_payload(crate::ssh::message::service_request(USERAUTH_SERVICE))
            .await?;
        loop {
            match conn.next_event().await? {
                Event::Service(payload) => {
                    let service = crate::ssh::message::parse_service(
                        &payload,
                        msg::SERVICE_ACCEPT,
                    )?;
                    if service != USERAUTH_SERVICE {
                        return Err(SkiffError::Protocol(format!(
                            "server accepted unexpected service {:?}",
                            service
                        )));
                    }
                    break;
                }
                Event::Kex(payload) => {
                    // A server may re-key immediately; serve it.
                    conn.run_kex_client(host, config.host_key_verifier.as_ref(), Some(payload))
                        .await?;
                }
                other => {
                    return Err(SkiffError::Protocol(format!(
                        "expected SERVICE_ACCEPT, got {:?}",
                        other
                    )))
                }
            }
        }

        Ok(Self {
            conn,
            host: host.to_string(),
            verifier: config.host_key_verifier,
            mux,
            authenticated: false,
            username: None,
            banners: Vec::new(),
            pending: VecDeque::new(),
        })
    }

    /// The peer's identification line.
    pub fn server_version(&self) -> String {
        self.conn.peer_version()
    }

    /// True once authentication succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// The authenticated user name.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Banner lines received during authentication.
    pub fn auth_banners(&self) -> &[String] {
        &self.banners
    }

    // --- authentication --------------------------------------------------

    async fn finish_auth_success(&mut self, user: &str) -> SkiffResult<()> {
        self.authenticated = true;
        self.username = Some(user.to_string());
        self.conn.activate_delayed_compression();
        self.conn.state_mut().transition(SessionPhase::Open)?;
        debug!(user, "authentication succeeded");
        Ok(())
    }

    /// One authentication exchange: sends the request, returns the
    /// terminal auth reply payload (success handled internally).
    async fn auth_round(&mut self, request: AuthRequest) -> SkiffResult<Vec<u8>> {
        self.conn.send_payload(request.to_bytes()).await?;
        loop {
            match self.conn.next_event().await? {
                Event::Auth(payload) => match payload.first() {
                    Some(&msg::USERAUTH_BANNER) => {
                        let banner = AuthBanner::from_bytes(&payload)?;
                        self.banners.push(banner.message);
                    }
                    _ => return Ok(payload),
                },
                Event::Kex(payload) => {
                    let verifier = self.verifier.clone();
                    let host = self.host.clone();
                    self.conn
                        .run_kex_client(&host, verifier.as_ref(), Some(payload))
                        .await?;
                }
                other => {
                    return Err(SkiffError::Protocol(format!(
                        "unexpected traffic during authentication: {:?}",
                        other
                    )))
                }
            }
        }
    }

    /// Tries the "none" method. Returns the methods the server suggests
    /// when it fails (the common case).
    pub async fn authenticate_none(&mut self, user: &str) -> SkiffResult<Result<(), Vec<String>>> {
        let reply = self
            .auth_round(AuthRequest::new(user, CONNECTION_SERVICE, AuthMethod::None))
            .await?;
        match reply.first() {
            Some(&msg::USERAUTH_SUCCESS) => {
                self.finish_auth_success(user).await?;
                Ok(Ok(()))
            }
            Some(&msg::USERAUTH_FAILURE) => {
                let failure = AuthFailure::from_bytes(&reply)?;
                Ok(Err(failure.methods_can_continue))
            }
            other => Err(SkiffError::Protocol(format!(
                "unexpected auth reply {:?}",
                other
            ))),
        }
    }

    /// Password authentication.
    pub async fn authenticate_password(&mut self, user: &str, password: &str) -> SkiffResult<()> {
        let reply = self
            .auth_round(AuthRequest::new(
                user,
                CONNECTION_SERVICE,
                AuthMethod::Password {
                    password: password.to_string(),
                    new_password: None,
                },
            ))
            .await?;
        match reply.first() {
            Some(&msg::USERAUTH_SUCCESS) => self.finish_auth_success(user).await,
            Some(&msg::USERAUTH_FAILURE) => {
                let failure = AuthFailure::from_bytes(&reply)?;
                Err(SkiffError::Security(format!(
                    "password rejected; methods that can continue: {}",
                    failure.methods_can_continue.join(",")
                )))
            }
            Some(&msg::USERAUTH_60) => Err(SkiffError::Security(
                "server requires a password change".to_string(),
            )),
            other => Err(SkiffError::Protocol(format!(
                "unexpected auth reply {:?}",
                other
            ))),
        }
    }

    /// Public key authentication: probe first, then sign.
    pub async fn authenticate_publickey(
        &mut self,
        user: &str,
        key: &dyn HostKey,
    ) -> SkiffResult<()> {
        let algorithm = key
            .algorithms()
            .first()
            .copied()
            .ok_or_else(|| SkiffError::Config("key offers no algorithms".to_string()))?;
        let blob = key.public_key_blob();

        // Probe: no signature yet.
        let reply = self
            .auth_round(AuthRequest::new(
                user,
                CONNECTION_SERVICE,
                AuthMethod::PublicKey {
                    algorithm: algorithm.name().to_string(),
                    public_key: blob.clone(),
                    signature: None,
                },
            ))
            .await?;
        match reply.first() {
            Some(&msg::USERAUTH_60) => {
                let pk_ok = AuthPkOk::from_bytes(&reply)?;
                if pk_ok.public_key != blob {
                    return Err(SkiffError::Protocol(
                        "PK_OK echoed a different key".to_string(),
                    ));
                }
            }
            Some(&msg::USERAUTH_SUCCESS) => {
                // Permitted by RFC 4252, though unusual for a probe.
                return self.finish_auth_success(user).await;
            }
            Some(&msg::USERAUTH_FAILURE) => {
                return Err(SkiffError::Security(
                    "public key not acceptable".to_string(),
                ))
            }
            other => {
                return Err(SkiffError::Protocol(format!(
                    "unexpected probe reply {:?}",
                    other
                )))
            }
        }

        // Signature over session_id || request prefix.
        let session_id = self
            .conn
            .state()
            .session_id()
            .ok_or_else(|| SkiffError::Protocol("no session id yet".to_string()))?
            .to_vec();
        let data = auth::publickey_signature_data(
            &session_id,
            user,
            CONNECTION_SERVICE,
            algorithm.name(),
            &blob,
        );
        let signature = key.sign(algorithm, &data)?;

        let reply = self
            .auth_round(AuthRequest::new(
                user,
                CONNECTION_SERVICE,
                AuthMethod::PublicKey {
                    algorithm: algorithm.name().to_string(),
                    public_key: blob,
                    signature: Some(signature),
                },
            ))
            .await?;
        match reply.first() {
            Some(&msg::USERAUTH_SUCCESS) => self.finish_auth_success(user).await,
            Some(&msg::USERAUTH_FAILURE) => Err(SkiffError::Security(
                "public key signature rejected".to_string(),
            )),
            other => Err(SkiffError::Protocol(format!(
                "unexpected auth reply {:?}",
                other
            ))),
        }
    }

    /// Keyboard-interactive authentication.
    pub async fn authenticate_keyboard_interactive(
        &mut self,
        user: &str,
        handler: &dyn PromptHandler,
    ) -> SkiffResult<()> {
        let mut reply = self
            .auth_round(AuthRequest::new(
                user,
                CONNECTION_SERVICE,
                AuthMethod::KeyboardInteractive {
                    language: String::new(),
                    submethods: String::new(),
                },
            ))
            .await?;

        loop {
            match reply.first() {
                Some(&msg::USERAUTH_SUCCESS) => return self.finish_auth_success(user).await,
                Some(&msg::USERAUTH_FAILURE) => {
                    return Err(SkiffError::Security(
                        "keyboard-interactive rejected".to_string(),
                    ))
                }
                Some(&msg::USERAUTH_60) => {
                    let request = InfoRequest::from_bytes(&reply)?;
                    let responses = handler
                        .answer(&request.name, &request.instruction, &request.prompts)
                        .await?;
                    if responses.len() != request.prompts.len() {
                        return Err(SkiffError::Config(format!(
                            "handler returned {} answers for {} prompts",
                            responses.len(),
                            request.prompts.len()
                        )));
                    }
                    let response = InfoResponse { responses };
                    self.conn.send_payload(response.to_bytes()).await?;
                    reply = loop {
                        match self.conn.next_event().await? {
                            Event::Auth(payload) => match payload.first() {
                                Some(&msg::USERAUTH_BANNER) => {
                                    let banner = AuthBanner::from_bytes(&payload)?;
                                    self.banners.push(banner.message);
                                }
                                _ => break payload,
                            },
                            other => {
                                return Err(SkiffError::Protocol(format!(
                                    "unexpected traffic during authentication: {:?}",
                                    other
                                )))
                            }
                        }
                    };
                }
                other => {
                    return Err(SkiffError::Protocol(format!(
                        "unexpected auth reply {:?}",
                        other
                    )))
                }
            }
        }
    }

    // --- connection layer ------------------------------------------------

    fn require_open(&self) -> SkiffResult<()> {
        if !self.authenticated {
            return Err(SkiffError::Protocol(
                "connection layer requires authentication".to_string(),
            ));
        }
        Ok(())
    }

    /// Processes one inbound connection-layer payload into zero or one
    /// [`ChannelEvent`].
    async fn handle_connection_payload(
        &mut self,
        payload: Vec<u8>,
    ) -> SkiffResult<Option<ChannelEvent>> {
        let number = payload[0];
        match number {
            msg::CHANNEL_OPEN_CONFIRMATION => {
                let confirm = ChannelOpenConfirmation::from_bytes(&payload)?;
                let channel = self.mux.get_mut(confirm.recipient_channel)?;
                channel.confirm(
                    confirm.sender_channel,
                    confirm.initial_window,
                    confirm.max_packet,
                );
                Ok(Some(ChannelEvent::Confirmed {
                    id: confirm.recipient_channel,
                }))
            }
            msg::CHANNEL_OPEN_FAILURE => {
                let failure = ChannelOpenFailure::from_bytes(&payload)?;
                self.mux.remove(failure.recipient_channel);
                Ok(Some(ChannelEvent::OpenFailed {
                    id: failure.recipient_channel,
                    reason: failure.reason,
                    description: failure.description,
                }))
            }
            msg::CHANNEL_WINDOW_ADJUST => {
                let adjust = ChannelWindowAdjust::from_bytes(&payload)?;
                self.mux
                    .get_mut(adjust.recipient_channel)?
                    .grow_remote_window(adjust.additional_bytes);
                Ok(None)
            }
            msg::CHANNEL_DATA => {
                let data = ChannelData::from_bytes(&payload)?;
                let id = data.recipient_channel;
                let channel = self.mux.get_mut(id)?;
                channel.consume_local_window(data.data.len())?;
                if let Some(grant) = channel.replenish_local_window() {
                    let adjust = ChannelWindowAdjust {
                        recipient_channel: channel.remote_id,
                        additional_bytes: grant,
                    };
                    self.conn.send_payload(adjust.to_bytes()).await?;
                }
                Ok(Some(ChannelEvent::Data { id, data: data.data }))
            }
            msg::CHANNEL_EXTENDED_DATA => {
                let data = ChannelExtendedData::from_bytes(&payload)?;
                let id = data.recipient_channel;
                let channel = self.mux.get_mut(id)?;
                channel.consume_local_window(data.data.len())?;
                if let Some(grant) = channel.replenish_local_window() {
                    let adjust = ChannelWindowAdjust {
                        recipient_channel: channel.remote_id,
                        additional_bytes: grant,
                    };
                    self.conn.send_payload(adjust.to_bytes()).await?;
                }
                Ok(Some(ChannelEvent::ExtendedData {
                    id,
                    data_type: data.data_type,
                    data: data.data,
                }))
            }
            msg::CHANNEL_EOF => {
                let id = connection::parse_channel_id_message(&payload, msg::CHANNEL_EOF)?;
                self.mux.get_mut(id)?.mark_eof_received();
                Ok(Some(ChannelEvent::Eof { id }))
            }
            msg::CHANNEL_CLOSE => {
                let id = connection::parse_channel_id_message(&payload, msg::CHANNEL_CLOSE)?;
                let channel = self.mux.get_mut(id)?;
                channel.mark_close_received();
                if !channel.close_sent() {
                    let remote_id = channel.remote_id;
                    self.conn
                        .send_payload(connection::channel_id_message(
                            msg::CHANNEL_CLOSE,
                            remote_id,
                        ))
                        .await?;
                    self.mux.get_mut(id)?.mark_close_sent();
                }
                self.mux.remove_if_closed(id);
                Ok(Some(ChannelEvent::Closed { id }))
            }
            msg::CHANNEL_SUCCESS => {
                let id = connection::parse_channel_id_message(&payload, msg::CHANNEL_SUCCESS)?;
                let request = self.mux.get_mut(id)?.pop_outstanding_request()?;
                Ok(Some(ChannelEvent::RequestSuccess { id, request }))
            }
            msg::CHANNEL_FAILURE => {
                let id = connection::parse_channel_id_message(&payload, msg::CHANNEL_FAILURE)?;
                let request = self.mux.get_mut(id)?.pop_outstanding_request()?;
                Ok(Some(ChannelEvent::RequestFailure { id, request }))
            }
            msg::CHANNEL_REQUEST => {
                let request = ChannelRequest::from_bytes(&payload)?;
                let id = request.recipient_channel;
                let remote_id = self.mux.get(id)?.remote_id;
                let event = match &request.request {
                    ChannelRequestType::ExitStatus { status } => Some(ChannelEvent::ExitStatus {
                        id,
                        status: *status,
                    }),
                    ChannelRequestType::ExitSignal { name, .. } => {
                        debug!(signal = %name, channel = id, "remote process killed by signal");
                        None
                    }
                    other => {
                        debug!(request = %other.name(), "unhandled channel request");
                        None
                    }
                };
                if request.want_reply {
                    // Nothing a client services generically: fail.
                    self.conn
                        .send_payload(connection::channel_id_message(
                            msg::CHANNEL_FAILURE,
                            remote_id,
                        ))
                        .await?;
                }
                Ok(event)
            }
            msg::CHANNEL_OPEN => {
                // Server-initiated channels (forwarded-tcpip, x11) need a
                // listener the caller has not registered: refuse.
                let open = ChannelOpen::from_bytes(&payload)?;
                let failure = ChannelOpenFailure::new(
                    open.sender_channel,
                    connection::ChannelOpenFailureReason::AdministrativelyProhibited,
                    "no handler registered",
                );
                self.conn.send_payload(failure.to_bytes()).await?;
                Ok(None)
            }
            msg::GLOBAL_REQUEST => {
                let request = GlobalRequest::from_bytes(&payload)?;
                let name = request.request.name().to_string();
                if request.want_reply {
                    self.conn
                        .send_payload(connection::request_failure())
                        .await?;
                }
                Ok(Some(ChannelEvent::GlobalRequestAnswered { request: name }))
            }
            msg::REQUEST_SUCCESS | msg::REQUEST_FAILURE => {
                // Resolved by the waiter in global_request().
                Ok(None)
            }
            other => {
                warn!(number = other, "unhandled connection message");
                Ok(None)
            }
        }
    }

    /// Reads one payload from the wire and processes it, bypassing the
    /// pending-event buffer. Returns an event if one was produced.
    async fn pump_once(&mut self) -> SkiffResult<Option<ChannelEvent>> {
        if self.conn.needs_rekey() {
            self.rekey().await?;
        }
        match self.conn.next_event().await? {
            Event::Connection(payload) => self.handle_connection_payload(payload).await,
            Event::Kex(payload) => {
                let verifier = self.verifier.clone();
                let host = self.host.clone();
                self.conn
                    .run_kex_client(&host, verifier.as_ref(), Some(payload))
                    .await?;
                Ok(None)
            }
            other => Err(SkiffError::Protocol(format!(
                "unexpected traffic on an open session: {:?}",
                other
            ))),
        }
    }

    /// Returns the next channel event, serving window adjusts, re-keys,
    /// and housekeeping along the way.
    pub async fn next_channel_event(&mut self) -> SkiffResult<ChannelEvent> {
        self.require_open()?;
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            if let Some(event) = self.pump_once().await? {
                return Ok(event);
            }
        }
    }

    /// Pumps events until `wanted` returns Some, buffering everything else
    /// for later [`SshClient::next_channel_event`] calls.
    async fn wait_for<T>(
        &mut self,
        mut wanted: impl FnMut(&ChannelEvent) -> Option<T>,
    ) -> SkiffResult<T> {
        // Already-buffered events first.
        for i in 0..self.pending.len() {
            if let Some(out) = wanted(&self.pending[i]) {
                let _ = self.pending.remove(i);
                return Ok(out);
            }
        }
        loop {
            if let Some(event) = self.pump_once().await? {
                if let Some(out) = wanted(&event) {
                    return Ok(out);
                }
                self.pending.push_back(event);
            }
        }
    }

    /// Opens a `session` channel, returning our channel id.
    pub async fn open_session(&mut self) -> SkiffResult<u32> {
        self.open_channel(ChannelType::Session).await
    }

    /// Opens a `direct-tcpip` channel.
    pub async fn open_direct_tcpip(
        &mut self,
        host: &str,
        port: u32,
        originator: (&str, u32),
    ) -> SkiffResult<u32> {
        self.open_channel(ChannelType::DirectTcpip {
            host: host.to_string(),
            port,
            originator_address: originator.0.to_string(),
            originator_port: originator.1,
        })
        .await
    }

    async fn open_channel(&mut self, channel_type: ChannelType) -> SkiffResult<u32> {
        self.require_open()?;
        let id = self.mux.allocate_local()?;
        let open = ChannelOpen::new(
            channel_type,
            id,
            self.mux.config().initial_window,
            self.mux.config().max_packet,
        );
        self.conn.send_payload(open.to_bytes()).await?;

        self.wait_for(|event| match event {
            ChannelEvent::Confirmed { id: got } if *got == id => Some(Ok(())),
            ChannelEvent::OpenFailed {
                id: got,
                reason,
                description,
            } if *got == id => Some(Err(SkiffError::Protocol(format!(
                "channel open failed (reason {}): {}",
                reason, description
            )))),
            _ => None,
        })
        .await??;
        Ok(id)
    }

    async fn channel_request(
        &mut self,
        id: u32,
        request: ChannelRequestType,
    ) -> SkiffResult<()> {
        self.require_open()?;
        let name = request.name().to_string();
        let channel = self.mux.get_mut(id)?;
        let remote_id = channel.remote_id;
        channel.push_outstanding_request(&name);
        let message = ChannelRequest {
            recipient_channel: remote_id,
            want_reply: true,
            request,
        };
        self.conn.send_payload(message.to_bytes()).await?;

        self.wait_for(|event| match event {
            ChannelEvent::RequestSuccess { id: got, .. } if *got == id => Some(Ok(())),
            ChannelEvent::RequestFailure { id: got, request } if *got == id => Some(Err(
                SkiffError::Protocol(format!("channel request {:?} refused", request)),
            )),
            _ => None,
        })
        .await?
    }

    /// Requests command execution on a session channel.
    pub async fn request_exec(&mut self, id: u32, command: &str) -> SkiffResult<()> {
        self.channel_request(
            id,
            ChannelRequestType::Exec {
                command: command.to_string(),
            },
        )
        .await
    }

    /// Requests a shell on a session channel.
    pub async fn request_shell(&mut self, id: u32) -> SkiffResult<()> {
        self.channel_request(id, ChannelRequestType::Shell).await
    }

    /// Requests a pseudo-terminal.
    pub async fn request_pty(
        &mut self,
        id: u32,
        term: &str,
        cols: u32,
        rows: u32,
    ) -> SkiffResult<()> {
        self.channel_request(
            id,
            ChannelRequestType::PtyReq {
                term: term.to_string(),
                cols,
                rows,
                width_px: 0,
                height_px: 0,
                modes: vec![0],
            },
        )
        .await
    }

    /// Requests a subsystem (e.g. "sftp").
    pub async fn request_subsystem(&mut self, id: u32, name: &str) -> SkiffResult<()> {
        self.channel_request(
            id,
            ChannelRequestType::Subsystem {
                name: name.to_string(),
            },
        )
        .await
    }

    /// Writes channel data, chunking to the peer's maximum packet size and
    /// blocking on the remote window when it runs dry.
    pub async fn write_data(&mut self, id: u32, mut data: &[u8]) -> SkiffResult<()> {
        self.require_open()?;
        while !data.is_empty() {
            let chunk_len = {
                let channel = self.mux.get(id)?;
                channel.max_chunk().min(data.len())
            };
            if chunk_len == 0 {
                // Window exhausted: pump the wire until an adjust arrives.
                if let Some(event) = self.pump_once().await? {
                    self.pending.push_back(event);
                }
                continue;
            }
            let (chunk, rest) = data.split_at(chunk_len);
            let channel = self.mux.get_mut(id)?;
            channel.consume_remote_window(chunk_len)?;
            let message = ChannelData {
                recipient_channel: channel.remote_id,
                data: chunk.to_vec(),
            };
            self.conn.send_payload(message.to_bytes()).await?;
            data = rest;
        }
        Ok(())
    }

    /// Sends CHANNEL_EOF.
    pub async fn send_eof(&mut self, id: u32) -> SkiffResult<()> {
        let channel = self.mux.get_mut(id)?;
        let remote_id = channel.remote_id;
        channel.mark_eof_sent();
        self.conn
            .send_payload(connection::channel_id_message(msg::CHANNEL_EOF, remote_id))
            .await
    }

    /// Sends CHANNEL_CLOSE and waits for the peer's close.
    pub async fn close_channel(&mut self, id: u32) -> SkiffResult<()> {
        let channel = self.mux.get_mut(id)?;
        let remote_id = channel.remote_id;
        if !channel.close_sent() {
            channel.mark_close_sent();
            self.conn
                .send_payload(connection::channel_id_message(
                    msg::CHANNEL_CLOSE,
                    remote_id,
                ))
                .await?;
        }
        if self.mux.remove_if_closed(id) {
            return Ok(());
        }
        self.wait_for(|event| match event {
            ChannelEvent::Closed { id: got } if *got == id => Some(()),
            _ => None,
        })
        .await
    }

    /// Convenience: open a session, run a command, collect its output.
    pub async fn run_command(&mut self, command: &str) -> SkiffResult<CommandOutput> {
        let id = self.open_session().await?;
        self.request_exec(id, command).await?;

        let mut output = CommandOutput::default();
        // Events for other channels are stashed aside so they are not
        // re-polled while this command drains.
        let mut stash = VecDeque::new();
        loop {
            match self.next_channel_event().await? {
                ChannelEvent::Data { id: got, data } if got == id => {
                    output.stdout.extend_from_slice(&data);
                }
                ChannelEvent::ExtendedData { id: got, data, .. } if got == id => {
                    output.stderr.extend_from_slice(&data);
                }
                ChannelEvent::ExitStatus { id: got, status } if got == id => {
                    output.exit_status = Some(status);
                }
                ChannelEvent::Eof { id: got } if got == id => {}
                ChannelEvent::Closed { id: got } if got == id => break,
                other => stash.push_back(other),
            }
        }
        self.pending.append(&mut stash);
        Ok(output)
    }

    /// Sends a global `tcpip-forward` request; returns the bound port.
    pub async fn request_tcpip_forward(&mut self, address: &str, port: u32) -> SkiffResult<u32> {
        self.require_open()?;
        let request = GlobalRequest {
            want_reply: true,
            request: GlobalRequestType::TcpipForward {
                address: address.to_string(),
                port,
            },
        };
        self.conn.send_payload(request.to_bytes()).await?;

        // Global replies are ordered; the next REQUEST_* answers us.
        loop {
            match self.conn.next_event().await? {
                Event::Connection(payload) => match payload.first() {
                    Some(&msg::REQUEST_SUCCESS) => {
                        let mut r = Reader::new(&payload[1..]);
                        let bound = if port == 0 && r.remaining() >= 4 {
                            r.read_u32()?
                        } else {
                            port
                        };
                        return Ok(bound);
                    }
                    Some(&msg::REQUEST_FAILURE) => {
                        return Err(SkiffError::Protocol(
                            "tcpip-forward refused".to_string(),
                        ))
                    }
                    _ => {
                        if let Some(event) = self.handle_connection_payload(payload).await? {
                            self.pending.push_back(event);
                        }
                    }
                },
                Event::Kex(payload) => {
                    let verifier = self.verifier.clone();
                    let host = self.host.clone();
                    self.conn
                        .run_kex_client(&host, verifier.as_ref(), Some(payload))
                        .await?;
                }
                other => {
                    return Err(SkiffError::Protocol(format!(
                        "unexpected traffic on an open session: {:?}",
                        other
                    )))
                }
            }
        }
    }

    /// Initiates a re-key explicitly.
    pub async fn rekey(&mut self) -> SkiffResult<()> {
        let verifier = self.verifier.clone();
        let host = self.host.clone();
        self.conn.initiate_rekey_client(&host, verifier.as_ref()).await
    }

    /// The current session id (exchange hash of the first KEX).
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.conn.state().session_id().map(|s| s.to_vec())
    }

    /// Sends DISCONNECT and closes the stream.
    pub async fn disconnect(&mut self) -> SkiffResult<()> {
        self.conn.close().await
    }

    /// Disconnects with an explicit reason.
    pub async fn disconnect_with(&mut self, reason: DisconnectReason, text: &str) -> SkiffResult<()> {
        self.conn.send_disconnect(reason, text).await?;
        self.conn.close().await
    }
}
