//! SSH server session driver.
//!
//! [`SshServerSession`] accepts one connection over any injected stream:
//! handshake, authentication against an [`AuthProvider`], then the
//! connection-protocol service loop against a [`SessionHandler`]. Listening
//! sockets and process spawning stay with the caller.
//!
//! Outbound channel data is queued per channel and flushed as the peer's
//! window allows, so a slow consumer never wedges the protocol loop.
//!
//! # Example
//!
//! ```rust,no_run
//! use skiff_proto::ssh::server::{ServerConfig, SessionHandler, SshServerSession, StaticPasswordAuth};
//! use skiff_proto::ssh::hostkey::{Ed25519HostKey, HostKey};
//! use skiff_platform::OsRandom;
//! use std::sync::Arc;
//!
//! struct Echo;
//! #[async_trait::async_trait]
//! impl SessionHandler for Echo {}
//!
//! # async fn example() -> skiff_platform::SkiffResult<()> {
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:2222").await?;
//! let (stream, _) = listener.accept().await?;
//!
//! let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate(&mut OsRandom));
//! let mut session =
//!     SshServerSession::handshake(stream, ServerConfig::default(), vec![host_key]).await?;
//!
//! let auth = StaticPasswordAuth::new("admin", "secret");
//! session.authenticate(&auth).await?;
//! session.serve(&mut Echo).await?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::auth::{
    self, AuthFailure, AuthMethod, AuthPkOk, AuthRequest, InfoPrompt, InfoRequest, InfoResponse,
    CONNECTION_SERVICE, USERAUTH_SERVICE,
};
use crate::ssh::channel::{ChannelMux, MuxConfig};
use crate::ssh::connection::{
    self, ChannelData, ChannelExtendedData, ChannelOpen, ChannelOpenConfirmation,
    ChannelOpenFailure, ChannelOpenFailureReason, ChannelRequest, ChannelRequestType, ChannelType,
    ChannelWindowAdjust, GlobalRequest, GlobalRequestType,
};
use crate::ssh::connection_mgr::{Event, SshConnection};
use crate::ssh::hostkey::{self, HostKey};
use crate::ssh::message::{self, msg, DisconnectReason};
use crate::ssh::transport::{Role, SessionConfig, SessionPhase};
use crate::ssh::wire::Writer;
use skiff_platform::{OsRandom, SkiffError, SkiffResult, SystemClock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Outcome of one authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Authentication complete.
    Accept,
    /// This method succeeded but more are required (multi-factor).
    Partial {
        /// Methods that can continue.
        methods: Vec<String>,
    },
    /// Rejected.
    Reject,
}

/// One round of a keyboard-interactive conversation.
#[derive(Debug, Clone)]
pub enum KiRound {
    /// Ask the client these prompts.
    Prompts {
        /// Round title.
        name: String,
        /// Instructions.
        instruction: String,
        /// The prompts.
        prompts: Vec<InfoPrompt>,
    },
    /// Conversation finished successfully.
    Accept,
    /// Conversation failed.
    Reject,
}

/// The server's credential collaborator.
#[async_trait::async_trait]
pub trait AuthProvider: Send + Sync {
    /// Banner shown before authentication, if any.
    async fn banner(&self) -> Option<String> {
        None
    }

    /// Methods to advertise in USERAUTH_FAILURE.
    fn methods(&self) -> Vec<String> {
        vec!["publickey".to_string(), "password".to_string()]
    }

    /// The "none" method (RFC 4252 Section 5.2).
    async fn auth_none(&self, _user: &str) -> AuthOutcome {
        AuthOutcome::Reject
    }

    /// Password check.
    async fn auth_password(&self, _user: &str, _password: &str) -> AuthOutcome {
        AuthOutcome::Reject
    }

    /// Password change (old verified, new to install).
    async fn auth_password_change(
        &self,
        _user: &str,
        _old: &str,
        _new: &str,
    ) -> AuthOutcome {
        AuthOutcome::Reject
    }

    /// Whether this key may authenticate this user (probe phase; no
    /// signature has been verified yet).
    async fn is_publickey_authorized(
        &self,
        _user: &str,
        _algorithm: &str,
        _public_key: &[u8],
    ) -> bool {
        false
    }

    /// Outcome once a valid signature from an authorized key arrived.
    async fn auth_publickey(&self, user: &str, algorithm: &str, public_key: &[u8]) -> AuthOutcome {
        if self.is_publickey_authorized(user, algorithm, public_key).await {
            AuthOutcome::Accept
        } else {
            AuthOutcome::Reject
        }
    }

    /// Starts a keyboard-interactive conversation.
    async fn ki_start(&self, _user: &str, _submethods: &str) -> KiRound {
        KiRound::Reject
    }

    /// Continues a keyboard-interactive conversation with the client's
    /// responses to the previous round.
    async fn ki_continue(&self, _user: &str, _responses: &[String]) -> KiRound {
        KiRound::Reject
    }

    /// Host-based authentication (signature already verified).
    async fn auth_hostbased(
        &self,
        _user: &str,
        _hostname: &str,
        _local_user: &str,
        _algorithm: &str,
        _host_key: &[u8],
    ) -> AuthOutcome {
        AuthOutcome::Reject
    }
}

/// Password-table provider for tests and demos.
pub struct StaticPasswordAuth {
    user: String,
    password: String,
}

impl StaticPasswordAuth {
    /// Accepts exactly this user/password pair.
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl AuthProvider for StaticPasswordAuth {
    fn methods(&self) -> Vec<String> {
        vec!["password".to_string()]
    }

    async fn auth_password(&self, user: &str, password: &str) -> AuthOutcome {
        use subtle::ConstantTimeEq;
        let user_ok = user.as_bytes().ct_eq(self.user.as_bytes());
        let pass_ok = password.as_bytes().ct_eq(self.password.as_bytes());
        if bool::from(user_ok & pass_ok) {
            AuthOutcome::Accept
        } else {
            AuthOutcome::Reject
        }
    }
}

/// Result a handler returns for an executed command.
#[derive(Debug, Default)]
pub struct ExecOutcome {
    /// Bytes for the channel's stdout.
    pub stdout: Vec<u8>,
    /// Bytes for the channel's stderr.
    pub stderr: Vec<u8>,
    /// Exit status to report.
    pub exit_status: u32,
}

/// Application hooks for session channels.
#[async_trait::async_trait]
pub trait SessionHandler: Send + Sync {
    /// Executes a command. `None` refuses the request.
    async fn exec(&mut self, _command: &str) -> Option<ExecOutcome> {
        None
    }

    /// Handles channel data; returned bytes are written back to the
    /// channel.
    async fn data(&mut self, _channel: u32, _data: &[u8]) -> SkiffResult<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Whether to grant a pty.
    async fn pty_request(&mut self, _term: &str, _cols: u32, _rows: u32) -> bool {
        true
    }

    /// Whether to accept an environment variable.
    async fn env(&mut self, _name: &str, _value: &str) -> bool {
        false
    }

    /// Whether to start a shell on this channel.
    async fn shell(&mut self) -> bool {
        true
    }

    /// Whether to start a subsystem.
    async fn subsystem(&mut self, _name: &str) -> bool {
        false
    }

    /// Remote forwarding request; returns the bound port on success.
    async fn tcpip_forward(&mut self, _address: &str, _port: u32) -> Option<u32> {
        None
    }

    /// Cancels a remote forwarding.
    async fn cancel_tcpip_forward(&mut self, _address: &str, _port: u32) -> bool {
        false
    }
}

/// Server configuration.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Core session options.
    pub session: SessionConfig,
}

/// Queued outbound work for one channel, flushed as the window allows.
#[derive(Debug, Default)]
struct Outgoing {
    data: Vec<u8>,
    stderr: Vec<u8>,
    exit_status: Option<u32>,
    send_eof: bool,
    send_close: bool,
}

impl Outgoing {
    fn is_done(&self) -> bool {
        self.data.is_empty()
            && self.stderr.is_empty()
            && self.exit_status.is_none()
            && !self.send_eof
            && !self.send_close
    }
}

/// One accepted server-side session.
pub struct SshServerSession<S> {
    conn: SshConnection<S>,
    host_keys: Vec<Arc<dyn HostKey>>,
    mux: ChannelMux,
    outgoing: HashMap<u32, Outgoing>,
    authenticated: bool,
    username: Option<String>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> SshServerSession<S> {
    /// Performs identification exchange and the first key exchange.
    pub async fn handshake(
        stream: S,
        config: ServerConfig,
        host_keys: Vec<Arc<dyn HostKey>>,
    ) -> SkiffResult<Self> {
        if host_keys.is_empty() {
            return Err(SkiffError::Config("a server needs a host key".to_string()));
        }
        let mux = ChannelMux::new(MuxConfig {
            initial_window: config.session.channel_initial_window,
            max_packet: config.session.channel_max_packet,
            max_channels: config.session.max_channels,
        });
        let mut conn = SshConnection::new(
            stream,
            Role::Server,
            config.session,
            Box::new(OsRandom),
            Box::new(SystemClock),
        );

        conn.exchange_identification().await?;
        if let Err(err) = conn.run_kex_server(&host_keys, None).await {
            return Err(conn.fail(err).await);
        }

        Ok(Self {
            conn,
            host_keys,
            mux,
            outgoing: HashMap::new(),
            authenticated: false,
            username: None,
        })
    }

    /// The peer's identification line.
    pub fn client_version(&self) -> String {
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

    /// The session id (exchange hash of the first KEX).
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.conn.state().session_id().map(|s| s.to_vec())
    }

    // --- authentication --------------------------------------------------

    /// Runs the `ssh-userauth` service until the client authenticates or
    /// runs out of attempts/time, returning the user name.
    pub async fn authenticate(&mut self, provider: &dyn AuthProvider) -> SkiffResult<String> {
        let auth_timeout = self.conn.state().config().auth_timeout;
        match tokio::time::timeout(auth_timeout, self.authenticate_inner(provider)).await {
            Ok(result) => result,
            Err(_) => {
                let _ = self
                    .conn
                    .send_disconnect(
                        DisconnectReason::NoMoreAuthMethodsAvailable,
                        "authentication timed out",
                    )
                    .await;
                Err(SkiffError::Timeout("authentication".to_string()))
            }
        }
    }

    async fn authenticate_inner(&mut self, provider: &dyn AuthProvider) -> SkiffResult<String> {
        // Service negotiation.
        loop {
            match self.conn.next_event().await? {
                Event::Service(payload) => {
                    let service =
                        message::parse_service(&payload, msg::SERVICE_REQUEST)?;
                    if service != USERAUTH_SERVICE {
                        let _ = self
                            .conn
                            .send_disconnect(
                                DisconnectReason::ServiceNotAvailable,
                                &format!("service {} not available", service),
                            )
                            .await;
                        return Err(SkiffError::Protocol(format!(
                            "client requested service {:?}",
                            service
                        )));
                    }
                    self.conn
                        .send_payload(message::service_accept(USERAUTH_SERVICE))
                        .await?;
                    break;
                }
                Event::Kex(payload) => {
                    let host_keys = self.host_keys.clone();
                    self.conn.run_kex_server(&host_keys, Some(payload)).await?;
                }
                other => {
                    return Err(SkiffError::Protocol(format!(
                        "expected SERVICE_REQUEST, got {:?}",
                        other
                    )))
                }
            }
        }

        if let Some(text) = provider.banner().await {
            let banner = auth::AuthBanner {
                message: text,
                language: String::new(),
            };
            self.conn.send_payload(banner.to_bytes()).await?;
        }

        let max_attempts = self.conn.state().config().max_auth_attempts;
        let mut attempts = 0u32;

        loop {
            let payload = loop {
                match self.conn.next_event().await? {
                    Event::Auth(payload) => break payload,
                    Event::Kex(payload) => {
                        let host_keys = self.host_keys.clone();
                        self.conn.run_kex_server(&host_keys, Some(payload)).await?;
                    }
                    other => {
                        return Err(SkiffError::Protocol(format!(
                            "expected USERAUTH_REQUEST, got {:?}",
                            other
                        )))
                    }
                }
            };
            if payload.first() != Some(&msg::USERAUTH_REQUEST) {
                return Err(SkiffError::Protocol(format!(
                    "expected USERAUTH_REQUEST, got {:?}",
                    payload.first()
                )));
            }

            let request = AuthRequest::from_bytes(&payload)?;
            if request.service_name != CONNECTION_SERVICE {
                let _ = self
                    .conn
                    .send_disconnect(
                        DisconnectReason::ServiceNotAvailable,
                        "only ssh-connection is served",
                    )
                    .await;
                return Err(SkiffError::Protocol(format!(
                    "authentication for unknown service {:?}",
                    request.service_name
                )));
            }
            let user = request.user_name.clone();
            debug!(user = %user, method = request.method.name(), "auth attempt");

            let outcome = match &request.method {
                AuthMethod::None => Some(provider.auth_none(&user).await),
                AuthMethod::Password {
                    password,
                    new_password,
                } => Some(match new_password {
                    None => provider.auth_password(&user, password).await,
                    Some(new_password) => {
                        provider
                            .auth_password_change(&user, password, new_password)
                            .await
                    }
                }),
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                } => match signature {
                    None => {
                        // A probe: acceptable keys get PK_OK without
                        // authenticating.
                        if provider
                            .is_publickey_authorized(&user, algorithm, public_key)
                            .await
                        {
                            let pk_ok = AuthPkOk {
                                algorithm: algorithm.clone(),
                                public_key: public_key.clone(),
                            };
                            self.conn.send_payload(pk_ok.to_bytes()).await?;
                            continue;
                        }
                        Some(AuthOutcome::Reject)
                    }
                    Some(signature) => {
                        let session_id = self
                            .conn
                            .state()
                            .session_id()
                            .ok_or_else(|| {
                                SkiffError::Protocol("no session id".to_string())
                            })?
                            .to_vec();
                        let data = auth::publickey_signature_data(
                            &session_id,
                            &user,
                            CONNECTION_SERVICE,
                            algorithm,
                            public_key,
                        );
                        let authorized = provider
                            .is_publickey_authorized(&user, algorithm, public_key)
                            .await;
                        let valid = authorized
                            && hostkey::verify_signature(
                                algorithm, public_key, &data, signature,
                            )
                            .is_ok();
                        Some(if valid {
                            provider.auth_publickey(&user, algorithm, public_key).await
                        } else {
                            AuthOutcome::Reject
                        })
                    }
                },
                AuthMethod::KeyboardInteractive { submethods, .. } => {
                    let outcome = self
                        .keyboard_interactive(provider, &user, submethods)
                        .await?;
                    Some(outcome)
                }
                AuthMethod::HostBased {
                    algorithm,
                    host_key,
                    hostname,
                    local_user,
                    signature,
                } => {
                    let session_id = self
                        .conn
                        .state()
                        .session_id()
                        .ok_or_else(|| SkiffError::Protocol("no session id".to_string()))?
                        .to_vec();
                    let data = auth::hostbased_signature_data(
                        &session_id,
                        &user,
                        CONNECTION_SERVICE,
                        algorithm,
                        host_key,
                        hostname,
                        local_user,
                    );
                    let valid =
                        hostkey::verify_signature(algorithm, host_key, &data, signature).is_ok();
                    Some(if valid {
                        provider
                            .auth_hostbased(&user, hostname, local_user, algorithm, host_key)
                            .await
                    } else {
                        AuthOutcome::Reject
                    })
                }
                AuthMethod::Other { name, .. } => {
                    debug!(method = %name, "unsupported authentication method");
                    Some(AuthOutcome::Reject)
                }
            };

            match outcome {
                Some(AuthOutcome::Accept) => {
                    self.conn.send_payload(auth::success()).await?;
                    self.conn.activate_delayed_compression();
                    self.conn.state_mut().transition(SessionPhase::Open)?;
                    self.authenticated = true;
                    self.username = Some(user.clone());
                    debug!(user = %user, "authentication succeeded");
                    return Ok(user);
                }
                Some(AuthOutcome::Partial { methods }) => {
                    let failure = AuthFailure::new(methods, true);
                    self.conn.send_payload(failure.to_bytes()).await?;
                }
                Some(AuthOutcome::Reject) => {
                    // "none" probes do not count against the limit.
                    if request.method.name() != "none" {
                        attempts += 1;
                    }
                    if attempts >= max_attempts {
                        let _ = self
                            .conn
                            .send_disconnect(
                                DisconnectReason::NoMoreAuthMethodsAvailable,
                                "too many authentication failures",
                            )
                            .await;
                        return Err(SkiffError::Security(
                            "too many authentication failures".to_string(),
                        ));
                    }
                    let failure = AuthFailure::new(provider.methods(), false);
                    self.conn.send_payload(failure.to_bytes()).await?;
                }
                None => {}
            }
        }
    }

    async fn keyboard_interactive(
        &mut self,
        provider: &dyn AuthProvider,
        user: &str,
        submethods: &str,
    ) -> SkiffResult<AuthOutcome> {
        let mut round = provider.ki_start(user, submethods).await;
        loop {
            match round {
                KiRound::Accept => return Ok(AuthOutcome::Accept),
                KiRound::Reject => return Ok(AuthOutcome::Reject),
                KiRound::Prompts {
                    name,
                    instruction,
                    prompts,
                } => {
                    let request = InfoRequest {
                        name,
                        instruction,
                        language: String::new(),
                        prompts,
                    };
                    self.conn.send_payload(request.to_bytes()).await?;

                    let payload = loop {
                        match self.conn.next_event().await? {
                            Event::Auth(payload) => break payload,
                            other => {
                                return Err(SkiffError::Protocol(format!(
                                    "expected USERAUTH_INFO_RESPONSE, got {:?}",
                                    other
                                )))
                            }
                        }
                    };
                    if payload.first() != Some(&msg::USERAUTH_INFO_RESPONSE) {
                        // The client may abandon the conversation with a
                        // fresh USERAUTH_REQUEST; treat it as a rejection
                        // of this conversation.
                        return Err(SkiffError::Protocol(
                            "keyboard-interactive conversation interrupted".to_string(),
                        ));
                    }
                    let response = InfoResponse::from_bytes(&payload)?;
                    round = provider.ki_continue(user, &response.responses).await;
                }
            }
        }
    }

    // --- connection service ----------------------------------------------

    /// Serves the connection protocol until the peer disconnects.
    pub async fn serve(&mut self, handler: &mut dyn SessionHandler) -> SkiffResult<()> {
        if !self.authenticated {
            return Err(SkiffError::Protocol(
                "serve() requires an authenticated session".to_string(),
            ));
        }
        loop {
            if self.conn.needs_rekey() {
                let host_keys = self.host_keys.clone();
                self.conn.initiate_rekey_server(&host_keys).await?;
            }
            self.flush_outgoing().await?;

            let event = {
                let idle = self.conn.state().config().idle_timeout;
                if idle.is_zero() {
                    self.conn.next_event().await
                } else {
                    match tokio::time::timeout(idle, self.conn.next_event()).await {
                        Ok(event) => event,
                        Err(_) => {
                            let _ = self
                                .conn
                                .send_disconnect(
                                    DisconnectReason::ByApplication,
                                    "idle timeout",
                                )
                                .await;
                            return Ok(());
                        }
                    }
                }
            };

            let event = match event {
                Ok(event) => event,
                Err(SkiffError::Disconnected { reason, message }) => {
                    debug!(reason, message = %message, "client disconnected");
                    return Ok(());
                }
                Err(err) => {
                    let err = self.conn.fail(err).await;
                    return Err(err);
                }
            };

            match event {
                Event::Kex(payload) => {
                    let host_keys = self.host_keys.clone();
                    self.conn.run_kex_server(&host_keys, Some(payload)).await?;
                }
                Event::Connection(payload) => {
                    self.handle_connection_payload(handler, payload).await?;
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

    async fn handle_connection_payload(
        &mut self,
        handler: &mut dyn SessionHandler,
        payload: Vec<u8>,
    ) -> SkiffResult<()> {
        match payload[0] {
            msg::CHANNEL_OPEN => self.handle_channel_open(payload).await,
            msg::CHANNEL_REQUEST => self.handle_channel_request(handler, payload).await,
            msg::CHANNEL_DATA => {
                let data = ChannelData::from_bytes(&payload)?;
                let id = data.recipient_channel;
                {
                    let channel = self.mux.get_mut(id)?;
                    channel.consume_local_window(data.data.len())?;
                }
                self.replenish(id).await?;
                let reply = handler.data(id, &data.data).await?;
                if !reply.is_empty() {
                    self.outgoing.entry(id).or_default().data.extend(reply);
                }
                Ok(())
            }
            msg::CHANNEL_EXTENDED_DATA => {
                let data = ChannelExtendedData::from_bytes(&payload)?;
                let id = data.recipient_channel;
                {
                    let channel = self.mux.get_mut(id)?;
                    channel.consume_local_window(data.data.len())?;
                }
                self.replenish(id).await?;
                // Clients rarely send stderr; hand it to the data hook.
                let reply = handler.data(id, &data.data).await?;
                if !reply.is_empty() {
                    self.outgoing.entry(id).or_default().data.extend(reply);
                }
                Ok(())
            }
            msg::CHANNEL_WINDOW_ADJUST => {
                let adjust = ChannelWindowAdjust::from_bytes(&payload)?;
                self.mux
                    .get_mut(adjust.recipient_channel)?
                    .grow_remote_window(adjust.additional_bytes);
                self.flush_outgoing().await
            }
            msg::CHANNEL_EOF => {
                let id = connection::parse_channel_id_message(&payload, msg::CHANNEL_EOF)?;
                self.mux.get_mut(id)?.mark_eof_received();
                Ok(())
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
                self.outgoing.remove(&id);
                Ok(())
            }
            msg::CHANNEL_SUCCESS | msg::CHANNEL_FAILURE => {
                let id = connection::parse_channel_id_message(&payload, payload[0])?;
                let _ = self.mux.get_mut(id)?.pop_outstanding_request()?;
                Ok(())
            }
            msg::GLOBAL_REQUEST => self.handle_global_request(handler, payload).await,
            msg::REQUEST_SUCCESS | msg::REQUEST_FAILURE => Ok(()),
            other => {
                warn!(number = other, "unhandled connection message");
                Ok(())
            }
        }
    }

    async fn handle_channel_open(&mut self, payload: Vec<u8>) -> SkiffResult<()> {
        let open = ChannelOpen::from_bytes(&payload)?;
        match open.channel_type {
            ChannelType::Session => {
                match self.mux.accept_remote(
                    open.sender_channel,
                    open.initial_window,
                    open.max_packet,
                ) {
                    Ok(local_id) => {
                        let confirm = ChannelOpenConfirmation {
                            recipient_channel: open.sender_channel,
                            sender_channel: local_id,
                            initial_window: self.mux.config().initial_window,
                            max_packet: self.mux.config().max_packet,
                        };
                        debug!(channel = local_id, "session channel opened");
                        self.conn.send_payload(confirm.to_bytes()).await
                    }
                    Err(_) => {
                        let failure = ChannelOpenFailure::new(
                            open.sender_channel,
                            ChannelOpenFailureReason::ResourceShortage,
                            "channel limit reached",
                        );
                        self.conn.send_payload(failure.to_bytes()).await
                    }
                }
            }
            ChannelType::DirectTcpip { .. } | ChannelType::ForwardedTcpip { .. } => {
                let failure = ChannelOpenFailure::new(
                    open.sender_channel,
                    ChannelOpenFailureReason::AdministrativelyProhibited,
                    "forwarding is not enabled",
                );
                self.conn.send_payload(failure.to_bytes()).await
            }
            ChannelType::X11 { .. } | ChannelType::Other { .. } => {
                let failure = ChannelOpenFailure::new(
                    open.sender_channel,
                    ChannelOpenFailureReason::UnknownChannelType,
                    "unknown channel type",
                );
                self.conn.send_payload(failure.to_bytes()).await
            }
        }
    }

    async fn handle_channel_request(
        &mut self,
        handler: &mut dyn SessionHandler,
        payload: Vec<u8>,
    ) -> SkiffResult<()> {
        let request = ChannelRequest::from_bytes(&payload)?;
        let id = request.recipient_channel;
        let remote_id = self.mux.get(id)?.remote_id;

        let granted = match &request.request {
            ChannelRequestType::PtyReq {
                term, cols, rows, ..
            } => handler.pty_request(term, *cols, *rows).await,
            ChannelRequestType::Env { name, value } => handler.env(name, value).await,
            ChannelRequestType::Shell => handler.shell().await,
            ChannelRequestType::Exec { command } => {
                match handler.exec(command).await {
                    Some(outcome) => {
                        let out = self.outgoing.entry(id).or_default();
                        out.data.extend(outcome.stdout);
                        out.stderr.extend(outcome.stderr);
                        out.exit_status = Some(outcome.exit_status);
                        out.send_eof = true;
                        out.send_close = true;
                        true
                    }
                    None => false,
                }
            }
            ChannelRequestType::Subsystem { name } => handler.subsystem(name).await,
            ChannelRequestType::WindowChange { .. } => true,
            ChannelRequestType::Signal { name } => {
                debug!(signal = %name, channel = id, "signal request");
                true
            }
            ChannelRequestType::ExitStatus { .. } | ChannelRequestType::ExitSignal { .. } => {
                // Only meaningful server-to-client.
                false
            }
            ChannelRequestType::Other { name, .. } => {
                debug!(request = %name, "unknown channel request");
                false
            }
        };

        // Replies stay in receipt order because requests are processed
        // sequentially on the session task.
        if request.want_reply {
            let kind = if granted {
                msg::CHANNEL_SUCCESS
            } else {
                msg::CHANNEL_FAILURE
            };
            self.conn
                .send_payload(connection::channel_id_message(kind, remote_id))
                .await?;
        }
        self.flush_outgoing().await
    }

    async fn handle_global_request(
        &mut self,
        handler: &mut dyn SessionHandler,
        payload: Vec<u8>,
    ) -> SkiffResult<()> {
        let request = GlobalRequest::from_bytes(&payload)?;
        let (granted, reply_data) = match &request.request {
            GlobalRequestType::TcpipForward { address, port } => {
                match handler.tcpip_forward(address, *port).await {
                    Some(bound) => {
                        let mut data = Writer::new();
                        if *port == 0 {
                            data.put_u32(bound);
                        }
                        (true, data.finish())
                    }
                    None => (false, Vec::new()),
                }
            }
            GlobalRequestType::CancelTcpipForward { address, port } => (
                handler.cancel_tcpip_forward(address, *port).await,
                Vec::new(),
            ),
            GlobalRequestType::Other { name, .. } => {
                debug!(request = %name, "unknown global request");
                (false, Vec::new())
            }
        };

        if request.want_reply {
            let reply = if granted {
                connection::request_success(&reply_data)
            } else {
                connection::request_failure()
            };
            self.conn.send_payload(reply).await?;
        }
        Ok(())
    }

    /// Sends a WINDOW_ADJUST when the local window has dropped below the
    /// replenish threshold.
    async fn replenish(&mut self, id: u32) -> SkiffResult<()> {
        let grant = {
            let channel = self.mux.get_mut(id)?;
            channel
                .replenish_local_window()
                .map(|grant| (channel.remote_id, grant))
        };
        if let Some((remote_id, grant)) = grant {
            let adjust = ChannelWindowAdjust {
                recipient_channel: remote_id,
                additional_bytes: grant,
            };
            self.conn.send_payload(adjust.to_bytes()).await?;
        }
        Ok(())
    }

    /// Flushes queued channel output as far as the windows allow.
    async fn flush_outgoing(&mut self) -> SkiffResult<()> {
        let ids: Vec<u32> = self.outgoing.keys().copied().collect();
        for id in ids {
            loop {
                let Ok(channel) = self.mux.get_mut(id) else {
                    self.outgoing.remove(&id);
                    break;
                };
                let remote_id = channel.remote_id;
                let Some(out) = self.outgoing.get_mut(&id) else {
                    break;
                };

                if !out.data.is_empty() || !out.stderr.is_empty() {
                    let (buffer, is_stderr) = if !out.data.is_empty() {
                        (&mut out.data, false)
                    } else {
                        (&mut out.stderr, true)
                    };
                    let chunk_len = channel.max_chunk().min(buffer.len());
                    if chunk_len == 0 {
                        // Window exhausted; resume on the next adjust.
                        break;
                    }
                    let chunk: Vec<u8> = buffer.drain(..chunk_len).collect();
                    channel.consume_remote_window(chunk_len)?;
                    let message = if is_stderr {
                        ChannelExtendedData {
                            recipient_channel: remote_id,
                            data_type: connection::EXTENDED_DATA_STDERR,
                            data: chunk,
                        }
                        .to_bytes()
                    } else {
                        ChannelData {
                            recipient_channel: remote_id,
                            data: chunk,
                        }
                        .to_bytes()
                    };
                    self.conn.send_payload(message).await?;
                    continue;
                }

                if let Some(status) = out.exit_status.take() {
                    let message = ChannelRequest {
                        recipient_channel: remote_id,
                        want_reply: false,
                        request: ChannelRequestType::ExitStatus { status },
                    };
                    self.conn.send_payload(message.to_bytes()).await?;
                    continue;
                }
                if out.send_eof {
                    out.send_eof = false;
                    channel.mark_eof_sent();
                    self.conn
                        .send_payload(connection::channel_id_message(
                            msg::CHANNEL_EOF,
                            remote_id,
                        ))
                        .await?;
                    continue;
                }
                if out.send_close {
                    out.send_close = false;
                    channel.mark_close_sent();
                    self.conn
                        .send_payload(connection::channel_id_message(
                            msg::CHANNEL_CLOSE,
                            remote_id,
                        ))
                        .await?;
                    self.mux.remove_if_closed(id);
                    continue;
                }

                if out.is_done() {
                    self.outgoing.remove(&id);
                }
                break;
            }
        }
        Ok(())
    }

    /// Initiates a re-key explicitly.
    pub async fn rekey(&mut self) -> SkiffResult<()> {
        let host_keys = self.host_keys.clone();
        self.conn.initiate_rekey_server(&host_keys).await
    }

    /// Sends DISCONNECT and closes the stream.
    pub async fn disconnect(&mut self) -> SkiffResult<()> {
        self.conn.close().await
    }
}

impl<S> std::fmt::Debug for SshServerSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshServerSession")
            .field("authenticated", &self.authenticated)
            .field("username", &self.username)
            .field("channels", &self.mux.len())
            .finish()
    }
}
