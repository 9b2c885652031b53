//! Integration tests for SSH client-server communication.
//!
//! Every test runs a real client and server over an in-memory duplex pipe:
//! version exchange, key exchange with signature verification,
//! authentication, channels, and re-keying — no sockets involved.

use skiff_platform::{OsRandom, SkiffError, SkiffResult, SystemClock};
use skiff_proto::ssh::client::{ClientConfig, SshClient};
use skiff_proto::ssh::connection_mgr::SshConnection;
use skiff_proto::ssh::hostkey::{AcceptAllVerifier, Ed25519HostKey, HostKey};
use skiff_proto::ssh::server::{
    AuthProvider, ExecOutcome, KiRound, ServerConfig, SessionHandler, SshServerSession,
    StaticPasswordAuth,
};
use skiff_proto::ssh::transport::{Role, SessionConfig};
use skiff_proto::ssh::auth::InfoPrompt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::time::{timeout, Duration};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn pipes() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(1024 * 1024)
}

fn test_host_keys() -> Vec<Arc<dyn HostKey>> {
    vec![Arc::new(Ed25519HostKey::generate(&mut OsRandom)) as Arc<dyn HostKey>]
}

/// Handler that records exec commands and data.
#[derive(Default)]
struct RecordingHandler {
    data_chunks: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait::async_trait]
impl SessionHandler for RecordingHandler {
    async fn exec(&mut self, command: &str) -> Option<ExecOutcome> {
        Some(ExecOutcome {
            stdout: format!("ran: {}", command).into_bytes(),
            stderr: b"warning: test".to_vec(),
            exit_status: 0,
        })
    }

    async fn data(&mut self, _channel: u32, data: &[u8]) -> SkiffResult<Vec<u8>> {
        self.data_chunks.lock().unwrap().push(data.to_vec());
        Ok(Vec::new())
    }
}

fn restricted_config(kex: &str, cipher: &str, strict: bool) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.kex_algorithms = vec![kex.to_string()];
    config.ciphers = vec![cipher.to_string()];
    config.offer_strict_kex = strict;
    // Keep the packet counts exact: no EXT_INFO after NEWKEYS.
    config.advertise_ext_info = false;
    config
}

/// Drives the low-level KEX for both sides and hands back the connections.
async fn kex_pair(
    client_config: SessionConfig,
    server_config: SessionConfig,
) -> (
    SshConnection<DuplexStream>,
    SshConnection<DuplexStream>,
) {
    let (a, b) = pipes();
    let mut client = SshConnection::new(
        a,
        Role::Client,
        client_config,
        Box::new(OsRandom),
        Box::new(SystemClock),
    );
    let mut server = SshConnection::new(
        b,
        Role::Server,
        server_config,
        Box::new(OsRandom),
        Box::new(SystemClock),
    );
    let host_keys = test_host_keys();

    let (c, s) = tokio::join!(
        async {
            client.exchange_identification().await?;
            client
                .run_kex_client("test.example", &AcceptAllVerifier, None)
                .await
        },
        async {
            server.exchange_identification().await?;
            server.run_kex_server(&host_keys, None).await
        }
    );
    c.unwrap();
    s.unwrap();
    (client, server)
}

/// Scenario: curve25519 + ed25519 + chacha20-poly1305 handshake. Both
/// sides derive a matching 32-byte session id, and without strict KEX the
/// sequence counters sit at exactly 3 after NEWKEYS (KEXINIT, the method
/// exchange, NEWKEYS).
#[tokio::test]
async fn test_curve25519_chacha20_handshake_sequence_numbers() {
    let config = restricted_config(
        "curve25519-sha256",
        "chacha20-poly1305@openssh.com",
        false,
    );
    let (client, server) = timeout(TEST_TIMEOUT, kex_pair(config.clone(), config))
        .await
        .unwrap();

    let client_sid = client.state().session_id().unwrap().to_vec();
    let server_sid = server.state().session_id().unwrap().to_vec();
    assert_eq!(client_sid, server_sid);
    assert_eq!(client_sid.len(), 32);

    assert_eq!(client.codec().send_sequence(), 3);
    assert_eq!(client.codec().recv_sequence(), 3);
    assert_eq!(server.codec().send_sequence(), 3);
    assert_eq!(server.codec().recv_sequence(), 3);
}

/// With strict KEX advertised by both sides, the counters reset at
/// NEWKEYS instead.
#[tokio::test]
async fn test_strict_kex_resets_sequence_numbers() {
    let config = restricted_config(
        "curve25519-sha256",
        "chacha20-poly1305@openssh.com",
        true,
    );
    let (client, server) = timeout(TEST_TIMEOUT, kex_pair(config.clone(), config))
        .await
        .unwrap();

    assert!(client.state().strict_kex());
    assert_eq!(client.codec().send_sequence(), 0);
    assert_eq!(client.codec().recv_sequence(), 0);
    assert_eq!(server.codec().send_sequence(), 0);
    assert_eq!(server.codec().recv_sequence(), 0);
}

#[tokio::test]
async fn test_handshake_aes256_gcm_mlkem_hybrid() {
    let config = restricted_config("mlkem768x25519-sha256", "aes256-gcm@openssh.com", true);
    let (client, server) = timeout(TEST_TIMEOUT, kex_pair(config.clone(), config))
        .await
        .unwrap();
    assert_eq!(
        client.state().session_id().unwrap(),
        server.state().session_id().unwrap()
    );
}

#[tokio::test]
async fn test_handshake_aes_ctr_etm_group_exchange() {
    let mut config = restricted_config("diffie-hellman-group-exchange-sha256", "aes128-ctr", true);
    config.macs = vec!["hmac-sha2-256-etm@openssh.com".to_string()];
    let (client, server) = timeout(TEST_TIMEOUT, kex_pair(config.clone(), config))
        .await
        .unwrap();
    assert_eq!(
        client.state().session_id().unwrap(),
        server.state().session_id().unwrap()
    );
}

#[tokio::test]
async fn test_handshake_classic_dh_group14() {
    let mut config = restricted_config("diffie-hellman-group14-sha256", "aes256-ctr", true);
    config.macs = vec!["hmac-sha2-512".to_string()];
    let (client, server) = timeout(TEST_TIMEOUT, kex_pair(config.clone(), config))
        .await
        .unwrap();
    assert_eq!(
        client.state().session_id().unwrap(),
        server.state().session_id().unwrap()
    );
}

async fn serve_session(
    stream: DuplexStream,
    config: ServerConfig,
    auth: impl AuthProvider + 'static,
    handler: RecordingHandler,
) -> tokio::task::JoinHandle<SkiffResult<()>> {
    let host_keys = test_host_keys();
    tokio::spawn(async move {
        let mut session = SshServerSession::handshake(stream, config, host_keys).await?;
        session.authenticate(&auth).await?;
        let mut handler = handler;
        session.serve(&mut handler).await
    })
}

/// Scenario: password authentication then a session channel.
#[tokio::test]
async fn test_password_auth_and_session_channel() {
    let (a, b) = pipes();
    let server = serve_session(
        b,
        ServerConfig::default(),
        StaticPasswordAuth::new("alice", "hunter2"),
        RecordingHandler::default(),
    )
    .await;

    timeout(TEST_TIMEOUT, async {
        let mut client = SshClient::connect(a, "test.example", ClientConfig::default())
            .await
            .unwrap();
        client.authenticate_password("alice", "hunter2").await.unwrap();
        assert!(client.is_authenticated());
        assert_eq!(client.username(), Some("alice"));

        let id = client.open_session().await.unwrap();
        client.close_channel(id).await.unwrap();
        client.disconnect().await.unwrap();
    })
    .await
    .unwrap();

    timeout(TEST_TIMEOUT, server).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_password_auth_rejected() {
    let (a, b) = pipes();
    let host_keys = test_host_keys();
    let server = tokio::spawn(async move {
        let mut session =
            SshServerSession::handshake(b, ServerConfig::default(), host_keys).await?;
        // Wrong password exhausts nothing; the client gives up first.
        let result = session
            .authenticate(&StaticPasswordAuth::new("alice", "correct"))
            .await;
        assert!(result.is_err() || !session.is_authenticated());
        Ok::<_, SkiffError>(())
    });

    timeout(TEST_TIMEOUT, async {
        let mut client = SshClient::connect(a, "test.example", ClientConfig::default())
            .await
            .unwrap();
        let err = client
            .authenticate_password("alice", "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, SkiffError::Security(_)));
        assert!(!client.is_authenticated());
        client.disconnect().await.unwrap();
    })
    .await
    .unwrap();
    let _ = timeout(TEST_TIMEOUT, server).await;
}

struct KeyAuth {
    blob: Vec<u8>,
}

#[async_trait::async_trait]
impl AuthProvider for KeyAuth {
    fn methods(&self) -> Vec<String> {
        vec!["publickey".to_string()]
    }

    async fn is_publickey_authorized(
        &self,
        user: &str,
        _algorithm: &str,
        public_key: &[u8],
    ) -> bool {
        user == "bob" && public_key == self.blob
    }
}

/// Scenario: publickey probe answered with PK_OK, then the signed request
/// authenticates.
#[tokio::test]
async fn test_publickey_probe_then_signature() {
    let identity = Ed25519HostKey::generate(&mut OsRandom);
    let auth = KeyAuth {
        blob: identity.public_key_blob(),
    };

    let (a, b) = pipes();
    let server = serve_session(b, ServerConfig::default(), auth, RecordingHandler::default())
        .await;

    timeout(TEST_TIMEOUT, async {
        let mut client = SshClient::connect(a, "test.example", ClientConfig::default())
            .await
            .unwrap();
        client.authenticate_publickey("bob", &identity).await.unwrap();
        assert!(client.is_authenticated());
        client.disconnect().await.unwrap();
    })
    .await
    .unwrap();

    timeout(TEST_TIMEOUT, server).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_publickey_unknown_key_rejected() {
    let identity = Ed25519HostKey::generate(&mut OsRandom);
    let other = Ed25519HostKey::generate(&mut OsRandom);
    let auth = KeyAuth {
        blob: other.public_key_blob(),
    };

    let (a, b) = pipes();
    let host_keys = test_host_keys();
    let server = tokio::spawn(async move {
        let mut session =
            SshServerSession::handshake(b, ServerConfig::default(), host_keys).await?;
        let _ = session.authenticate(&auth).await;
        Ok::<_, SkiffError>(())
    });

    timeout(TEST_TIMEOUT, async {
        let mut client = SshClient::connect(a, "test.example", ClientConfig::default())
            .await
            .unwrap();
        let err = client
            .authenticate_publickey("bob", &identity)
            .await
            .unwrap_err();
        assert!(matches!(err, SkiffError::Security(_)));
        client.disconnect().await.unwrap();
    })
    .await
    .unwrap();
    let _ = timeout(TEST_TIMEOUT, server).await;
}

struct TokenAuth;

#[async_trait::async_trait]
impl AuthProvider for TokenAuth {
    fn methods(&self) -> Vec<String> {
        vec!["keyboard-interactive".to_string()]
    }

    async fn ki_start(&self, user: &str, _submethods: &str) -> KiRound {
        if user != "carol" {
            return KiRound::Reject;
        }
        KiRound::Prompts {
            name: "Token".to_string(),
            instruction: "Enter your token".to_string(),
            prompts: vec![InfoPrompt {
                prompt: "Token: ".to_string(),
                echo: false,
            }],
        }
    }

    async fn ki_continue(&self, _user: &str, responses: &[String]) -> KiRound {
        if responses == ["424242"] {
            KiRound::Accept
        } else {
            KiRound::Reject
        }
    }
}

struct FixedAnswers;

#[async_trait::async_trait]
impl skiff_proto::ssh::client::PromptHandler for FixedAnswers {
    async fn answer(
        &self,
        _name: &str,
        _instruction: &str,
        prompts: &[InfoPrompt],
    ) -> SkiffResult<Vec<String>> {
        Ok(prompts.iter().map(|_| "424242".to_string()).collect())
    }
}

#[tokio::test]
async fn test_keyboard_interactive_auth() {
    let (a, b) = pipes();
    let server = serve_session(
        b,
        ServerConfig::default(),
        TokenAuth,
        RecordingHandler::default(),
    )
    .await;

    timeout(TEST_TIMEOUT, async {
        let mut client = SshClient::connect(a, "test.example", ClientConfig::default())
            .await
            .unwrap();
        client
            .authenticate_keyboard_interactive("carol", &FixedAnswers)
            .await
            .unwrap();
        assert!(client.is_authenticated());
        client.disconnect().await.unwrap();
    })
    .await
    .unwrap();

    timeout(TEST_TIMEOUT, server).await.unwrap().unwrap().unwrap();
}

/// Scenario: command execution end to end, stdout, stderr, and exit
/// status all arriving on the session channel.
#[tokio::test]
async fn test_exec_command_output() {
    let (a, b) = pipes();
    let server = serve_session(
        b,
        ServerConfig::default(),
        StaticPasswordAuth::new("alice", "hunter2"),
        RecordingHandler::default(),
    )
    .await;

    timeout(TEST_TIMEOUT, async {
        let mut client = SshClient::connect(a, "test.example", ClientConfig::default())
            .await
            .unwrap();
        client.authenticate_password("alice", "hunter2").await.unwrap();

        let output = client.run_command("uname -a").await.unwrap();
        assert_eq!(output.stdout, b"ran: uname -a");
        assert_eq!(output.stderr, b"warning: test");
        assert_eq!(output.exit_status, Some(0));

        client.disconnect().await.unwrap();
    })
    .await
    .unwrap();

    timeout(TEST_TIMEOUT, server).await.unwrap().unwrap().unwrap();
}

/// Scenario: a tiny remote window (16 bytes, 8-byte max packet) forces
/// chunked, window-paced writes; the server's adjusts unblock them.
#[tokio::test]
async fn test_window_constrained_send() {
    let chunks = Arc::new(Mutex::new(Vec::new()));
    let handler = RecordingHandler {
        data_chunks: chunks.clone(),
    };

    let mut server_config = ServerConfig::default();
    server_config.session.channel_initial_window = 16;
    server_config.session.channel_max_packet = 8;

    let (a, b) = pipes();
    let server = serve_session(
        b,
        server_config,
        StaticPasswordAuth::new("alice", "hunter2"),
        handler,
    )
    .await;

    timeout(TEST_TIMEOUT, async {
        let mut client = SshClient::connect(a, "test.example", ClientConfig::default())
            .await
            .unwrap();
        client.authenticate_password("alice", "hunter2").await.unwrap();

        let id = client.open_session().await.unwrap();
        client.request_shell(id).await.unwrap();
        client.write_data(id, &[0x61; 32]).await.unwrap();
        client.send_eof(id).await.unwrap();
        client.close_channel(id).await.unwrap();
        client.disconnect().await.unwrap();
    })
    .await
    .unwrap();

    timeout(TEST_TIMEOUT, server).await.unwrap().unwrap().unwrap();

    let chunks = chunks.lock().unwrap();
    let total: usize = chunks.iter().map(|c| c.len()).sum();
    assert_eq!(total, 32);
    // Every packet respected the 8-byte maximum.
    assert!(chunks.iter().all(|c| c.len() <= 8));
    assert!(chunks.len() >= 4);
}

/// Scenario: a re-key mid-session leaves channels working and the session
/// id unchanged.
#[tokio::test]
async fn test_rekey_preserves_session() {
    let (a, b) = pipes();
    let server = serve_session(
        b,
        ServerConfig::default(),
        StaticPasswordAuth::new("alice", "hunter2"),
        RecordingHandler::default(),
    )
    .await;

    timeout(TEST_TIMEOUT, async {
        let mut client = SshClient::connect(a, "test.example", ClientConfig::default())
            .await
            .unwrap();
        client.authenticate_password("alice", "hunter2").await.unwrap();

        let sid_before = client.session_id().unwrap();
        client.rekey().await.unwrap();
        let sid_after = client.session_id().unwrap();
        assert_eq!(sid_before, sid_after);

        // Traffic still flows under the new keys.
        let output = client.run_command("echo ok").await.unwrap();
        assert_eq!(output.stdout, b"ran: echo ok");

        client.disconnect().await.unwrap();
    })
    .await
    .unwrap();

    timeout(TEST_TIMEOUT, server).await.unwrap().unwrap().unwrap();
}

/// Scenario: a packet with padding_length 3 draws
/// DISCONNECT(PROTOCOL_ERROR).
#[tokio::test]
async fn test_protocol_error_disconnect_on_bad_padding() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (mut raw, b) = pipes();
    let mut server = SshConnection::new(
        b,
        Role::Server,
        SessionConfig::default(),
        Box::new(OsRandom),
        Box::new(SystemClock),
    );

    timeout(TEST_TIMEOUT, async {
        let (client_side, server_side) = tokio::join!(
            async {
                raw.write_all(b"SSH-2.0-BadPeer_1.0\r\n").await.unwrap();
                // Read the server's identification line.
                let mut byte = [0u8; 1];
                loop {
                    raw.read_exact(&mut byte).await.unwrap();
                    if byte[0] == b'\n' {
                        break;
                    }
                }
                // packet_length = 8, padding_length = 3 (below the minimum
                // of 4).
                let bad = [0u8, 0, 0, 8, 3, 80, 1, 2, 3, 0, 0, 0];
                raw.write_all(&bad).await.unwrap();

                // Expect a plaintext DISCONNECT with reason 2 back.
                let mut codec = skiff_proto::ssh::packet::PacketCodec::new();
                let payload = loop {
                    let mut buf = [0u8; 256];
                    let n = raw.read(&mut buf).await.unwrap();
                    assert!(n > 0, "server closed without DISCONNECT");
                    codec.feed(&buf[..n]).unwrap();
                    if let Some(payload) = codec.next_payload() {
                        break payload;
                    }
                };
                let disconnect =
                    skiff_proto::ssh::message::Disconnect::from_bytes(&payload).unwrap();
                assert_eq!(disconnect.reason, 2);
            },
            async {
                server.exchange_identification().await.unwrap();
                let err = server.next_event().await.unwrap_err();
                let err = server.fail(err).await;
                assert!(matches!(err, SkiffError::Protocol(_)));
            }
        );
        let _ = (client_side, server_side);
    })
    .await
    .unwrap();
}

/// The server refuses unknown channel types and forwarding channels.
#[tokio::test]
async fn test_direct_tcpip_refused_by_default() {
    let (a, b) = pipes();
    let server = serve_session(
        b,
        ServerConfig::default(),
        StaticPasswordAuth::new("alice", "hunter2"),
        RecordingHandler::default(),
    )
    .await;

    timeout(TEST_TIMEOUT, async {
        let mut client = SshClient::connect(a, "test.example", ClientConfig::default())
            .await
            .unwrap();
        client.authenticate_password("alice", "hunter2").await.unwrap();

        let err = client
            .open_direct_tcpip("db.internal", 5432, ("127.0.0.1", 40000))
            .await
            .unwrap_err();
        assert!(matches!(err, SkiffError::Protocol(_)));

        // The session itself is still healthy.
        let id = client.open_session().await.unwrap();
        client.close_channel(id).await.unwrap();
        client.disconnect().await.unwrap();
    })
    .await
    .unwrap();

    timeout(TEST_TIMEOUT, server).await.unwrap().unwrap().unwrap();
}

/// Too many failed attempts end in DISCONNECT(NO_MORE_AUTH_METHODS).
#[tokio::test]
async fn test_auth_attempt_limit() {
    let attempts = Arc::new(AtomicUsize::new(0));

    let (a, b) = pipes();
    let host_keys = test_host_keys();
    let mut server_config = ServerConfig::default();
    server_config.session.max_auth_attempts = 3;
    let server = tokio::spawn(async move {
        let mut session = SshServerSession::handshake(b, server_config, host_keys).await?;
        session
            .authenticate(&StaticPasswordAuth::new("alice", "correct"))
            .await
    });

    let result = timeout(TEST_TIMEOUT, async {
        let mut client = SshClient::connect(a, "test.example", ClientConfig::default())
            .await
            .unwrap();
        for _ in 0..4 {
            attempts.fetch_add(1, Ordering::SeqCst);
            match client.authenticate_password("alice", "wrong").await {
                Err(SkiffError::Security(_)) => continue,
                Err(SkiffError::Disconnected { reason, .. }) => return Some(reason),
                Err(_) => return None,
                Ok(()) => panic!("wrong password accepted"),
            }
        }
        None
    })
    .await
    .unwrap();

    // The third failure triggers the disconnect; the client observes it on
    // that attempt or the next write.
    assert_eq!(result, Some(14));

    let server_result = timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
    assert!(server_result.is_err());
}

/// Global tcpip-forward requests resolve through the handler with ordered
/// replies.
#[tokio::test]
async fn test_global_tcpip_forward() {
    struct ForwardingHandler;
    #[async_trait::async_trait]
    impl SessionHandler for ForwardingHandler {
        async fn tcpip_forward(&mut self, _address: &str, port: u32) -> Option<u32> {
            Some(if port == 0 { 50022 } else { port })
        }
    }

    let (a, b) = pipes();
    let host_keys = test_host_keys();
    let server = tokio::spawn(async move {
        let mut session =
            SshServerSession::handshake(b, ServerConfig::default(), host_keys).await?;
        session
            .authenticate(&StaticPasswordAuth::new("alice", "hunter2"))
            .await?;
        let mut handler = ForwardingHandler;
        session.serve(&mut handler).await
    });

    timeout(TEST_TIMEOUT, async {
        let mut client = SshClient::connect(a, "test.example", ClientConfig::default())
            .await
            .unwrap();
        client.authenticate_password("alice", "hunter2").await.unwrap();

        let bound = client.request_tcpip_forward("0.0.0.0", 0).await.unwrap();
        assert_eq!(bound, 50022);

        let bound = client.request_tcpip_forward("0.0.0.0", 8022).await.unwrap();
        assert_eq!(bound, 8022);

        client.disconnect().await.unwrap();
    })
    .await
    .unwrap();

    timeout(TEST_TIMEOUT, server).await.unwrap().unwrap().unwrap();
}
