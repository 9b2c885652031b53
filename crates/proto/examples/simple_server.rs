//! Minimal SSH server: accepts one connection on port 2222, authenticates
//! `demo`/`demo`, and answers exec requests.
//!
//! ```text
//! cargo run --example simple_server
//! ssh -p 2222 demo@127.0.0.1 uname
//! ```

use skiff_platform::{OsRandom, SkiffResult};
use skiff_proto::ssh::hostkey::{Ed25519HostKey, HostKey};
use skiff_proto::ssh::server::{
    ExecOutcome, ServerConfig, SessionHandler, SshServerSession, StaticPasswordAuth,
};
use std::sync::Arc;

struct DemoHandler;

#[async_trait::async_trait]
impl SessionHandler for DemoHandler {
    async fn exec(&mut self, command: &str) -> Option<ExecOutcome> {
        Some(ExecOutcome {
            stdout: format!("demo server executed: {}\n", command).into_bytes(),
            stderr: Vec::new(),
            exit_status: 0,
        })
    }

    async fn data(&mut self, _channel: u32, data: &[u8]) -> SkiffResult<Vec<u8>> {
        // Echo shell.
        Ok(data.to_vec())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate(&mut OsRandom));
    println!("host key fingerprint: {}", host_key.fingerprint());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:2222").await?;
    println!("listening on 127.0.0.1:2222 (demo/demo)");

    loop {
        let (stream, addr) = listener.accept().await?;
        println!("connection from {}", addr);
        let host_keys = vec![host_key.clone()];
        tokio::spawn(async move {
            let result = async {
                let mut session =
                    SshServerSession::handshake(stream, ServerConfig::default(), host_keys)
                        .await?;
                let user = session
                    .authenticate(&StaticPasswordAuth::new("demo", "demo"))
                    .await?;
                println!("{} authenticated as {}", addr, user);
                session.serve(&mut DemoHandler).await
            }
            .await;
            if let Err(err) = result {
                eprintln!("session {} ended: {}", addr, err);
            }
        });
    }
}
