//! Minimal SSH client: connects, authenticates with a password, runs one
//! command, and prints its output.
//!
//! ```text
//! cargo run --example simple_client -- 127.0.0.1:2222 demo demo uname
//! ```

use skiff_proto::ssh::client::{ClientConfig, SshClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:2222".to_string());
    let user = args.next().unwrap_or_else(|| "demo".to_string());
    let password = args.next().unwrap_or_else(|| "demo".to_string());
    let command = args.next().unwrap_or_else(|| "uname -a".to_string());

    let stream = tokio::net::TcpStream::connect(&addr).await?;
    let host = addr.split(':').next().unwrap_or(&addr).to_string();

    // The default config accepts any host key; wire a real verifier for
    // anything beyond experiments.
    let mut client = SshClient::connect(stream, &host, ClientConfig::default()).await?;
    println!("connected to {}", client.server_version());

    client.authenticate_password(&user, &password).await?;
    println!("authenticated as {}", user);

    let output = client.run_command(&command).await?;
    print!("{}", String::from_utf8_lossy(&output.stdout));
    if !output.stderr.is_empty() {
        eprint!("{}", String::from_utf8_lossy(&output.stderr));
    }
    if let Some(status) = output.exit_status {
        println!("exit status: {}", status);
    }

    client.disconnect().await?;
    Ok(())
}
