//! Connect to one DC, negotiate an auth key and ping it.
//!
//! # What this does
//!
//! 1. Loads `connect.session` if present, otherwise runs the key exchange
//! 2. Sends a few `ping` calls concurrently over the encrypted session
//! 3. Saves the session so the next run skips the handshake
//!
//! # Run
//! ```text
//! RUST_LOG=info cargo run -p ferry-connect -- [dc_id] [host:port] [transport]
//! ```
//!
//! `transport` is one of `abridged`, `intermediate`, `padded`, `full`,
//! `obfuscated`. Without arguments the production DC2 is used.

use std::time::{Duration, Instant};

use ferry_client::{BinaryFileBackend, Client, Config, TransportKind};
use ferry_tl::mtproto::Ping;

fn transport(name: &str) -> Option<TransportKind> {
    Some(match name {
        "abridged"     => TransportKind::Abridged,
        "intermediate" => TransportKind::Intermediate,
        "padded"       => TransportKind::PaddedIntermediate,
        "full"         => TransportKind::Full,
        "obfuscated"   => TransportKind::Obfuscated { secret: None },
        _ => return None,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config = Config {
        session_backend: std::sync::Arc::new(BinaryFileBackend::new("connect.session")),
        request_timeout: Some(Duration::from_secs(30)),
        ..Default::default()
    };
    if let Some(dc) = args.first() {
        config.home_dc_id = dc.parse()?;
    }
    if let Some(addr) = args.get(1) {
        config.dc_addresses.insert(config.home_dc_id, addr.clone());
    }
    if let Some(name) = args.get(2) {
        config.transport = transport(name).ok_or_else(|| format!("unknown transport {name:?}"))?;
    }

    println!("Connecting to DC{} …", config.home_dc_id);
    let client = Client::connect(config).await?;

    let started = Instant::now();
    let pong = client.invoke(&Ping { ping_id: 1 }).await?;
    println!("✓ first pong (ping_id={}) after {:?}", pong.ping_id, started.elapsed());

    let handles: Vec<_> = (2..=5).map(|id| client.call(&Ping { ping_id: id })).collect();
    for handle in handles {
        let pong = handle.await?;
        println!("  pong {} for msg {}", pong.ping_id, pong.msg_id);
    }

    let home = client.home_dc_id().await;
    println!("state: {:?}", client.connection_state(home).await);

    client.save_session().await?;
    client.disconnect().await;
    println!("✓ session saved to connect.session");
    Ok(())
}
