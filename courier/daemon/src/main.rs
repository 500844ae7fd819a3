//! Courier Daemon - Transport Node
//!
//! Runs one courier transport instance: opens a UDP conduit, publishes
//! its address through a filesystem rendezvous directory, prints every
//! inbound message, and can fire test sends at peers on the same host.
//!
//! # Usage
//!
//! ```bash
//! # Terminal 1: listen as process 1.0
//! courier-daemon --name 1.0
//!
//! # Terminal 2: run as 1.1 and send a tagged message to 1.0
//! courier-daemon --name 1.1 --send 1.0:7:ping
//!
//! # In-process loopback self-test (no sockets, no rendezvous files)
//! courier-daemon --name 1.0 --self-test
//!
//! # Verbose logging
//! RUST_LOG=debug courier-daemon --name 1.0
//! ```
//!
//! # Signals
//!
//! `SIGTERM` / `SIGINT`: close every conduit and exit. Outstanding sends
//! are abandoned.

use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use courier_core::fabric::loopback::{LoopbackNetwork, LoopbackProvider};
use courier_core::fabric::udp::UdpProvider;
use courier_core::fabric::FabricProvider;
use courier_core::rendezvous::{FileRendezvous, InMemoryRendezvous, Rendezvous};
use courier_core::{Courier, CourierConfig, Payload, ProcessName, SendStatus, Tag};

/// Courier Daemon - fabric conduit transport node
#[derive(Parser, Debug)]
#[command(name = "courier-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local process name as <job>.<rank>
    #[arg(short = 'n', long, env = "COURIER_NAME")]
    name: ProcessName,

    /// Rendezvous directory shared by processes on this host
    #[arg(
        short = 'r',
        long,
        env = "COURIER_RENDEZVOUS_DIR",
        default_value = "/tmp/courier-rendezvous"
    )]
    rendezvous_dir: PathBuf,

    /// Bind address for the UDP conduit (port 0 = ephemeral)
    #[arg(short = 'b', long, env = "COURIER_BIND", default_value = "127.0.0.1:0")]
    bind: SocketAddrV4,

    /// Fire one test send: <job>.<rank>:<tag>:<text>
    #[arg(short = 's', long, value_name = "PEER:TAG:TEXT")]
    send: Vec<String>,

    /// Run a two-node in-process loopback self-test and exit
    #[arg(long)]
    self_test: bool,

    /// Exit after the sends complete instead of listening
    #[arg(long)]
    oneshot: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "COURIER_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("courier_daemon={level},courier_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// One parsed `--send` request.
struct SendSpec {
    peer: ProcessName,
    tag: Tag,
    text: String,
}

fn parse_send_spec(spec: &str) -> Result<SendSpec> {
    let mut parts = spec.splitn(3, ':');
    let peer = parts
        .next()
        .context("missing peer in send spec")?
        .parse::<ProcessName>()
        .context("peer must be <job>.<rank>")?;
    let tag: u32 = parts
        .next()
        .context("missing tag in send spec")?
        .parse()
        .context("tag must be an integer")?;
    let text = parts.next().context("missing text in send spec")?;
    Ok(SendSpec {
        peer,
        tag: Tag(tag),
        text: text.to_string(),
    })
}

/// Fire one send and wait for its terminal notification.
async fn run_send(courier: &Courier, spec: &SendSpec) -> Result<()> {
    let (done_tx, done_rx) = oneshot::channel();
    courier
        .messenger()
        .send_async(
            0,
            spec.peer,
            spec.tag,
            Payload::Single(spec.text.clone().into_bytes()),
            done_tx,
        )
        .with_context(|| format!("send to {} rejected", spec.peer))?;

    let outcome = tokio::time::timeout(Duration::from_secs(10), done_rx)
        .await
        .context("send completion timed out")?
        .context("transport stopped before completing the send")?;

    match outcome.status {
        SendStatus::Success => {
            info!(peer = %spec.peer, tag = %spec.tag, seq = outcome.record.seq, "send delivered");
            Ok(())
        }
        status => anyhow::bail!("send to {} failed: {status:?}", spec.peer),
    }
}

/// Two in-process nodes over a loopback network exchange a ping; proves
/// the stack end to end without sockets or rendezvous files.
async fn run_self_test(config: CourierConfig) -> Result<()> {
    let network = LoopbackNetwork::new();
    let rendezvous = Arc::new(InMemoryRendezvous::new());

    let a_name = ProcessName::new(1, 0);
    let b_name = ProcessName::new(1, 1);

    let providers_a: Vec<Box<dyn FabricProvider>> =
        vec![Box::new(LoopbackProvider::new("lo-a", network.clone()))];
    let (a, _a_inbound) = Courier::open(
        config.clone(),
        a_name,
        providers_a,
        Arc::clone(&rendezvous) as Arc<dyn Rendezvous>,
    )
    .await
    .context("node A failed to open")?;

    let providers_b: Vec<Box<dyn FabricProvider>> =
        vec![Box::new(LoopbackProvider::new("lo-b", network.clone()))];
    let (b, mut b_inbound) = Courier::open(
        config,
        b_name,
        providers_b,
        Arc::clone(&rendezvous) as Arc<dyn Rendezvous>,
    )
    .await
    .context("node B failed to open")?;

    run_send(
        &a,
        &SendSpec {
            peer: b_name,
            tag: Tag(7),
            text: "ping".to_string(),
        },
    )
    .await?;

    let message = tokio::time::timeout(Duration::from_secs(10), b_inbound.recv())
        .await
        .context("self-test delivery timed out")?
        .context("node B transport stopped")?;
    anyhow::ensure!(message.origin == a_name, "unexpected origin");
    anyhow::ensure!(message.payload == b"ping", "payload mismatch");

    info!(
        origin = %message.origin,
        tag = %message.tag,
        seq = message.seq,
        "self-test message delivered"
    );
    a.shutdown().await;
    b.shutdown().await;
    info!("self-test passed");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("Courier daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(name = %args.name, "local process name");

    let config = CourierConfig::from_env();

    if args.self_test {
        return run_self_test(config).await;
    }

    let rendezvous = Arc::new(FileRendezvous::new(&args.rendezvous_dir));
    info!(dir = ?args.rendezvous_dir, "rendezvous directory");

    let providers: Vec<Box<dyn FabricProvider>> =
        vec![Box::new(UdpProvider::new("udp0", args.bind))];
    let (courier, mut inbound) = Courier::open(
        config,
        args.name,
        providers,
        rendezvous as Arc<dyn Rendezvous>,
    )
    .await
    .context("failed to open any conduit")?;

    for info in courier.messenger().conduits() {
        info!(
            conduit_id = info.conduit_id,
            provider = %info.provider_name,
            protocol = %info.protocol,
            "conduit available"
        );
    }

    let sends = args
        .send
        .iter()
        .map(|spec| parse_send_spec(spec))
        .collect::<Result<Vec<_>>>()?;
    for spec in &sends {
        if let Err(e) = run_send(&courier, spec).await {
            error!(error = %e, "test send failed");
        }
    }

    if args.oneshot {
        courier.shutdown().await;
        info!("courier daemon stopped cleanly");
        return Ok(());
    }

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;

    loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => {
                    info!(
                        origin = %message.origin,
                        tag = %message.tag,
                        seq = message.seq,
                        len = message.payload.len(),
                        payload = %String::from_utf8_lossy(&message.payload),
                        "message received"
                    );
                }
                None => {
                    warn!("transport stopped delivering; shutting down");
                    break;
                }
            },
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            }
        }
    }

    courier.shutdown().await;
    info!("courier daemon stopped cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send_spec() {
        let spec = parse_send_spec("2.3:7:hello world").unwrap();
        assert_eq!(spec.peer, ProcessName::new(2, 3));
        assert_eq!(spec.tag, Tag(7));
        assert_eq!(spec.text, "hello world");
    }

    #[test]
    fn test_parse_send_spec_allows_colons_in_text() {
        let spec = parse_send_spec("1.0:5:a:b:c").unwrap();
        assert_eq!(spec.text, "a:b:c");
    }

    #[test]
    fn test_parse_send_spec_rejects_garbage() {
        assert!(parse_send_spec("nope").is_err());
        assert!(parse_send_spec("1.0:x:text").is_err());
    }
}
