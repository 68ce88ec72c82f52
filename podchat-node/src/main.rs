// podchat: chat with whoever else runs podchat on the same port. One node hosts;
// the rest connect to it and take over if it leaves.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use podchat_core::{Peer, PeerId, BROADCAST_ID};
use podchat_node::{config, Coordinator, CoordinatorOptions};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "podchat", version, about = "LAN chat with automatic host failover")]
struct Cli {
    /// Port shared by every participant.
    #[arg(long)]
    port: Option<u16>,
    /// Address to try when no previous peer is hosting.
    #[arg(long)]
    host: Option<String>,
    /// Display name (default "Anonymous").
    #[arg(long)]
    name: Option<String>,
    /// Config file instead of the standard locations.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut cfg = config::load(cli.config.as_deref());
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if cli.host.is_some() {
        cfg.host = cli.host;
    }
    if cli.name.is_some() {
        cfg.name = cli.name;
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), port = cfg.port, "podchat starting");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg.options()))
}

async fn run(options: CoordinatorOptions) -> anyhow::Result<()> {
    let coordinator = Coordinator::new(options);
    print_events(coordinator.on_peer_connected(), |p| {
        format!("* {} joined", label(&p))
    });
    print_events(coordinator.on_peer_disconnected(), |p| {
        format!("* {} left", label(&p))
    });
    print_events(coordinator.on_message_received(), |m| {
        let to = if m.message.is_broadcast() { "" } else { " (private)" };
        format!("<{}>{} {}", m.from.name(), to, m.message.text)
    });

    coordinator
        .begin()
        .await
        .context("could not host or join a chat")?;

    let outcome = tokio::select! {
        r = chat(&coordinator) => r,
        r = shutdown_signal() => r,
    };
    coordinator.dispose().await;
    outcome
}

/// Read stdin until EOF or /quit.
async fn chat(coordinator: &Coordinator) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            None => {}
            Some(Command::Quit) => break,
            Some(Command::Peers) => {
                for p in coordinator.peers() {
                    println!("  {} [{}] {:?}", label(&p), p.address(), p.status());
                }
            }
            Some(Command::To { name, text }) => match find_peer(&coordinator.peers(), name) {
                Some(id) => deliver(coordinator, id, text).await,
                None => println!("! no peer named {}", name),
            },
            Some(Command::Say(text)) => deliver(coordinator, BROADCAST_ID, text).await,
        }
    }
    Ok(())
}

async fn deliver(coordinator: &Coordinator, recipient: PeerId, text: &str) {
    if !coordinator.send_sync(recipient, text).await {
        println!("! not delivered: {}", text);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Quit,
    Peers,
    To { name: &'a str, text: &'a str },
    Say(&'a str),
}

fn parse_command(line: &str) -> Option<Command<'_>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match line {
        "/quit" => return Some(Command::Quit),
        "/peers" => return Some(Command::Peers),
        _ => {}
    }
    if let Some(rest) = line.strip_prefix("/to ") {
        let (name, text) = rest.trim_start().split_once(' ')?;
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        return Some(Command::To { name, text });
    }
    Some(Command::Say(line))
}

fn find_peer(peers: &[Peer], name: &str) -> Option<PeerId> {
    peers
        .iter()
        .find(|p| p.is_connected() && p.name() == name)
        .map(|p| p.id())
}

fn label(peer: &Peer) -> String {
    if peer.is_host() {
        format!("{} (host)", peer.name())
    } else {
        peer.name().to_string()
    }
}

fn print_events<T, F>(mut rx: broadcast::Receiver<T>, render: F)
where
    T: Clone + Send + 'static,
    F: Fn(T) -> String + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => println!("{}", render(event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event output fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    tracing::info!("shutting down");
    Ok(())
}
