//! # dgxfer-node
//!
//! Minimal UDP node for moving one file into a peer's memory.
//!
//! ## Usage
//!
//! ```bash
//! # Receiver: prints its endpoint string, waits for one transfer
//! dgxfer-node listen --bind 127.0.0.1:5000 --size 1048576 --output received.bin
//!
//! # Sender: copies a file into the listener's memory, then the length flag
//! dgxfer-node put --peer "udp-dgram:127.0.0.1;5000;1048576.0.4" --file data.bin
//! ```
//!
//! The listener's last 4 bytes of memory are the completion flag; the sender
//! writes the file length there once the whole file has landed at offset 0.
//! Files larger than one request can carry go over in several requests, each
//! finishing with a progress word in the 4 bytes before the flag.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context};
use clap::{Parser, Subcommand};
use dgxfer::transport::UDP_PROTOCOL;
use dgxfer::wire::align8;
use dgxfer::{CompletionStatus, CopyKind, EndPoint, LocalEndpoint, UdpTransport, XferConfig};

/// Reliable datagram put node.
#[derive(Parser, Debug)]
#[command(name = "dgxfer-node", about = "Reliable put-with-completion over UDP")]
struct Cli {
    /// TOML file with timer and limit overrides.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wait for one transfer and write what arrived.
    Listen {
        #[arg(long, default_value = "127.0.0.1:5000")]
        bind: SocketAddr,

        #[arg(long, default_value_t = 0)]
        mailbox: u16,

        #[arg(long, default_value_t = 4)]
        max_mailbox: u16,

        /// Memory size exposed to peers, in bytes.
        #[arg(long, default_value_t = 1 << 20)]
        size: u32,

        /// Where to write the received bytes. Logged only when absent.
        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },
    /// Copy a file into a listening peer.
    Put {
        #[arg(long, default_value = "127.0.0.1:0")]
        bind: SocketAddr,

        #[arg(long, default_value_t = 1)]
        mailbox: u16,

        /// Peer endpoint string as printed by `listen`.
        #[arg(long)]
        peer: String,

        #[arg(long)]
        file: PathBuf,

        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();

    // ── Config ──────────────────────────────────────────────────
    let config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            XferConfig::from_toml_str(&text)?
        }
        None => XferConfig::default(),
    };

    match cli.command {
        Command::Listen {
            bind,
            mailbox,
            max_mailbox,
            size,
            output,
            timeout_secs,
        } => listen(
            config,
            bind,
            EndPoint::new(UDP_PROTOCOL, "", size, mailbox, max_mailbox),
            output,
            Duration::from_secs(timeout_secs),
        ),
        Command::Put {
            bind,
            mailbox,
            peer,
            file,
            timeout_secs,
        } => put(
            config,
            bind,
            mailbox,
            EndPoint::parse(&peer)?,
            file,
            Duration::from_secs(timeout_secs),
        ),
    }
}

fn listen(
    config: XferConfig,
    bind: SocketAddr,
    endpoint: EndPoint,
    output: Option<PathBuf>,
    timeout: Duration,
) -> anyhow::Result<()> {
    ensure!(endpoint.size >= 8, "memory size must be at least 8 bytes");
    let transport = Arc::new(UdpTransport::bind(bind)?);
    let node = LocalEndpoint::start(endpoint, transport, config.clone())?;
    println!("{}", node.endpoint());

    let memory = node.memory().clone();
    let flag_offset = memory.len() - 4;
    let deadline = quanta::Instant::now() + timeout;
    let len = loop {
        let flag = memory.read_u32(flag_offset)?;
        if flag != 0 {
            break flag as usize;
        }
        if quanta::Instant::now() >= deadline {
            bail!("no transfer within {:?}", timeout);
        }
        std::thread::sleep(Duration::from_millis(5));
    };
    let data = memory.read(0, len)?;
    tracing::info!(bytes = len, "transfer complete");

    match output {
        Some(path) => {
            std::fs::write(&path, &data).with_context(|| format!("writing {}", path.display()))?;
            tracing::info!(path = %path.display(), "output written");
        }
        None => tracing::info!(head = ?&data[..data.len().min(32)], "received"),
    }

    // Stay up until the sender has our ACKs and says goodbye.
    let linger = quanta::Instant::now() + config.retransmit_timeout * 10;
    while !node.connections().is_empty() && quanta::Instant::now() < linger {
        for services in node.connections() {
            let stats = serde_json::to_string(&services.stats())?;
            tracing::debug!(mailbox = services.remote_mailbox(), %stats, "connection stats");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    println!("{}", serde_json::to_string_pretty(&node.stats())?);
    node.shutdown();
    Ok(())
}

fn put(
    config: XferConfig,
    bind: SocketAddr,
    mailbox: u16,
    peer: EndPoint,
    file: PathBuf,
    timeout: Duration,
) -> anyhow::Result<()> {
    let data = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
    ensure!(!data.is_empty(), "{} is empty", file.display());
    ensure!(
        data.len() + 8 <= peer.size as usize,
        "{} bytes do not fit in peer memory of {}",
        data.len(),
        peer.size
    );

    // Local layout: file at 0, then the length flag and the progress word.
    let len_src = align8(data.len());
    let progress_src = len_src + 4;
    let endpoint = EndPoint::new(
        UDP_PROTOCOL,
        "",
        (len_src + 8) as u32,
        mailbox,
        peer.max_mailbox,
    );
    let transport = Arc::new(UdpTransport::bind(bind)?);
    let node = LocalEndpoint::start(endpoint, transport, config)?;
    node.memory().write(0, &data)?;
    node.memory().write_u32(len_src, data.len() as u32)?;

    let services = node.connect(&peer)?;
    let step = services.max_transaction_bytes().min(u32::MAX as u64) as usize;
    ensure!(step > 0, "frame budget leaves no room for payload");
    tracing::info!(
        peer = %peer,
        bytes = data.len(),
        requests = data.len().div_ceil(step) + 1,
        "transfer starting"
    );

    let mut status = CompletionStatus::CompleteSuccess;
    for start in (0..data.len()).step_by(step) {
        let end = (start + step).min(data.len());
        node.memory().write_u32(progress_src, end as u32)?;
        let mut req = node.request(&peer)?;
        req.copy(start as u32, start as u32, (end - start) as u32, CopyKind::Data)?
            .copy(progress_src as u32, peer.size - 8, 4, CopyKind::Flag)?;
        req.post()?;
        status = req.wait(timeout);
        tracing::debug!(start, end, messages = req.message_count(), ?status, "chunk finished");
        if status != CompletionStatus::CompleteSuccess {
            break;
        }
    }
    if status == CompletionStatus::CompleteSuccess {
        let mut done = node.request(&peer)?;
        done.copy(len_src as u32, peer.size - 4, 4, CopyKind::Flag)?;
        done.post()?;
        status = done.wait(timeout);
    }

    let stats = services.stats();
    tracing::info!(
        ?status,
        retransmissions = stats.retransmissions,
        frames_sent = stats.frames_sent,
        "transfer finished"
    );
    node.disconnect(peer.mailbox)?;
    node.shutdown();

    match status {
        CompletionStatus::CompleteSuccess => Ok(()),
        CompletionStatus::Failed => bail!("transfer failed: peer stopped acknowledging"),
        CompletionStatus::Pending => bail!("transfer still pending after {:?}", timeout),
    }
}
