// OCFT reference node: a line-oriented text channel on stdin/stdout around the transfer engine.
//
// Each stdin line is either `<peer-id> <text>` (text received from that peer) or a command:
//   /send <peer-id> <path>      /accept <transfer-id> [resume-from]
//   /reject <transfer-id> [reason]   /resume <transfer-id>   /cancel <transfer-id>
//   /list   /secret
// Text the engine sends is written to stdout as `<peer-id> <text>`. Logs go to stderr.

mod config;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use ocft_core::{
    generate_secret, EventSink, LocalFileStore, OutboundText, TransferEngine, TransferEvent,
    Transport, TransportError,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: ocft-node [--config <path>] [-v...] [--version]";

struct Args {
    config: Option<PathBuf>,
    verbosity: u8,
}

/// `None` when the invocation only asked for version or help.
fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Option<Args>> {
    let mut out = Args {
        config: None,
        verbosity: 1,
    };
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("ocft-node {}", VERSION);
                return Ok(None);
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(None);
            }
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                out.config = Some(PathBuf::from(path));
            }
            s if s.len() > 1 && s.starts_with('-') && s[1..].chars().all(|c| c == 'v') => {
                out.verbosity = out.verbosity.saturating_add((s.len() - 1) as u8);
            }
            other => bail!("unexpected argument {other:?}\n{USAGE}"),
        }
    }
    Ok(Some(out))
}

/// Engine output, queued for the stdout writer.
struct ChannelTransport(mpsc::UnboundedSender<OutboundText>);

impl Transport for ChannelTransport {
    fn send_text(&self, peer_id: &str, text: &str) -> Result<(), TransportError> {
        self.0
            .send(OutboundText {
                peer_id: peer_id.to_string(),
                text: text.to_string(),
            })
            .map_err(|_| TransportError::Closed)
    }
}

struct ChannelSink(mpsc::UnboundedSender<TransferEvent>);

impl EventSink for ChannelSink {
    fn emit(&self, event: TransferEvent) {
        let _ = self.0.send(event);
    }
}

fn main() -> anyhow::Result<()> {
    let Some(args) = parse_args(std::env::args().skip(1))? else {
        return Ok(());
    };
    logging::init(args.verbosity)?;
    let cfg = config::load(args.config.as_deref())?;
    let trust = cfg.trust_store();
    tracing::info!(
        node_id = %cfg.node.node_id,
        download_dir = %cfg.node.download_dir.display(),
        trusted_peers = cfg.trusted_peers.len(),
        "starting ocft-node"
    );

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let engine = TransferEngine::new(cfg.node, ChannelTransport(out_tx), LocalFileStore)
        .with_trust_store(trust)
        .with_events(ChannelSink(event_tx));
    let engine = Arc::new(Mutex::new(engine));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let writer = tokio::spawn(write_outbound(out_rx));
        tokio::spawn(log_events(event_rx));
        tokio::select! {
            r = read_input(engine) => r?,
            r = shutdown_signal() => r?,
        }
        // The engine is gone, so the writer drains what is queued and stops.
        writer.await??;
        Ok::<(), anyhow::Error>(())
    })
}

async fn read_input(engine: Arc<Mutex<TransferEngine>>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let result = match Input::parse(line) {
            Ok(input) => run(&mut *engine.lock().await, input),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!("{e:#}");
        }
    }
    tracing::info!("input closed");
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    /// Text that arrived from a peer on the channel.
    Received { peer: &'a str, text: &'a str },
    Send { peer: &'a str, path: &'a str },
    Accept { id: &'a str, resume_from: Option<u32> },
    Reject { id: &'a str, reason: &'a str },
    Resume { id: &'a str },
    Cancel { id: &'a str },
    List,
    Secret,
}

impl<'a> Input<'a> {
    fn parse(line: &'a str) -> anyhow::Result<Self> {
        let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        if !head.starts_with('/') {
            if rest.is_empty() {
                bail!("expected `<peer-id> <text>` or a /command");
            }
            return Ok(Input::Received {
                peer: head,
                text: rest,
            });
        }
        let (arg, tail) = rest.split_once(' ').unwrap_or((rest, ""));
        let tail = tail.trim();
        let need_arg = |what: &str| -> anyhow::Result<&'a str> {
            if arg.is_empty() {
                bail!("{head} needs {what}");
            }
            Ok(arg)
        };
        Ok(match head {
            "/send" => {
                let peer = need_arg("a peer id and a path")?;
                if tail.is_empty() {
                    bail!("/send needs a path");
                }
                Input::Send { peer, path: tail }
            }
            "/accept" => Input::Accept {
                id: need_arg("a transfer id")?,
                resume_from: match tail {
                    "" => None,
                    n => Some(n.parse().with_context(|| format!("bad resume index {n:?}"))?),
                },
            },
            "/reject" => Input::Reject {
                id: need_arg("a transfer id")?,
                reason: if tail.is_empty() { "Rejected by user" } else { tail },
            },
            "/resume" => Input::Resume {
                id: need_arg("a transfer id")?,
            },
            "/cancel" => Input::Cancel {
                id: need_arg("a transfer id")?,
            },
            "/list" => Input::List,
            "/secret" => Input::Secret,
            other => bail!("unknown command {other}"),
        })
    }
}

fn run(engine: &mut TransferEngine, input: Input<'_>) -> anyhow::Result<()> {
    match input {
        Input::Received { peer, text } => {
            if !engine.handle_message(peer, text) {
                tracing::info!(peer, text, "chat message");
            }
        }
        Input::Send { peer, path } => {
            let id = engine
                .send_file(peer, path)
                .with_context(|| format!("sending {path} to {peer}"))?;
            tracing::info!(transfer_id = %id, "offer queued");
        }
        Input::Accept { id, resume_from } => {
            let start = engine.accept_transfer(id, resume_from)?;
            if resume_from.is_some_and(|i| i != start) {
                tracing::warn!(transfer_id = %id, start, "no chunks kept, accepting from 0");
            }
        }
        Input::Reject { id, reason } => engine.reject_transfer(id, reason)?,
        Input::Resume { id } => {
            engine.resume_transfer(id)?;
        }
        Input::Cancel { id } => engine.cancel_transfer(id)?,
        Input::List => {
            let mut transfers: Vec<_> = engine.transfers().collect();
            transfers.sort_by_key(|t| t.started_at);
            for t in transfers {
                tracing::info!(
                    transfer_id = %t.id,
                    direction = ?t.direction,
                    peer = %t.peer_id,
                    file = %t.filename,
                    state = %t.state,
                    progress = t.progress(),
                    "transfer"
                );
            }
        }
        Input::Secret => tracing::info!(secret = %generate_secret(), "generated secret"),
    }
    Ok(())
}

async fn write_outbound(mut rx: mpsc::UnboundedReceiver<OutboundText>) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(out) = rx.recv().await {
        stdout
            .write_all(format!("{} {}\n", out.peer_id, out.text).as_bytes())
            .await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn log_events(mut rx: mpsc::UnboundedReceiver<TransferEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            TransferEvent::OfferReceived(t) => tracing::info!(
                transfer_id = %t.id,
                peer = %t.peer_id,
                file = %t.filename,
                size = t.size,
                "incoming offer (/accept or /reject)"
            ),
            TransferEvent::Completed(t) => {
                let path = t.local_path.as_deref().map(|p| p.display().to_string());
                tracing::info!(
                    transfer_id = %t.id,
                    path = %path.unwrap_or_default(),
                    "transfer complete"
                )
            }
            TransferEvent::Failed { info, error } => {
                tracing::warn!(transfer_id = %info.id, %error, "transfer failed")
            }
            TransferEvent::Rejected { info, reason } => {
                tracing::info!(transfer_id = %info.id, %reason, "transfer rejected")
            }
            TransferEvent::ChunkReceived {
                transfer_id,
                index,
                progress,
            } => tracing::debug!(%transfer_id, index, progress, "chunk received"),
            other => tracing::debug!(transfer_id = other.transfer_id(), ?other, "event"),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
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
