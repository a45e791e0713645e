// lanchat-linux: LAN chat daemon with a line-oriented terminal front end.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use lanchat_core::PeerIdentity;
use lanchat_linux::store::{Record, RecordBody};
use lanchat_linux::{config, Engine, Event, PurgeThreshold};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const HELP: &str = "\
commands:
  /peers                 list peers
  /open <n>              open the chat with peer n (plain lines go to it)
  /msg <n> <text>        send a message
  /send <n> <path>       send a file
  /history <n>           show the conversation with peer n
  /save <stored> <dest>  copy a received file out of the history store
  /name <new>            change your display name
  /avatar <path|clear>   change your avatar
  /purge <days|all>      delete history older than <days> days, or everything
  /quit";

enum Flow {
    Continue,
    Quit,
}

#[tokio::main]
async fn main() -> Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("lanchat-linux {}", VERSION);
            return Ok(());
        }
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,lanchat_linux=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load();
    let (engine, events) = Engine::start(cfg).await.context("starting engine")?;
    let printer = tokio::spawn(print_events(events));
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            r = &mut shutdown => {
                r?;
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                match run_command(&engine, line.trim()).await {
                    Ok(Flow::Quit) => break,
                    Ok(Flow::Continue) => {}
                    Err(e) => eprintln!("error: {e:#}"),
                }
            }
        }
    }

    engine.shutdown().await;
    printer.abort();
    Ok(())
}

async fn run_command(engine: &Engine, line: &str) -> Result<Flow> {
    if line.is_empty() {
        return Ok(Flow::Continue);
    }
    if !line.starts_with('/') {
        let Some(key) = engine.selected_peer().await else {
            bail!("no chat open; use /open <n>");
        };
        engine.send_text(&key, line).await?;
        return Ok(Flow::Continue);
    }
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match cmd {
        "/quit" | "/exit" => return Ok(Flow::Quit),
        "/help" => println!("{HELP}"),
        "/peers" => {
            let peers = engine.peers();
            if peers.is_empty() {
                println!("no peers yet");
            }
            for (i, p) in peers.iter().enumerate() {
                println!(
                    "{:>3}. {} ({}) {}:{}{}{}",
                    i + 1,
                    p.name,
                    p.key,
                    p.ip,
                    p.port,
                    if p.online { "" } else { " offline" },
                    if p.unread > 0 {
                        format!(" [{} unread]", p.unread)
                    } else {
                        String::new()
                    }
                );
            }
        }
        "/open" => {
            let peer = peer_at(engine, rest)?;
            engine.select_peer(&peer.key).await?;
            println!("chatting with {}", peer.name);
            print_history(&engine.load_history(&peer.key).await?);
        }
        "/msg" => {
            let (n, text) = rest.split_once(' ').context("usage: /msg <n> <text>")?;
            let peer = peer_at(engine, n)?;
            engine.send_text(&peer.key, text.trim()).await?;
        }
        "/send" => {
            let (n, path) = rest.split_once(' ').context("usage: /send <n> <path>")?;
            let peer = peer_at(engine, n)?;
            engine.send_file(&peer.key, Path::new(path.trim())).await?;
        }
        "/history" => {
            let peer = peer_at(engine, rest)?;
            print_history(&engine.load_history(&peer.key).await?);
        }
        "/save" => {
            let (stored, dest) = rest
                .split_once(' ')
                .context("usage: /save <stored> <dest>")?;
            let dest = engine
                .save_received_file(Path::new(stored), &PathBuf::from(dest.trim()))
                .await?;
            println!("saved to {}", dest.display());
        }
        "/name" => engine.change_local_name(rest).await?,
        "/avatar" => {
            let avatar = match rest {
                "" => bail!("usage: /avatar <path|clear>"),
                "clear" => Vec::new(),
                path => tokio::fs::read(path)
                    .await
                    .with_context(|| format!("reading {path}"))?,
            };
            engine.change_local_avatar(avatar).await?;
        }
        "/purge" => {
            let threshold = match rest {
                "all" => PurgeThreshold::All,
                days => PurgeThreshold::OlderThanDays(
                    days.parse().context("usage: /purge <days|all>")?,
                ),
            };
            let report = engine.purge_history(threshold).await?;
            println!(
                "removed {} records and {} files",
                report.records_removed, report.files_removed
            );
        }
        other => bail!("unknown command {other}; /help lists them"),
    }
    Ok(Flow::Continue)
}

/// Peer by its 1-based position in the `/peers` listing.
fn peer_at(engine: &Engine, arg: &str) -> Result<PeerIdentity> {
    let n: usize = arg.trim().parse().context("expected a peer number")?;
    let peers = engine.peers();
    match n.checked_sub(1).and_then(|i| peers.into_iter().nth(i)) {
        Some(p) => Ok(p),
        None => bail!("no peer {n}; see /peers"),
    }
}

fn clock(ts_ms: u64) -> String {
    let secs = (ts_ms / 1000) % 86_400;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

fn print_history(records: &[Record]) {
    for r in records {
        let arrow = if r.sent { ">" } else { "<" };
        match &r.body {
            RecordBody::Text { content } => {
                println!("[{}] {} {}: {}", clock(r.timestamp), arrow, r.sender_name, content)
            }
            RecordBody::File { filename, path } => println!(
                "[{}] {} {}: file {} ({})",
                clock(r.timestamp),
                arrow,
                r.sender_name,
                filename,
                path.display()
            ),
        }
    }
}

async fn print_events(mut events: UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        match event {
            Event::PeerAdded(p) => println!("* {} joined ({})", p.name, p.ip),
            Event::PeerUpdated(p) => {
                println!("* {} {}", p.name, if p.online { "online" } else { "offline" })
            }
            Event::PeerRemoved(key) => println!("* {key} left"),
            Event::UnreadChanged { peer, unread } => {
                if unread > 0 {
                    println!("* {unread} unread from {peer}");
                }
            }
            Event::MessageReceived {
                sender_name,
                text,
                timestamp,
                ..
            } => println!("[{}] {}: {}", clock(timestamp), sender_name, text),
            Event::FileReceived {
                filename,
                size,
                stored_path,
                ..
            } => match stored_path {
                Some(path) => println!(
                    "* received {filename} ({size} bytes), stored at {}; /save it elsewhere",
                    path.display()
                ),
                None => println!("* received {filename} ({size} bytes) but could not store it"),
            },
            Event::TransferCompleted { filename, size, .. } => {
                println!("* sent {filename} ({size} bytes)")
            }
            Event::TransferFailed {
                filename, reason, ..
            } => println!(
                "* transfer of {} failed: {reason}",
                filename.as_deref().unwrap_or("file")
            ),
            Event::NameChanged {
                old_name, new_name, ..
            } => println!("* {old_name} is now {new_name}"),
            Event::RecordNotPersisted { peer, reason } => {
                println!("* history for {peer} not saved: {reason}")
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
