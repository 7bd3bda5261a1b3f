//! rtcdrop-webrtc: send one file over a WebRTC data channel
//!
//! The sender creates a room in a shared rooms directory and prints its
//! six-digit code; the receiver joins with that code. Offer, answer and ICE
//! candidates travel through the room record, the file itself travels
//! peer-to-peer.
//!
//! Build with: cargo build -p rtcdrop-webrtc

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use rtcdrop_common::config::{TransportConfig, DEFAULT_STUN_SERVER, MAX_CHUNK_SIZE, ROOMS_TABLE};
use rtcdrop_common::core::events::format_bytes;
use rtcdrop_common::signaling::RoomStore;
use rtcdrop_common::{
    event_channel, DirectorySink, FileReceiver, FileSender, FileSource, TransferConfig,
    TransferEvent,
};

mod signaling;
mod webrtc;

use crate::signaling::DirRoomStore;
use crate::webrtc::WebRtcTransport;

/// Error returned when a transfer is interrupted by Ctrl+C.
#[derive(Debug, Clone, Copy)]
struct Interrupted;

impl std::fmt::Display for Interrupted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transfer interrupted")
    }
}

impl std::error::Error for Interrupted {}

fn is_interrupted(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Interrupted>().is_some()
}

#[derive(Parser)]
#[command(name = "rtcdrop-webrtc")]
#[command(about = "Peer-to-peer file transfer over a WebRTC data channel")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Use verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory shared by both sides for room records
    #[arg(long, global = true, value_name = "DIR")]
    rooms: Option<PathBuf>,

    /// STUN/TURN server URLs (can be specified multiple times)
    #[arg(long, global = true, value_name = "URL")]
    stun: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a session and send a file once the receiver joins
    Send {
        /// Path to the file to send
        path: PathBuf,

        /// Largest frame put on the data channel, in bytes
        #[arg(long, default_value_t = MAX_CHUNK_SIZE)]
        chunk_size: usize,
    },

    /// Join a session and save the file it sends
    Receive {
        /// Session code from sender (will prompt if not provided)
        code: Option<String>,

        /// Output directory (defaults to current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(async_main()) {
        if is_interrupted(&e) {
            // 128 + SIGINT
            std::process::exit(130);
        }
        eprintln!("Error: {:?}", e);
        std::process::exit(1);
    }
}

async fn async_main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging with filters for noisy internal modules
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = format!("{},webrtc_ice=error,webrtc_sctp=warn,webrtc_mdns=warn", log_level);
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&filter)).init();

    let rooms = cli
        .rooms
        .unwrap_or_else(|| std::env::temp_dir().join("rtcdrop-rooms"));
    let store: Arc<dyn RoomStore> = Arc::new(DirRoomStore::open(&rooms, ROOMS_TABLE)?);
    let transport = TransportConfig {
        ice_servers: if cli.stun.is_empty() {
            vec![DEFAULT_STUN_SERVER.to_string()]
        } else {
            cli.stun
        },
        ..Default::default()
    };

    match cli.command {
        Commands::Send { path, chunk_size } => {
            let config = TransferConfig {
                transport,
                max_chunk_size: chunk_size,
                read_size: chunk_size,
                ..Default::default()
            };
            send_file(store, config, path).await
        }

        Commands::Receive { code, output } => {
            let code = match code {
                Some(c) => c.trim().to_string(),
                None => {
                    print!("Enter session code: ");
                    io::stdout().flush()?;
                    let mut input = String::new();
                    io::stdin().read_line(&mut input)?;
                    input.trim().to_string()
                }
            };
            if code.is_empty() {
                anyhow::bail!("Session code is required");
            }

            let config = TransferConfig {
                transport,
                ..Default::default()
            };
            let output = output.unwrap_or_else(|| PathBuf::from("."));
            receive_file(store, config, &code, output).await
        }
    }
}

async fn send_file(
    store: Arc<dyn RoomStore>,
    config: TransferConfig,
    path: PathBuf,
) -> Result<()> {
    let source = FileSource::open(&path).await?;
    eprintln!(
        "Preparing {} ({})",
        source.metadata.name,
        format_bytes(source.metadata.size)
    );

    let mut sender = FileSender::new(store, Arc::new(WebRtcTransport), config);
    let code = sender.create_session().await?;
    eprintln!("\nSession code: {}\n", code);
    eprintln!("On the other side, run:");
    eprintln!("  rtcdrop-webrtc receive {}\n", code);
    eprintln!("Waiting for receiver...");

    let (events_tx, mut events) = event_channel();
    sender.send(source, events_tx);

    let outcome = tokio::select! {
        result = report_progress(&mut events, "Sending") => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted.");
            Err(Interrupted.into())
        }
    };
    sender.close().await;
    outcome
}

async fn receive_file(
    store: Arc<dyn RoomStore>,
    config: TransferConfig,
    code: &str,
    output: PathBuf,
) -> Result<()> {
    let sink = Arc::new(DirectorySink::new(output));
    let mut receiver = FileReceiver::new(store, Arc::new(WebRtcTransport), sink, config);

    let (events_tx, mut events) = event_channel();
    eprintln!("Joining session {}...", code);
    receiver.receive(code, events_tx).await?;
    eprintln!("Waiting for sender...");

    let outcome = tokio::select! {
        result = report_progress(&mut events, "Receiving") => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted.");
            Err(Interrupted.into())
        }
    };
    receiver.close().await;
    outcome
}

/// Print events for one transfer until it completes or fails.
async fn report_progress(
    events: &mut mpsc::UnboundedReceiver<TransferEvent>,
    verb: &str,
) -> Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::Started(metadata) => {
                eprintln!(
                    "{} {} ({}, {})",
                    verb,
                    metadata.name,
                    format_bytes(metadata.size),
                    metadata.mime_type
                );
            }
            TransferEvent::Progress(percent) => {
                eprint!("\r   Progress: {:.1}%", percent);
            }
            TransferEvent::Completed(path) => {
                eprintln!();
                match path {
                    Some(path) => eprintln!("File saved to {}", path.display()),
                    None => eprintln!("Transfer complete"),
                }
                return Ok(());
            }
            TransferEvent::Failed(e) => {
                eprintln!();
                return Err(e.into());
            }
        }
    }
    anyhow::bail!("Transfer ended without a result")
}
