use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use huddle::call::{
    CallSession, LogSink, RtcPeerFactory, SessionConfig, SessionNotice, SyntheticSource,
};
use huddle::config::Config;
use huddle::relay::RelayHub;
use huddle::signal::SignalChannel;

#[derive(Parser)]
#[command(name = "huddle")]
#[command(about = "Peer-to-peer video call signalling relay and client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signalling relay
    Relay {
        /// Listening address, overrides the config file
        #[arg(long)]
        addr: Option<String>,
    },
    /// Join a call through a signalling relay
    Join {
        /// Relay URL, overrides the config file
        #[arg(long)]
        url: Option<String>,
        /// Place the call instead of waiting for an offer
        #[arg(long)]
        call: bool,
        /// Start the local preview while waiting
        #[arg(long)]
        preview: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;

    match cli.command {
        Commands::Relay { addr } => {
            if let Some(addr) = addr {
                config.relay.bind_address = addr;
            }
            let hub = RelayHub::bind(&config.relay).await?;
            let addr = hub.local_addr()?;
            println!("Signalling relay listening on ws://{}", addr);
            hub.serve().await?;
        }
        Commands::Join { url, call, preview } => {
            if let Some(url) = url {
                config.signal.url = url;
            }

            let channel = SignalChannel::new(&config.signal.url, config.signal.reconnect());
            channel.connect();

            let session_config = SessionConfig {
                constraints: config.media.constraints(),
                ..Default::default()
            };
            let (session, mut handle) = CallSession::new(
                channel.subscribe(),
                Arc::new(channel.clone()),
                Arc::new(RtcPeerFactory::new(config.webrtc.stun_servers.clone())),
                Arc::new(SyntheticSource),
                Arc::new(LogSink::new("local video")),
                Arc::new(LogSink::new("remote video")),
                session_config,
            );
            tokio::spawn(session.run());

            println!("Connected to relay {}", config.signal.url);
            if call {
                println!("Placing call...");
                handle.call().await;
            } else {
                if preview {
                    handle.start_local_video().await;
                }
                println!("Waiting for an incoming call...");
            }
            println!("Press Ctrl-C to hang up");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    notice = handle.notices.recv() => match notice {
                        Some(SessionNotice::CallFailed(reason)) => {
                            eprintln!("Call failed: {}", reason);
                        }
                        None => break,
                    },
                }
            }

            handle.hang_up().await;
            handle.shutdown().await;
            channel.shutdown();
        }
    }

    Ok(())
}
