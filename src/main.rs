use anyhow::Result;
use clap::Parser;
use tracing::info;

use rover_signal::{
    config::{Cli, Command},
    peer, server,
    util::init_log,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_log();

    match Cli::parse().command {
        Command::Server(args) => {
            info!("Starting signaling server...");
            server::run(args.bind_addr(), args.relay_settings()).await
        }
        Command::Peer(args) => {
            info!("Starting WebRTC peer as {:?} in room '{}'...", args.role, args.room);
            peer::run(args).await
        }
    }
}
