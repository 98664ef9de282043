use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::server::RelaySettings;

#[derive(Debug, Parser)]
#[command(name = "rover-signal", version, about = "Rover video signaling relay and peer")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the room-based signaling relay
    Server(ServerArgs),
    /// Run a WebRTC peer that negotiates through the relay
    Peer(PeerArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    #[arg(long, env = "ROVER_SIGNAL_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    #[arg(long, env = "ROVER_SIGNAL_PORT", default_value_t = 8765)]
    pub port: u16,

    /// Seconds between keep-alive pings
    #[arg(long, env = "ROVER_SIGNAL_PING_INTERVAL", default_value_t = 20)]
    pub ping_interval: u64,

    /// Seconds without any inbound frame before a connection is closed
    #[arg(long, env = "ROVER_SIGNAL_IDLE_TIMEOUT", default_value_t = 40)]
    pub idle_timeout: u64,

    /// Seconds a single frame write may take before the client is dropped
    #[arg(long, env = "ROVER_SIGNAL_SEND_TIMEOUT", default_value_t = 10)]
    pub send_timeout: u64,

    /// Frames buffered per connection
    #[arg(long, env = "ROVER_SIGNAL_QUEUE_DEPTH", default_value_t = 64)]
    pub queue_depth: usize,
}

impl ServerArgs {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            ping_interval: Duration::from_secs(self.ping_interval.max(1)),
            idle_timeout: Duration::from_secs(self.idle_timeout.max(1)),
            send_timeout: Duration::from_secs(self.send_timeout.max(1)),
            queue_depth: self.queue_depth.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PeerRole {
    /// Camera side: joins and sends the offer
    Offerer,
    /// Console side: joins and answers the first offer
    Answerer,
}

#[derive(Debug, Clone, Args)]
pub struct PeerArgs {
    #[arg(long, env = "ROVER_SIGNAL_URL", default_value = "ws://localhost:8765")]
    pub signaling: String,

    #[arg(long, env = "ROVER_SIGNAL_ROOM", default_value = "room1")]
    pub room: String,

    #[arg(long, env = "ROVER_SIGNAL_ROLE", value_enum, default_value_t = PeerRole::Offerer)]
    pub role: PeerRole,

    /// Extra address to advertise as a host candidate (repeatable)
    #[arg(long = "candidate-ip", env = "ROVER_SIGNAL_CANDIDATE_IPS", value_delimiter = ',')]
    pub candidate_ips: Vec<IpAddr>,

    /// Label of the negotiated data channel
    #[arg(long, env = "ROVER_SIGNAL_CHANNEL", default_value = "rover-data")]
    pub channel: String,
}
