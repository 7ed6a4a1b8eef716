use std::net::SocketAddr;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Relay every websocket message to all other connected clients", long_about = None)]
pub struct Cli {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:8888")]
    pub listen: SocketAddr,
}
