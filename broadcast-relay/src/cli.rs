use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::Parser;

use crate::{
    relay::DEFAULT_SEND_TIMEOUT,
    server::{DEFAULT_BACKLOG, DEFAULT_PORT, RelayConfig},
};

const DEFAULT_SEND_TIMEOUT_MS: u64 = DEFAULT_SEND_TIMEOUT.as_millis() as u64;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Relay every client's bytes to every other client", long_about = None)]
pub struct Cli {
    /// Interface address to bind. Defaults to all interfaces.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// TCP port to listen on. Use 0 for an ephemeral port.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Pending-connection queue length passed to listen(2).
    #[arg(long, default_value_t = DEFAULT_BACKLOG)]
    pub backlog: u32,

    /// Milliseconds a single delivery may take before its target is dropped.
    #[arg(long, default_value_t = DEFAULT_SEND_TIMEOUT_MS)]
    pub send_timeout_ms: u64,

    /// File that receives a copy of every log line.
    #[arg(long, default_value = "server_logs.txt")]
    pub log_file: PathBuf,
}

impl Cli {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            listen: SocketAddr::new(self.bind, self.port),
            backlog: self.backlog,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
        }
    }
}
