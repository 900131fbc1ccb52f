//! Clap option structs for the daemon and the interactive client

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::protocol::MAX_FRAME_SIZE;

/// Options for `cloudstored`
#[derive(Clone, Debug, Parser)]
#[command(name = "cloudstored", version, about = "Cloud storage daemon")]
pub struct DaemonOpts {
    /// Directory holding one sub-folder per registered user
    pub root: PathBuf,

    /// TCP port to listen on
    pub port: u16,

    /// Interface to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// TOML file with server tunables
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Append session and file events to this file
    #[arg(long)]
    pub audit_log: Option<PathBuf>,
}

impl DaemonOpts {
    pub fn bind_addr(&self) -> String {
        std::net::SocketAddr::new(self.bind, self.port).to_string()
    }
}

/// Options for the `cloudstore` client
#[derive(Clone, Debug, Parser)]
#[command(name = "cloudstore", version, about = "Interactive cloud storage client")]
pub struct ClientOpts {
    /// Server host name or address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Largest frame to send or accept; match the server's `max_frame_size`
    #[arg(long, default_value_t = MAX_FRAME_SIZE)]
    pub max_frame_size: usize,
}
