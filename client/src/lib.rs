use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use protocol::{DuplicateNode, Status};

mod client;
mod completion;
mod connection;
mod pool;
mod util;

pub use client::DiskNodeClient;
pub use completion::Completion;
pub use connection::ConnectionState;
pub use pool::{DiskNodeConnection, DiskNodeConnectionPool};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    /// how long to wait for the answer to a single request
    pub request_timeout: Duration,
    /// requests queued for sending before callers have to wait
    pub queue_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(30),
            queue_size: 64,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("could not connect to {addr}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("timed out connecting to {0}")]
    ConnectTimeout(SocketAddr),
    #[error("no answer from {0} in time")]
    Timeout(SocketAddr),
    #[error("connection to {0} is closed")]
    Disconnected(SocketAddr),
    #[error("request was cancelled")]
    Cancelled,
    #[error(transparent)]
    UnknownService(#[from] discovery::Error),
    #[error("replica [{0}] is virtual, it has no disk node")]
    Virtual(DuplicateNode),
    #[error("disk node answered {status:?}: {msg}")]
    Status { status: Status, msg: String },
    #[error("could not decode response body")]
    Decode(#[from] bincode::Error),
}
