use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU16;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use client::{ClientConfig, DiskNodeConnectionPool};
use color_eyre::eyre::{eyre, Result};
pub use color_eyre::eyre::WrapErr;
use discovery::{LocalRegistry, Service, ServiceRegistry};
use protocol::DuplicateNode;
use tracing::{info, instrument};

pub mod util;

mod context;
mod handlers;
mod liveness;
mod sequence;
mod server;
mod workers;
mod writer;

pub use context::{DiskContext, InvalidPath};
pub use sequence::{Position, SequenceCache};
pub use server::{HandlerError, MessageHandler, Router};
pub use workers::{WorkerError, WorkerPool};
pub use writer::{FileWriterManager, Record, RecordFileWriter, WriteOutcome, WriterError};

use handlers::NodeState;

pub type Id = String;

/// Disk node: stores the replicas placed on this machine
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Config {
    /// Id of this node, unique within its group
    #[clap(short, long)]
    pub id: Id,
    /// Service group to register under
    #[clap(short, long, default_value = "disk_group")]
    pub group: String,
    /// Address to listen on for requests
    #[clap(long, default_value = "0.0.0.0")]
    pub host: IpAddr,
    /// Optional, port on which to listen for requests
    /// by default pick a free port
    #[clap(short, long)]
    pub port: Option<NonZeroU16>,
    /// Directory holding the files of this node, must exist
    #[clap(short, long, default_value = "data")]
    pub data_root: PathBuf,
    /// Seconds between syncing files with unflushed writes to disk,
    /// zero disables the periodic flush
    #[clap(short, long, default_value = "5")]
    pub flush_interval: u64,
    /// Other disk nodes as `group:id@ip:port`, can be repeated
    #[clap(long)]
    pub peer: Vec<String>,
    /// Instrumentation endpoint
    #[clap(short, long)]
    pub endpoint: Option<IpAddr>,
    /// Run, by default the next number from the runtime dir
    #[clap(short('u'), long)]
    pub run: Option<u16>,
}

impl Config {
    pub fn settings(&self) -> Settings {
        Settings {
            id: self.id.clone(),
            group: self.group.clone(),
            host: self.host,
            port: self.port,
            data_root: self.data_root.clone(),
            flush_interval: (self.flush_interval > 0)
                .then(|| Duration::from_secs(self.flush_interval)),
            workers: None,
            client: ClientConfig::default(),
        }
    }
}

/// Everything needed to start a [`DiskNode`]
#[derive(Debug, Clone)]
pub struct Settings {
    pub id: Id,
    pub group: String,
    pub host: IpAddr,
    pub port: Option<NonZeroU16>,
    pub data_root: PathBuf,
    pub flush_interval: Option<Duration>,
    /// defaults to one per processor
    pub workers: Option<usize>,
    /// for connections to peers during recovery
    pub client: ClientConfig,
}

impl Settings {
    /// listen on a free loopback port, for running nodes in process
    pub fn local(id: impl Into<Id>, group: impl Into<String>, data_root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            group: group.into(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: None,
            data_root: data_root.into(),
            flush_interval: None,
            workers: Some(2),
            client: ClientConfig::default(),
        }
    }
}

/// A running disk node, its tasks end when it is dropped
pub struct DiskNode {
    addr: SocketAddr,
    group: String,
    state: Arc<NodeState>,
    _server: util::Wrapper<()>,
    _flusher: Option<util::Wrapper<()>>,
    _watch: util::Wrapper<()>,
}

impl DiskNode {
    /// Reopen files left open by an earlier run, then start serving.
    /// Registering the node is up to the caller.
    #[instrument(skip(registry), err)]
    pub async fn start(settings: Settings, registry: Arc<dyn ServiceRegistry>) -> Result<Self> {
        let ctx = DiskContext::new(&settings.data_root);
        let sequences = Arc::new(SequenceCache::new());
        let writers = FileWriterManager::new(ctx, settings.id.clone(), sequences);
        let workers = settings
            .workers
            .map_or_else(WorkerPool::sized_to_machine, WorkerPool::new);
        let peers = DiskNodeConnectionPool::new(registry.clone(), settings.client.clone());

        let state = Arc::new(NodeState {
            me: DuplicateNode::new(settings.group.clone(), settings.id.clone()),
            writers,
            workers,
            peers,
        });
        state
            .on_disk(|w| w.rebuild())
            .await
            .wrap_err("could not reopen files")?;

        let listener = util::open_socket(settings.host, settings.port).await?;
        let addr = listener.local_addr()?;
        let router = Arc::new(handlers::router(state.clone()));

        let server = util::spawn(server::serve(listener, router));
        let flusher = settings
            .flush_interval
            .map(|period| util::spawn(liveness::flush_periodically(state.clone(), period)));
        let watch = registry.watch(&settings.group);
        let watch = util::spawn(liveness::flush_on_removal(state.clone(), watch));

        info!("disk node [{}] listening on {addr}", state.me);
        Ok(Self {
            addr,
            group: settings.group,
            state,
            _server: server,
            _flusher: flusher,
            _watch: watch,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn node(&self) -> &DuplicateNode {
        &self.state.me
    }

    /// how this node should be registered, the address is the one it
    /// actually listens on
    pub fn service(&self) -> Service {
        Service::new(self.group.clone(), self.state.me.id.clone(), self.addr)
    }

    pub fn open_files(&self) -> usize {
        self.state.writers.open_files()
    }

    /// Stop accepting requests and flush every open file. Files stay open
    /// on disk and are picked up again by the next start.
    #[instrument(skip(self), fields(node = %self.state.me))]
    pub async fn stop(self) -> Result<()> {
        let Self { state, .. } = self;
        let flushed = state.on_disk(|w| Ok(w.flush_all())).await?;
        state.workers.close();
        info!("stopped, flushed {flushed} files");
        Ok(())
    }
}

fn parse_peer(peer: &str) -> Result<Service> {
    let (node, addr) = peer
        .split_once('@')
        .ok_or_else(|| eyre!("peer should look like group:id@ip:port, got: {peer}"))?;
    let (group, id) = node
        .split_once(':')
        .ok_or_else(|| eyre!("peer should look like group:id@ip:port, got: {peer}"))?;
    let addr = addr
        .parse()
        .wrap_err_with(|| format!("invalid peer address: {addr}"))?;
    Ok(Service::new(group, id, addr))
}

#[instrument(level = "info")]
pub async fn run(conf: Config) -> Result<()> {
    let registry = LocalRegistry::new();
    for peer in &conf.peer {
        registry.register(parse_peer(peer)?);
    }

    let node = DiskNode::start(conf.settings(), Arc::new(registry.clone())).await?;
    registry.register(node.service());

    tokio::signal::ctrl_c()
        .await
        .wrap_err("could not listen for shutdown signal")?;
    info!("shutting down");
    registry.unregister(&conf.group, &conf.id);
    node.stop().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_are_parsed() {
        let service = parse_peer("disk_group:7@127.0.0.1:4000").unwrap();
        assert_eq!(service.node(), DuplicateNode::new("disk_group", "7"));
        assert_eq!(service.addr, "127.0.0.1:4000".parse().unwrap());

        assert!(parse_peer("disk_group:7").is_err());
        assert!(parse_peer("7@127.0.0.1:4000").is_err());
    }

    #[test]
    fn zero_interval_disables_flushing() {
        let conf = Config::parse_from(["disknode", "--id", "1", "--flush-interval", "0"]);
        assert_eq!(conf.settings().flush_interval, None);
        let conf = Config::parse_from(["disknode", "--id", "1"]);
        assert_eq!(conf.settings().flush_interval, Some(Duration::from_secs(5)));
    }
}
