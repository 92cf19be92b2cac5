use std::sync::Arc;

use dashmap::DashMap;
use discovery::ServiceRegistry;
use protocol::DuplicateNode;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::{ClientConfig, ClientError, ConnectionState, DiskNodeClient};

/// A pooled client bound to the replica it was opened for
#[derive(Debug)]
pub struct DiskNodeConnection {
    node: DuplicateNode,
    client: DiskNodeClient,
}

impl DiskNodeConnection {
    pub fn node(&self) -> &DuplicateNode {
        &self.node
    }

    pub fn client(&self) -> &DiskNodeClient {
        &self.client
    }

    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }
}

type Slot = Arc<OnceCell<Arc<DiskNodeConnection>>>;

/// Keeps at most one live connection per replica. Every route of a disk
/// node is served over that one connection.
pub struct DiskNodeConnectionPool {
    registry: Arc<dyn ServiceRegistry>,
    config: ClientConfig,
    slots: DashMap<DuplicateNode, Slot>,
}

impl DiskNodeConnectionPool {
    pub fn new(registry: Arc<dyn ServiceRegistry>, config: ClientConfig) -> Self {
        Self {
            registry,
            config,
            slots: DashMap::new(),
        }
    }

    /// Returns the live connection to `node`, opening one if there is
    /// none yet. Concurrent callers for the same node share a single
    /// connection attempt. None means the node can not be reached right
    /// now, which is for the caller to report.
    #[instrument(skip(self, node), fields(node = %node))]
    pub async fn get_connection(&self, node: &DuplicateNode) -> Option<Arc<DiskNodeConnection>> {
        if node.is_virtual() {
            debug!("virtual replicas have no connection");
            return None;
        }

        // a dead connection is replaced at most once per call
        for _ in 0..2 {
            let slot = self.slots.entry(node.clone()).or_default().clone();
            match slot.get_or_try_init(|| self.connect(node)).await {
                Ok(conn) if conn.is_connected() => return Some(conn.clone()),
                Ok(_) => {
                    debug!("dropping disconnected client");
                    self.evict(node, &slot);
                }
                Err(e) => {
                    warn!("can not connect to disk node: {e}");
                    self.evict(node, &slot);
                    return None;
                }
            }
        }
        None
    }

    /// forget the connection to `node`, the next request reconnects
    pub fn remove(&self, node: &DuplicateNode) {
        if self.slots.remove(node).is_some() {
            info!("removed connection to [{node}]");
        }
    }

    pub fn clear(&self) {
        self.slots.clear();
    }

    /// number of connected replicas
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.value().get().map_or(false, |c| c.is_connected()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn connect(&self, node: &DuplicateNode) -> Result<Arc<DiskNodeConnection>, ClientError> {
        let addr = self.registry.resolve(node)?;
        let client = DiskNodeClient::connect(addr, &self.config).await?;
        info!("connected to [{node}] at {addr}");
        Ok(Arc::new(DiskNodeConnection {
            node: node.clone(),
            client,
        }))
    }

    /// only removes the slot we tried, a concurrent caller may already
    /// have put a fresh one in its place
    fn evict(&self, node: &DuplicateNode, slot: &Slot) {
        self.slots.remove_if(node, |_, current| Arc::ptr_eq(current, slot));
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use discovery::{LocalRegistry, Service};
    use protocol::VIRTUAL_SERVICE_GROUP;
    use tokio::net::TcpListener;

    use super::*;

    /// accepts connections and keeps them open without ever answering
    async fn silent_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                open.push(stream);
            }
        });
        (addr, handle)
    }

    fn pool(registry: &LocalRegistry) -> DiskNodeConnectionPool {
        let config = ClientConfig {
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_millis(500),
            ..ClientConfig::default()
        };
        DiskNodeConnectionPool::new(Arc::new(registry.clone()), config)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_connection() {
        let (addr, _server) = silent_server().await;
        let registry = LocalRegistry::new();
        registry.register(Service::new("disk", "x", addr));
        let pool = pool(&registry);

        let node = DuplicateNode::new("disk", "x");
        let (a, b) = tokio::join!(pool.get_connection(&node), pool.get_connection(&node));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);

        let again = pool.get_connection(&node).await.unwrap();
        assert!(Arc::ptr_eq(&a, &again));
    }

    #[tokio::test]
    async fn unknown_node_is_unreachable() {
        let registry = LocalRegistry::new();
        let pool = pool(&registry);
        assert!(pool.get_connection(&DuplicateNode::new("disk", "nope")).await.is_none());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn virtual_node_has_no_connection() {
        let (addr, _server) = silent_server().await;
        let registry = LocalRegistry::new();
        registry.register(Service::new(VIRTUAL_SERVICE_GROUP, "v", addr));
        let pool = pool(&registry);
        let node = DuplicateNode::new(VIRTUAL_SERVICE_GROUP, "v");
        assert!(pool.get_connection(&node).await.is_none());
    }

    #[tokio::test]
    async fn refused_connection_is_not_cached() {
        // grab a free port then close it again
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let registry = LocalRegistry::new();
        registry.register(Service::new("disk", "gone", addr));
        let pool = pool(&registry);
        let node = DuplicateNode::new("disk", "gone");

        assert!(pool.get_connection(&node).await.is_none());
        assert!(pool.slots.is_empty());
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let (addr, _server) = silent_server().await;
        let registry = LocalRegistry::new();
        registry.register(Service::new("disk", "x", addr));
        let pool = pool(&registry);

        let conn = pool.get_connection(&DuplicateNode::new("disk", "x")).await.unwrap();
        let res = conn.client().close_file("/some/file").await;
        assert!(matches!(res, Err(ClientError::Timeout(_))));
    }
}
