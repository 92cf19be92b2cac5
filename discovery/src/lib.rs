//! Service registry for disk nodes
//!
//! Disk nodes register themselves under a service group with the address
//! their request handlers listen on. Clients resolve a replica
//! (`DuplicateNode`) to an address through the registry and can watch a
//! group for services coming and going.
//!
//! ```rust
//! use discovery::{LocalRegistry, Service, ServiceRegistry};
//!
//! let registry = LocalRegistry::new();
//! registry.register(Service::new("disk_group", "1", "127.0.0.1:8042".parse().unwrap()));
//! assert_eq!(registry.services("disk_group").len(), 1);
//! ```

use std::net::SocketAddr;

use protocol::DuplicateNode;

mod registry;
mod watch;

pub use registry::LocalRegistry;
pub use watch::ServiceWatch;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Service {
    pub group: String,
    pub id: String,
    pub addr: SocketAddr,
}

impl Service {
    pub fn new(group: impl Into<String>, id: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            group: group.into(),
            id: id.into(),
            addr,
        }
    }

    pub fn node(&self) -> DuplicateNode {
        DuplicateNode::new(self.group.clone(), self.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Added(Service),
    Removed(Service),
}

impl ServiceEvent {
    pub fn service(&self) -> &Service {
        match self {
            Self::Added(s) => s,
            Self::Removed(s) => s,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("service [{0}] is not registered")]
    UnknownService(DuplicateNode),
}

pub trait ServiceRegistry: Send + Sync {
    fn service(&self, group: &str, id: &str) -> Option<Service>;
    fn services(&self, group: &str) -> Vec<Service>;
    /// subscribe to services being added to or removed from `group`
    fn watch(&self, group: &str) -> ServiceWatch;

    fn resolve(&self, node: &DuplicateNode) -> Result<SocketAddr, Error> {
        self.service(&node.group, &node.id)
            .map(|s| s.addr)
            .ok_or_else(|| Error::UnknownService(node.clone()))
    }
}
