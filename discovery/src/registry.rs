use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{Service, ServiceEvent, ServiceRegistry, ServiceWatch};

type Key = (String, String);

/// In process registry, shared by cloning
#[derive(Debug, Clone)]
pub struct LocalRegistry {
    map: Arc<DashMap<Key, Service>>,
    events: broadcast::Sender<ServiceEvent>,
}

impl Default for LocalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            map: Arc::new(DashMap::new()),
            events,
        }
    }

    /// returns true if the service was not charted yet or its address changed
    pub fn register(&self, service: Service) -> bool {
        let key = (service.group.clone(), service.id.clone());
        let old = self.map.insert(key, service.clone());
        if old.as_ref() == Some(&service) {
            return false;
        }

        if let Some(old) = old {
            debug!("service [{}] moved from {} to {}", old.node(), old.addr, service.addr);
            let _no_watchers = self.events.send(ServiceEvent::Removed(old));
        }
        info!("added service [{}] at {}, n charted: ({})", service.node(), service.addr, self.map.len());
        let _no_watchers = self.events.send(ServiceEvent::Added(service));
        true
    }

    pub fn unregister(&self, group: &str, id: &str) -> Option<Service> {
        let (_, service) = self.map.remove(&(group.to_owned(), id.to_owned()))?;
        info!("removed service [{}]", service.node());
        let _no_watchers = self.events.send(ServiceEvent::Removed(service.clone()));
        Some(service)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl ServiceRegistry for LocalRegistry {
    fn service(&self, group: &str, id: &str) -> Option<Service> {
        self.map
            .get(&(group.to_owned(), id.to_owned()))
            .map(|s| s.value().clone())
    }

    fn services(&self, group: &str) -> Vec<Service> {
        let mut list: Vec<_> = self
            .map
            .iter()
            .filter(|entry| entry.key().0 == group)
            .map(|entry| entry.value().clone())
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    fn watch(&self, group: &str) -> ServiceWatch {
        ServiceWatch::new(group.to_owned(), self.events.subscribe())
    }
}
