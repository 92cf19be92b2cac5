use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::ServiceEvent;

/// Events for a single service group
#[derive(Debug)]
pub struct ServiceWatch {
    group: String,
    rx: broadcast::Receiver<ServiceEvent>,
}

impl ServiceWatch {
    pub(crate) fn new(group: String, rx: broadcast::Receiver<ServiceEvent>) -> Self {
        Self { group, rx }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// returns None once the registry is dropped
    pub async fn recv(&mut self) -> Option<ServiceEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.service().group == self.group => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => {
                    warn!("service watch on group [{}] missed {n} events", self.group);
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
