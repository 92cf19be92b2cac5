use std::sync::Arc;
use std::time::Duration;

use discovery::{ServiceEvent, ServiceWatch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, trace, warn};

use crate::handlers::NodeState;

/// Sync dirty writers every `period` until the worker pool shuts down
pub(crate) async fn flush_periodically(state: Arc<NodeState>, period: Duration) {
    let mut ticks = interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticks.tick().await;
    loop {
        ticks.tick().await;
        match state.on_disk(|w| Ok(w.flush_dirty())).await {
            Ok(0) => (),
            Ok(n) => trace!("flushed {n} dirty files"),
            Err(e) => {
                warn!("stopping periodic flush: {e}");
                return;
            }
        }
    }
}

/// A service leaving the group may be the first sign of trouble, get
/// everything onto disk while we still can.
pub(crate) async fn flush_on_removal(state: Arc<NodeState>, mut watch: ServiceWatch) {
    while let Some(event) = watch.recv().await {
        let ServiceEvent::Removed(service) = event else {
            continue;
        };
        let node = service.node();
        state.peers.remove(&node);

        info!("[{node}] left group [{}], flushing open files", watch.group());
        match state.on_disk(|w| Ok(w.flush_all())).await {
            Ok(n) => info!("flushed {n} files"),
            Err(e) => warn!("could not flush open files: {e}"),
        }
    }
}
