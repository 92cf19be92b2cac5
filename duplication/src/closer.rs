use std::sync::Arc;

use client::{Completion, DiskNodeConnectionPool};
use protocol::DuplicateNode;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::coordinator::{FileCoordinator, FileNode};
use crate::ids::ServerIdManager;
use crate::limiter::FileLimiter;
use crate::sync::{synchronize_with, SyncOutcome, Synchronize};

mod state;
pub use state::{CloseEvent, CloseState};

/// Closes the replicas of files that are done being written. The file node
/// is removed from the coordinator as soon as one replica confirms the
/// close, or right away if the replicas could not be synchronized.
pub struct FileLimiterCloser {
    synchronizer: Arc<dyn Synchronize>,
    pool: Arc<DiskNodeConnectionPool>,
    coordinator: FileCoordinator,
    ids: ServerIdManager,
}

impl FileLimiterCloser {
    pub fn new(
        synchronizer: Arc<dyn Synchronize>,
        pool: Arc<DiskNodeConnectionPool>,
        coordinator: FileCoordinator,
        ids: ServerIdManager,
    ) -> Self {
        Self {
            synchronizer,
            pool,
            coordinator,
            ids,
        }
    }

    /// Close in the background, the handle resolves to the final state
    pub fn spawn_close(self: &Arc<Self>, limiter: FileLimiter) -> JoinHandle<CloseState> {
        let closer = self.clone();
        tokio::spawn(async move { closer.close(limiter).await })
    }

    #[instrument(skip_all, fields(file = %limiter.file_node().name))]
    pub async fn close(&self, limiter: FileLimiter) -> CloseState {
        let file = limiter.into_file_node();
        let mut state = CloseState::Pending;

        let (tx, rx) = oneshot::channel();
        synchronize_with(self.synchronizer.clone(), file.clone(), move |outcome| {
            let _ = tx.send(outcome);
        });
        let file = match rx.await {
            Ok(SyncOutcome::Complete(file)) => file,
            Ok(SyncOutcome::Error(e)) => {
                warn!("abandoning file, could not synchronize replicas: {e}");
                self.forget(&file);
                return state.on(CloseEvent::SyncFailed);
            }
            Err(_) => {
                error!("synchronization ended without an outcome, abandoning file");
                self.forget(&file);
                return state.on(CloseEvent::SyncFailed);
            }
        };

        let (events, mut settled) = mpsc::unbounded_channel();
        let mut dispatched = 0;
        for node in &file.duplicate_nodes {
            if self.dispatch_close(&file, node, events.clone()).await {
                dispatched += 1;
            }
        }
        drop(events);
        debug!("sent close to {dispatched} replicas");
        state = state.on(CloseEvent::Synced { dispatched });

        while !state.is_terminal() {
            let (node, event) = match settled.recv().await {
                Some(settled) => settled,
                None => {
                    error!("close callbacks went missing");
                    break;
                }
            };
            match event {
                CloseEvent::ReplicaClosed => {
                    debug!("[{node}] closed the file");
                    self.forget(&file);
                }
                CloseEvent::ReplicaRejected => warn!("[{node}] refused to close the file"),
                _ => (),
            }
            state = state.on(event);
        }

        match state {
            CloseState::Closed => info!("file closed"),
            other => warn!("close ended as {other:?}, keeping the file node"),
        }
        state
    }

    /// Returns whether a close was sent, replicas that can not be reached
    /// are skipped.
    async fn dispatch_close(
        &self,
        file: &FileNode,
        node: &DuplicateNode,
        events: mpsc::UnboundedSender<(DuplicateNode, CloseEvent)>,
    ) -> bool {
        if node.is_virtual() {
            debug!("skipping virtual replica [{node}]");
            return false;
        }
        let Some(conn) = self.pool.get_connection(node).await else {
            warn!("no connection to [{node}], skipping its close");
            return false;
        };
        let second_id = match self.ids.other_second_id(&node.id, file.storage_id) {
            Ok(Some(id)) => id,
            Ok(None) => {
                warn!("[{node}] has no secondary id for storage {}", file.storage_id);
                return false;
            }
            Err(e) => {
                warn!("could not look up secondary id of [{node}]: {e}");
                return false;
            }
        };

        let path = file.path_on(&second_id);
        let replica = node.clone();
        conn.client().close_file_with(&path, move |completion| {
            let event = match completion {
                Completion::Completed(true) => CloseEvent::ReplicaClosed,
                Completion::Completed(false) => CloseEvent::ReplicaRejected,
                Completion::Failed(e) => {
                    warn!("close on [{replica}] failed: {e}");
                    CloseEvent::ReplicaFailed
                }
                Completion::Cancelled => {
                    warn!("close on [{replica}] was cancelled");
                    CloseEvent::ReplicaFailed
                }
            };
            let _ = events.send((replica, event));
        });
        true
    }

    fn forget(&self, file: &FileNode) {
        if let Err(e) = self.coordinator.delete(file) {
            error!("could not delete file node: {e}");
        }
    }
}
