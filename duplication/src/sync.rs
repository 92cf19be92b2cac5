use std::sync::Arc;

use async_trait::async_trait;
use client::{ClientError, DiskNodeConnection, DiskNodeConnectionPool};
use futures::future::join_all;
use protocol::{DuplicateNode, SequenceInfo};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::coordinator::FileNode;
use crate::db::DbError;
use crate::ids::ServerIdManager;

mod plan;
pub use plan::{plan_recovery, ReplicaSeqs};

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("no replica of {0} could be reached")]
    NoReachableReplica(String),
    #[error("replica [{node}] refused to recover {path}")]
    RecoverRejected { node: DuplicateNode, path: String },
    #[error("could not recover replica [{node}]")]
    Recover {
        node: DuplicateNode,
        #[source]
        source: ClientError,
    },
    #[error("replicas of {name} still differ after recovery: {replicas:?}")]
    Diverged {
        name: String,
        replicas: Vec<(DuplicateNode, SequenceInfo)>,
    },
    #[error(transparent)]
    Db(#[from] DbError),
}

/// How a synchronization ended, exactly one per call
#[derive(Debug)]
pub enum SyncOutcome {
    /// every reachable replica now holds the same data
    Complete(FileNode),
    Error(SyncError),
}

#[async_trait]
pub trait Synchronize: Send + Sync {
    async fn synchronize(&self, file: FileNode) -> SyncOutcome;
}

/// Run a synchronization in the background, `callback` gets its outcome
pub fn synchronize_with<F>(
    synchronizer: Arc<dyn Synchronize>,
    file: FileNode,
    callback: F,
) -> JoinHandle<()>
where
    F: FnOnce(SyncOutcome) + Send + 'static,
{
    tokio::spawn(async move {
        let outcome = synchronizer.synchronize(file).await;
        callback(outcome)
    })
}

struct Replica {
    node: DuplicateNode,
    path: String,
    info: SequenceInfo,
    conn: Arc<DiskNodeConnection>,
}

/// Reconciles the replicas of a file through their disk nodes. Replicas
/// that can not be reached are left out and logged, they do not block the
/// others from completing.
pub struct FileSynchronizer {
    pool: Arc<DiskNodeConnectionPool>,
    ids: ServerIdManager,
}

impl FileSynchronizer {
    pub fn new(pool: Arc<DiskNodeConnectionPool>, ids: ServerIdManager) -> Self {
        Self { pool, ids }
    }

    /// A reachable replica that does not have the file open counts as
    /// holding nothing, it is recovered like any other lagging replica.
    async fn probe(&self, file: &FileNode, node: &DuplicateNode) -> Option<Replica> {
        let Some(conn) = self.pool.get_connection(node).await else {
            warn!("[{node}] is unreachable, leaving it out");
            return None;
        };
        let second_id = match self.ids.other_second_id(&node.id, file.storage_id) {
            Ok(Some(id)) => id,
            Ok(None) => {
                warn!("[{node}] has no secondary id for storage {}", file.storage_id);
                return None;
            }
            Err(e) => {
                warn!("could not look up secondary id of [{node}]: {e}");
                return None;
            }
        };
        let path = file.path_on(&second_id);

        let info = match conn.client().sequence_info(&path).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                debug!("[{node}] does not have {path} open");
                SequenceInfo::default()
            }
            Err(e) => {
                warn!("could not get sequence numbers from [{node}]: {e}");
                return None;
            }
        };
        Some(Replica {
            node: node.clone(),
            path,
            info,
            conn,
        })
    }

    async fn reconcile(&self, file: &FileNode) -> Result<(), SyncError> {
        let probes = file
            .duplicate_nodes
            .iter()
            .filter(|node| !node.is_virtual())
            .map(|node| self.probe(file, node));
        let replicas: Vec<Replica> = join_all(probes).await.into_iter().flatten().collect();
        if replicas.is_empty() {
            return Err(SyncError::NoReachableReplica(file.name.clone()));
        }

        let views: Vec<ReplicaSeqs> = replicas
            .iter()
            .map(|r| ReplicaSeqs {
                node: r.node.clone(),
                path: r.path.clone(),
                seqs: r.info.seqs.clone(),
            })
            .collect();
        let plans = plan_recovery(&views);
        debug!("{} of {} replicas lag behind", plans.len(), replicas.len());

        let recoveries = plans.iter().map(|(i, plan)| {
            let replica = &replicas[*i];
            async move {
                let res = replica.conn.client().recover_file(&replica.path, plan).await;
                (replica, res)
            }
        });
        for (replica, res) in join_all(recoveries).await {
            match res {
                Ok(true) => info!("recovered [{}]", replica.node),
                Ok(false) => {
                    return Err(SyncError::RecoverRejected {
                        node: replica.node.clone(),
                        path: replica.path.clone(),
                    })
                }
                Err(source) => {
                    return Err(SyncError::Recover {
                        node: replica.node.clone(),
                        source,
                    })
                }
            }
        }

        self.verify(file, &replicas).await
    }

    /// Replicas hold the same bytes once they hold the same seqs at the same
    /// length, disk nodes keep records ordered by seq. Replicas that dropped
    /// out since the probe are ignored.
    async fn verify(&self, file: &FileNode, replicas: &[Replica]) -> Result<(), SyncError> {
        let current = replicas.iter().map(|replica| async move {
            match replica.conn.client().sequence_info(&replica.path).await {
                Ok(Some(info)) => Some((replica.node.clone(), info)),
                Ok(None) => None,
                Err(e) => {
                    warn!("could not verify [{}]: {e}", replica.node);
                    None
                }
            }
        });
        let current: Vec<_> = join_all(current).await.into_iter().flatten().collect();

        let equal = current.windows(2).all(|pair| {
            let (a, b) = (&pair[0].1, &pair[1].1);
            a.seqs == b.seqs && a.length == b.length
        });
        if !equal {
            return Err(SyncError::Diverged {
                name: file.name.clone(),
                replicas: current,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Synchronize for FileSynchronizer {
    #[instrument(skip_all, fields(file = %file.name))]
    async fn synchronize(&self, file: FileNode) -> SyncOutcome {
        match self.reconcile(&file).await {
            Ok(()) => {
                info!("replicas are in sync");
                SyncOutcome::Complete(file)
            }
            Err(e) => {
                warn!("synchronization failed: {e}");
                SyncOutcome::Error(e)
            }
        }
    }
}
