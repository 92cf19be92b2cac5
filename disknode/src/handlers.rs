use std::sync::Arc;

use client::DiskNodeConnectionPool;
use protocol::{DuplicateNode, Method, Route};

use crate::server::{HandlerError, Router};
use crate::workers::WorkerPool;
use crate::writer::{FileWriterManager, WriterError};

mod file;
mod query;
mod recover;

/// What every handler of a disk node shares
pub(crate) struct NodeState {
    /// this disk node as a replica
    pub me: DuplicateNode,
    pub writers: FileWriterManager,
    pub workers: WorkerPool,
    /// to pull records from other replicas during recovery
    pub peers: DiskNodeConnectionPool,
}

impl NodeState {
    /// run a writer operation on the worker pool
    pub async fn on_disk<F, T>(self: &Arc<Self>, job: F) -> Result<T, HandlerError>
    where
        F: FnOnce(&FileWriterManager) -> Result<T, WriterError> + Send + 'static,
        T: Send + 'static,
    {
        let state = self.clone();
        let res = self.workers.run(move || job(&state.writers)).await?;
        Ok(res?)
    }
}

pub(crate) fn router(state: Arc<NodeState>) -> Router {
    let s = || state.clone();
    Router::new()
        .with(Route::DiskNode, Method::Put, file::OpenFile(s()))
        .with(Route::DiskNode, Method::Post, file::WriteData(s()))
        .with(Route::DiskNode, Method::Get, file::ReadFile(s()))
        .with(Route::DiskNode, Method::Close, file::CloseFile(s()))
        .with(Route::DiskNode, Method::Delete, file::DeleteFile(s()))
        .with(Route::Flush, Method::Post, file::FlushFile(s()))
        .with(Route::Copy, Method::Post, file::CopyFile(s()))
        .with(Route::List, Method::Get, query::List(s()))
        .with(Route::Sequence, Method::Get, query::Sequence(s()))
        .with(Route::SequenceBytes, Method::Get, query::Bytes(s()))
        .with(Route::Meta, Method::Get, query::Meta(s()))
        .with(Route::Ping, Method::Get, query::Ping)
        .with(Route::Recover, Method::Post, recover::Recover(s()))
}
