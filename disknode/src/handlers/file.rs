use std::sync::Arc;

use async_trait::async_trait;
use protocol::{Payload, Request, Response, Status};
use tracing::{debug, instrument, warn};

use super::NodeState;
use crate::server::{HandlerError, MessageHandler};
use crate::writer::WriteOutcome;

pub(crate) struct OpenFile(pub Arc<NodeState>);

#[async_trait]
impl MessageHandler for OpenFile {
    #[instrument(skip_all, fields(path = %req.path))]
    async fn handle(&self, req: Request) -> Result<Response, HandlerError> {
        let capacity = req.query.capacity;
        self.0
            .on_disk(move |w| w.open(&req.path, capacity))
            .await?;
        Ok(Response::flag(true))
    }
}

pub(crate) struct WriteData(pub Arc<NodeState>);

#[async_trait]
impl MessageHandler for WriteData {
    #[instrument(skip_all, fields(path = %req.path, seq = ?req.query.seq))]
    async fn handle(&self, req: Request) -> Result<Response, HandlerError> {
        let seq = req
            .query
            .seq
            .ok_or_else(|| HandlerError::BadRequest("write without seq".to_owned()))?;
        let Request { path, body, .. } = req;

        let outcome = self
            .0
            .on_disk(move |w| w.write(&path, seq, &body))
            .await?;
        match outcome {
            WriteOutcome::Written(res) => Ok(Response::ok(res.to_body()?)),
            WriteOutcome::Rejected { last } => {
                debug!("replica is already at seq {last}");
                let msg = format!("seq {seq} is not after {last}");
                Ok(Response::error(Status::Conflict, msg))
            }
        }
    }
}

pub(crate) struct ReadFile(pub Arc<NodeState>);

#[async_trait]
impl MessageHandler for ReadFile {
    async fn handle(&self, req: Request) -> Result<Response, HandlerError> {
        let offset = req.query.offset.unwrap_or(0);
        let size = req.query.size;
        let path = req.path.clone();
        let bytes = self
            .0
            .on_disk(move |w| w.read(&path, offset, size))
            .await?;
        Ok(match bytes {
            Some(bytes) => Response::ok(bytes),
            None => Response::error(Status::NotFound, req.path),
        })
    }
}

/// Always answers with a flag, whatever went wrong is logged here and
/// shows up as `false` on the other end.
pub(crate) struct CloseFile(pub Arc<NodeState>);

#[async_trait]
impl MessageHandler for CloseFile {
    #[instrument(skip_all, fields(path = %req.path))]
    async fn handle(&self, req: Request) -> Result<Response, HandlerError> {
        let path = req.path;
        let closed = match self.0.on_disk(move |w| w.close(&path)).await {
            Ok(closed) => closed,
            Err(e) => {
                warn!("could not close file: {e}");
                false
            }
        };
        Ok(Response::flag(closed))
    }
}

pub(crate) struct DeleteFile(pub Arc<NodeState>);

#[async_trait]
impl MessageHandler for DeleteFile {
    #[instrument(skip_all, fields(path = %req.path, force = req.query.force))]
    async fn handle(&self, req: Request) -> Result<Response, HandlerError> {
        let force = req.query.force;
        let path = req.path;
        let deleted = self
            .0
            .on_disk(move |w| w.delete(&path, force))
            .await?;
        Ok(Response::flag(deleted))
    }
}

/// The root path flushes every open file
pub(crate) struct FlushFile(pub Arc<NodeState>);

#[async_trait]
impl MessageHandler for FlushFile {
    async fn handle(&self, req: Request) -> Result<Response, HandlerError> {
        let path = req.path;
        let flushed = if path.trim_matches('/').is_empty() {
            let n = self.0.on_disk(|w| Ok(w.flush_all())).await?;
            debug!("flushed {n} files");
            true
        } else {
            self.0.on_disk(move |w| w.flush(&path)).await?
        };
        Ok(Response::flag(flushed))
    }
}

/// Body holds the destination path
pub(crate) struct CopyFile(pub Arc<NodeState>);

#[async_trait]
impl MessageHandler for CopyFile {
    async fn handle(&self, req: Request) -> Result<Response, HandlerError> {
        let to = String::from_body(&req.body)?;
        let from = req.path;
        let copied = self
            .0
            .on_disk(move |w| w.copy(&from, &to))
            .await?;
        Ok(Response::flag(copied))
    }
}
