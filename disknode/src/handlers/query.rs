use std::sync::Arc;

use async_trait::async_trait;
use protocol::{Payload, Request, Response, Seq, Status};

use super::NodeState;
use crate::server::{HandlerError, MessageHandler};

fn found<T: Payload>(value: Option<T>, path: String) -> Result<Response, HandlerError> {
    match value {
        Some(value) => Ok(Response::ok(value.to_body()?)),
        None => Ok(Response::error(Status::NotFound, path)),
    }
}

pub(crate) struct List(pub Arc<NodeState>);

#[async_trait]
impl MessageHandler for List {
    async fn handle(&self, req: Request) -> Result<Response, HandlerError> {
        let path = req.path.clone();
        let entries = self.0.on_disk(move |w| w.list(&path)).await?;
        found(entries, req.path)
    }
}

/// Sequence numbers held for a file that is open for writing
pub(crate) struct Sequence(pub Arc<NodeState>);

#[async_trait]
impl MessageHandler for Sequence {
    async fn handle(&self, req: Request) -> Result<Response, HandlerError> {
        let path = req.path.clone();
        let info = self.0.on_disk(move |w| w.sequence_info(&path)).await?;
        found(info, req.path)
    }
}

/// Body holds the wanted sequence numbers
pub(crate) struct Bytes(pub Arc<NodeState>);

#[async_trait]
impl MessageHandler for Bytes {
    async fn handle(&self, req: Request) -> Result<Response, HandlerError> {
        let seqs = Vec::<Seq>::from_body(&req.body)?;
        let path = req.path.clone();
        let records = self.0.on_disk(move |w| w.records(&path, &seqs)).await?;
        found(records, req.path)
    }
}

pub(crate) struct Meta(pub Arc<NodeState>);

#[async_trait]
impl MessageHandler for Meta {
    async fn handle(&self, req: Request) -> Result<Response, HandlerError> {
        let path = req.path.clone();
        let meta = self.0.on_disk(move |w| w.meta(&path)).await?;
        found(meta, req.path)
    }
}

pub(crate) struct Ping;

#[async_trait]
impl MessageHandler for Ping {
    async fn handle(&self, _: Request) -> Result<Response, HandlerError> {
        Ok(Response::flag(true))
    }
}
