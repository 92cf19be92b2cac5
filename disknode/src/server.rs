use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, TryStreamExt};
use protocol::connection::{self, MsgStream};
use protocol::{Method, Request, Response, Route, Status};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, instrument, trace, warn};

use crate::context::InvalidPath;
use crate::workers::WorkerError;
use crate::writer::WriterError;

#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Writer(#[from] WriterError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("could not decode request body: {0}")]
    Decode(#[from] bincode::Error),
}

impl From<InvalidPath> for HandlerError {
    fn from(e: InvalidPath) -> Self {
        HandlerError::Writer(e.into())
    }
}

impl HandlerError {
    pub fn status(&self) -> Status {
        use WriterError as W;
        match self {
            HandlerError::BadRequest(_) | HandlerError::Decode(_) => Status::BadRequest,
            HandlerError::Writer(W::InvalidPath(_)) => Status::BadRequest,
            HandlerError::Writer(W::NotOpen(_) | W::RootMissing(_)) => Status::NotFound,
            HandlerError::Writer(W::AlreadyClosed(_) | W::CapacityExceeded { .. }) => {
                Status::Conflict
            }
            HandlerError::Writer(W::Io(_) | W::Record(_)) => Status::InternalError,
            HandlerError::Worker(_) => Status::InternalError,
        }
    }
}

/// Server side of one (route, method) pair
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Result<Response, HandlerError>;
}

/// Dispatches requests to the handler registered for their route and
/// method. Pairs without a handler are answered with `NotImplemented`.
#[derive(Default)]
pub struct Router {
    handlers: HashMap<(Route, Method), Arc<dyn MessageHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, route: Route, method: Method, handler: impl MessageHandler + 'static) {
        let existing = self.handlers.insert((route, method), Arc::new(handler));
        debug_assert!(existing.is_none(), "{method} {route} registered twice");
    }

    pub fn with(mut self, route: Route, method: Method, handler: impl MessageHandler + 'static) -> Self {
        self.add(route, method, handler);
        self
    }

    #[instrument(level = "debug", skip(self, request), fields(uri = %request.uri(), method = %request.method))]
    pub async fn dispatch(&self, request: Request) -> Response {
        let id = request.id;
        let Some(handler) = self.handlers.get(&(request.route, request.method)) else {
            debug!("no handler");
            let msg = format!("{} {} is not supported", request.method, request.route);
            return Response::error(Status::NotImplemented, msg).with_id(id);
        };

        let response = match handler.handle(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("request failed: {e}");
                Response::error(e.status(), e)
            }
        };
        trace!("answering {:?}", response.status);
        response.with_id(id)
    }
}

/// Accept connections until the surrounding task is dropped, which also
/// drops every connection.
pub async fn serve(listener: TcpListener, router: Arc<Router>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    connections.spawn(handle_conn(stream, peer, router.clone()));
                }
                Err(e) => warn!("could not accept connection: {e}"),
            },
            Some(res) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = res {
                    if e.is_panic() {
                        warn!("connection handler panicked: {e}");
                    }
                }
            }
        }
    }
}

/// Every request is handled in its own task so a slow disk operation does
/// not hold up the others on the same connection. Responses go out in the
/// order they finish, the client matches them on id.
async fn handle_conn(stream: TcpStream, peer: SocketAddr, router: Arc<Router>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("could not disable nagle for {peer}: {e}");
    }
    let stream: MsgStream<Request, Response> = connection::wrap(stream);
    let (mut sink, mut requests) = stream.split::<Response>();
    let (tx, mut rx) = mpsc::channel::<Response>(64);

    let writer = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            if let Err(e) = sink.send(response).await {
                warn!("could not answer {peer}: {e:?}");
                break;
            }
        }
    });

    loop {
        match requests.try_next().await {
            Ok(Some(request)) => {
                let router = router.clone();
                let tx = tx.clone();
                // handlers run to completion even if the peer goes away,
                // a write that reached the disk must also reach the cache
                tokio::spawn(async move {
                    let response = router.dispatch(request).await;
                    let _ = tx.send(response).await;
                });
            }
            Ok(None) => {
                debug!("{peer} disconnected");
                break;
            }
            Err(e) => {
                warn!("error in transport from {peer}: {e:?}");
                break;
            }
        }
    }

    drop(tx);
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, request: Request) -> Result<Response, HandlerError> {
            Ok(Response::ok(request.body))
        }
    }

    struct Failing;

    #[async_trait]
    impl MessageHandler for Failing {
        async fn handle(&self, request: Request) -> Result<Response, HandlerError> {
            Err(WriterError::NotOpen(request.path).into())
        }
    }

    fn router() -> Router {
        Router::new()
            .with(Route::Ping, Method::Get, Echo)
            .with(Route::DiskNode, Method::Post, Failing)
    }

    #[tokio::test]
    async fn response_carries_request_id() {
        let mut req = Request::new(Method::Get, Route::Ping, "/").with_body(vec![1, 2]);
        req.id = 42;
        let resp = router().dispatch(req).await;
        assert_eq!(resp.id, 42);
        assert_eq!(resp.status, Status::Ok);
        assert_eq!(resp.body, vec![1, 2]);
    }

    #[tokio::test]
    async fn unknown_pair_is_not_implemented() {
        let mut req = Request::new(Method::Delete, Route::Ping, "/");
        req.id = 7;
        let resp = router().dispatch(req).await;
        assert_eq!(resp.status, Status::NotImplemented);
        assert_eq!(resp.id, 7);
    }

    #[tokio::test]
    async fn handler_errors_become_statuses() {
        let req = Request::new(Method::Post, Route::DiskNode, "/f");
        let resp = router().dispatch(req).await;
        assert_eq!(resp.status, Status::NotFound);
        assert!(resp.message().contains("/f"));
    }
}
