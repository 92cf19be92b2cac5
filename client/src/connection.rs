use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt, TryStreamExt};
use protocol::connection::{self, MsgStream};
use protocol::{Request, RequestId, Response};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, instrument, trace, warn};

use crate::util::{self, AbortOnDrop};
use crate::{ClientConfig, ClientError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

type Pending = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Response>>>>;

/// One tcp connection to a disk node. Requests are tagged with an id and
/// may be answered out of order, a reader task routes each response back
/// to the request waiting for it.
#[derive(Debug)]
pub(crate) struct Connection {
    peer: SocketAddr,
    request_timeout: Duration,
    next_id: AtomicU64,
    pending: Pending,
    connected: Arc<AtomicBool>,
    outgoing: mpsc::Sender<Request>,
    _writer: AbortOnDrop<()>,
    _reader: AbortOnDrop<()>,
}

impl Connection {
    #[instrument(skip(config), err)]
    pub(crate) async fn connect(addr: SocketAddr, config: &ClientConfig) -> Result<Self, ClientError> {
        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::ConnectTimeout(addr))?
            .map_err(|source| ClientError::Connect { addr, source })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not disable nagle for {addr}: {e}");
        }

        let stream: MsgStream<Response, Request> = connection::wrap(stream);
        let (sink, responses) = stream.split::<Request>();

        let pending = Pending::default();
        let connected = Arc::new(AtomicBool::new(true));
        let (outgoing, requests) = mpsc::channel(config.queue_size);

        let writer = send_requests(addr, sink, requests, connected.clone());
        let reader = recieve_responses(addr, responses, pending.clone(), connected.clone());

        Ok(Self {
            peer: addr,
            request_timeout: config.request_timeout,
            next_id: AtomicU64::new(1),
            pending,
            connected,
            outgoing,
            _writer: util::spawn(writer),
            _reader: util::spawn(reader),
        })
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn state(&self) -> ConnectionState {
        match self.connected.load(Ordering::Acquire) {
            true => ConnectionState::Connected,
            false => ConnectionState::Disconnected,
        }
    }

    #[instrument(level = "trace", skip(self, request), fields(uri = %request.uri(), method = %request.method))]
    pub(crate) async fn execute(&self, mut request: Request) -> Result<Response, ClientError> {
        if self.state() == ConnectionState::Disconnected {
            return Err(ClientError::Disconnected(self.peer));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        request.id = id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.outgoing.send(request).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ClientError::Disconnected(self.peer));
        }

        match timeout(self.request_timeout, rx).await {
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ClientError::Timeout(self.peer))
            }
            // sender dropped by the reader, the connection is gone
            Ok(Err(_)) => Err(ClientError::Cancelled),
            Ok(Ok(response)) => {
                trace!("got response: {:?}", response.status);
                Ok(response)
            }
        }
    }
}

type Sink = futures::stream::SplitSink<MsgStream<Response, Request>, Request>;
type Responses = futures::stream::SplitStream<MsgStream<Response, Request>>;

async fn send_requests(
    peer: SocketAddr,
    mut sink: Sink,
    mut requests: mpsc::Receiver<Request>,
    connected: Arc<AtomicBool>,
) {
    while let Some(request) = requests.recv().await {
        if let Err(e) = sink.send(request).await {
            warn!("could not send request to {peer}, error: {e:?}");
            break;
        }
    }
    connected.store(false, Ordering::Release);
}

async fn recieve_responses(
    peer: SocketAddr,
    mut responses: Responses,
    pending: Pending,
    connected: Arc<AtomicBool>,
) {
    loop {
        match responses.try_next().await {
            Ok(Some(response)) => {
                let waiting = pending.lock().await.remove(&response.id);
                match waiting {
                    Some(tx) => {
                        // the caller may have timed out in the meantime
                        let _ = tx.send(response);
                    }
                    None => debug!("dropping response for unknown request: {}", response.id),
                }
            }
            Ok(None) => {
                debug!("connection to {peer} closed");
                break;
            }
            Err(e) => {
                warn!("error in transport from {peer}: {e:?}");
                break;
            }
        }
    }

    connected.store(false, Ordering::Release);
    // dropping the senders cancels every request still in flight
    pending.lock().await.clear();
}
