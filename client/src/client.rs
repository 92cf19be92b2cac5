use std::net::SocketAddr;
use std::sync::Arc;

use protocol::{
    FileInfo, FileMeta, Method, Payload, Query, RecordBytes, RecoverPlan, Request, Response,
    Route, Seq, SequenceInfo, Status, WriteResult,
};
use tracing::{debug, instrument};

use crate::connection::{Connection, ConnectionState};
use crate::{ClientConfig, ClientError, Completion};

/// Client for the request handlers of a single disk node, cheap to clone.
///
/// Every operation comes back as one of three things: `Ok` with the
/// answer, `Ok(false)`/`Ok(None)` when the disk node refused, or `Err`
/// when the request never made it there and back.
#[derive(Debug, Clone)]
pub struct DiskNodeClient {
    conn: Arc<Connection>,
}

impl DiskNodeClient {
    pub async fn connect(addr: SocketAddr, config: &ClientConfig) -> Result<Self, ClientError> {
        let conn = Connection::connect(addr, config).await?;
        Ok(Self {
            conn: Arc::new(conn),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.conn.peer()
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// send a request and wait for its response
    pub async fn execute(&self, request: Request) -> Result<Response, ClientError> {
        self.conn.execute(request).await
    }

    /// send a request without waiting, `callback` is invoked once the
    /// request completed, failed or got cancelled
    pub fn execute_with<F>(&self, request: Request, callback: F)
    where
        F: FnOnce(Completion<Response>) + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::spawn(async move {
            let res = conn.execute(request).await;
            callback(res.into())
        });
    }

    pub async fn ping(&self) -> Result<bool, ClientError> {
        let req = Request::new(Method::Get, Route::Ping, "/");
        let resp = self.execute(req).await?;
        Ok(resp.status.is_success())
    }

    #[instrument(skip(self), err)]
    pub async fn open_file(&self, path: &str, capacity: u64) -> Result<bool, ClientError> {
        let query = Query {
            capacity: Some(capacity),
            ..Query::default()
        };
        let req = Request::new(Method::Put, Route::DiskNode, path).with_query(query);
        let resp = self.execute(req).await?;
        Ok(resp.status.is_success())
    }

    /// returns None if the disk node did not accept the write, for example
    /// because `seq` is not ahead of what it already has
    #[instrument(skip(self, data), fields(len = data.len()), err)]
    pub async fn write_data(
        &self,
        path: &str,
        seq: Seq,
        data: Vec<u8>,
    ) -> Result<Option<WriteResult>, ClientError> {
        let query = Query {
            seq: Some(seq),
            ..Query::default()
        };
        let req = Request::new(Method::Post, Route::DiskNode, path)
            .with_query(query)
            .with_body(data);
        let resp = self.execute(req).await?;
        match resp.status {
            Status::Conflict | Status::NotFound => {
                debug!("write refused: {}", resp.message());
                Ok(None)
            }
            _ => payload(resp),
        }
    }

    /// read `size` bytes starting at `offset`, everything up to the end
    /// of the file if `size` is None
    pub async fn read_file(
        &self,
        path: &str,
        offset: u64,
        size: Option<u64>,
    ) -> Result<Option<Vec<u8>>, ClientError> {
        let query = Query {
            offset: Some(offset),
            size,
            ..Query::default()
        };
        let req = Request::new(Method::Get, Route::DiskNode, path).with_query(query);
        let resp = self.execute(req).await?;
        match resp.status {
            Status::Ok => Ok(Some(resp.body)),
            Status::NotFound => Ok(None),
            status => Err(status_error(status, &resp)),
        }
    }

    #[instrument(skip(self), err)]
    pub async fn close_file(&self, path: &str) -> Result<bool, ClientError> {
        let resp = self.execute(close_request(path)).await?;
        flag(resp)
    }

    /// non-blocking form of [`close_file`](Self::close_file)
    pub fn close_file_with<F>(&self, path: &str, callback: F)
    where
        F: FnOnce(Completion<bool>) + Send + 'static,
    {
        self.execute_with(close_request(path), move |completion| {
            let completion = match completion.map(flag) {
                Completion::Completed(Ok(closed)) => Completion::Completed(closed),
                Completion::Completed(Err(e)) => Completion::Failed(e),
                Completion::Failed(e) => Completion::Failed(e),
                Completion::Cancelled => Completion::Cancelled,
            };
            callback(completion)
        })
    }

    pub async fn delete_file(&self, path: &str, force: bool) -> Result<bool, ClientError> {
        let query = Query {
            force,
            ..Query::default()
        };
        let req = Request::new(Method::Delete, Route::DiskNode, path).with_query(query);
        flag(self.execute(req).await?)
    }

    pub async fn flush_file(&self, path: &str) -> Result<bool, ClientError> {
        let req = Request::new(Method::Post, Route::Flush, path);
        flag(self.execute(req).await?)
    }

    pub async fn list_files(&self, path: &str) -> Result<Option<Vec<FileInfo>>, ClientError> {
        let req = Request::new(Method::Get, Route::List, path);
        payload(self.execute(req).await?)
    }

    pub async fn sequence_info(&self, path: &str) -> Result<Option<SequenceInfo>, ClientError> {
        let req = Request::new(Method::Get, Route::Sequence, path);
        payload(self.execute(req).await?)
    }

    /// the bytes written under the given sequence numbers, numbers the
    /// replica does not hold are left out
    pub async fn records(
        &self,
        path: &str,
        seqs: Vec<Seq>,
    ) -> Result<Option<Vec<RecordBytes>>, ClientError> {
        let req = Request::new(Method::Get, Route::SequenceBytes, path).with_body(seqs.to_body()?);
        payload(self.execute(req).await?)
    }

    pub async fn file_meta(&self, path: &str) -> Result<Option<FileMeta>, ClientError> {
        let req = Request::new(Method::Get, Route::Meta, path);
        payload(self.execute(req).await?)
    }

    pub async fn copy_file(&self, from: &str, to: &str) -> Result<bool, ClientError> {
        let req = Request::new(Method::Post, Route::Copy, from).with_body(to.to_owned().to_body()?);
        flag(self.execute(req).await?)
    }

    #[instrument(skip(self, plan), fields(n_seqs = plan.seqs.len()), err)]
    pub async fn recover_file(&self, path: &str, plan: &RecoverPlan) -> Result<bool, ClientError> {
        let req = Request::new(Method::Post, Route::Recover, path).with_body(plan.to_body()?);
        flag(self.execute(req).await?)
    }
}

fn close_request(path: &str) -> Request {
    Request::new(Method::Close, Route::DiskNode, path)
}

fn status_error(status: Status, resp: &Response) -> ClientError {
    ClientError::Status {
        status,
        msg: resp.message(),
    }
}

/// a refusal is `false`, never an error
fn flag(resp: Response) -> Result<bool, ClientError> {
    if !resp.status.is_success() {
        debug!("request refused ({:?}): {}", resp.status, resp.message());
        return Ok(false);
    }
    Ok(bool::from_body(&resp.body)?)
}

fn payload<T: Payload>(resp: Response) -> Result<Option<T>, ClientError> {
    match resp.status {
        Status::Ok => Ok(Some(T::from_body(&resp.body)?)),
        Status::NotFound => Ok(None),
        status => Err(status_error(status, &resp)),
    }
}
