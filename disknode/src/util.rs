use color_eyre::eyre::{Result, WrapErr};

use std::fs;
use std::io;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::num::NonZeroU16;
use std::path::Path;
use std::path::PathBuf;
use tokio::net::TcpListener;

mod logging;
pub use logging::setup_errors;
pub use logging::setup_test_tracing;
pub use logging::setup_tracing;

pub async fn open_socket(host: IpAddr, port: Option<NonZeroU16>) -> Result<TcpListener> {
    let addr = SocketAddr::new(host, port.map(NonZeroU16::get).unwrap_or(0));
    let listener = TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Could not bind to address: {addr}"))?;

    let open_port = listener.local_addr()?.port();
    match port {
        None => tracing::trace!("OS assigned free TCP port: {open_port}"),
        Some(p) => tracing::trace!("opend TCP port: {p}"),
    }
    Ok(listener)
}

pub fn runtime_dir() -> Result<PathBuf> {
    let temp = std::env::temp_dir().join("disknode");
    match fs::create_dir(&temp) {
        Err(e) if e.kind() != io::ErrorKind::AlreadyExists => {
            Err(e).wrap_err("could not create runtime dir")
        }
        _ => Ok(temp),
    }
}

/// Returns the run number stored in `dir` and stores the next one
pub fn run_number(dir: &Path) -> Result<u16> {
    let path = dir.join("run.txt");
    let run: u16 = match fs::read_to_string(&path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e).wrap_err("could not access run numb file"),
        Ok(run) => run.trim().parse().wrap_err("corrupt run numb file")?,
    };
    fs::write(path, (run + 1).to_string().as_bytes())?;
    Ok(run)
}

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use tokio::task;

/// Spawn a new tokio Task and cancel it on drop.
#[track_caller]
pub fn spawn<T>(future: T) -> Wrapper<T::Output>
where
    T: Future + Send + 'static,
    T::Output: Send + 'static,
{
    Wrapper(task::spawn(future))
}

/// Cancels the wrapped tokio Task on Drop.
#[derive(Debug)]
pub struct Wrapper<T>(task::JoinHandle<T>);

impl<T> Future for Wrapper<T> {
    type Output = Result<T, task::JoinError>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for Wrapper<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    mod run_number {
        use mktemp::Temp;

        use super::*;
        #[test]
        fn increases() {
            let dir = Temp::new_dir().unwrap();
            for correct in 0..10 {
                let run_numb = run_number(&dir).unwrap();
                assert_eq!(run_numb, correct);
            }
        }
    }

    #[tokio::test]
    async fn dropping_the_wrapper_cancels_the_task() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await
        });
        drop(task);
        // the sender is dropped along with the aborted task
        assert!(rx.await.is_err());
    }
}
