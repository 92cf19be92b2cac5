use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use tokio::task;

/// Spawn a new tokio Task and cancel it on drop.
#[track_caller]
pub(crate) fn spawn<T>(future: T) -> AbortOnDrop<T::Output>
where
    T: Future + Send + 'static,
    T::Output: Send + 'static,
{
    AbortOnDrop(task::spawn(future))
}

/// Cancels the wrapped tokio Task on Drop.
#[derive(Debug)]
pub(crate) struct AbortOnDrop<T>(task::JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, task::JoinError>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
