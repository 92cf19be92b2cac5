use crate::ClientError;

/// Outcome of a request issued in the non-blocking form, handed to the
/// callback exactly once.
#[derive(Debug)]
pub enum Completion<T> {
    Completed(T),
    Failed(ClientError),
    /// the connection went away before an answer arrived
    Cancelled,
}

impl<T> Completion<T> {
    pub fn into_result(self) -> Result<T, ClientError> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Failed(e) => Err(e),
            Self::Cancelled => Err(ClientError::Cancelled),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Completion<U> {
        match self {
            Self::Completed(value) => Completion::Completed(f(value)),
            Self::Failed(e) => Completion::Failed(e),
            Self::Cancelled => Completion::Cancelled,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

impl<T> From<Result<T, ClientError>> for Completion<T> {
    fn from(res: Result<T, ClientError>) -> Self {
        match res {
            Ok(value) => Self::Completed(value),
            Err(ClientError::Cancelled) => Self::Cancelled,
            Err(e) => Self::Failed(e),
        }
    }
}
