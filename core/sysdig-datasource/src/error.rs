use thiserror::Error;

use crate::api::TransportError;

/// Error returned to a caller of the datasource.
///
/// It is `Clone` because a single failure (typically a transport failure of a batched call)
/// is delivered to every query waiting on the same batch.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum DatasourceError {
    /// The backend could not be reached, or answered with a non-success status.
    #[error("backend request failed: {0}")]
    Transport(#[from] TransportError),
    /// Every target of the query failed on the backend side.
    #[error("{reason} ({message})")]
    QueryFailed { reason: String, message: String },
    /// The requested time window cannot be served by the backend.
    ///
    /// The batched query path never returns this error: it answers with empty data instead.
    #[error("unable to validate request time")]
    TimeWindowUnavailable,
    /// The backend answered, but not with what we asked for.
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
    /// The batch that carried the query was dropped before answering.
    #[error("query dropped: the batch scheduler stopped before answering")]
    SchedulerClosed,
    /// The query cannot be sent as is.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl DatasourceError {
    /// Returns the HTTP status of the backend response, if the error comes from one.
    pub fn status(&self) -> Option<u16> {
        match self {
            DatasourceError::Transport(TransportError::Status { status, .. }) => Some(*status),
            _ => None,
        }
    }
}
