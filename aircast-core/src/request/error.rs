use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::models::RequestStatus;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("failed to open station database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on station database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("database path not configured")]
    MissingStore,
    #[error("invalid request status: {0}")]
    InvalidStatus(String),
    #[error("request not found: {0}")]
    NotFound(String),
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
    #[error("illegal transition for {request_id}: {from} -> {to}")]
    TransitionRejected {
        request_id: String,
        from: RequestStatus,
        to: RequestStatus,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type RequestResult<T> = Result<T, RequestError>;
