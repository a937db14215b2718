/// Shared error type used across all workgrid crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("verification failed")]
    VerificationFailed,

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("prepare failed: {0}")]
    PrepareFailed(String),

    #[error("stream: {0}")]
    StreamError(String),

    #[error("persist: {0}")]
    PersistError(String),

    #[error("deliver: {0}")]
    DeliverError(String),

    #[error("push: {0}")]
    PushError(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("canceled")]
    Canceled,

    #[error("config: {0}")]
    Config(String),

    #[error("driver: {0}")]
    Driver(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
