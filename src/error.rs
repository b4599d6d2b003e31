// Error type shared by the library modules. The binary wraps these in
// `anyhow` at the command boundary; inside the library every fallible call
// returns `crate::error::Result`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The cabinet could not be reached or refused our credentials.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A command ran on the cabinet but exited non-zero.
    #[error("Remote command failed: {0}")]
    RemoteCommand(String),

    /// A file copy (local fetch or SCP upload) was interrupted.
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// The archive API could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    /// The archive API answered with an error status or an unexpected body.
    #[error("Unexpected response: {0}")]
    Response(String),

    #[error("Invalid queue entry: {0}")]
    InvalidEntry(String),

    /// Reading or writing the queue file failed.
    #[error("Queue file error: {0}")]
    Queue(String),
}

impl Error {
    /// Losing the cabinet mid-pass; fatal for the rest of a queue run.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// The bare message without the category prefix, as recorded on a
    /// failed queue entry.
    pub fn reason(&self) -> &str {
        match self {
            Error::Connection(m)
            | Error::RemoteCommand(m)
            | Error::Transfer(m)
            | Error::Network(m)
            | Error::Response(m)
            | Error::InvalidEntry(m)
            | Error::Queue(m) => m,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
