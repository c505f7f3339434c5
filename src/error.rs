use std::{io, path::PathBuf};

/// Failure to bring the controller up. These are the only fatal errors in the
/// system: once the worker threads are running, every fault on the request
/// path is converted into a reply or a log line (see `dispatcher`).
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
  #[error(transparent)]
  Transport(#[from] TransportError),

  #[error("spawning {name} thread: {source}")]
  Thread {
    name: &'static str,
    #[source]
    source: io::Error,
  },
}

/// I/O trouble on a named channel endpoint.
///
/// During steady state these are logged and the offending operation is
/// abandoned; only during startup do they become fatal (as `StartupError`).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
  #[error("creating channel {path}: {source}")]
  Create {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("opening channel {path}: {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("reading channel {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

pub type StartupResult<T> = Result<T, StartupError>;
pub type TransportResult<T> = Result<T, TransportError>;
