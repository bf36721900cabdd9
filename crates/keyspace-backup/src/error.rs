use std::fmt;

#[derive(Debug)]
pub enum Error {
    NoHostsFound,
    NonMonotonicTimestamp {
        generated: String,
        latest: String,
    },
    ChainDecode {
        key: String,
        reason: String,
    },
    ChainCycle {
        snapshot: String,
    },
    UnknownSnapshot(String),
    InvalidSnapshot(String),
    NoBackupAvailable,
    CaptureFailed {
        host: String,
        source: Box<Error>,
    },
    UploadFailed {
        host: String,
        file: String,
        source: Box<Error>,
    },
    CleanupFailed {
        host: String,
        source: Box<Error>,
    },
    BulkLoadFailed {
        directory: String,
        source: Box<Error>,
    },
    /// A backup stopped after some of its files were already stored.
    PartialSnapshot {
        snapshot: String,
        stored: usize,
        source: Box<Error>,
    },
    Config(String),
    Msg(String),
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Msg(msg.into())
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::Config(msg.into())
    }

    pub fn chain_decode(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ChainDecode {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn capture_failed(host: &str, source: Error) -> Self {
        Self::CaptureFailed {
            host: host.to_string(),
            source: Box::new(source),
        }
    }

    pub fn upload_failed(host: &str, file: &str, source: Error) -> Self {
        Self::UploadFailed {
            host: host.to_string(),
            file: file.to_string(),
            source: Box::new(source),
        }
    }

    pub fn cleanup_failed(host: &str, source: Error) -> Self {
        Self::CleanupFailed {
            host: host.to_string(),
            source: Box::new(source),
        }
    }

    pub fn bulk_load_failed(directory: &str, source: Error) -> Self {
        Self::BulkLoadFailed {
            directory: directory.to_string(),
            source: Box::new(source),
        }
    }

    /// Host the failure is attributed to, if it came out of a per-host stage.
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::CaptureFailed { host, .. }
            | Self::UploadFailed { host, .. }
            | Self::CleanupFailed { host, .. } => Some(host),
            Self::PartialSnapshot { source, .. } => source.host(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHostsFound => write!(f, "no live cluster hosts found"),
            Self::NonMonotonicTimestamp { generated, latest } => write!(
                f,
                "new snapshot id '{generated}' is not after latest snapshot '{latest}'"
            ),
            Self::ChainDecode { key, reason } => {
                write!(f, "malformed artifact key '{key}': {reason}")
            }
            Self::ChainCycle { snapshot } => {
                write!(f, "snapshot chain loops back to '{snapshot}'")
            }
            Self::UnknownSnapshot(id) => write!(f, "snapshot '{id}' has no stored artifacts"),
            Self::InvalidSnapshot(id) => write!(f, "'{id}' is not a valid snapshot"),
            Self::NoBackupAvailable => write!(f, "no existing backup to restore from"),
            Self::CaptureFailed { host, source } => write!(f, "capture @ {host}: {source}"),
            Self::UploadFailed { host, file, source } => {
                write!(f, "upload @ {host} of {file}: {source}")
            }
            Self::CleanupFailed { host, source } => write!(f, "cleanup @ {host}: {source}"),
            Self::BulkLoadFailed { directory, source } => {
                write!(f, "bulk load of {directory} failed on every node: {source}")
            }
            Self::PartialSnapshot {
                snapshot,
                stored,
                source,
            } => write!(
                f,
                "snapshot '{snapshot}' is partial ({stored} files stored before the run stopped); \
                 do not restore it or build incrementals on it: {source}"
            ),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Msg(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CaptureFailed { source, .. }
            | Self::UploadFailed { source, .. }
            | Self::CleanupFailed { source, .. }
            | Self::BulkLoadFailed { source, .. }
            | Self::PartialSnapshot { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
