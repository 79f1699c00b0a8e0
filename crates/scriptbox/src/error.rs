use std::sync::Arc;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error source that can be handed to many waiters at once.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Stat or read of a script source failed.
    #[error("read {path}: {source}")]
    SourceRead {
        path: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// A transpile step rejected the source; compilation did not start.
    #[error("transpile {file}: {source}")]
    Transpile {
        file: String,
        #[source]
        source: SharedError,
    },

    /// The engine rejected the source.
    #[error("compile {file}: {source}")]
    Compile {
        file: String,
        #[source]
        source: SharedError,
    },

    /// A call binding could not be injected into the compiled unit.
    #[error("bind `{name}`: {source}")]
    Binding {
        name: String,
        #[source]
        source: SharedError,
    },

    /// The script failed while executing.
    #[error("runtime: {0}")]
    Runtime(#[source] SharedError),

    /// The run was aborted through its cancellation token.
    #[error("execution cancelled")]
    Cancelled,

    #[error("config {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("import not found: {0}")]
    ImportNotFound(String),

    #[error("sandbox [{0}] exists")]
    DuplicateSandboxName(String),

    #[error("sandbox [{0}] not exists")]
    UnknownSandbox(String),

    #[error("sandbox name must not be empty")]
    InvalidName,

    #[error("sandbox [{0}] is closed")]
    Closed(String),

    /// Opening, reading or unpacking a package archive failed.
    #[error("package {archive}: {message}")]
    Package { archive: String, message: String },

    /// A remote module responded with a non-success status.
    #[error("request failed with {status}: {body}")]
    Fetch {
        url: String,
        status: u16,
        body: String,
    },

    #[error("request {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: SharedError,
    },
}

impl Error {
    pub(crate) fn source_read(path: impl Into<String>, err: std::io::Error) -> Self {
        Self::SourceRead {
            path: path.into(),
            source: Arc::new(err),
        }
    }

    pub(crate) fn runtime(err: BoxError) -> Self {
        Self::Runtime(Arc::from(err))
    }

    pub(crate) fn package(archive: impl Into<String>, message: impl ToString) -> Self {
        Self::Package {
            archive: archive.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error only reports that a source file is absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SourceRead { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}
