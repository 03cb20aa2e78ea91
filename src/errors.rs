//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// The substrate tool or daemon (tmux, docker) is not reachable.
    BackendUnavailable(String),
    /// Starting a backend instance or provisioning its working copy failed.
    CreateFailed(String),
    /// Building the container base image failed.
    ImageBuildFailed(String),
    /// Requested agent does not exist.
    NotFound(String),
    /// Agent has no live backend instance.
    NotRunning(String),
    /// Another bridge already owns the terminal in this invocation.
    AlreadyAttached(String),
    /// The attached stream closed because the instance went away.
    SessionEnded(String),
    /// A liveness probe did not answer within its bound.
    ProbeTimeout(String),
    /// A concurrent writer won a compare-and-set on the same agent, or an
    /// identifier was reused.
    Conflict(String),
}

impl AppError {
    /// Process exit code for this error, used by the `am` binary.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Db(_) | Self::Io(_) => 3,
            Self::BackendUnavailable(_) => 4,
            Self::CreateFailed(_) => 5,
            Self::ImageBuildFailed(_) => 6,
            Self::NotFound(_) => 7,
            Self::NotRunning(_) => 8,
            Self::AlreadyAttached(_) => 9,
            Self::SessionEnded(_) => 10,
            Self::ProbeTimeout(_) => 11,
            Self::Conflict(_) => 12,
        }
    }

    /// Whether this error means "the substrate says the instance is absent".
    ///
    /// Teardown paths tolerate these outcomes.
    #[must_use]
    pub fn is_absence(&self) -> bool {
        matches!(self, Self::NotRunning(_) | Self::NotFound(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::BackendUnavailable(msg) => write!(f, "backend unavailable: {msg}"),
            Self::CreateFailed(msg) => write!(f, "create failed: {msg}"),
            Self::ImageBuildFailed(msg) => write!(f, "image build failed: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::NotRunning(msg) => write!(f, "not running: {msg}"),
            Self::AlreadyAttached(msg) => write!(f, "already attached: {msg}"),
            Self::SessionEnded(msg) => write!(f, "session ended: {msg}"),
            Self::ProbeTimeout(msg) => write!(f, "probe timeout: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
