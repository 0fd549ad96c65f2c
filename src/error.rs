//! Error taxonomy shared by the registry, the capture path and the façade.
//!
//! Internals propagate `anyhow::Error`; component boundaries convert into
//! `OccupancyError` so callers can branch on `kind()` instead of comparing
//! sentinel values.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Referenced zone/area/record absent.
    NotFound,
    /// Duplicate zone creation.
    AlreadyExists,
    /// Malformed polygon, bbox, identifier or query.
    InvalidInput,
    /// Store or object-storage call failed.
    UpstreamUnavailable,
    /// Unexpected failure during a multi-step write.
    ServerError,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AlreadyExists => "ALREADY_EXISTS",
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorKind::ServerError => "SERVER_ERROR",
        }
    }
}

#[derive(Clone, Debug)]
pub struct OccupancyError {
    kind: ErrorKind,
    message: String,
}

impl OccupancyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    /// Wraps a backend failure, keeping the full `anyhow` context chain.
    pub fn upstream(err: anyhow::Error) -> Self {
        Self::new(ErrorKind::UpstreamUnavailable, format!("{:#}", err))
    }

    /// Like `upstream`, but keeps an `OccupancyError` the store raised itself.
    pub fn from_store(err: anyhow::Error) -> Self {
        match err.downcast::<OccupancyError>() {
            Ok(err) => err,
            Err(err) => Self::upstream(err),
        }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerError, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for OccupancyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for OccupancyError {}

pub type OccupancyResult<T> = std::result::Result<T, OccupancyError>;
