use thiserror::Error;

/// Errors shared by every component of the dispatch engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(e.to_string()),
            _ => Error::BackendUnavailable(e.to_string()),
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { path, .. } => Error::NotFound(path),
            object_store::Error::InvalidPath { source } => Error::InvalidKey(source.to_string()),
            other => Error::BackendUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_maps_to_not_found() {
        let e: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(e.is_not_found());
    }

    #[test]
    fn other_io_errors_are_backend_unavailable() {
        let e: Error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope").into();
        assert!(matches!(e, Error::BackendUnavailable(_)));
    }
}
