use std::collections::TryReserveError;

/// Result alias that carries the custom [`FrameStoreError`] type.
pub type Result<T> = std::result::Result<T, FrameStoreError>;

/// Coarse classification of a [`FrameStoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadParameter,
    BadValue,
    InvalidState,
    InsufficientMemory,
    NotImplemented,
    Io,
    Config,
}

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum FrameStoreError {
    /// A required argument was missing or empty.
    #[error("bad parameter: {0}")]
    BadParameter(String),
    /// Unknown id or name, or a value of the wrong kind.
    #[error("bad value: {0}")]
    BadValue(String),
    /// The object is in the wrong lifecycle phase for the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Growing an internal table failed.
    #[error("insufficient memory")]
    InsufficientMemory(#[from] TryReserveError),
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl FrameStoreError {
    pub fn bad_parameter<T: Into<String>>(msg: T) -> Self {
        Self::BadParameter(msg.into())
    }

    pub fn bad_value<T: Into<String>>(msg: T) -> Self {
        Self::BadValue(msg.into())
    }

    pub fn invalid_state<T: Into<String>>(msg: T) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Returns the taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadParameter(_) => ErrorKind::BadParameter,
            Self::BadValue(_) => ErrorKind::BadValue,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::InsufficientMemory(_) => ErrorKind::InsufficientMemory,
            Self::NotImplemented(_) => ErrorKind::NotImplemented,
            Self::Io(_) => ErrorKind::Io,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        Self::InvalidState(format!("{what} lock has been poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(
            FrameStoreError::bad_value("x").kind(),
            ErrorKind::BadValue
        );
        assert_eq!(
            FrameStoreError::NotImplemented("shallow clone").kind(),
            ErrorKind::NotImplemented
        );
    }

    #[test]
    fn reserve_failure_maps_to_insufficient_memory() {
        let mut v: Vec<u64> = Vec::new();
        let err: FrameStoreError = v.try_reserve(usize::MAX).unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::InsufficientMemory);
    }
}
