use std::fmt;

use thiserror::Error;

/// Failure categories shared by every runtime component.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller contract violated; detected before any side effect.
    InvalidArgument,
    /// Valid arguments, wrong lifecycle state.
    OperationForbidden,
    /// The selected device does not support a requested capability.
    Unavailable,
    InvalidFile,
    InvalidPath,
    MemoryError,
    Unsupported,
    Failed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::OperationForbidden => "operation forbidden",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::InvalidFile => "invalid file",
            ErrorKind::InvalidPath => "invalid path",
            ErrorKind::MemoryError => "memory error",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct NnrtError {
    kind: ErrorKind,
    message: String,
}

impl NnrtError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OperationForbidden, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn invalid_file(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidFile, message)
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidPath, message)
    }

    pub fn memory(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MemoryError, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Failed, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Prefixes the message with extra context, keeping the kind.
    pub fn context(self, context: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{context}: {}", self.message),
        }
    }
}

pub type NnrtResult<T> = Result<T, NnrtError>;

/// Early-return helper mirroring `anyhow::ensure!` for typed errors.
#[macro_export]
macro_rules! ensure_arg {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::NnrtError::invalid_argument(format!($($arg)*)));
        }
    };
}
