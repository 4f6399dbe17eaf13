use std::fmt;

use nnrt_core::{ErrorKind, NnrtError, NnrtResult};

/// Numeric status reported at the outermost boundary.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReturnCode {
    Success = 0,
    Failed = 1,
    InvalidParameter = 2,
    MemoryError = 3,
    OperationForbidden = 4,
    NullPtr = 5,
    InvalidFile = 6,
    UnavailableDevice = 7,
    InvalidPath = 8,
    Unsupported = 10,
}

impl ReturnCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_result<T>(result: &NnrtResult<T>) -> Self {
        match result {
            Ok(_) => ReturnCode::Success,
            Err(err) => err.into(),
        }
    }
}

impl From<ErrorKind> for ReturnCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::InvalidArgument => ReturnCode::InvalidParameter,
            ErrorKind::OperationForbidden => ReturnCode::OperationForbidden,
            ErrorKind::Unavailable => ReturnCode::UnavailableDevice,
            ErrorKind::InvalidFile => ReturnCode::InvalidFile,
            ErrorKind::InvalidPath => ReturnCode::InvalidPath,
            ErrorKind::MemoryError => ReturnCode::MemoryError,
            ErrorKind::Unsupported => ReturnCode::Unsupported,
            ErrorKind::Failed => ReturnCode::Failed,
        }
    }
}

impl From<&NnrtError> for ReturnCode {
    fn from(err: &NnrtError) -> Self {
        err.kind().into()
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({})", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_results_to_codes() {
        let ok: NnrtResult<()> = Ok(());
        assert_eq!(ReturnCode::from_result(&ok).code(), 0);

        let err: NnrtResult<()> = Err(NnrtError::unavailable("no fp16"));
        assert_eq!(ReturnCode::from_result(&err), ReturnCode::UnavailableDevice);
        assert_eq!(ReturnCode::from(ErrorKind::Unsupported).code(), 10);
    }
}
