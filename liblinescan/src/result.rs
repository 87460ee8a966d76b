use std::{collections::TryReserveError, io};
use thiserror::Error;

pub type Result<T> = ::core::result::Result<T, SaneError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SaneError {
    #[error("unsupported")]
    Unsupported,

    #[error("cancelled")]
    Cancelled,

    #[error("device busy")]
    DeviceBusy,

    #[error("invalid value")]
    Inval,

    #[error("end of file")]
    EOF,

    #[error("error occurred while communicating with the device")]
    IO,

    #[error("not enough memory")]
    NoMem,

    #[error("access denied")]
    AccessDenied,
}

impl SaneError {
    /// Cancellation ends a scan without being a failure.
    pub fn is_failure(self) -> bool {
        !matches!(self, SaneError::Cancelled | SaneError::EOF)
    }
}

impl From<TryReserveError> for SaneError {
    fn from(_: TryReserveError) -> Self {
        SaneError::NoMem
    }
}

impl From<SaneError> for io::Error {
    fn from(err: SaneError) -> Self {
        match err {
            SaneError::IO => io::ErrorKind::BrokenPipe.into(),
            SaneError::NoMem => io::ErrorKind::OutOfMemory.into(),
            SaneError::AccessDenied => io::ErrorKind::PermissionDenied.into(),
            err => io::Error::other(err),
        }
    }
}
