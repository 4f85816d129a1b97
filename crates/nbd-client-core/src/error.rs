use crate::transport::{TransportError, TransportErrorKind};
use std::fmt;

/// POSIX error numbers (Linux numbering) surfaced to device-node collaborators.
pub mod errno {
    pub const EIO: i32 = 5;
    pub const ENXIO: i32 = 6;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const EROFS: i32 = 30;
    pub const EILSEQ: i32 = 84;
    pub const EPROTONOSUPPORT: i32 = 93;
    pub const EOPNOTSUPP: i32 = 95;
    pub const ETIMEDOUT: i32 = 110;
}

/// Failure categories returned by every control and I/O operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceErrorKind {
    /// Unit index outside the table.
    InvalidUnit,
    /// Malformed caller input (endpoint bytes, table configuration).
    InvalidArgument,
    /// Another opener holds the unit exclusively.
    Busy,
    /// The unit already has an established transport.
    AlreadyConnected,
    /// Connection-level operation on a unit without a transport.
    NotConnected,
    /// Control or I/O operation that requires a live transport.
    DeviceNotReady,
    /// Greeting or reply framing did not match the protocol.
    ProtocolError,
    /// Buffer too small, transfer failure or socket-level error.
    Io,
    /// Teardown requested on a unit without a transport.
    NothingToTeardown,
    /// Close attempted by an opener that does not own the unit.
    InvalidState,
    /// Socket creation or connect initiation failed.
    ConnectFailed,
    /// Operation not offered by the transport.
    Unsupported,
    /// Write requested on a unit whose export is read-only.
    ReadOnly,
    /// Caller-side wait gave up.
    TimedOut,
}

impl DeviceErrorKind {
    /// True for the "not ready" class: no usable transport behind the unit.
    pub fn is_not_ready(self) -> bool {
        matches!(self, Self::NotConnected | Self::DeviceNotReady)
    }

    fn default_errno(self) -> i32 {
        match self {
            Self::InvalidUnit | Self::NotConnected | Self::DeviceNotReady => errno::ENXIO,
            Self::Busy | Self::AlreadyConnected => errno::EBUSY,
            Self::ProtocolError => errno::EILSEQ,
            Self::Io | Self::ConnectFailed => errno::EIO,
            Self::InvalidArgument | Self::NothingToTeardown | Self::InvalidState => errno::EINVAL,
            Self::Unsupported => errno::EOPNOTSUPP,
            Self::ReadOnly => errno::EROFS,
            Self::TimedOut => errno::ETIMEDOUT,
        }
    }
}

/// Error surfaced by the device table, controller, dispatcher and control surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceError {
    kind: DeviceErrorKind,
    code: Option<i32>,
    message: Option<String>,
}

impl DeviceError {
    pub const fn new(kind: DeviceErrorKind) -> Self {
        Self {
            kind,
            code: None,
            message: None,
        }
    }

    pub fn with_message(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: Some(message.into()),
        }
    }

    /// Attach an underlying OS or server error number.
    pub fn with_code(mut self, code: Option<i32>) -> Self {
        self.code = code;
        self
    }

    pub(crate) fn connect_failed(err: TransportError) -> Self {
        Self::with_message(DeviceErrorKind::ConnectFailed, err.to_string()).with_code(err.code())
    }

    pub fn kind(&self) -> DeviceErrorKind {
        self.kind
    }

    /// Underlying error number, when the failure came from the socket or the server.
    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Stable errno for callers that surface failures as integer codes.
    pub fn errno(&self) -> i32 {
        match self.kind {
            DeviceErrorKind::ConnectFailed | DeviceErrorKind::Io => {
                self.code.unwrap_or_else(|| self.kind.default_errno())
            }
            kind => kind.default_errno(),
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.message(), self.code) {
            (Some(msg), Some(code)) => write!(f, "{:?} ({code}): {msg}", self.kind),
            (Some(msg), None) => write!(f, "{:?}: {msg}", self.kind),
            (None, Some(code)) => write!(f, "{:?} ({code})", self.kind),
            (None, None) => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<TransportError> for DeviceError {
    fn from(err: TransportError) -> Self {
        let kind = match err.kind() {
            TransportErrorKind::Protocol => DeviceErrorKind::ProtocolError,
            TransportErrorKind::Unsupported => DeviceErrorKind::Unsupported,
            TransportErrorKind::Io
            | TransportErrorKind::Disconnected
            | TransportErrorKind::Remote => DeviceErrorKind::Io,
        };
        DeviceError::with_message(kind, err.to_string()).with_code(err.code())
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;

pub(crate) fn not_ready(unit: usize) -> DeviceError {
    DeviceError::with_message(
        DeviceErrorKind::DeviceNotReady,
        format!("unit {unit} has no connected transport"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_is_stable_per_kind() {
        assert_eq!(DeviceError::new(DeviceErrorKind::InvalidUnit).errno(), errno::ENXIO);
        assert_eq!(DeviceError::new(DeviceErrorKind::Busy).errno(), errno::EBUSY);
        assert_eq!(DeviceError::new(DeviceErrorKind::ProtocolError).errno(), errno::EILSEQ);
        assert_eq!(DeviceError::new(DeviceErrorKind::NothingToTeardown).errno(), errno::EINVAL);
        assert_eq!(DeviceError::new(DeviceErrorKind::ReadOnly).errno(), errno::EROFS);
    }

    #[test]
    fn connect_failed_reports_socket_code() {
        let err = DeviceError::new(DeviceErrorKind::ConnectFailed).with_code(Some(111));
        assert_eq!(err.errno(), 111);
        assert_eq!(DeviceError::new(DeviceErrorKind::ConnectFailed).errno(), errno::EIO);
    }

    #[test]
    fn code_does_not_leak_into_other_kinds() {
        let err = DeviceError::new(DeviceErrorKind::ProtocolError).with_code(Some(5));
        assert_eq!(err.errno(), errno::EILSEQ);
    }

    #[test]
    fn transport_errors_map_to_device_kinds() {
        let err: DeviceError =
            TransportError::with_message(TransportErrorKind::Protocol, "bad reply").into();
        assert_eq!(err.kind(), DeviceErrorKind::ProtocolError);
        let err: DeviceError = TransportError::remote(5).into();
        assert_eq!(err.kind(), DeviceErrorKind::Io);
        assert_eq!(err.errno(), 5);
    }

    #[test]
    fn not_ready_class() {
        assert!(DeviceErrorKind::NotConnected.is_not_ready());
        assert!(DeviceErrorKind::DeviceNotReady.is_not_ready());
        assert!(!DeviceErrorKind::Io.is_not_ready());
    }
}
