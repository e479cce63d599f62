//! The error taxonomy shared by every imaging operation.
//!
//! Each error belongs to exactly one [`ErrorCategory`] and carries a
//! human-readable message. Errors that originate from an OS call also keep
//! the OS error code and text so that a front-end can show both.
use std::fmt;
use std::io;
use thiserror::Error;

/// The category an [`ImagingError`] is reported under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Path, permission or existence problems with the image container file.
    File,
    /// Failure to acquire a device handle or its geometry, or media absent.
    Device,
    /// Failure to open, lock or unmount a volume.
    Volume,
    /// Sector read failure.
    Read,
    /// Sector write failure, or an image that does not fit the device.
    Write,
    /// Byte mismatch, or an I/O failure during the verify phase.
    Verify,
    /// Another operation is already running.
    Busy,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::File => "File Error",
            ErrorCategory::Device => "Device Error",
            ErrorCategory::Volume => "Volume Error",
            ErrorCategory::Read => "Read Error",
            ErrorCategory::Write => "Write Error",
            ErrorCategory::Verify => "Verify Error",
            ErrorCategory::Busy => "Busy",
        };
        f.write_str(name)
    }
}

/// The originating OS error of a failed call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OsError {
    /// The raw OS error code, when the failure came from a system call.
    pub code: Option<i32>,
    pub text: String,
}

impl OsError {
    pub fn from_io(err: &io::Error) -> Self {
        Self {
            code: err.raw_os_error(),
            text: err.to_string(),
        }
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "Error {}: {}", code, self.text),
            None => f.write_str(&self.text),
        }
    }
}

fn os_suffix(os: &Option<OsError>) -> String {
    match os {
        Some(os) => format!("\n {os}"),
        None => String::new(),
    }
}

/// Errors produced by the imaging core.
#[derive(Error, Debug)]
pub enum ImagingError {
    #[error("{message}{}", os_suffix(.os))]
    File {
        message: String,
        os: Option<OsError>,
    },

    #[error("{message}{}", os_suffix(.os))]
    Device {
        message: String,
        os: Option<OsError>,
    },

    /// The device reported a size of zero: the media was pulled from its
    /// reader or is otherwise unavailable.
    #[error("{message}")]
    MediaAbsent { message: String },

    #[error("{message}{}", os_suffix(.os))]
    Volume {
        message: String,
        os: Option<OsError>,
    },

    #[error("{message}{}", os_suffix(.os))]
    Read {
        message: String,
        os: Option<OsError>,
    },

    #[error("{message}{}", os_suffix(.os))]
    Write {
        message: String,
        os: Option<OsError>,
    },

    #[error("{message}{}", os_suffix(.os))]
    Verify {
        message: String,
        os: Option<OsError>,
    },

    #[error("An imaging operation is already running.")]
    Busy,
}

impl ImagingError {
    /// Creates an error of the given category without OS details.
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self::build(category, message.into(), None)
    }

    /// Creates an error of the given category that keeps the OS code and text
    /// of `err`.
    pub fn with_os(category: ErrorCategory, message: impl Into<String>, err: &io::Error) -> Self {
        Self::build(category, message.into(), Some(OsError::from_io(err)))
    }

    pub fn media_absent(message: impl Into<String>) -> Self {
        Self::MediaAbsent {
            message: message.into(),
        }
    }

    fn build(category: ErrorCategory, message: String, os: Option<OsError>) -> Self {
        match category {
            ErrorCategory::File => Self::File { message, os },
            ErrorCategory::Device => Self::Device { message, os },
            ErrorCategory::Volume => Self::Volume { message, os },
            ErrorCategory::Read => Self::Read { message, os },
            ErrorCategory::Write => Self::Write { message, os },
            ErrorCategory::Verify => Self::Verify { message, os },
            ErrorCategory::Busy => Self::Busy,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::File { .. } => ErrorCategory::File,
            Self::Device { .. } | Self::MediaAbsent { .. } => ErrorCategory::Device,
            Self::Volume { .. } => ErrorCategory::Volume,
            Self::Read { .. } => ErrorCategory::Read,
            Self::Write { .. } => ErrorCategory::Write,
            Self::Verify { .. } => ErrorCategory::Verify,
            Self::Busy => ErrorCategory::Busy,
        }
    }

    /// The message without the OS details.
    pub fn message(&self) -> &str {
        match self {
            Self::File { message, .. }
            | Self::Device { message, .. }
            | Self::Volume { message, .. }
            | Self::Read { message, .. }
            | Self::Write { message, .. }
            | Self::Verify { message, .. }
            | Self::MediaAbsent { message } => message,
            Self::Busy => "An imaging operation is already running.",
        }
    }

    pub fn os_error(&self) -> Option<&OsError> {
        match self {
            Self::File { os, .. }
            | Self::Device { os, .. }
            | Self::Volume { os, .. }
            | Self::Read { os, .. }
            | Self::Write { os, .. }
            | Self::Verify { os, .. } => os.as_ref(),
            Self::MediaAbsent { .. } | Self::Busy => None,
        }
    }

    pub fn is_media_absent(&self) -> bool {
        matches!(self, Self::MediaAbsent { .. })
    }

    /// Re-files the error under `category`, keeping message and OS details.
    ///
    /// Used by the verify phase, where any read failure is a verify failure.
    pub(crate) fn recategorize(self, category: ErrorCategory) -> Self {
        match self {
            Self::Busy => Self::Busy,
            Self::MediaAbsent { message } => Self::build(category, message, None),
            other => {
                let os = other.os_error().cloned();
                let message = other.message().to_string();
                Self::build(category, message, os)
            }
        }
    }
}

/// Result type alias for imaging operations.
pub type Result<T> = std::result::Result<T, ImagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_appends_os_details() {
        let err = ImagingError::with_os(
            ErrorCategory::Read,
            "An error occurred when attempting to read data from handle.",
            &io::Error::from_raw_os_error(5),
        );
        let text = err.to_string();
        assert!(text.starts_with("An error occurred when attempting to read data from handle."));
        assert!(text.contains("Error 5:"));
        assert_eq!(err.category(), ErrorCategory::Read);
        assert_eq!(err.os_error().and_then(|os| os.code), Some(5));
    }

    #[test]
    fn media_absent_is_a_device_error() {
        let err = ImagingError::media_absent("The media was removed.");
        assert_eq!(err.category(), ErrorCategory::Device);
        assert!(err.is_media_absent());
        assert_eq!(err.category().to_string(), "Device Error");
    }

    #[test]
    fn recategorize_keeps_message_and_code() {
        let err = ImagingError::with_os(
            ErrorCategory::Read,
            "read failed",
            &io::Error::from_raw_os_error(21),
        )
        .recategorize(ErrorCategory::Verify);
        assert_eq!(err.category(), ErrorCategory::Verify);
        assert_eq!(err.message(), "read failed");
        assert_eq!(err.os_error().and_then(|os| os.code), Some(21));
    }
}
