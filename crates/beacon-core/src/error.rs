//! Unified error types for the beacon core library.
//!
//! This module provides a unified error type [`BeaconError`] that covers all failure
//! modes surfaced by the engine. Each module also has its own specific error types
//! (`RegionError`, `ConfigError`, `ScanServiceError`) for internal use.
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Actionable messages**: Error messages guide users toward resolution
//! - **Sink-ready**: [`BeaconError::error_code`] is the `kind` pushed to subscribers
//!
//! Frames that match neither beacon layout are not errors; the decoder simply
//! returns `None` for them.
//!
//! # Example
//!
//! ```rust
//! use beacon_core::error::{BeaconError, Result};
//!
//! fn require_radio(enabled: bool) -> Result<()> {
//!     if !enabled {
//!         return Err(BeaconError::RadioDisabled);
//!     }
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// The unified error type for all beacon engine operations.
#[derive(Debug, Error)]
pub enum BeaconError {
    // =========================================================================
    // REGION ERRORS
    // =========================================================================
    /// A region definition could not be parsed.
    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    // =========================================================================
    // AVAILABILITY ERRORS
    // =========================================================================
    /// The device has no Bluetooth LE radio, or its state cannot be queried.
    #[error("Bluetooth LE is not supported on this device")]
    RadioUnsupported,

    /// The radio is off and the user declined to enable it.
    #[error("Bluetooth is disabled. Enable Bluetooth to scan for beacons.")]
    RadioDisabled,

    /// The OS location service is off.
    #[error("Location services are disabled. Enable location to scan for beacons.")]
    LocationServiceDisabled,

    /// The location permission required for scanning was not granted.
    #[error("Location permission not granted")]
    PermissionDenied,

    // =========================================================================
    // SCAN SERVICE ERRORS
    // =========================================================================
    /// The platform scan service failed to bind, unbind or observe a region.
    #[error("Scan service unavailable: {0}")]
    ScanServiceUnavailable(String),

    // =========================================================================
    // REMEDIATION ERRORS
    // =========================================================================
    /// Another permission/settings flow is already waiting for the user.
    #[error("Another availability request is already in progress")]
    RemediationInProgress,

    /// The user never answered the permission/settings prompt.
    #[error("Availability request timed out after {secs} seconds")]
    RemediationTimedOut {
        /// Configured timeout.
        secs: u64,
    },

    /// The engine was closed while a request was still waiting.
    #[error("Availability request cancelled because the engine was closed")]
    RemediationCancelled,

    // =========================================================================
    // CONFIGURATION & I/O ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for beacon engine operations.
pub type Result<T> = std::result::Result<T, BeaconError>;

impl BeaconError {
    /// Returns `true` if this error comes from the availability gate.
    #[inline]
    #[must_use]
    pub const fn is_availability_error(&self) -> bool {
        matches!(
            self,
            Self::RadioUnsupported
                | Self::RadioDisabled
                | Self::LocationServiceDisabled
                | Self::PermissionDenied
        )
    }

    /// Returns `true` if this error describes a malformed region.
    #[inline]
    #[must_use]
    pub const fn is_region_error(&self) -> bool {
        matches!(self, Self::InvalidRegion(_))
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if retrying the same request later may succeed.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RemediationInProgress
                | Self::RemediationTimedOut { .. }
                | Self::ScanServiceUnavailable(_)
                | Self::RadioDisabled
                | Self::LocationServiceDisabled
        )
    }

    /// Returns a machine-readable error code, used as the error kind on sinks.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRegion(_) => "INVALID_REGION",
            Self::RadioUnsupported => "RADIO_UNSUPPORTED",
            Self::RadioDisabled => "RADIO_DISABLED",
            Self::LocationServiceDisabled => "LOCATION_SERVICE_DISABLED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ScanServiceUnavailable(_) => "SCAN_SERVICE_UNAVAILABLE",
            Self::RemediationInProgress => "REMEDIATION_IN_PROGRESS",
            Self::RemediationTimedOut { .. } => "REMEDIATION_TIMED_OUT",
            Self::RemediationCancelled => "REMEDIATION_CANCELLED",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for BeaconError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::ReadError { path, source } | ConfigError::WriteError { path, source } => {
                Self::IoError(std::io::Error::new(
                    source.kind(),
                    format!("{}: {source}", path.display()),
                ))
            }
            ConfigError::ParseError(message) => Self::ConfigParseError(message),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::region::RegionError> for BeaconError {
    fn from(err: crate::region::RegionError) -> Self {
        Self::InvalidRegion(err.to_string())
    }
}

impl From<crate::platform::ScanServiceError> for BeaconError {
    fn from(err: crate::platform::ScanServiceError) -> Self {
        Self::ScanServiceUnavailable(err.to_string())
    }
}

impl From<crate::platform::RadioUnsupported> for BeaconError {
    fn from(_: crate::platform::RadioUnsupported) -> Self {
        Self::RadioUnsupported
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoErr, ErrorKind};

    #[test]
    fn test_availability_error_classification() {
        assert!(BeaconError::RadioUnsupported.is_availability_error());
        assert!(BeaconError::RadioDisabled.is_availability_error());
        assert!(BeaconError::LocationServiceDisabled.is_availability_error());
        assert!(BeaconError::PermissionDenied.is_availability_error());

        assert!(!BeaconError::InvalidRegion("x".into()).is_availability_error());
    }

    #[test]
    fn test_region_and_config_classification() {
        assert!(BeaconError::InvalidRegion("bad uuid".into()).is_region_error());
        assert!(BeaconError::ConfigNotFound(PathBuf::from("/test")).is_config_error());
        assert!(BeaconError::ConfigValidationError("x".into()).is_config_error());
        assert!(!BeaconError::PermissionDenied.is_config_error());
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(BeaconError::RemediationInProgress.is_recoverable());
        assert!(BeaconError::ScanServiceUnavailable("bind".into()).is_recoverable());
        assert!(!BeaconError::RadioUnsupported.is_recoverable());
        assert!(!BeaconError::InvalidRegion("x".into()).is_recoverable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            BeaconError::InvalidRegion("x".into()).error_code(),
            "INVALID_REGION"
        );
        assert_eq!(BeaconError::PermissionDenied.error_code(), "PERMISSION_DENIED");
        assert_eq!(
            BeaconError::RemediationTimedOut { secs: 5 }.error_code(),
            "REMEDIATION_TIMED_OUT"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoErr::new(ErrorKind::NotFound, "file not found");
        let err: BeaconError = io_err.into();
        assert!(matches!(err, BeaconError::IoError(_)));
    }

    #[test]
    fn test_from_region_error() {
        let err: BeaconError = crate::region::RegionError::MissingIdentifier.into();
        assert!(err.is_region_error());
        assert!(err.to_string().contains("identifier"));
    }

    #[test]
    fn test_error_display_messages() {
        let err = BeaconError::RemediationTimedOut { secs: 30 };
        assert!(err.to_string().contains("30 seconds"));

        let err = BeaconError::ScanServiceUnavailable("bind refused".into());
        assert!(err.to_string().contains("bind refused"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<BeaconError>();
        assert_sync::<BeaconError>();
    }
}
