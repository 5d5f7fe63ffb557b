//! Collaborator interfaces implemented by platform adapters.
//!
//! Every call here returns immediately. Results that arrive later (permission
//! dialogs, the radio-enable prompt, the location settings screen, the scan
//! service connecting) are fed back into the engine through its `on_*`
//! callback methods, so they are handled at the engine's serialization point.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decoder::RawAdvertisement;
use crate::region::Region;

/// Location permission state as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionStatus {
    /// Permission granted.
    Allowed,
    /// Permission refused permanently.
    Denied,
    /// Never asked, or the request was cancelled/interrupted.
    NotDetermined,
}

impl PermissionStatus {
    /// Wire string pushed on the authorization channel.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "ALLOWED",
            Self::Denied => "DENIED",
            Self::NotDetermined => "NOT_DETERMINED",
        }
    }
}

impl fmt::Display for PermissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised by the radio collaborator when the hardware capability is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Bluetooth LE radio unsupported")]
pub struct RadioUnsupported;

/// Failure reported by the scan service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed: {message}")]
pub struct ScanServiceError {
    /// Operation that failed (`bind`, `start_observing`, ...).
    pub operation: &'static str,
    /// Platform-provided detail.
    pub message: String,
}

impl ScanServiceError {
    /// Create an error for `operation`.
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

/// How the scan service should observe a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObservationMode {
    /// Continuous per-cycle batches.
    Ranging,
    /// Presence evaluation.
    Monitoring,
}

/// Raw advertisements the scan service collected for one region in one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementBatch {
    /// Identifier of the region the batch was collected for.
    pub region: String,
    /// Undecoded advertisements.
    #[serde(default)]
    pub advertisements: Vec<RawAdvertisement>,
}

/// Everything delivered in one scan cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCycle {
    /// One batch per observed region.
    #[serde(default)]
    pub batches: Vec<AdvertisementBatch>,
}

impl From<AdvertisementBatch> for ScanCycle {
    fn from(batch: AdvertisementBatch) -> Self {
        Self {
            batches: vec![batch],
        }
    }
}

/// Location permission collaborator.
pub trait PermissionSource: Send + Sync {
    /// Current permission state.
    fn check(&self) -> PermissionStatus;

    /// Ask the OS for permission. The answer arrives via
    /// `RegionEngine::on_permission_result`.
    fn request(&self);
}

/// Bluetooth radio collaborator.
pub trait RadioStateSource: Send + Sync {
    /// Whether the radio is powered on.
    ///
    /// # Errors
    ///
    /// Returns [`RadioUnsupported`] when the device has no usable radio.
    fn is_enabled(&self) -> Result<bool, RadioUnsupported>;

    /// Prompt the user to turn the radio on. The answer arrives via
    /// `RegionEngine::on_radio_enable_result`.
    fn request_enable(&self);
}

/// OS location service collaborator.
pub trait LocationServiceSource: Send + Sync {
    /// Whether location services are on.
    fn is_enabled(&self) -> bool;

    /// Open the location settings screen. Its dismissal arrives via
    /// `RegionEngine::on_location_settings_result`.
    fn open_settings(&self);
}

/// The platform scanning service.
pub trait ScanService: Send + Sync {
    /// Start binding. Readiness arrives via `RegionEngine::on_service_connected`.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform refuses the binding outright.
    fn bind(&self) -> Result<(), ScanServiceError>;

    /// Release the binding.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform fails to release the binding.
    fn unbind(&self) -> Result<(), ScanServiceError>;

    /// Start delivering batches for `region`.
    ///
    /// # Errors
    ///
    /// Returns an error if the service rejects the region.
    fn start_observing(&self, region: &Region, mode: ObservationMode)
        -> Result<(), ScanServiceError>;

    /// Stop delivering batches for `region`.
    ///
    /// # Errors
    ///
    /// Returns an error if the service fails to stop.
    fn stop_observing(&self, region: &Region, mode: ObservationMode)
        -> Result<(), ScanServiceError>;
}

/// The collaborators an engine is constructed with.
#[derive(Clone)]
pub struct Collaborators {
    /// Location permission.
    pub permission: Arc<dyn PermissionSource>,
    /// Bluetooth radio.
    pub radio: Arc<dyn RadioStateSource>,
    /// OS location service.
    pub location: Arc<dyn LocationServiceSource>,
    /// Platform scanning service.
    pub scan: Arc<dyn ScanService>,
}

impl Collaborators {
    /// Use one adapter for every collaborator role.
    pub fn from_platform<P>(platform: Arc<P>) -> Self
    where
        P: PermissionSource + RadioStateSource + LocationServiceSource + ScanService + 'static,
    {
        Self {
            permission: platform.clone(),
            radio: platform.clone(),
            location: platform.clone(),
            scan: platform,
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
