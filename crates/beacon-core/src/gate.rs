//! Availability gate: decides whether scanning may start.
//!
//! The gate owns [`AvailabilityState`]. It refreshes each field from its
//! collaborator when asked and reports the first unmet requirement in the
//! fixed order radio → permission → location service.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::platform::{LocationServiceSource, PermissionSource, PermissionStatus, RadioStateSource};

/// Radio state as observed by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RadioState {
    /// Powered on.
    On,
    /// Powered off.
    Off,
    /// No usable radio on this device.
    Unsupported,
}

impl RadioState {
    /// Wire string for the `bluetoothState` query.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::On => "STATE_ON",
            Self::Off => "STATE_OFF",
            Self::Unsupported => "STATE_UNSUPPORTED",
        }
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scan service binding state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Binding {
    /// No binding.
    Unbound,
    /// `bind()` issued, waiting for the service to connect.
    Pending,
    /// Service connected.
    Bound,
}

/// Result of [`AvailabilityGate::ensure_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// All requirements hold.
    Ready,
    /// The radio is off.
    NeedsRadio,
    /// Location permission is missing.
    NeedsPermission,
    /// Location services are off.
    NeedsLocationService,
    /// The device cannot scan at all.
    RadioUnsupported,
}

/// Snapshot of everything the gate tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AvailabilityState {
    /// Last known permission status.
    pub permission: PermissionStatus,
    /// Last known radio state.
    pub radio: RadioState,
    /// Last known location service state.
    pub location_service_enabled: bool,
    /// Scan service binding.
    pub binding: Binding,
}

impl Default for AvailabilityState {
    fn default() -> Self {
        Self {
            permission: PermissionStatus::NotDetermined,
            radio: RadioState::Off,
            location_service_enabled: false,
            binding: Binding::Unbound,
        }
    }
}

/// Availability state machine.
pub struct AvailabilityGate {
    state: AvailabilityState,
    permission: Arc<dyn PermissionSource>,
    radio: Arc<dyn RadioStateSource>,
    location: Arc<dyn LocationServiceSource>,
}

impl fmt::Debug for AvailabilityGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AvailabilityGate")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl AvailabilityGate {
    /// Create a gate over the given collaborators.
    pub fn new(
        permission: Arc<dyn PermissionSource>,
        radio: Arc<dyn RadioStateSource>,
        location: Arc<dyn LocationServiceSource>,
    ) -> Self {
        Self {
            state: AvailabilityState::default(),
            permission,
            radio,
            location,
        }
    }

    /// Current state without querying collaborators.
    #[must_use]
    pub const fn state(&self) -> AvailabilityState {
        self.state
    }

    /// Query the permission collaborator.
    pub fn check_permission(&mut self) -> PermissionStatus {
        self.state.permission = self.permission.check();
        self.state.permission
    }

    /// Ask the OS for permission. The answer comes back through
    /// [`apply_permission_result`](Self::apply_permission_result).
    pub fn request_permission(&self) {
        debug!("Requesting location permission");
        self.permission.request();
    }

    /// Record the outcome of a permission request.
    pub fn apply_permission_result(&mut self, status: PermissionStatus) -> PermissionStatus {
        self.state.permission = status;
        status
    }

    /// Query the radio. A missing capability becomes [`RadioState::Unsupported`].
    pub fn check_radio_enabled(&mut self) -> RadioState {
        self.state.radio = match self.radio.is_enabled() {
            Ok(true) => RadioState::On,
            Ok(false) => RadioState::Off,
            Err(e) => {
                warn!(error = %e, "Radio state query failed");
                RadioState::Unsupported
            }
        };
        self.state.radio
    }

    /// Prompt the user to enable the radio.
    pub fn request_radio_enable(&self) {
        debug!("Requesting radio enable");
        self.radio.request_enable();
    }

    /// Query the location service.
    pub fn check_location_service_enabled(&mut self) -> bool {
        self.state.location_service_enabled = self.location.is_enabled();
        self.state.location_service_enabled
    }

    /// Open the location settings screen.
    pub fn open_location_settings(&self) {
        debug!("Opening location settings");
        self.location.open_settings();
    }

    /// Refresh all requirements and return the first unmet one.
    pub fn ensure_ready(&mut self) -> Readiness {
        match self.check_radio_enabled() {
            RadioState::Unsupported => return Readiness::RadioUnsupported,
            RadioState::Off => return Readiness::NeedsRadio,
            RadioState::On => {}
        }
        if self.check_permission() != PermissionStatus::Allowed {
            return Readiness::NeedsPermission;
        }
        if !self.check_location_service_enabled() {
            return Readiness::NeedsLocationService;
        }
        Readiness::Ready
    }

    /// Current binding.
    #[must_use]
    pub const fn binding(&self) -> Binding {
        self.state.binding
    }

    /// Whether the scan service is connected.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.state.binding == Binding::Bound
    }

    /// Mark a bind as started. Returns `false` if already bound or binding,
    /// in which case the caller must not issue another platform bind.
    pub fn begin_bind(&mut self) -> bool {
        if self.state.binding == Binding::Unbound {
            self.state.binding = Binding::Pending;
            true
        } else {
            false
        }
    }

    /// Mark the scan service connected.
    pub fn complete_bind(&mut self) {
        self.state.binding = Binding::Bound;
    }

    /// Mark the binding released. Returns `false` if nothing was bound.
    pub fn unbind(&mut self) -> bool {
        let was_bound = self.state.binding != Binding::Unbound;
        self.state.binding = Binding::Unbound;
        was_bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPlatform;

    fn gate(platform: &Arc<MockPlatform>) -> AvailabilityGate {
        AvailabilityGate::new(platform.clone(), platform.clone(), platform.clone())
    }

    #[test]
    fn test_ready_when_everything_holds() {
        let platform = Arc::new(MockPlatform::ready());
        let mut gate = gate(&platform);
        assert_eq!(gate.ensure_ready(), Readiness::Ready);
        assert_eq!(gate.state().permission, PermissionStatus::Allowed);
        assert!(gate.state().location_service_enabled);
    }

    #[test]
    fn test_priority_order_radio_permission_location() {
        let platform = Arc::new(MockPlatform::new());
        let mut gate = gate(&platform);
        // everything unmet: radio first
        assert_eq!(gate.ensure_ready(), Readiness::NeedsRadio);

        platform.set_radio_enabled(true);
        assert_eq!(gate.ensure_ready(), Readiness::NeedsPermission);

        platform.set_permission(PermissionStatus::Allowed);
        assert_eq!(gate.ensure_ready(), Readiness::NeedsLocationService);

        platform.set_location_enabled(true);
        assert_eq!(gate.ensure_ready(), Readiness::Ready);
    }

    #[test]
    fn test_unsupported_radio_never_panics() {
        let platform = Arc::new(MockPlatform::ready());
        platform.set_radio_unsupported();
        let mut gate = gate(&platform);
        assert_eq!(gate.check_radio_enabled(), RadioState::Unsupported);
        assert_eq!(gate.ensure_ready(), Readiness::RadioUnsupported);
    }

    #[test]
    fn test_bind_is_idempotent() {
        let platform = Arc::new(MockPlatform::ready());
        let mut gate = gate(&platform);

        assert!(gate.begin_bind());
        assert!(!gate.begin_bind());
        gate.complete_bind();
        assert!(gate.is_bound());
        assert!(!gate.begin_bind());

        assert!(gate.unbind());
        assert!(!gate.unbind());
        assert_eq!(gate.binding(), Binding::Unbound);
    }

    #[test]
    fn test_permission_result_updates_state() {
        let platform = Arc::new(MockPlatform::new());
        let mut gate = gate(&platform);
        gate.apply_permission_result(PermissionStatus::Denied);
        assert_eq!(gate.state().permission, PermissionStatus::Denied);
    }

    #[test]
    fn test_radio_state_strings() {
        assert_eq!(RadioState::On.as_str(), "STATE_ON");
        assert_eq!(RadioState::Unsupported.to_string(), "STATE_UNSUPPORTED");
    }
}
