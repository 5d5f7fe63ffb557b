//! Scripted platform for tests and the replay harness.
//!
//! [`MockPlatform`] implements every collaborator trait over in-memory state.
//! Prompts it receives (permission requests, radio enable, location settings,
//! binds) are queued so the driver can answer them by calling the engine's
//! `on_*` callbacks, the same way a real adapter would.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::platform::{
    LocationServiceSource, ObservationMode, PermissionSource, PermissionStatus, RadioStateSource,
    RadioUnsupported, ScanService, ScanServiceError,
};
use crate::region::Region;

const RADIO_OFF: u8 = 0;
const RADIO_ON: u8 = 1;
const RADIO_UNSUPPORTED: u8 = 2;

/// A platform request awaiting an answer from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    /// `PermissionSource::request` was called.
    Permission,
    /// `RadioStateSource::request_enable` was called.
    RadioEnable,
    /// `LocationServiceSource::open_settings` was called.
    LocationSettings,
    /// `ScanService::bind` was called.
    Bind,
}

/// In-memory platform adapter.
#[derive(Debug, Default)]
pub struct MockPlatform {
    permission: AtomicU8,
    radio: AtomicU8,
    location: AtomicBool,
    fail_bind: AtomicBool,
    fail_observe: AtomicBool,
    binds: AtomicUsize,
    unbinds: AtomicUsize,
    prompts: Mutex<VecDeque<Prompt>>,
    observing: Mutex<Vec<(String, ObservationMode)>>,
}

impl MockPlatform {
    /// Radio off, permission not determined, location off.
    #[must_use]
    pub fn new() -> Self {
        let platform = Self::default();
        platform.set_permission(PermissionStatus::NotDetermined);
        platform
    }

    /// Every availability requirement already met.
    #[must_use]
    pub fn ready() -> Self {
        let platform = Self::new();
        platform.set_radio_enabled(true);
        platform.set_permission(PermissionStatus::Allowed);
        platform.set_location_enabled(true);
        platform
    }

    /// Set the permission returned by `check`.
    pub fn set_permission(&self, status: PermissionStatus) {
        let raw = match status {
            PermissionStatus::Allowed => 0,
            PermissionStatus::Denied => 1,
            PermissionStatus::NotDetermined => 2,
        };
        self.permission.store(raw, Ordering::SeqCst);
    }

    /// Power the radio on or off.
    pub fn set_radio_enabled(&self, enabled: bool) {
        let raw = if enabled { RADIO_ON } else { RADIO_OFF };
        self.radio.store(raw, Ordering::SeqCst);
    }

    /// Make radio queries fail as unsupported.
    pub fn set_radio_unsupported(&self) {
        self.radio.store(RADIO_UNSUPPORTED, Ordering::SeqCst);
    }

    /// Turn location services on or off.
    pub fn set_location_enabled(&self, enabled: bool) {
        self.location.store(enabled, Ordering::SeqCst);
    }

    /// Make `bind` fail.
    pub fn set_fail_bind(&self, fail: bool) {
        self.fail_bind.store(fail, Ordering::SeqCst);
    }

    /// Make `start_observing` fail.
    pub fn set_fail_observe(&self, fail: bool) {
        self.fail_observe.store(fail, Ordering::SeqCst);
    }

    /// Number of `bind` calls so far.
    #[must_use]
    pub fn bind_count(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    /// Number of `unbind` calls so far.
    #[must_use]
    pub fn unbind_count(&self) -> usize {
        self.unbinds.load(Ordering::SeqCst)
    }

    /// Take the oldest unanswered prompt.
    pub fn next_prompt(&self) -> Option<Prompt> {
        lock(&self.prompts).pop_front()
    }

    /// Drain all unanswered prompts.
    pub fn take_prompts(&self) -> Vec<Prompt> {
        lock(&self.prompts).drain(..).collect()
    }

    /// Region identifiers currently observed in `mode`.
    #[must_use]
    pub fn observing(&self, mode: ObservationMode) -> Vec<String> {
        lock(&self.observing)
            .iter()
            .filter(|(_, m)| *m == mode)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn push_prompt(&self, prompt: Prompt) {
        lock(&self.prompts).push_back(prompt);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PermissionSource for MockPlatform {
    fn check(&self) -> PermissionStatus {
        match self.permission.load(Ordering::SeqCst) {
            0 => PermissionStatus::Allowed,
            1 => PermissionStatus::Denied,
            _ => PermissionStatus::NotDetermined,
        }
    }

    fn request(&self) {
        self.push_prompt(Prompt::Permission);
    }
}

impl RadioStateSource for MockPlatform {
    fn is_enabled(&self) -> Result<bool, RadioUnsupported> {
        match self.radio.load(Ordering::SeqCst) {
            RADIO_ON => Ok(true),
            RADIO_OFF => Ok(false),
            _ => Err(RadioUnsupported),
        }
    }

    fn request_enable(&self) {
        self.push_prompt(Prompt::RadioEnable);
    }
}

impl LocationServiceSource for MockPlatform {
    fn is_enabled(&self) -> bool {
        self.location.load(Ordering::SeqCst)
    }

    fn open_settings(&self) {
        self.push_prompt(Prompt::LocationSettings);
    }
}

impl ScanService for MockPlatform {
    fn bind(&self) -> Result<(), ScanServiceError> {
        if self.fail_bind.load(Ordering::SeqCst) {
            return Err(ScanServiceError::new("bind", "scan service not installed"));
        }
        self.binds.fetch_add(1, Ordering::SeqCst);
        self.push_prompt(Prompt::Bind);
        Ok(())
    }

    fn unbind(&self) -> Result<(), ScanServiceError> {
        self.unbinds.fetch_add(1, Ordering::SeqCst);
        lock(&self.observing).clear();
        Ok(())
    }

    fn start_observing(
        &self,
        region: &Region,
        mode: ObservationMode,
    ) -> Result<(), ScanServiceError> {
        if self.fail_observe.load(Ordering::SeqCst) {
            return Err(ScanServiceError::new("start_observing", "remote exception"));
        }
        let mut observing = lock(&self.observing);
        observing.retain(|(id, m)| !(id == &region.identifier && *m == mode));
        observing.push((region.identifier.clone(), mode));
        Ok(())
    }

    fn stop_observing(
        &self,
        region: &Region,
        mode: ObservationMode,
    ) -> Result<(), ScanServiceError> {
        lock(&self.observing).retain(|(id, m)| !(id == &region.identifier && *m == mode));
        Ok(())
    }
}
