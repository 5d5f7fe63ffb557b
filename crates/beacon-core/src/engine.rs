//! The region engine.
//!
//! [`RegionEngine`] is a cloneable handle to state behind one async mutex.
//! Host commands and platform callbacks both lock that mutex, so region
//! sets, membership, availability and the notifier slots only ever change at
//! one serialization point. Frame decoding is pure and runs before the lock
//! is taken.
//!
//! Availability problems are remediated through a single pending request
//! slot. A request advances one step per platform callback
//! (radio → permission → location service → bind) and resolves either the
//! waiting caller or, for requests opened by an observation start, the
//! ranging and monitoring subscribers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::decoder::{dedupe_sightings, Beacon, FrameDecoder};
use crate::error::{BeaconError, Result};
use crate::gate::{AvailabilityGate, AvailabilityState, Binding, RadioState, Readiness};
use crate::notifier::{EventSink, Notifiers, SharedSink};
use crate::platform::{
    AdvertisementBatch, Collaborators, ObservationMode, PermissionStatus, ScanCycle, ScanService,
    ScanServiceError,
};
use crate::region::{dedupe_regions, parse_region_list, Region};
use crate::types::{BeaconView, MonitoringEvent, RangingEvent, RegionState};

type Reply = oneshot::Receiver<Result<()>>;

/// What a remediation request is trying to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Goal {
    /// Every requirement met and the scan service bound.
    Ready,
    /// Scan service bound, availability not checked.
    Bound,
    /// Location permission granted.
    Permission,
    /// Radio powered on.
    Radio,
}

/// The platform answer a request is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Radio,
    Permission,
    LocationService,
    Bind,
}

impl Step {
    /// Error reported when the user was asked and the requirement still fails.
    fn refusal(self) -> BeaconError {
        match self {
            Self::Radio => BeaconError::RadioDisabled,
            Self::Permission => BeaconError::PermissionDenied,
            Self::LocationService => BeaconError::LocationServiceDisabled,
            Self::Bind => BeaconError::ScanServiceUnavailable("service did not connect".into()),
        }
    }
}

/// The one in-flight remediation.
#[derive(Debug)]
struct PendingRemediation {
    id: u64,
    goal: Goal,
    waiting: Step,
    /// `None` when an observation start opened the request.
    reply: Option<oneshot::Sender<Result<()>>>,
}

/// Regions watched in one mode and whether the scan service is observing them.
#[derive(Debug)]
struct Observation {
    mode: ObservationMode,
    regions: Vec<Region>,
    active: bool,
}

impl Observation {
    const fn new(mode: ObservationMode) -> Self {
        Self {
            mode,
            regions: Vec::new(),
            active: false,
        }
    }

    /// Subscribed with regions but not yet observing.
    fn is_waiting(&self, subscribed: bool) -> bool {
        subscribed && !self.active && !self.regions.is_empty()
    }
}

fn start_regions(
    scan: &dyn ScanService,
    observation: &mut Observation,
) -> std::result::Result<(), ScanServiceError> {
    for (started, region) in observation.regions.iter().enumerate() {
        if let Err(e) = scan.start_observing(region, observation.mode) {
            for region in &observation.regions[..started] {
                if let Err(e) = scan.stop_observing(region, observation.mode) {
                    debug!(region = %region.identifier, error = %e, "Rollback stop failed");
                }
            }
            return Err(e);
        }
    }
    observation.active = true;
    Ok(())
}

fn stop_regions(scan: &dyn ScanService, observation: &mut Observation) {
    if !observation.active {
        return;
    }
    for region in &observation.regions {
        if let Err(e) = scan.stop_observing(region, observation.mode) {
            warn!(region = %region.identifier, error = %e, "Failed to stop observing region");
        }
    }
    observation.active = false;
}

struct EngineState {
    decoder: FrameDecoder,
    gate: AvailabilityGate,
    scan: Arc<dyn ScanService>,
    notifiers: Notifiers,
    ranging: Observation,
    monitoring: Observation,
    membership: HashMap<String, RegionState>,
    /// Monitoring regions that have not reported their initial state yet.
    undetermined: HashSet<String>,
    pending: Option<PendingRemediation>,
    next_request_id: u64,
    /// Requests opened since the lock was taken, still needing a timeout.
    unarmed: Vec<u64>,
}

impl EngineState {
    fn new(collaborators: Collaborators, decoder: FrameDecoder) -> Self {
        Self {
            decoder,
            gate: AvailabilityGate::new(
                collaborators.permission,
                collaborators.radio,
                collaborators.location,
            ),
            scan: collaborators.scan,
            notifiers: Notifiers::default(),
            ranging: Observation::new(ObservationMode::Ranging),
            monitoring: Observation::new(ObservationMode::Monitoring),
            membership: HashMap::new(),
            undetermined: HashSet::new(),
            pending: None,
            next_request_id: 0,
            unarmed: Vec::new(),
        }
    }

    // ========================================================================
    // Remediation
    // ========================================================================

    fn new_request(
        &mut self,
        goal: Goal,
        reply: Option<oneshot::Sender<Result<()>>>,
    ) -> PendingRemediation {
        self.next_request_id += 1;
        let id = self.next_request_id;
        self.unarmed.push(id);
        debug!(request = id, ?goal, caller = reply.is_some(), "Availability request opened");
        PendingRemediation {
            id,
            goal,
            waiting: Step::Bind,
            reply,
        }
    }

    /// Open a caller request, or join one an observation start opened.
    fn admit(
        &mut self,
        goal: Goal,
        start: impl FnOnce(&mut Self, PendingRemediation),
    ) -> Result<Reply> {
        if let Some(pending) = self.pending.as_mut() {
            let joinable = pending.reply.is_none()
                && pending.goal == Goal::Ready
                && matches!(goal, Goal::Ready | Goal::Bound);
            if !joinable {
                debug!(request = pending.id, ?goal, "Rejected concurrent availability request");
                return Err(BeaconError::RemediationInProgress);
            }
            let (tx, rx) = oneshot::channel();
            pending.reply = Some(tx);
            debug!(request = pending.id, "Caller joined pending availability request");
            return Ok(rx);
        }
        let (tx, rx) = oneshot::channel();
        let request = self.new_request(goal, Some(tx));
        start(self, request);
        Ok(rx)
    }

    fn take_waiting(&mut self, step: Step) -> Option<PendingRemediation> {
        if self.pending.as_ref().is_some_and(|p| p.waiting == step) {
            self.pending.take()
        } else {
            None
        }
    }

    fn pursue_ready(&mut self, request: PendingRemediation, last: Option<Step>) {
        match self.gate.ensure_ready() {
            Readiness::Ready => self.pursue_binding(request),
            Readiness::RadioUnsupported => self.finish(request, Err(BeaconError::RadioUnsupported)),
            Readiness::NeedsRadio => self.prompt(request, Step::Radio, last),
            Readiness::NeedsPermission => self.prompt(request, Step::Permission, last),
            Readiness::NeedsLocationService => {
                self.prompt(request, Step::LocationService, last);
            }
        }
    }

    fn prompt(&mut self, mut request: PendingRemediation, step: Step, last: Option<Step>) {
        // Asked already and the requirement still does not hold.
        if last == Some(step) {
            self.finish(request, Err(step.refusal()));
            return;
        }
        match step {
            Step::Radio => self.gate.request_radio_enable(),
            Step::Permission => self.gate.request_permission(),
            Step::LocationService => self.gate.open_location_settings(),
            Step::Bind => {
                self.pursue_binding(request);
                return;
            }
        }
        info!(request = request.id, ?step, "Waiting for user");
        request.waiting = step;
        self.pending = Some(request);
    }

    fn pursue_binding(&mut self, mut request: PendingRemediation) {
        match self.gate.binding() {
            Binding::Bound => self.finish(request, Ok(())),
            Binding::Pending => {
                request.waiting = Step::Bind;
                self.pending = Some(request);
            }
            Binding::Unbound => {
                self.gate.begin_bind();
                if let Err(e) = self.scan.bind() {
                    self.gate.unbind();
                    warn!(error = %e, "Scan service bind failed");
                    self.finish(request, Err(e.into()));
                    return;
                }
                debug!(request = request.id, "Scan service bind issued");
                request.waiting = Step::Bind;
                self.pending = Some(request);
            }
        }
    }

    fn finish(&mut self, request: PendingRemediation, result: Result<()>) {
        let waiting = self.observations_waiting();
        match &result {
            Ok(()) => info!(request = request.id, goal = ?request.goal, "Availability request resolved"),
            Err(e) => {
                warn!(request = request.id, goal = ?request.goal, error = %e, "Availability request failed");
                if waiting {
                    self.notify_waiting_observers(e);
                }
            }
        }

        let succeeded = result.is_ok();
        let had_caller = request.reply.is_some();
        if let Some(reply) = request.reply {
            if reply.send(result).is_err() {
                debug!(request = request.id, "Caller went away before the result arrived");
            }
        }
        if succeeded && waiting && self.pending.is_none() {
            self.start_observations_when_ready();
        } else if !had_caller && !waiting {
            // Opened for observations that are gone by now.
            self.release_binding_if_idle();
        }
    }

    fn expire(&mut self, id: u64, timeout: Duration) {
        if !self.pending.as_ref().is_some_and(|p| p.id == id) {
            return;
        }
        if let Some(request) = self.pending.take() {
            let secs = timeout.as_secs();
            let binding = request.waiting == Step::Bind;
            self.finish(request, Err(BeaconError::RemediationTimedOut { secs }));
            if binding {
                self.release_binding_if_idle();
            }
        }
    }

    // ========================================================================
    // Observations
    // ========================================================================

    const fn observation(&self, mode: ObservationMode) -> &Observation {
        match mode {
            ObservationMode::Ranging => &self.ranging,
            ObservationMode::Monitoring => &self.monitoring,
        }
    }

    fn observations_waiting(&self) -> bool {
        self.ranging.is_waiting(self.notifiers.ranging.is_subscribed())
            || self
                .monitoring
                .is_waiting(self.notifiers.monitoring.is_subscribed())
    }

    fn notify_waiting_observers(&self, error: &BeaconError) {
        if self.ranging.is_waiting(self.notifiers.ranging.is_subscribed()) {
            self.notifiers.ranging.deliver_error(error);
        }
        if self
            .monitoring
            .is_waiting(self.notifiers.monitoring.is_subscribed())
        {
            self.notifiers.monitoring.deliver_error(error);
        }
    }

    fn start_observations_when_ready(&mut self) {
        if self.gate.is_bound() {
            self.start_observations();
            return;
        }
        if let Some(pending) = &self.pending {
            debug!(request = pending.id, "Observation start waits for pending request");
            return;
        }
        let request = self.new_request(Goal::Ready, None);
        self.pursue_ready(request, None);
    }

    fn start_observations(&mut self) {
        if !self.gate.is_bound() {
            return;
        }
        if self.ranging.is_waiting(self.notifiers.ranging.is_subscribed()) {
            match start_regions(self.scan.as_ref(), &mut self.ranging) {
                Ok(()) => info!(regions = self.ranging.regions.len(), "Ranging started"),
                Err(e) => {
                    warn!(error = %e, "Ranging failed to start");
                    self.notifiers.ranging.deliver_error(&BeaconError::from(e));
                }
            }
        }
        if self
            .monitoring
            .is_waiting(self.notifiers.monitoring.is_subscribed())
        {
            match start_regions(self.scan.as_ref(), &mut self.monitoring) {
                Ok(()) => {
                    self.undetermined = self
                        .monitoring
                        .regions
                        .iter()
                        .map(|r| r.identifier.clone())
                        .collect();
                    info!(regions = self.monitoring.regions.len(), "Monitoring started");
                }
                Err(e) => {
                    warn!(error = %e, "Monitoring failed to start");
                    self.notifiers.monitoring.deliver_error(&BeaconError::from(e));
                }
            }
        }
    }

    fn replace_regions(&mut self, mode: ObservationMode, regions: Vec<Region>) {
        let regions = dedupe_regions(regions);
        let observation = match mode {
            ObservationMode::Ranging => &mut self.ranging,
            ObservationMode::Monitoring => &mut self.monitoring,
        };
        let was_active = observation.active;
        stop_regions(self.scan.as_ref(), observation);
        debug!(?mode, regions = regions.len(), "Region set replaced");
        observation.regions = regions;
        if mode == ObservationMode::Monitoring {
            self.membership.clear();
            self.undetermined.clear();
        }
        if was_active {
            self.start_observations_when_ready();
            self.release_binding_if_idle();
        }
    }

    fn begin(&mut self, mode: ObservationMode) {
        if self.observation(mode).regions.is_empty() {
            warn!(?mode, "Region list is empty, observation not started");
            return;
        }
        self.start_observations_when_ready();
    }

    fn stop(&mut self, mode: ObservationMode) {
        let cancelled = match mode {
            ObservationMode::Ranging => {
                stop_regions(self.scan.as_ref(), &mut self.ranging);
                self.notifiers.ranging.cancel()
            }
            ObservationMode::Monitoring => {
                stop_regions(self.scan.as_ref(), &mut self.monitoring);
                self.notifiers.monitoring.cancel()
            }
        };
        info!(?mode, cancelled, "Observation stopped");
        if !self.observations_waiting() {
            self.abandon_observation_request();
        }
        self.release_binding_if_idle();
    }

    /// Drop a pending request no caller is waiting on.
    fn abandon_observation_request(&mut self) {
        if self.pending.as_ref().is_some_and(|p| p.reply.is_none()) {
            if let Some(request) = self.pending.take() {
                debug!(
                    request = request.id,
                    waiting = ?request.waiting,
                    "Availability request abandoned"
                );
            }
        }
    }

    fn release_binding_if_idle(&mut self) {
        if self.ranging.active || self.monitoring.active || self.pending.is_some() {
            return;
        }
        self.release_binding();
    }

    fn release_binding(&mut self) {
        if !self.gate.unbind() {
            return;
        }
        match self.scan.unbind() {
            Ok(()) => info!("Scan service released"),
            Err(e) => warn!(error = %e, "Scan service unbind failed"),
        }
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    fn relay_ranging(&self, decoded: &[(String, Vec<Beacon>)]) {
        if !self.ranging.active || !self.notifiers.ranging.is_subscribed() {
            trace!(batches = decoded.len(), "Ranging inactive, batches dropped");
            return;
        }
        for (region_id, beacons) in decoded {
            let Some(region) = self
                .ranging
                .regions
                .iter()
                .find(|r| &r.identifier == region_id)
            else {
                trace!(region = %region_id, "Batch for unranged region dropped");
                continue;
            };
            let beacons: Vec<BeaconView> = beacons
                .iter()
                .filter(|b| region.matches(b))
                .map(BeaconView::from)
                .collect();
            trace!(region = %region.identifier, beacons = beacons.len(), "Ranging snapshot");
            self.notifiers.ranging.deliver(RangingEvent {
                region: region.into(),
                beacons,
            });
        }
    }

    fn evaluate_monitoring(&mut self, decoded: &[(String, Vec<Beacon>)]) {
        if !self.monitoring.active || !self.notifiers.monitoring.is_subscribed() {
            return;
        }
        for region in &self.monitoring.regions {
            let mut batches = decoded
                .iter()
                .filter(|(region_id, _)| region_id == &region.identifier)
                .peekable();
            // Not scanned this cycle.
            if batches.peek().is_none() {
                continue;
            }
            let inside = batches
                .flat_map(|(_, beacons)| beacons)
                .any(|b| region.matches(b));
            let state = if inside {
                RegionState::Inside
            } else {
                RegionState::Outside
            };
            let prior = self
                .membership
                .insert(region.identifier.clone(), state)
                .unwrap_or_default();

            if self.undetermined.remove(&region.identifier) {
                self.notifiers
                    .monitoring
                    .deliver(MonitoringEvent::determine_state(region, state));
            }
            if prior != state {
                debug!(region = %region.identifier, ?prior, ?state, "Region membership changed");
                let event = if inside {
                    MonitoringEvent::enter(region)
                } else {
                    MonitoringEvent::exit(region)
                };
                self.notifiers.monitoring.deliver(event);
            }
        }
    }

    fn close(&mut self) {
        if let Some(request) = self.pending.take() {
            if let Some(reply) = request.reply {
                // Receiver may have timed out already.
                let _ = reply.send(Err(BeaconError::RemediationCancelled));
            }
        }
        stop_regions(self.scan.as_ref(), &mut self.ranging);
        stop_regions(self.scan.as_ref(), &mut self.monitoring);
        self.ranging.regions.clear();
        self.monitoring.regions.clear();
        self.membership.clear();
        self.undetermined.clear();
        self.notifiers.clear();
        self.release_binding();
    }
}

/// Parse a host region list, reporting a malformed one to `sink`.
fn parse_regions<E>(value: &Value, sink: &dyn EventSink<E>) -> Result<Vec<Region>> {
    parse_region_list(value).map_err(|e| {
        let error = BeaconError::from(e);
        warn!(error = %error, "Rejected region list");
        sink.push_error(error.error_code(), &error.to_string());
        error
    })
}

/// Handle to a beacon region engine.
///
/// Cloning is cheap and every clone drives the same engine, so platform
/// adapters can keep a clone for their callbacks.
#[derive(Clone)]
pub struct RegionEngine {
    inner: Arc<Mutex<EngineState>>,
    timeout: Duration,
}

impl std::fmt::Debug for RegionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionEngine")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RegionEngine {
    /// Create an engine with default configuration.
    #[must_use]
    pub fn new(collaborators: Collaborators) -> Self {
        Self::with_config(collaborators, &EngineConfig::default())
    }

    /// Create an engine from `config`.
    #[must_use]
    pub fn with_config(collaborators: Collaborators, config: &EngineConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EngineState::new(
                collaborators,
                config.decoder(),
            ))),
            timeout: config.remediation_timeout(),
        }
    }

    /// Override how long an availability request may wait for the user.
    #[must_use]
    pub fn with_remediation_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `f` at the serialization point, then arm timeouts for any
    /// availability request it opened.
    async fn with_state<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        let (result, opened) = {
            let mut state = self.inner.lock().await;
            let result = f(&mut state);
            (result, std::mem::take(&mut state.unarmed))
        };
        for id in opened {
            self.arm_timeout(id);
        }
        result
    }

    fn arm_timeout(&self, id: u64) {
        let inner: Weak<Mutex<EngineState>> = Arc::downgrade(&self.inner);
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = inner.upgrade() {
                inner.lock().await.expire(id, timeout);
            }
        });
    }

    async fn wait(reply: Option<Reply>) -> Result<()> {
        match reply {
            Some(reply) => reply
                .await
                .unwrap_or_else(|_| Err(BeaconError::RemediationCancelled)),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Select the decoded layouts and bind the scan service.
    ///
    /// Availability is not checked. Resolves once the service connects.
    ///
    /// # Errors
    ///
    /// `ScanServiceUnavailable` if the bind is refused,
    /// `RemediationInProgress` if another request is pending, and
    /// `RemediationTimedOut` if the service never connects.
    pub async fn initialize(&self, eddystone: bool, altbeacon: bool) -> Result<()> {
        let reply = self
            .with_state(|state| -> Result<Option<Reply>> {
                state.decoder = state.decoder.with_layouts(eddystone, altbeacon);
                info!(eddystone, altbeacon, "Beacon layouts configured");
                if state.gate.is_bound() {
                    return Ok(None);
                }
                state
                    .admit(Goal::Bound, |state, request| state.pursue_binding(request))
                    .map(Some)
            })
            .await?;
        Self::wait(reply).await
    }

    /// Select the decoded layouts, remediate every unmet availability
    /// requirement in order, then bind.
    ///
    /// # Errors
    ///
    /// The refusal of whichever step the user declined, or the errors of
    /// [`RegionEngine::initialize`].
    pub async fn initialize_and_check(&self, eddystone: bool, altbeacon: bool) -> Result<()> {
        let reply = self
            .with_state(|state| {
                state.decoder = state.decoder.with_layouts(eddystone, altbeacon);
                info!(eddystone, altbeacon, "Beacon layouts configured, checking availability");
                state
                    .admit(Goal::Ready, |state, request| state.pursue_ready(request, None))
                    .map(Some)
            })
            .await?;
        Self::wait(reply).await
    }

    /// Ask for location permission.
    ///
    /// When permission is already granted no dialog is shown, but `ALLOWED`
    /// is still pushed to the authorization subscriber.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` if the user refuses, `RemediationInProgress` if
    /// another request is pending.
    pub async fn request_authorization(&self) -> Result<()> {
        let reply = self
            .with_state(|state| -> Result<Option<Reply>> {
                if state.gate.check_permission() == PermissionStatus::Allowed {
                    state
                        .notifiers
                        .authorization
                        .deliver(PermissionStatus::Allowed);
                    return Ok(None);
                }
                state
                    .admit(Goal::Permission, |state, request| {
                        state.prompt(request, Step::Permission, None);
                    })
                    .map(Some)
            })
            .await?;
        Self::wait(reply).await
    }

    /// Current location permission.
    pub async fn authorization_status(&self) -> PermissionStatus {
        self.with_state(|state| state.gate.check_permission()).await
    }

    /// Whether OS location services are on.
    pub async fn check_location_services_if_enabled(&self) -> bool {
        self.with_state(|state| state.gate.check_location_service_enabled())
            .await
    }

    /// Current radio state.
    pub async fn bluetooth_state(&self) -> RadioState {
        self.with_state(|state| state.gate.check_radio_enabled())
            .await
    }

    /// Prompt the user to power on the radio, unless it already is.
    ///
    /// # Errors
    ///
    /// `RadioUnsupported`, `RadioDisabled` if the user declines, or
    /// `RemediationInProgress`.
    pub async fn open_bluetooth_settings(&self) -> Result<()> {
        let reply = self
            .with_state(|state| -> Result<Option<Reply>> {
                match state.gate.check_radio_enabled() {
                    RadioState::On => return Ok(None),
                    RadioState::Unsupported => return Err(BeaconError::RadioUnsupported),
                    RadioState::Off => {}
                }
                state
                    .admit(Goal::Radio, |state, request| {
                        state.prompt(request, Step::Radio, None);
                    })
                    .map(Some)
            })
            .await?;
        Self::wait(reply).await
    }

    /// Open the OS location settings screen without waiting for the user.
    pub async fn open_location_settings(&self) {
        self.with_state(|state| state.gate.open_location_settings())
            .await;
    }

    /// Accepted for host compatibility; the authorization type is fixed.
    #[allow(clippy::unused_self)]
    pub fn set_location_authorization_type_default(&self) {
        debug!("Location authorization type left at default");
    }

    /// Subscribe to authorization status changes.
    pub async fn subscribe_authorization(&self, sink: SharedSink<PermissionStatus>) {
        self.with_state(|state| state.notifiers.authorization.subscribe(sink))
            .await;
    }

    /// Drop the authorization subscriber.
    pub async fn unsubscribe_authorization(&self) {
        self.with_state(|state| state.notifiers.authorization.cancel())
            .await;
    }

    /// Replace the ranging region set.
    ///
    /// If ranging is running it restarts on the new set.
    pub async fn set_ranging_regions(&self, regions: Vec<Region>) {
        self.with_state(|state| state.replace_regions(ObservationMode::Ranging, regions))
            .await;
    }

    /// Subscribe `sink` to ranging and start ranging the current region set.
    pub async fn start_ranging(&self, sink: SharedSink<RangingEvent>) {
        self.with_state(|state| {
            state.notifiers.ranging.subscribe(sink);
            state.begin(ObservationMode::Ranging);
        })
        .await;
    }

    /// Host entry point: parse `regions`, replace the ranging set and start.
    ///
    /// # Errors
    ///
    /// `InvalidRegion` if `regions` is malformed. The error is also pushed to
    /// `sink`, and any running ranging is left untouched.
    pub async fn subscribe_ranging(
        &self,
        regions: &Value,
        sink: SharedSink<RangingEvent>,
    ) -> Result<()> {
        let regions = parse_regions(regions, sink.as_ref())?;
        self.with_state(|state| {
            state.replace_regions(ObservationMode::Ranging, regions);
            state.notifiers.ranging.subscribe(sink);
            state.begin(ObservationMode::Ranging);
        })
        .await;
        Ok(())
    }

    /// Stop ranging and drop the ranging subscriber.
    pub async fn stop_ranging(&self) {
        self.with_state(|state| state.stop(ObservationMode::Ranging))
            .await;
    }

    /// Replace the monitoring region set. Membership resets to unknown.
    pub async fn set_monitoring_regions(&self, regions: Vec<Region>) {
        self.with_state(|state| state.replace_regions(ObservationMode::Monitoring, regions))
            .await;
    }

    /// Subscribe `sink` to monitoring and start monitoring the current set.
    pub async fn start_monitoring(&self, sink: SharedSink<MonitoringEvent>) {
        self.with_state(|state| {
            state.notifiers.monitoring.subscribe(sink);
            state.begin(ObservationMode::Monitoring);
        })
        .await;
    }

    /// Host entry point: parse `regions`, replace the monitoring set and start.
    ///
    /// # Errors
    ///
    /// `InvalidRegion` if `regions` is malformed. The error is also pushed to
    /// `sink`, and any running monitoring is left untouched.
    pub async fn subscribe_monitoring(
        &self,
        regions: &Value,
        sink: SharedSink<MonitoringEvent>,
    ) -> Result<()> {
        let regions = parse_regions(regions, sink.as_ref())?;
        self.with_state(|state| {
            state.replace_regions(ObservationMode::Monitoring, regions);
            state.notifiers.monitoring.subscribe(sink);
            state.begin(ObservationMode::Monitoring);
        })
        .await;
        Ok(())
    }

    /// Stop monitoring and drop the monitoring subscriber.
    pub async fn stop_monitoring(&self) {
        self.with_state(|state| state.stop(ObservationMode::Monitoring))
            .await;
    }

    /// Stop everything, drop every subscriber and release the scan service.
    ///
    /// A pending availability request fails with `RemediationCancelled`.
    /// Closing twice is harmless.
    pub async fn close(&self) {
        self.with_state(|state| {
            state.close();
            info!("Engine closed");
        })
        .await;
    }

    // ========================================================================
    // Platform callbacks
    // ========================================================================

    /// The OS answered a permission request.
    pub async fn on_permission_result(&self, status: PermissionStatus) {
        self.with_state(|state| {
            let status = state.gate.apply_permission_result(status);
            info!(%status, "Permission result");
            state.notifiers.authorization.deliver(status);

            let Some(request) = state.take_waiting(Step::Permission) else {
                return;
            };
            if status != PermissionStatus::Allowed {
                state.finish(request, Err(BeaconError::PermissionDenied));
            } else if request.goal == Goal::Ready {
                state.pursue_ready(request, Some(Step::Permission));
            } else {
                state.finish(request, Ok(()));
            }
        })
        .await;
    }

    /// The user answered the radio-enable prompt.
    pub async fn on_radio_enable_result(&self, enabled: bool) {
        self.with_state(|state| {
            info!(enabled, "Radio enable result");
            let Some(request) = state.take_waiting(Step::Radio) else {
                return;
            };
            if !enabled {
                state.finish(request, Err(BeaconError::RadioDisabled));
            } else if request.goal == Goal::Ready {
                state.pursue_ready(request, Some(Step::Radio));
            } else {
                state.finish(request, Ok(()));
            }
        })
        .await;
    }

    /// The user left the location settings screen.
    pub async fn on_location_settings_result(&self) {
        self.with_state(|state| {
            debug!("Location settings closed");
            if let Some(request) = state.take_waiting(Step::LocationService) {
                state.pursue_ready(request, Some(Step::LocationService));
            }
        })
        .await;
    }

    /// The scan service finished binding.
    pub async fn on_service_connected(&self) {
        self.with_state(|state| {
            if state.gate.binding() == Binding::Unbound {
                debug!("Stale service connection ignored");
                return;
            }
            state.gate.complete_bind();
            info!("Scan service connected");
            match state.take_waiting(Step::Bind) {
                Some(request) => state.finish(request, Ok(())),
                None => state.start_observations(),
            }
        })
        .await;
    }

    /// The scan service dropped its binding.
    pub async fn on_service_disconnected(&self) {
        self.with_state(|state| {
            if !state.gate.unbind() {
                return;
            }
            state.ranging.active = false;
            state.monitoring.active = false;
            warn!("Scan service disconnected");
            if let Some(request) = state.take_waiting(Step::Bind) {
                state.finish(request, Err(Step::Bind.refusal()));
            } else if state.pending.is_none() && state.observations_waiting() {
                state.start_observations_when_ready();
            }
        })
        .await;
    }

    /// Decode and deliver one scan cycle.
    ///
    /// Ranging snapshots for every batch go out before monitoring is
    /// evaluated. A monitored region is evaluated only against its own
    /// batches, and regions with no batch in the cycle keep their state.
    pub async fn deliver_cycle(&self, cycle: ScanCycle) {
        let decoder = self.inner.lock().await.decoder;
        let decoded: Vec<(String, Vec<Beacon>)> = cycle
            .batches
            .into_iter()
            .map(|batch| {
                let beacons = dedupe_sightings(
                    batch
                        .advertisements
                        .iter()
                        .filter_map(|adv| decoder.decode(adv)),
                );
                (batch.region, beacons)
            })
            .collect();

        self.with_state(|state| {
            state.relay_ranging(&decoded);
            state.evaluate_monitoring(&decoded);
        })
        .await;
    }

    /// Deliver a single batch as its own cycle.
    ///
    /// Only the batch's region is evaluated for monitoring.
    pub async fn deliver_batch(&self, batch: AdvertisementBatch) {
        self.deliver_cycle(batch.into()).await;
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Snapshot of the availability gate.
    pub async fn availability(&self) -> AvailabilityState {
        self.with_state(|state| state.gate.state()).await
    }

    /// Membership of a monitored region.
    pub async fn region_state(&self, identifier: &str) -> RegionState {
        self.with_state(|state| {
            state
                .membership
                .get(identifier)
                .copied()
                .unwrap_or_default()
        })
        .await
    }

    /// Current ranging region set.
    pub async fn ranging_regions(&self) -> Vec<Region> {
        self.with_state(|state| state.ranging.regions.clone()).await
    }

    /// Current monitoring region set.
    pub async fn monitoring_regions(&self) -> Vec<Region> {
        self.with_state(|state| state.monitoring.regions.clone())
            .await
    }

    /// Whether the scan service is observing the ranging set.
    pub async fn is_ranging(&self) -> bool {
        self.with_state(|state| state.ranging.active).await
    }

    /// Whether the scan service is observing the monitoring set.
    pub async fn is_monitoring(&self) -> bool {
        self.with_state(|state| state.monitoring.active).await
    }

    /// Whether an availability request is waiting on the platform.
    pub async fn has_pending_request(&self) -> bool {
        self.with_state(|state| state.pending.is_some()).await
    }

    /// Active decoder layouts.
    pub async fn decoder(&self) -> FrameDecoder {
        self.with_state(|state| state.decoder).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{encode_eddystone_uid, encode_ibeacon, RawAdvertisement};
    use crate::mock::{MockPlatform, Prompt};
    use crate::notifier::{ChannelSink, SinkItem};
    use crate::region::Identifier;
    use crate::types::{BeaconIds, MonitoringEventKind};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;
    use uuid::Uuid;

    const UUID: &str = "2F234454-CF6D-4A0F-ADF2-F4911BA9FFA6";

    fn engine(platform: &Arc<MockPlatform>) -> RegionEngine {
        RegionEngine::new(Collaborators::from_platform(platform.clone()))
    }

    fn ibeacon(major: u16, minor: u16, rssi: i16) -> RawAdvertisement {
        RawAdvertisement {
            data: encode_ibeacon(Uuid::parse_str(UUID).unwrap(), major, minor, -59),
            rssi,
            mac_address: format!("AA:BB:CC:DD:{major:02X}:{minor:02X}"),
        }
    }

    fn batch(region: &str, advertisements: Vec<RawAdvertisement>) -> AdvertisementBatch {
        AdvertisementBatch {
            region: region.into(),
            advertisements,
        }
    }

    fn drain<E>(rx: &mut UnboundedReceiver<SinkItem<E>>) -> Vec<SinkItem<E>> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    async fn ranging(
        engine: &RegionEngine,
        regions: Value,
    ) -> UnboundedReceiver<SinkItem<RangingEvent>> {
        let (sink, rx) = ChannelSink::channel();
        engine.subscribe_ranging(&regions, Arc::new(sink)).await.unwrap();
        rx
    }

    async fn monitoring(
        engine: &RegionEngine,
        regions: Value,
    ) -> UnboundedReceiver<SinkItem<MonitoringEvent>> {
        let (sink, rx) = ChannelSink::channel();
        engine
            .subscribe_monitoring(&regions, Arc::new(sink))
            .await
            .unwrap();
        rx
    }

    async fn next_prompt(platform: &MockPlatform) -> Prompt {
        for _ in 0..200 {
            if let Some(prompt) = platform.next_prompt() {
                return prompt;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no prompt issued");
    }

    #[tokio::test]
    async fn test_ranging_scenario_reports_accuracy() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        let mut rx = ranging(
            &engine,
            json!([{"identifier": "r1", "proximityUUID": UUID}]),
        )
        .await;

        assert_eq!(platform.next_prompt(), Some(Prompt::Bind));
        engine.on_service_connected().await;
        assert!(engine.is_ranging().await);
        assert_eq!(platform.observing(ObservationMode::Ranging), vec!["r1"]);

        engine.deliver_batch(batch("r1", vec![ibeacon(1, 2, -65)])).await;

        let event = rx.try_recv().unwrap().unwrap();
        assert_eq!(event.region.identifier, "r1");
        assert_eq!(event.beacons.len(), 1);
        assert_eq!(event.beacons[0].accuracy, "1.37");
        assert_eq!(event.beacons[0].tx_power, -59);
        assert!(matches!(
            &event.beacons[0].ids,
            BeaconIds::IBeacon { major: 1, minor: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_ranging_filters_and_dedupes_batch() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        let mut rx = ranging(
            &engine,
            json!([{"identifier": "r1", "proximityUUID": UUID, "major": 1}]),
        )
        .await;
        engine.on_service_connected().await;

        let eddystone = RawAdvertisement {
            data: encode_eddystone_uid([0xab; 10], [1; 6], -18),
            rssi: -70,
            mac_address: String::new(),
        };
        engine
            .deliver_batch(batch(
                "r1",
                vec![
                    ibeacon(1, 2, -80),
                    ibeacon(2, 2, -60),
                    eddystone,
                    RawAdvertisement {
                        data: vec![0x02, 0x01, 0x06],
                        rssi: -50,
                        mac_address: String::new(),
                    },
                    ibeacon(1, 2, -65),
                ],
            ))
            .await;

        let event = rx.try_recv().unwrap().unwrap();
        assert_eq!(event.beacons.len(), 1);
        assert_eq!(event.beacons[0].rssi, -65);
    }

    #[tokio::test]
    async fn test_batch_for_unknown_region_is_dropped() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        let mut rx = ranging(&engine, json!([{"identifier": "r1"}])).await;
        engine.on_service_connected().await;

        engine.deliver_batch(batch("other", vec![ibeacon(1, 1, -60)])).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_stop_ranging_discards_later_batches() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        let mut rx = ranging(&engine, json!([{"identifier": "r1"}])).await;
        engine.on_service_connected().await;

        engine.stop_ranging().await;
        engine.deliver_batch(batch("r1", vec![ibeacon(1, 1, -60)])).await;

        assert!(drain(&mut rx).is_empty());
        assert!(!engine.is_ranging().await);
        assert!(platform.observing(ObservationMode::Ranging).is_empty());
    }

    #[tokio::test]
    async fn test_empty_region_list_does_not_start() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        let mut rx = ranging(&engine, json!([])).await;

        assert!(!engine.is_ranging().await);
        assert_eq!(platform.bind_count(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_regions_leave_observation_untouched() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        let mut rx = ranging(&engine, json!([{"identifier": "r1"}])).await;
        engine.on_service_connected().await;

        let (bad_sink, mut bad_rx) = ChannelSink::channel();
        let result = engine
            .subscribe_ranging(
                &json!([{"identifier": "r2", "proximityUUID": "not-a-uuid"}]),
                Arc::new(bad_sink),
            )
            .await;
        assert!(matches!(result, Err(BeaconError::InvalidRegion(_))));

        let errors = drain(&mut bad_rx);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].as_ref().unwrap_err().kind, "INVALID_REGION");

        assert!(engine.is_ranging().await);
        assert_eq!(engine.ranging_regions().await[0].identifier, "r1");
        engine.deliver_batch(batch("r1", vec![ibeacon(1, 1, -60)])).await;
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_monitoring_determines_state_before_enter() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        let mut rx = monitoring(&engine, json!([{"identifier": "m1", "proximityUUID": UUID}])).await;
        engine.on_service_connected().await;

        engine.deliver_batch(batch("m1", vec![ibeacon(1, 1, -60)])).await;

        let events: Vec<MonitoringEvent> = drain(&mut rx)
            .into_iter()
            .map(std::result::Result::unwrap)
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, MonitoringEventKind::DidDetermineStateForRegion);
        assert_eq!(events[0].state, Some(RegionState::Inside));
        assert_eq!(events[1].event, MonitoringEventKind::DidEnterRegion);
        assert_eq!(engine.region_state("m1").await, RegionState::Inside);
    }

    #[tokio::test]
    async fn test_monitoring_enter_and_exit_once() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        let mut rx = monitoring(&engine, json!([{"identifier": "m1", "major": 7}])).await;
        engine.on_service_connected().await;

        // First cycle: nothing seen, region is outside.
        engine.deliver_batch(batch("m1", vec![])).await;
        drain(&mut rx);
        assert_eq!(engine.region_state("m1").await, RegionState::Outside);

        engine.deliver_batch(batch("m1", vec![ibeacon(7, 1, -60)])).await;
        engine.deliver_batch(batch("m1", vec![ibeacon(7, 2, -61)])).await;
        let events: Vec<_> = drain(&mut rx)
            .into_iter()
            .map(std::result::Result::unwrap)
            .collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, MonitoringEventKind::DidEnterRegion);

        engine.deliver_batch(batch("m1", vec![ibeacon(8, 1, -60)])).await;
        engine.deliver_batch(batch("m1", vec![])).await;
        let events: Vec<_> = drain(&mut rx)
            .into_iter()
            .map(std::result::Result::unwrap)
            .collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, MonitoringEventKind::DidExitRegion);
        assert_eq!(engine.region_state("m1").await, RegionState::Outside);
    }

    #[tokio::test]
    async fn test_ranging_relayed_before_monitoring_in_cycle() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        let (sink, mut order) = ChannelSink::<String>::channel();
        let sink = Arc::new(sink);

        struct Tagged(Arc<ChannelSink<String>>, &'static str);
        impl<E> EventSink<E> for Tagged {
            fn push(&self, _event: E) {
                self.0.push(self.1.to_string());
            }
            fn push_error(&self, kind: &str, message: &str) {
                self.0.push_error(kind, message);
            }
        }

        engine
            .subscribe_monitoring(
                &json!([{"identifier": "m1"}]),
                Arc::new(Tagged(sink.clone(), "monitoring")),
            )
            .await
            .unwrap();
        engine
            .subscribe_ranging(
                &json!([{"identifier": "r1"}]),
                Arc::new(Tagged(sink, "ranging")),
            )
            .await
            .unwrap();
        engine.on_service_connected().await;

        engine
            .deliver_cycle(ScanCycle {
                batches: vec![
                    batch("r1", vec![ibeacon(1, 1, -60)]),
                    batch("m1", vec![ibeacon(1, 1, -60)]),
                ],
            })
            .await;

        let order: Vec<String> = drain(&mut order)
            .into_iter()
            .map(std::result::Result::unwrap)
            .collect();
        assert_eq!(order, vec!["ranging", "monitoring", "monitoring"]);
    }

    #[tokio::test]
    async fn test_monitoring_skips_regions_without_batch() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        let _ranging = ranging(&engine, json!([{"identifier": "r1", "major": 1}])).await;
        let mut rx = monitoring(&engine, json!([{"identifier": "m1", "major": 2}])).await;
        engine.on_service_connected().await;

        for _ in 0..2 {
            engine.deliver_batch(batch("m1", vec![ibeacon(2, 1, -60)])).await;
            engine
                .deliver_batch(batch("r1", vec![ibeacon(1, 1, -60), ibeacon(2, 1, -60)]))
                .await;
        }

        let kinds: Vec<_> = drain(&mut rx)
            .into_iter()
            .map(|item| item.unwrap().event)
            .collect();
        assert_eq!(
            kinds,
            vec![
                MonitoringEventKind::DidDetermineStateForRegion,
                MonitoringEventKind::DidEnterRegion,
            ]
        );
        assert_eq!(engine.region_state("m1").await, RegionState::Inside);
    }

    #[tokio::test]
    async fn test_replacing_monitoring_set_resets_membership() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        let mut rx = monitoring(&engine, json!([{"identifier": "m1"}])).await;
        engine.on_service_connected().await;
        engine.deliver_batch(batch("m1", vec![ibeacon(1, 1, -60)])).await;
        assert_eq!(engine.region_state("m1").await, RegionState::Inside);
        drain(&mut rx);

        engine
            .set_monitoring_regions(vec![Region::wildcard("m1")])
            .await;
        assert_eq!(engine.region_state("m1").await, RegionState::Unknown);
        assert!(engine.is_monitoring().await);

        engine.deliver_batch(batch("m1", vec![ibeacon(1, 1, -60)])).await;
        let events: Vec<_> = drain(&mut rx)
            .into_iter()
            .map(std::result::Result::unwrap)
            .collect();
        assert_eq!(events[0].event, MonitoringEventKind::DidDetermineStateForRegion);
    }

    #[tokio::test]
    async fn test_request_authorization_when_allowed_reemits() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        let (sink, mut rx) = ChannelSink::channel();
        engine.subscribe_authorization(Arc::new(sink)).await;

        engine.request_authorization().await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), Ok(PermissionStatus::Allowed));
        assert_eq!(platform.next_prompt(), None);
    }

    #[tokio::test]
    async fn test_request_authorization_waits_for_answer() {
        let platform = Arc::new(MockPlatform::new());
        let engine = engine(&platform);
        let (sink, mut rx) = ChannelSink::channel();
        engine.subscribe_authorization(Arc::new(sink)).await;

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.request_authorization().await }
        });
        assert_eq!(next_prompt(&platform).await, Prompt::Permission);

        platform.set_permission(PermissionStatus::Denied);
        engine.on_permission_result(PermissionStatus::Denied).await;

        assert!(matches!(
            task.await.unwrap(),
            Err(BeaconError::PermissionDenied)
        ));
        assert_eq!(rx.try_recv().unwrap(), Ok(PermissionStatus::Denied));
        assert_eq!(engine.authorization_status().await, PermissionStatus::Denied);
    }

    #[tokio::test]
    async fn test_initialize_and_check_walks_every_step() {
        let platform = Arc::new(MockPlatform::new());
        let engine = engine(&platform);
        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.initialize_and_check(true, false).await }
        });

        assert_eq!(next_prompt(&platform).await, Prompt::RadioEnable);
        platform.set_radio_enabled(true);
        engine.on_radio_enable_result(true).await;

        assert_eq!(next_prompt(&platform).await, Prompt::Permission);
        platform.set_permission(PermissionStatus::Allowed);
        engine.on_permission_result(PermissionStatus::Allowed).await;

        assert_eq!(next_prompt(&platform).await, Prompt::LocationSettings);
        platform.set_location_enabled(true);
        engine.on_location_settings_result().await;

        assert_eq!(next_prompt(&platform).await, Prompt::Bind);
        engine.on_service_connected().await;

        tokio_test::assert_ok!(task.await.unwrap());
        let decoder = engine.decoder().await;
        assert!(decoder.eddystone_enabled());
        assert!(!decoder.altbeacon_enabled());
        assert_eq!(engine.availability().await.binding, Binding::Bound);
    }

    #[tokio::test]
    async fn test_radio_refusal_fails_request() {
        let platform = Arc::new(MockPlatform::new());
        let engine = engine(&platform);
        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.initialize_and_check(true, true).await }
        });

        assert_eq!(next_prompt(&platform).await, Prompt::RadioEnable);
        engine.on_radio_enable_result(false).await;

        assert!(matches!(task.await.unwrap(), Err(BeaconError::RadioDisabled)));
        assert!(!engine.has_pending_request().await);
    }

    #[tokio::test]
    async fn test_location_still_off_fails_without_looping() {
        let platform = Arc::new(MockPlatform::ready());
        platform.set_location_enabled(false);
        let engine = engine(&platform);
        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.initialize_and_check(true, true).await }
        });

        assert_eq!(next_prompt(&platform).await, Prompt::LocationSettings);
        engine.on_location_settings_result().await;

        assert!(matches!(
            task.await.unwrap(),
            Err(BeaconError::LocationServiceDisabled)
        ));
        assert_eq!(platform.next_prompt(), None);
    }

    #[tokio::test]
    async fn test_unsupported_radio() {
        let platform = Arc::new(MockPlatform::ready());
        platform.set_radio_unsupported();
        let engine = engine(&platform);

        assert_eq!(engine.bluetooth_state().await, RadioState::Unsupported);
        assert!(matches!(
            engine.initialize_and_check(true, true).await,
            Err(BeaconError::RadioUnsupported)
        ));
        assert!(matches!(
            engine.open_bluetooth_settings().await,
            Err(BeaconError::RadioUnsupported)
        ));
    }

    #[tokio::test]
    async fn test_second_request_is_rejected() {
        let platform = Arc::new(MockPlatform::new());
        let engine = engine(&platform);
        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.open_bluetooth_settings().await }
        });
        assert_eq!(next_prompt(&platform).await, Prompt::RadioEnable);

        assert!(matches!(
            engine.initialize_and_check(true, true).await,
            Err(BeaconError::RemediationInProgress)
        ));
        assert!(matches!(
            engine.request_authorization().await,
            Err(BeaconError::RemediationInProgress)
        ));

        platform.set_radio_enabled(true);
        engine.on_radio_enable_result(true).await;
        first.await.unwrap().unwrap();
        assert_eq!(engine.bluetooth_state().await, RadioState::On);
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let platform = Arc::new(MockPlatform::new());
        let engine = engine(&platform).with_remediation_timeout(Duration::from_millis(20));

        let result = engine.open_bluetooth_settings().await;
        assert!(matches!(result, Err(BeaconError::RemediationTimedOut { .. })));
        assert!(!engine.has_pending_request().await);

        // A late answer is ignored.
        engine.on_radio_enable_result(true).await;
    }

    #[tokio::test]
    async fn test_close_cancels_pending_request() {
        let platform = Arc::new(MockPlatform::new());
        let engine = engine(&platform);
        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.request_authorization().await }
        });
        assert_eq!(next_prompt(&platform).await, Prompt::Permission);

        engine.close().await;
        assert!(matches!(
            task.await.unwrap(),
            Err(BeaconError::RemediationCancelled)
        ));
    }

    #[tokio::test]
    async fn test_observation_start_remediates_then_starts() {
        let platform = Arc::new(MockPlatform::new());
        platform.set_radio_enabled(true);
        platform.set_location_enabled(true);
        let engine = engine(&platform);

        let mut rx = ranging(&engine, json!([{"identifier": "r1"}])).await;
        assert_eq!(next_prompt(&platform).await, Prompt::Permission);
        assert!(!engine.is_ranging().await);

        platform.set_permission(PermissionStatus::Allowed);
        engine.on_permission_result(PermissionStatus::Allowed).await;
        assert_eq!(next_prompt(&platform).await, Prompt::Bind);
        engine.on_service_connected().await;

        assert!(engine.is_ranging().await);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_observation_refusal_reaches_subscriber() {
        let platform = Arc::new(MockPlatform::new());
        platform.set_radio_enabled(true);
        let engine = engine(&platform);

        let mut rx = monitoring(&engine, json!([{"identifier": "m1"}])).await;
        assert_eq!(next_prompt(&platform).await, Prompt::Permission);
        engine.on_permission_result(PermissionStatus::Denied).await;

        let items = drain(&mut rx);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap_err().kind, "PERMISSION_DENIED");
        assert!(!engine.has_pending_request().await);
    }

    #[tokio::test]
    async fn test_caller_joins_observation_request() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        let _rx = ranging(&engine, json!([{"identifier": "r1"}])).await;
        assert_eq!(platform.next_prompt(), Some(Prompt::Bind));

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.initialize(true, true).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.on_service_connected().await;

        task.await.unwrap().unwrap();
        assert_eq!(platform.bind_count(), 1);
        assert!(engine.is_ranging().await);
    }

    #[tokio::test]
    async fn test_bind_failure_surfaces() {
        let platform = Arc::new(MockPlatform::ready());
        platform.set_fail_bind(true);
        let engine = engine(&platform);

        assert!(matches!(
            engine.initialize(true, true).await,
            Err(BeaconError::ScanServiceUnavailable(_))
        ));
        assert_eq!(engine.availability().await.binding, Binding::Unbound);
    }

    #[tokio::test]
    async fn test_observe_failure_reaches_subscriber_only() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        let mut ranging_rx = ranging(&engine, json!([{"identifier": "r1"}])).await;
        engine.on_service_connected().await;

        platform.set_fail_observe(true);
        let mut monitoring_rx = monitoring(&engine, json!([{"identifier": "m1"}])).await;

        let errors = drain(&mut monitoring_rx);
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].as_ref().unwrap_err().kind,
            "SCAN_SERVICE_UNAVAILABLE"
        );
        assert!(engine.is_ranging().await);
        assert!(!engine.is_monitoring().await);
        assert!(drain(&mut ranging_rx).is_empty());
    }

    #[tokio::test]
    async fn test_binding_released_when_both_stopped() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        let _ranging = ranging(&engine, json!([{"identifier": "r1"}])).await;
        let _monitoring = monitoring(&engine, json!([{"identifier": "m1"}])).await;
        engine.on_service_connected().await;
        assert_eq!(platform.bind_count(), 1);

        engine.stop_ranging().await;
        assert_eq!(platform.unbind_count(), 0);
        assert!(engine.is_monitoring().await);

        engine.stop_monitoring().await;
        assert_eq!(platform.unbind_count(), 1);
        assert_eq!(engine.availability().await.binding, Binding::Unbound);
    }

    #[tokio::test]
    async fn test_stop_during_permission_prompt_never_binds() {
        let platform = Arc::new(MockPlatform::new());
        platform.set_radio_enabled(true);
        platform.set_location_enabled(true);
        let engine = engine(&platform);

        let _rx = ranging(&engine, json!([{"identifier": "r1"}])).await;
        assert_eq!(next_prompt(&platform).await, Prompt::Permission);
        engine.stop_ranging().await;
        assert!(!engine.has_pending_request().await);

        platform.set_permission(PermissionStatus::Allowed);
        engine.on_permission_result(PermissionStatus::Allowed).await;
        engine.on_service_connected().await;

        assert_eq!(platform.next_prompt(), None);
        assert_eq!(platform.bind_count(), 0);
        assert!(!engine.is_ranging().await);
        assert_eq!(engine.availability().await.binding, Binding::Unbound);
    }

    #[tokio::test]
    async fn test_stop_during_bind_releases_service() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        let _rx = monitoring(&engine, json!([{"identifier": "m1"}])).await;
        assert_eq!(platform.next_prompt(), Some(Prompt::Bind));

        engine.stop_monitoring().await;
        assert_eq!(platform.unbind_count(), 1);

        engine.on_service_connected().await;
        assert!(!engine.is_monitoring().await);
        assert_eq!(engine.availability().await.binding, Binding::Unbound);
    }

    #[tokio::test]
    async fn test_emptying_active_set_releases_binding() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        let _rx = ranging(&engine, json!([{"identifier": "r1"}])).await;
        engine.on_service_connected().await;
        assert!(engine.is_ranging().await);

        engine.set_ranging_regions(Vec::new()).await;

        assert!(!engine.is_ranging().await);
        assert_eq!(platform.unbind_count(), 1);
        assert_eq!(engine.availability().await.binding, Binding::Unbound);
    }

    #[tokio::test]
    async fn test_bind_timeout_releases_service() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform).with_remediation_timeout(Duration::from_millis(20));

        assert!(matches!(
            engine.initialize(true, true).await,
            Err(BeaconError::RemediationTimedOut { .. })
        ));
        assert_eq!(engine.availability().await.binding, Binding::Unbound);
        assert_eq!(platform.bind_count(), 1);
        assert_eq!(platform.unbind_count(), 1);

        // A late connection is ignored.
        engine.on_service_connected().await;
        assert_eq!(engine.availability().await.binding, Binding::Unbound);
    }

    #[tokio::test]
    async fn test_disconnect_rebinds_and_restarts() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        let mut rx = monitoring(&engine, json!([{"identifier": "m1"}])).await;
        engine.on_service_connected().await;
        platform.take_prompts();

        engine.on_service_disconnected().await;
        assert!(!engine.is_monitoring().await);
        assert_eq!(next_prompt(&platform).await, Prompt::Bind);

        engine.on_service_connected().await;
        assert!(engine.is_monitoring().await);
        engine.deliver_batch(batch("m1", vec![])).await;
        let events: Vec<_> = drain(&mut rx)
            .into_iter()
            .map(std::result::Result::unwrap)
            .collect();
        assert_eq!(events[0].event, MonitoringEventKind::DidDetermineStateForRegion);
    }

    #[tokio::test]
    async fn test_close_twice_is_harmless() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        let mut rx = ranging(&engine, json!([{"identifier": "r1"}])).await;
        engine.on_service_connected().await;

        engine.close().await;
        engine.close().await;

        assert_eq!(platform.unbind_count(), 1);
        assert!(!engine.is_ranging().await);
        assert!(engine.ranging_regions().await.is_empty());
        engine.deliver_batch(batch("r1", vec![ibeacon(1, 1, -60)])).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_initialize_when_bound_is_immediate() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.initialize(true, true).await }
        });
        assert_eq!(next_prompt(&platform).await, Prompt::Bind);
        engine.on_service_connected().await;
        task.await.unwrap().unwrap();

        engine.initialize(false, true).await.unwrap();
        assert_eq!(platform.bind_count(), 1);
        assert!(!engine.decoder().await.eddystone_enabled());
    }

    #[tokio::test]
    async fn test_duplicate_region_identifiers_collapse() {
        let platform = Arc::new(MockPlatform::ready());
        let engine = engine(&platform);
        engine
            .set_ranging_regions(vec![
                Region::wildcard("r1"),
                Region::new("r1", None, Some(Identifier::Int(9)), None),
            ])
            .await;
        let regions = engine.ranging_regions().await;
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].id(1), Some(&Identifier::Int(9)));
    }
}
