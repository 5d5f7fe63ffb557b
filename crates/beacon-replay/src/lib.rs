//! # beacon-replay
//!
//! Replays a scripted scenario against a [`RegionEngine`] running on the
//! in-memory [`MockPlatform`].
//!
//! A scenario sets the initial platform state, says how the simulated user
//! answers prompts, and lists steps: host commands, scan cycles and service
//! disconnects. Every command result and every event pushed to a subscriber
//! is collected as an [`Emitted`] line.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod logging;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use beacon_core::{
    AdvertisementBatch, BeaconError, ChannelSink, Collaborators, EngineConfig, MockPlatform,
    MonitoringEvent, PermissionStatus, Prompt, RangingEvent, RawAdvertisement, RegionEngine,
    ScanCycle, SinkItem,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

/// How often prompts are polled while a command is running.
const PROMPT_POLL: Duration = Duration::from_millis(2);

/// Errors that stop a replay.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// The scenario file could not be read.
    #[error("Failed to read scenario {}: {source}", path.display())]
    Read {
        /// Scenario path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The scenario is not valid JSON or has the wrong shape.
    #[error("Invalid scenario: {0}")]
    Parse(#[from] serde_json::Error),

    /// An advertisement payload is not valid hex.
    #[error("Invalid advertisement payload in step {step}: {source}")]
    Payload {
        /// Zero-based step index.
        step: usize,
        /// Hex decoding error.
        source: hex::FromHexError,
    },

    /// An engine command panicked or was aborted.
    #[error("Engine command failed to complete: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Radio state at scenario start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioScript {
    /// Powered on.
    #[default]
    On,
    /// Powered off.
    Off,
    /// No radio.
    Unsupported,
}

/// Initial platform state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlatformScript {
    /// Radio state.
    pub radio: RadioScript,
    /// Location permission.
    pub permission: PermissionStatus,
    /// Location services on.
    pub location_enabled: bool,
    /// Refuse every bind.
    pub fail_bind: bool,
    /// Refuse every region observation.
    pub fail_observe: bool,
}

impl Default for PlatformScript {
    fn default() -> Self {
        Self {
            radio: RadioScript::On,
            permission: PermissionStatus::Allowed,
            location_enabled: true,
            fail_bind: false,
            fail_observe: false,
        }
    }
}

impl PlatformScript {
    fn build(&self) -> MockPlatform {
        let platform = MockPlatform::new();
        match self.radio {
            RadioScript::On => platform.set_radio_enabled(true),
            RadioScript::Off => platform.set_radio_enabled(false),
            RadioScript::Unsupported => platform.set_radio_unsupported(),
        }
        platform.set_permission(self.permission);
        platform.set_location_enabled(self.location_enabled);
        platform.set_fail_bind(self.fail_bind);
        platform.set_fail_observe(self.fail_observe);
        platform
    }
}

/// How the simulated user answers prompts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Answers {
    /// Answer to a permission dialog.
    pub permission: PermissionStatus,
    /// Whether the user turns the radio on when asked.
    pub radio_enable: bool,
    /// Whether the user turns location services on in settings.
    pub location_enable: bool,
    /// Whether the scan service connects after a bind.
    pub connect: bool,
}

impl Default for Answers {
    fn default() -> Self {
        Self {
            permission: PermissionStatus::Allowed,
            radio_enable: true,
            location_enable: true,
            connect: true,
        }
    }
}

/// One advertisement with its payload as hex.
#[derive(Debug, Clone, Deserialize)]
pub struct AdvertisementScript {
    /// Advertising data, hex encoded.
    pub data: String,
    /// Signal strength in dBm.
    pub rssi: i16,
    /// Sender address.
    #[serde(default)]
    pub mac_address: String,
}

/// Advertisements delivered for one region in a cycle.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchScript {
    /// Region identifier.
    pub region: String,
    /// Advertisements.
    #[serde(default)]
    pub advertisements: Vec<AdvertisementScript>,
}

const fn enabled() -> bool {
    true
}

/// One scenario step.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Step {
    /// `initialize(eddystone, altbeacon)`.
    Initialize {
        /// Decode Eddystone-UID.
        #[serde(default = "enabled")]
        eddystone: bool,
        /// Decode iBeacon/AltBeacon.
        #[serde(default = "enabled")]
        altbeacon: bool,
    },
    /// `initialize_and_check(eddystone, altbeacon)`.
    InitializeAndCheck {
        /// Decode Eddystone-UID.
        #[serde(default = "enabled")]
        eddystone: bool,
        /// Decode iBeacon/AltBeacon.
        #[serde(default = "enabled")]
        altbeacon: bool,
    },
    /// `request_authorization()`.
    RequestAuthorization,
    /// `authorization_status()`.
    AuthorizationStatus,
    /// `bluetooth_state()`.
    BluetoothState,
    /// `check_location_services_if_enabled()`.
    CheckLocationServices,
    /// `open_bluetooth_settings()`.
    OpenBluetoothSettings,
    /// `open_location_settings()`.
    OpenLocationSettings,
    /// `subscribe_ranging(regions)`.
    StartRanging {
        /// Region maps as the host sends them.
        regions: Value,
    },
    /// `stop_ranging()`.
    StopRanging,
    /// `subscribe_monitoring(regions)`.
    StartMonitoring {
        /// Region maps as the host sends them.
        regions: Value,
    },
    /// `stop_monitoring()`.
    StopMonitoring,
    /// Deliver one scan cycle.
    Cycle {
        /// Per-region batches.
        batches: Vec<BatchScript>,
    },
    /// The scan service drops its binding.
    Disconnect,
    /// `close()`.
    Close,
}

impl Step {
    /// Command name used in output lines.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Initialize { .. } => "initialize",
            Self::InitializeAndCheck { .. } => "initialize_and_check",
            Self::RequestAuthorization => "request_authorization",
            Self::AuthorizationStatus => "authorization_status",
            Self::BluetoothState => "bluetooth_state",
            Self::CheckLocationServices => "check_location_services",
            Self::OpenBluetoothSettings => "open_bluetooth_settings",
            Self::OpenLocationSettings => "open_location_settings",
            Self::StartRanging { .. } => "start_ranging",
            Self::StopRanging => "stop_ranging",
            Self::StartMonitoring { .. } => "start_monitoring",
            Self::StopMonitoring => "stop_monitoring",
            Self::Cycle { .. } => "cycle",
            Self::Disconnect => "disconnect",
            Self::Close => "close",
        }
    }
}

/// A complete scenario.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Scenario {
    /// Initial platform state.
    pub platform: PlatformScript,
    /// Prompt answers.
    pub answers: Answers,
    /// Steps in order.
    pub steps: Vec<Step>,
}

impl Scenario {
    /// Parse a scenario from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Parse`] for malformed JSON.
    pub fn from_json(content: &str) -> Result<Self, ReplayError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load a scenario file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ReplayError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }
}

/// Output channel of an [`Emitted`] line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Result of a scenario command.
    Command,
    /// Ranging subscriber.
    Ranging,
    /// Monitoring subscriber.
    Monitoring,
    /// Authorization subscriber.
    Authorization,
}

/// An error as reported on an output line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorView {
    /// Stable error code.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl From<&BeaconError> for ErrorView {
    fn from(err: &BeaconError) -> Self {
        Self {
            kind: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}

/// One output line.
#[derive(Debug, Clone, Serialize)]
pub struct Emitted {
    /// When the line was produced.
    pub timestamp: DateTime<Utc>,
    /// Where it came from.
    pub channel: Channel,
    /// Command name, for command lines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Command result or subscriber event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<Value>,
    /// Failure, for failed commands and subscriber errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorView>,
}

impl Emitted {
    fn event(channel: Channel, event: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            channel,
            command: None,
            event: Some(event),
            error: None,
        }
    }

    fn error(channel: Channel, error: ErrorView) -> Self {
        Self {
            timestamp: Utc::now(),
            channel,
            command: None,
            event: None,
            error: Some(error),
        }
    }

    fn command(name: &str, outcome: Result<Value, ErrorView>) -> Self {
        let (event, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(error) => (None, Some(error)),
        };
        Self {
            timestamp: Utc::now(),
            channel: Channel::Command,
            command: Some(name.to_string()),
            event,
            error,
        }
    }

    /// Render as a single JSON line.
    #[must_use]
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}

fn unit(result: beacon_core::Result<()>) -> Result<Value, ErrorView> {
    result
        .map(|()| Value::String("ok".into()))
        .map_err(|e| ErrorView::from(&e))
}

struct Receivers {
    ranging: UnboundedReceiver<SinkItem<RangingEvent>>,
    monitoring: UnboundedReceiver<SinkItem<MonitoringEvent>>,
    authorization: UnboundedReceiver<SinkItem<PermissionStatus>>,
}

/// A running replay.
pub struct Replay {
    engine: RegionEngine,
    platform: Arc<MockPlatform>,
    answers: Answers,
    ranging_sink: ChannelSink<RangingEvent>,
    monitoring_sink: ChannelSink<MonitoringEvent>,
    receivers: Receivers,
    emitted: Vec<Emitted>,
}

impl Replay {
    /// Set up the platform and engine for `scenario`.
    pub async fn new(scenario: &Scenario, config: &EngineConfig) -> Self {
        let platform = Arc::new(scenario.platform.build());
        let engine = RegionEngine::with_config(Collaborators::from_platform(platform.clone()), config);

        let (ranging_sink, ranging) = ChannelSink::channel();
        let (monitoring_sink, monitoring) = ChannelSink::channel();
        let (authorization_sink, authorization) = ChannelSink::channel();
        engine
            .subscribe_authorization(Arc::new(authorization_sink))
            .await;

        Self {
            engine,
            platform,
            answers: scenario.answers.clone(),
            ranging_sink,
            monitoring_sink,
            receivers: Receivers {
                ranging,
                monitoring,
                authorization,
            },
            emitted: Vec::new(),
        }
    }

    /// Run every step and return the collected output.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed advertisement payloads or a failed
    /// engine task. Command failures are reported as output lines instead.
    pub async fn run(mut self, scenario: Scenario) -> Result<Vec<Emitted>, ReplayError> {
        info!(steps = scenario.steps.len(), "Replaying scenario");
        for (index, step) in scenario.steps.into_iter().enumerate() {
            self.step(index, step).await?;
        }
        self.engine.close().await;
        self.drain();
        Ok(self.emitted)
    }

    async fn step(&mut self, index: usize, step: Step) -> Result<(), ReplayError> {
        let name = step.name();
        debug!(step = index, command = name, "Running step");
        let engine = self.engine.clone();

        let outcome = match step {
            Step::Initialize {
                eddystone,
                altbeacon,
            } => unit(self.drive(async move { engine.initialize(eddystone, altbeacon).await }).await?),
            Step::InitializeAndCheck {
                eddystone,
                altbeacon,
            } => unit(
                self.drive(async move { engine.initialize_and_check(eddystone, altbeacon).await })
                    .await?,
            ),
            Step::RequestAuthorization => {
                unit(self.drive(async move { engine.request_authorization().await }).await?)
            }
            Step::AuthorizationStatus => Ok(Value::String(
                engine.authorization_status().await.as_str().into(),
            )),
            Step::BluetoothState => Ok(Value::String(engine.bluetooth_state().await.as_str().into())),
            Step::CheckLocationServices => {
                Ok(Value::Bool(engine.check_location_services_if_enabled().await))
            }
            Step::OpenBluetoothSettings => {
                unit(self.drive(async move { engine.open_bluetooth_settings().await }).await?)
            }
            Step::OpenLocationSettings => {
                engine.open_location_settings().await;
                self.answer_prompts().await;
                unit(Ok(()))
            }
            Step::StartRanging { regions } => {
                let sink = Arc::new(self.ranging_sink.clone());
                let result = engine.subscribe_ranging(&regions, sink).await;
                self.answer_prompts().await;
                unit(result)
            }
            Step::StopRanging => {
                engine.stop_ranging().await;
                unit(Ok(()))
            }
            Step::StartMonitoring { regions } => {
                let sink = Arc::new(self.monitoring_sink.clone());
                let result = engine.subscribe_monitoring(&regions, sink).await;
                self.answer_prompts().await;
                unit(result)
            }
            Step::StopMonitoring => {
                engine.stop_monitoring().await;
                unit(Ok(()))
            }
            Step::Cycle { batches } => {
                engine.deliver_cycle(decode_cycle(index, batches)?).await;
                unit(Ok(()))
            }
            Step::Disconnect => {
                engine.on_service_disconnected().await;
                self.answer_prompts().await;
                unit(Ok(()))
            }
            Step::Close => {
                engine.close().await;
                unit(Ok(()))
            }
        };

        self.drain();
        self.emitted.push(Emitted::command(name, outcome));
        Ok(())
    }

    /// Run a command that may wait on prompts, answering them as they appear.
    async fn drive<T>(&self, command: impl Future<Output = T> + Send + 'static) -> Result<T, ReplayError>
    where
        T: Send + 'static,
    {
        let task = tokio::spawn(command);
        while !task.is_finished() {
            if !self.answer_prompts().await {
                tokio::time::sleep(PROMPT_POLL).await;
            }
        }
        let output = task.await?;
        self.answer_prompts().await;
        Ok(output)
    }

    /// Answer every queued prompt. Returns whether any were answered.
    async fn answer_prompts(&self) -> bool {
        let mut answered = false;
        while let Some(prompt) = self.platform.next_prompt() {
            answered = true;
            debug!(?prompt, "Answering prompt");
            match prompt {
                Prompt::Permission => {
                    self.platform.set_permission(self.answers.permission);
                    self.engine
                        .on_permission_result(self.answers.permission)
                        .await;
                }
                Prompt::RadioEnable => {
                    if self.answers.radio_enable {
                        self.platform.set_radio_enabled(true);
                    }
                    self.engine
                        .on_radio_enable_result(self.answers.radio_enable)
                        .await;
                }
                Prompt::LocationSettings => {
                    if self.answers.location_enable {
                        self.platform.set_location_enabled(true);
                    }
                    self.engine.on_location_settings_result().await;
                }
                Prompt::Bind => {
                    if self.answers.connect {
                        self.engine.on_service_connected().await;
                    }
                }
            }
        }
        answered
    }

    fn drain(&mut self) {
        while let Ok(item) = self.receivers.authorization.try_recv() {
            self.emitted.push(emit(Channel::Authorization, item));
        }
        while let Ok(item) = self.receivers.ranging.try_recv() {
            self.emitted.push(emit(Channel::Ranging, item));
        }
        while let Ok(item) = self.receivers.monitoring.try_recv() {
            self.emitted.push(emit(Channel::Monitoring, item));
        }
    }
}

fn emit<E: Serialize>(channel: Channel, item: SinkItem<E>) -> Emitted {
    match item {
        Ok(event) => Emitted::event(
            channel,
            serde_json::to_value(event).unwrap_or(Value::Null),
        ),
        Err(e) => Emitted::error(
            channel,
            ErrorView {
                kind: e.kind,
                message: e.message,
            },
        ),
    }
}

fn decode_cycle(step: usize, batches: Vec<BatchScript>) -> Result<ScanCycle, ReplayError> {
    let batches = batches
        .into_iter()
        .map(|batch| {
            let advertisements = batch
                .advertisements
                .into_iter()
                .map(|adv| {
                    let data = hex::decode(adv.data.trim())
                        .map_err(|source| ReplayError::Payload { step, source })?;
                    Ok(RawAdvertisement {
                        data,
                        rssi: adv.rssi,
                        mac_address: adv.mac_address,
                    })
                })
                .collect::<Result<Vec<_>, ReplayError>>()?;
            Ok(AdvertisementBatch {
                region: batch.region,
                advertisements,
            })
        })
        .collect::<Result<Vec<_>, ReplayError>>()?;
    Ok(ScanCycle { batches })
}

/// Replay `scenario` with `config` and return the output lines.
///
/// # Errors
///
/// See [`Replay::run`].
pub async fn replay(scenario: Scenario, config: &EngineConfig) -> Result<Vec<Emitted>, ReplayError> {
    Replay::new(&scenario, config).await.run(scenario).await
}
