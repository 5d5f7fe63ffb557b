//! # beacon-core
//!
//! Core logic of the beacon region engine.
//!
//! This crate provides:
//! - Decoding of iBeacon/AltBeacon and Eddystone-UID advertisements
//! - Region matching with positional wildcards
//! - An availability gate over permission, radio, location service and binding
//! - Ranging snapshots and monitoring enter/exit transitions
//! - Zero-or-one subscriber per event channel
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`decoder`] - Advertisement frame decoding and distance estimation
//! - [`region`] - Identifiers, regions, and region-map parsing
//! - [`gate`] - Availability state and readiness checks
//! - [`platform`] - Collaborator traits implemented by platform adapters
//! - [`notifier`] - Subscriber sinks and notifier slots
//! - [`engine`] - The region engine and its serialization point
//! - [`types`] - Event payloads pushed to subscribers
//! - [`config`] - Engine configuration loading, saving, and validation
//! - [`error`] - Unified error types for the crate

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod gate;
#[cfg(any(test, feature = "mock-platform"))]
pub mod mock;
pub mod notifier;
pub mod platform;
pub mod region;
pub mod types;

// Re-export primary types for convenience
pub use config::{default_config_path, ConfigError, ConfigResult, EngineConfig};
pub use decoder::{Beacon, BeaconKind, FrameDecoder, RawAdvertisement};
pub use engine::RegionEngine;
pub use error::{BeaconError, Result};
pub use gate::{AvailabilityState, Binding, RadioState, Readiness};
#[cfg(any(test, feature = "mock-platform"))]
pub use mock::{MockPlatform, Prompt};
pub use notifier::{ChannelSink, EventSink, SharedSink, SinkError, SinkItem};
pub use platform::{
    AdvertisementBatch, Collaborators, LocationServiceSource, ObservationMode, PermissionSource,
    PermissionStatus, RadioStateSource, ScanCycle, ScanService, ScanServiceError,
};
pub use region::{Identifier, Region, RegionError};
pub use types::{
    AuthorizationEvent, BeaconView, MonitoringEvent, MonitoringEventKind, RangingEvent,
    RegionState, RegionView,
};
