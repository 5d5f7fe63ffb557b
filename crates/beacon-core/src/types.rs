//! Event payloads pushed to subscribers.
//!
//! These are the shapes the host transport forwards verbatim, so field
//! names and string values are fixed.

use serde::{Deserialize, Serialize};

use crate::decoder::{Beacon, BeaconKind};
use crate::platform::PermissionStatus;
use crate::region::{Identifier, Region};

/// Membership of a monitored region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegionState {
    /// Not evaluated yet.
    #[default]
    Unknown,
    /// No matching beacon in the last cycle.
    Outside,
    /// At least one matching beacon in the last cycle.
    Inside,
}

/// Region as echoed back to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionView {
    /// Caller-assigned key.
    pub identifier: String,
    /// Proximity UUID, uppercase.
    #[serde(rename = "proximityUUID", skip_serializing_if = "Option::is_none")]
    pub proximity_uuid: Option<String>,
    /// Major.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub major: Option<u16>,
    /// Minor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minor: Option<u16>,
    /// Eddystone namespace, `0x` hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace_id: Option<String>,
    /// Eddystone instance, `0x` hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl From<&Region> for RegionView {
    fn from(region: &Region) -> Self {
        let mut view = Self {
            identifier: region.identifier.clone(),
            proximity_uuid: None,
            major: None,
            minor: None,
            namespace_id: None,
            instance_id: None,
        };
        match region.id(0) {
            Some(id @ Identifier::Bytes(_)) => view.namespace_id = Some(id.to_string()),
            Some(id) => view.proximity_uuid = Some(id.to_string()),
            None => {}
        }
        match region.id(1) {
            Some(id @ Identifier::Bytes(_)) => view.instance_id = Some(id.to_string()),
            Some(id) => view.major = id.as_int(),
            None => {}
        }
        view.minor = region.id(2).and_then(Identifier::as_int);
        view
    }
}

/// Identifier fields of a [`BeaconView`], tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BeaconIds {
    /// iBeacon / AltBeacon triple.
    #[serde(rename = "ibeacon")]
    IBeacon {
        /// Proximity UUID, uppercase.
        #[serde(rename = "proximityUUID")]
        proximity_uuid: String,
        /// Major.
        major: u16,
        /// Minor.
        minor: u16,
    },
    /// Eddystone-UID pair.
    #[serde(rename = "eddystone", rename_all = "camelCase")]
    Eddystone {
        /// Namespace, `0x` hex.
        namespace_id: String,
        /// Instance, `0x` hex.
        instance_id: String,
    },
}

/// Beacon as pushed in a ranging event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeaconView {
    /// Layout-specific identifiers.
    #[serde(flatten)]
    pub ids: BeaconIds,
    /// Signal strength in dBm.
    pub rssi: i16,
    /// Calibrated 1 m power in dBm.
    pub tx_power: i16,
    /// Estimated distance in meters, two decimals.
    pub accuracy: String,
    /// Sender address, may be empty.
    pub mac_address: String,
}

impl From<&Beacon> for BeaconView {
    fn from(beacon: &Beacon) -> Self {
        let id = |i: usize| beacon.ids.get(i);
        let ids = match beacon.kind {
            BeaconKind::IBeacon => BeaconIds::IBeacon {
                proximity_uuid: id(0).map(ToString::to_string).unwrap_or_default(),
                major: id(1).and_then(Identifier::as_int).unwrap_or_default(),
                minor: id(2).and_then(Identifier::as_int).unwrap_or_default(),
            },
            BeaconKind::Eddystone => BeaconIds::Eddystone {
                namespace_id: id(0).map(ToString::to_string).unwrap_or_default(),
                instance_id: id(1).map(ToString::to_string).unwrap_or_default(),
            },
        };
        Self {
            ids,
            rssi: beacon.rssi,
            tx_power: beacon.tx_power,
            accuracy: format!("{:.2}", beacon.accuracy),
            mac_address: beacon.mac_address.clone(),
        }
    }
}

/// One ranging snapshot for one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangingEvent {
    /// Region the batch was delivered for.
    pub region: RegionView,
    /// Matching beacons seen in this batch.
    pub beacons: Vec<BeaconView>,
}

/// Monitoring event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitoringEventKind {
    /// State became `Inside`.
    #[serde(rename = "didEnterRegion")]
    DidEnterRegion,
    /// State became `Outside`.
    #[serde(rename = "didExitRegion")]
    DidExitRegion,
    /// First evaluation after monitoring (re)started.
    #[serde(rename = "didDetermineStateForRegion")]
    DidDetermineStateForRegion,
}

/// One monitoring transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringEvent {
    /// Event name.
    pub event: MonitoringEventKind,
    /// Region concerned.
    pub region: RegionView,
    /// Present only on `didDetermineStateForRegion`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<RegionState>,
}

impl MonitoringEvent {
    /// Enter event.
    #[must_use]
    pub fn enter(region: &Region) -> Self {
        Self {
            event: MonitoringEventKind::DidEnterRegion,
            region: region.into(),
            state: None,
        }
    }

    /// Exit event.
    #[must_use]
    pub fn exit(region: &Region) -> Self {
        Self {
            event: MonitoringEventKind::DidExitRegion,
            region: region.into(),
            state: None,
        }
    }

    /// Initial-state snapshot.
    #[must_use]
    pub fn determine_state(region: &Region, state: RegionState) -> Self {
        Self {
            event: MonitoringEventKind::DidDetermineStateForRegion,
            region: region.into(),
            state: Some(state),
        }
    }
}

/// Authorization status pushed on the availability channel.
pub type AuthorizationEvent = PermissionStatus;
