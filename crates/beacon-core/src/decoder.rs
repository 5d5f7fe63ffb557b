//! Advertisement frame decoding.
//!
//! Two layouts are recognized:
//!
//! - **Eddystone-UID**: 16-bit service data for UUID `0xFEAA`, frame type
//!   `0x00`, tx power at 0 m, 10-byte namespace, 6-byte instance.
//! - **iBeacon/AltBeacon**: manufacturer data with `0x02 0x15` after the
//!   company id, 16-byte proximity UUID, big-endian major and minor, and the
//!   measured power at 1 m.
//!
//! Anything else decodes to `None`. Most BLE traffic is unrelated to
//! beacons, so a non-match is never an error.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::region::Identifier;

/// Eddystone service UUID.
pub const EDDYSTONE_SERVICE_UUID: u16 = 0xFEAA;

/// Eddystone-UID frame type.
pub const EDDYSTONE_UID_FRAME: u8 = 0x00;

/// iBeacon type/length prefix inside manufacturer data.
pub const IBEACON_PREFIX: [u8; 2] = [0x02, 0x15];

/// Default correction from Eddystone 0 m power to the 1 m calibration.
pub const DEFAULT_EDDYSTONE_POWER_CORRECTION: i8 = -41;

const AD_TYPE_SERVICE_DATA_16: u8 = 0x16;
const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// Which beacon layout produced a sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BeaconKind {
    /// iBeacon / AltBeacon manufacturer frame.
    IBeacon,
    /// Eddystone-UID service-data frame.
    Eddystone,
}

/// One raw advertisement as delivered by the scan service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAdvertisement {
    /// Advertising data: a sequence of `len | type | value` structures.
    pub data: Vec<u8>,
    /// Received signal strength in dBm.
    pub rssi: i16,
    /// Sender address, empty when the platform hides it.
    #[serde(default)]
    pub mac_address: String,
}

/// A decoded beacon sighting.
#[derive(Debug, Clone, PartialEq)]
pub struct Beacon {
    /// Layout the frame matched.
    pub kind: BeaconKind,
    /// UUID+major+minor for iBeacon, namespace+instance for Eddystone.
    pub ids: Vec<Identifier>,
    /// Received signal strength in dBm.
    pub rssi: i16,
    /// Calibrated power at 1 m in dBm.
    pub tx_power: i16,
    /// Estimated distance in meters.
    pub accuracy: f64,
    /// Sender address, may be empty.
    pub mac_address: String,
}

impl Beacon {
    /// Whether two sightings come from the same transmitter identity.
    #[must_use]
    pub fn same_identity(&self, other: &Self) -> bool {
        self.kind == other.kind && self.ids == other.ids && self.mac_address == other.mac_address
    }
}

/// Which layouts are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDecoder {
    eddystone: bool,
    altbeacon: bool,
    eddystone_power_correction: i8,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl FrameDecoder {
    /// Create a decoder with the given layouts enabled.
    #[must_use]
    pub const fn new(eddystone: bool, altbeacon: bool) -> Self {
        Self {
            eddystone,
            altbeacon,
            eddystone_power_correction: DEFAULT_EDDYSTONE_POWER_CORRECTION,
        }
    }

    /// Override the Eddystone 0 m → 1 m power correction.
    #[must_use]
    pub const fn with_eddystone_power_correction(mut self, correction: i8) -> Self {
        self.eddystone_power_correction = correction;
        self
    }

    /// Same power correction, different layouts.
    #[must_use]
    pub const fn with_layouts(mut self, eddystone: bool, altbeacon: bool) -> Self {
        self.eddystone = eddystone;
        self.altbeacon = altbeacon;
        self
    }

    /// Whether Eddystone-UID frames are decoded.
    #[must_use]
    pub const fn eddystone_enabled(&self) -> bool {
        self.eddystone
    }

    /// Whether iBeacon/AltBeacon frames are decoded.
    #[must_use]
    pub const fn altbeacon_enabled(&self) -> bool {
        self.altbeacon
    }

    /// Decode one advertisement, or `None` if no active layout matches.
    #[must_use]
    pub fn decode(&self, adv: &RawAdvertisement) -> Option<Beacon> {
        let structures: Vec<(u8, &[u8])> = AdStructures::new(&adv.data).collect();

        if self.eddystone {
            let eddystone_data = structures.iter().find_map(|&(ad_type, value)| {
                (ad_type == AD_TYPE_SERVICE_DATA_16
                    && value.len() >= 2
                    && u16::from_le_bytes([value[0], value[1]]) == EDDYSTONE_SERVICE_UUID)
                    .then(|| &value[2..])
            });
            if let Some(data) = eddystone_data {
                return self.decode_eddystone(data, adv);
            }
        }

        if self.altbeacon {
            return structures
                .iter()
                .filter(|(ad_type, _)| *ad_type == AD_TYPE_MANUFACTURER_DATA)
                .find_map(|(_, value)| decode_ibeacon(value, adv));
        }

        None
    }

    fn decode_eddystone(&self, data: &[u8], adv: &RawAdvertisement) -> Option<Beacon> {
        if data.len() < 18 || data[0] != EDDYSTONE_UID_FRAME {
            return None;
        }
        let tx_power =
            i16::from(i8::from_le_bytes([data[1]])) + i16::from(self.eddystone_power_correction);
        Some(Beacon {
            kind: BeaconKind::Eddystone,
            ids: vec![
                Identifier::Bytes(data[2..12].to_vec()),
                Identifier::Bytes(data[12..18].to_vec()),
            ],
            rssi: adv.rssi,
            tx_power,
            accuracy: estimate_accuracy(adv.rssi, tx_power),
            mac_address: adv.mac_address.clone(),
        })
    }
}

fn decode_ibeacon(value: &[u8], adv: &RawAdvertisement) -> Option<Beacon> {
    if value.len() < 25 || value[2..4] != IBEACON_PREFIX {
        return None;
    }
    let uuid = Uuid::from_slice(&value[4..20]).ok()?;
    let major = u16::from_be_bytes([value[20], value[21]]);
    let minor = u16::from_be_bytes([value[22], value[23]]);
    let tx_power = i16::from(i8::from_le_bytes([value[24]]));
    Some(Beacon {
        kind: BeaconKind::IBeacon,
        ids: vec![
            Identifier::Uuid(uuid),
            Identifier::Int(major),
            Identifier::Int(minor),
        ],
        rssi: adv.rssi,
        tx_power,
        accuracy: estimate_accuracy(adv.rssi, tx_power),
        mac_address: adv.mac_address.clone(),
    })
}

/// Collapse repeated sightings of one transmitter, keeping the latest.
pub fn dedupe_sightings(beacons: impl IntoIterator<Item = Beacon>) -> Vec<Beacon> {
    let mut unique: Vec<Beacon> = Vec::new();
    for beacon in beacons {
        match unique.iter_mut().find(|seen| seen.same_identity(&beacon)) {
            Some(seen) => *seen = beacon,
            None => unique.push(beacon),
        }
    }
    unique
}

/// Estimate distance in meters from received and calibrated power.
///
/// Curve-fitted path-loss model used by AltBeacon:
/// `ratio = rssi / tx_power`; below 1.0 the distance is
/// `0.89976 * ratio^7.7095 + 0.111`, otherwise
/// `0.42093 * ratio^6.9476 + 0.54992`. Returns `0.0` when either power
/// is zero (distance unknown).
#[must_use]
pub fn estimate_accuracy(rssi: i16, tx_power: i16) -> f64 {
    if rssi == 0 || tx_power == 0 {
        return 0.0;
    }
    let ratio = f64::from(rssi) / f64::from(tx_power);
    let distance = if ratio < 1.0 {
        0.89976f64.mul_add(ratio.powf(7.7095), 0.111)
    } else {
        0.42093f64.mul_add(ratio.powf(6.9476), 0.54992)
    };
    distance.max(0.0)
}

/// Iterator over `len | type | value` advertising structures.
///
/// Stops at a zero length or a truncated structure.
struct AdStructures<'a> {
    data: &'a [u8],
}

impl<'a> AdStructures<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for AdStructures<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let (&len, rest) = self.data.split_first()?;
        let len = usize::from(len);
        if len == 0 || rest.len() < len {
            self.data = &[];
            return None;
        }
        let (structure, remaining) = rest.split_at(len);
        self.data = remaining;
        Some((structure[0], &structure[1..]))
    }
}

/// Build an iBeacon advertisement. Used by tests and the replay harness.
#[must_use]
pub fn encode_ibeacon(uuid: Uuid, major: u16, minor: u16, measured_power: i8) -> Vec<u8> {
    let mut value = vec![AD_TYPE_MANUFACTURER_DATA, 0x4C, 0x00];
    value.extend_from_slice(&IBEACON_PREFIX);
    value.extend_from_slice(uuid.as_bytes());
    value.extend_from_slice(&major.to_be_bytes());
    value.extend_from_slice(&minor.to_be_bytes());
    value.extend_from_slice(&measured_power.to_le_bytes());

    let mut data = vec![0x02, 0x01, 0x06];
    data.push(u8::try_from(value.len()).unwrap_or(u8::MAX));
    data.extend_from_slice(&value);
    data
}

/// Build an Eddystone-UID advertisement. Used by tests and the replay harness.
#[must_use]
pub fn encode_eddystone_uid(namespace: [u8; 10], instance: [u8; 6], power_at_0m: i8) -> Vec<u8> {
    let uuid = EDDYSTONE_SERVICE_UUID.to_le_bytes();
    let mut value = vec![AD_TYPE_SERVICE_DATA_16, uuid[0], uuid[1], EDDYSTONE_UID_FRAME];
    value.extend_from_slice(&power_at_0m.to_le_bytes());
    value.extend_from_slice(&namespace);
    value.extend_from_slice(&instance);
    value.extend_from_slice(&[0x00, 0x00]);

    let mut data = vec![0x02, 0x01, 0x06, 0x03, 0x03, uuid[0], uuid[1]];
    data.push(u8::try_from(value.len()).unwrap_or(u8::MAX));
    data.extend_from_slice(&value);
    data
}
