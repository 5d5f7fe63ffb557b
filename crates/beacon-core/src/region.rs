//! Beacon identifiers, watched regions, and region matching.
//!
//! A [`Region`] is a positional pattern of up to three identifiers. A present
//! identifier at position *i* must equal the beacon's identifier at *i*; an
//! absent one is a wildcard. Identifier kinds never compare equal across
//! types, so a UUID pattern cannot match an Eddystone namespace.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::decoder::Beacon;

/// Maximum number of identifier positions in a region.
pub const MAX_REGION_IDS: usize = 3;

/// `0x`-prefixed hex byte string.
static HEX_IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^0[xX]([0-9a-fA-F]{2})+$").expect("valid hex identifier regex")
});

/// Plain decimal, parsed as a 16-bit identifier.
static DECIMAL_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{1,5}$").expect("valid decimal identifier regex"));

/// Errors produced while parsing identifiers and region maps.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegionError {
    /// The identifier string is neither a UUID, a 16-bit integer nor hex bytes.
    #[error("unparsable identifier '{0}'")]
    InvalidIdentifier(String),

    /// An integer identifier lies outside `0..=65535`.
    #[error("integer identifier {0} out of range 0..=65535")]
    OutOfRange(i64),

    /// A region map is missing its string `identifier`.
    #[error("region is missing a string 'identifier'")]
    MissingIdentifier,

    /// A region field has the wrong JSON type.
    #[error("region field '{field}' must be {expected}")]
    WrongType {
        /// Offending key.
        field: &'static str,
        /// Expected JSON type.
        expected: &'static str,
    },

    /// Two keys claim the same identifier position.
    #[error("region fields '{0}' and '{1}' are mutually exclusive")]
    Conflict(&'static str, &'static str),

    /// The region list itself is not a list of maps.
    #[error("expected a list of region maps, got {0}")]
    NotAList(String),
}

/// An opaque beacon identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// 128-bit UUID (iBeacon proximity UUID). Compared case-insensitively by value.
    Uuid(Uuid),
    /// 16-bit integer (iBeacon major/minor).
    Int(u16),
    /// Raw bytes (Eddystone namespace/instance).
    Bytes(Vec<u8>),
}

impl Identifier {
    /// Parse an identifier from its string form.
    ///
    /// Accepts `0x`-prefixed hex (bytes), decimal `0..=65535` (int), and
    /// UUIDs with or without hyphens.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError::InvalidIdentifier`] for anything else.
    pub fn parse(s: &str) -> Result<Self, RegionError> {
        let trimmed = s.trim();
        if HEX_IDENTIFIER.is_match(trimmed) {
            let bytes = hex::decode(&trimmed[2..])
                .map_err(|_| RegionError::InvalidIdentifier(s.to_string()))?;
            return Ok(Self::Bytes(bytes));
        }
        if DECIMAL_IDENTIFIER.is_match(trimmed) {
            let value: i64 = trimmed
                .parse()
                .map_err(|_| RegionError::InvalidIdentifier(s.to_string()))?;
            return Self::from_int(value);
        }
        Uuid::parse_str(trimmed)
            .map(Self::Uuid)
            .map_err(|_| RegionError::InvalidIdentifier(s.to_string()))
    }

    /// Build a 16-bit identifier, rejecting out-of-range values.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError::OutOfRange`] outside `0..=65535`.
    pub fn from_int(value: i64) -> Result<Self, RegionError> {
        u16::try_from(value)
            .map(Self::Int)
            .map_err(|_| RegionError::OutOfRange(value))
    }

    /// Integer value, if this is an integer identifier.
    #[must_use]
    pub const fn as_int(&self) -> Option<u16> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uuid(uuid) => write!(f, "{}", uuid.hyphenated().to_string().to_uppercase()),
            Self::Int(v) => write!(f, "{v}"),
            Self::Bytes(bytes) => write!(f, "0x{}", hex::encode(bytes)),
        }
    }
}

/// A caller-defined watch pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    /// Caller-assigned key used to correlate events.
    pub identifier: String,
    ids: [Option<Identifier>; MAX_REGION_IDS],
}

impl Region {
    /// Create a region from positional identifiers. `None` is a wildcard.
    #[must_use]
    pub fn new(
        identifier: impl Into<String>,
        id1: Option<Identifier>,
        id2: Option<Identifier>,
        id3: Option<Identifier>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            ids: [id1, id2, id3],
        }
    }

    /// A region matching every beacon.
    #[must_use]
    pub fn wildcard(identifier: impl Into<String>) -> Self {
        Self::new(identifier, None, None, None)
    }

    /// Identifier at `position`, or `None` for a wildcard.
    #[must_use]
    pub fn id(&self, position: usize) -> Option<&Identifier> {
        self.ids.get(position).and_then(Option::as_ref)
    }

    /// Whether `beacon` falls inside this region.
    #[must_use]
    pub fn matches(&self, beacon: &Beacon) -> bool {
        matches(beacon, self)
    }

    /// Parse a region from the map form sent by the host.
    ///
    /// # Errors
    ///
    /// Returns a [`RegionError`] describing the first malformed field.
    pub fn from_value(value: &Value) -> Result<Self, RegionError> {
        let map = value.as_object().ok_or(RegionError::WrongType {
            field: "region",
            expected: "a map",
        })?;

        let identifier = map
            .get("identifier")
            .and_then(Value::as_str)
            .ok_or(RegionError::MissingIdentifier)?
            .to_string();

        let id1 = exclusive(map, "proximityUUID", "namespaceId")?;
        let id2 = match (map.get("major"), map.get("instanceId")) {
            (Some(major), None) => Some(int_field(major, "major")?),
            (None, Some(instance)) => Some(bytes_field(instance, "instanceId")?),
            (None, None) => None,
            (Some(_), Some(_)) => return Err(RegionError::Conflict("major", "instanceId")),
        };
        let id3 = map
            .get("minor")
            .map(|minor| int_field(minor, "minor"))
            .transpose()?;

        Ok(Self::new(identifier, id1, id2, id3))
    }
}

/// Parse a list of region maps. Any malformed entry rejects the whole list.
///
/// # Errors
///
/// Returns [`RegionError::NotAList`] if `value` is not an array, or the first
/// per-region error otherwise.
pub fn parse_region_list(value: &Value) -> Result<Vec<Region>, RegionError> {
    let list = value
        .as_array()
        .ok_or_else(|| RegionError::NotAList(json_type_name(value).to_string()))?;
    list.iter().map(Region::from_value).collect()
}

/// Drop earlier regions that share an identifier with a later one.
#[must_use]
pub fn dedupe_regions(regions: Vec<Region>) -> Vec<Region> {
    let mut unique: Vec<Region> = Vec::with_capacity(regions.len());
    for region in regions {
        unique.retain(|r| r.identifier != region.identifier);
        unique.push(region);
    }
    unique
}

/// Whether `beacon` belongs to `region`.
///
/// Wildcard positions always match. Present positions must be equal,
/// which never holds across identifier kinds.
#[must_use]
pub fn matches(beacon: &Beacon, region: &Region) -> bool {
    region.ids.iter().enumerate().all(|(i, pattern)| match pattern {
        None => true,
        Some(expected) => beacon.ids.get(i) == Some(expected),
    })
}

fn exclusive(
    map: &Map<String, Value>,
    uuid_key: &'static str,
    bytes_key: &'static str,
) -> Result<Option<Identifier>, RegionError> {
    match (map.get(uuid_key), map.get(bytes_key)) {
        (Some(_), Some(_)) => Err(RegionError::Conflict(uuid_key, bytes_key)),
        (Some(v), None) => {
            let s = v.as_str().ok_or(RegionError::WrongType {
                field: uuid_key,
                expected: "a string",
            })?;
            Identifier::parse(s).map(Some)
        }
        (None, Some(v)) => bytes_field(v, bytes_key).map(Some),
        (None, None) => Ok(None),
    }
}

fn int_field(value: &Value, field: &'static str) -> Result<Identifier, RegionError> {
    let n = value.as_i64().ok_or(RegionError::WrongType {
        field,
        expected: "an integer",
    })?;
    Identifier::from_int(n)
}

fn bytes_field(value: &Value, field: &'static str) -> Result<Identifier, RegionError> {
    let s = value.as_str().ok_or(RegionError::WrongType {
        field,
        expected: "a hex string",
    })?;
    match Identifier::parse(s)? {
        id @ Identifier::Bytes(_) => Ok(id),
        _ => Err(RegionError::WrongType {
            field,
            expected: "a 0x-prefixed hex string",
        }),
    }
}

const fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a map",
    }
}
