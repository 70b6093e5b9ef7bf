//! piCtory configuration records (`config.rsc`).
//!
//! The file is JSON. Numeric fields appear both as numbers and as numeric
//! strings depending on the piCtory version, so the raw document is read
//! into `serde_json::Value`s and converted field by field. Records that
//! cannot be converted are configuration defects: they are logged and
//! skipped.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use super::address::DefaultSpec;
use crate::config::{ConfigError, DeviceKey};

// ─── Records ────────────────────────────────────────────────────────

/// Module `type` key of a device record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceType {
    /// Core/Connect/Compact/Flat base modules.
    Base,
    /// IO modules left or right of the base.
    LeftRight,
    /// Virtual devices.
    Virtual,
    /// Gateways.
    Edge,
    /// Connect devices (not built).
    Right,
    /// Anything else.
    Unknown(String),
}

impl From<&str> for DeviceType {
    fn from(s: &str) -> Self {
        match s {
            "BASE" => Self::Base,
            "LEFT_RIGHT" => Self::LeftRight,
            "VIRTUAL" => Self::Virtual,
            "EDGE" => Self::Edge,
            "RIGHT" => Self::Right,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Device position; adapters of old piCtory versions carry `"adap."`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePosition {
    /// Fixed position number.
    Fixed(u16),
    /// Assigned at build time to the first free position >= 64.
    Adapter,
}

/// One entry of an `inp`/`out`/`mem` map.
#[derive(Debug, Clone, PartialEq)]
pub struct IoRecord {
    /// Numeric key of the entry inside its map.
    pub key: u32,
    /// IO name.
    pub name: String,
    /// Configured default.
    pub default: DefaultSpec,
    /// Width in bits.
    pub bit_length: u32,
    /// Start offset inside the module.
    pub start: usize,
    /// Export flag.
    pub export: bool,
    /// piCtory id string.
    pub id: String,
    /// Description.
    pub bmk: String,
    /// Bit index for bit values.
    pub bit_index: Option<u32>,
}

/// One device of the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    /// Device name.
    pub name: String,
    /// Position number.
    pub position: DevicePosition,
    /// Absolute offset in the process image.
    pub offset: usize,
    /// piCtory product type.
    pub product_type: u16,
    /// Module type.
    pub device_type: DeviceType,
    /// Input records ordered by key.
    pub inp: Vec<IoRecord>,
    /// Output records ordered by key.
    pub out: Vec<IoRecord>,
    /// Memory records ordered by key.
    pub mem: Vec<IoRecord>,
    /// Designation.
    pub bmk: String,
    /// Free comment.
    pub comment: String,
}

/// Parsed `config.rsc`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PiCtoryConfig {
    /// Valid device records in file order.
    pub devices: Vec<DeviceRecord>,
}

// ─── Raw JSON ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawConfig {
    #[serde(rename = "Devices", default)]
    devices: Vec<RawDevice>,
}

#[derive(Deserialize)]
struct RawDevice {
    #[serde(default)]
    name: String,
    position: Value,
    offset: Value,
    #[serde(rename = "productType", default)]
    product_type: Value,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    inp: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    out: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    mem: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    bmk: String,
    #[serde(default)]
    comment: String,
}

/// Integer from a JSON number or numeric string.
fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_default(value: &Value) -> DefaultSpec {
    match value {
        Value::Null => DefaultSpec::None,
        Value::Bool(b) => DefaultSpec::Bool(*b),
        Value::Number(n) => n
            .as_i64()
            .map(|i| DefaultSpec::Int(i as i128))
            .unwrap_or(DefaultSpec::None),
        Value::String(s) => DefaultSpec::Text(s.clone()),
        _ => DefaultSpec::None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "0",
        _ => false,
    }
}

impl IoRecord {
    /// Convert the 8-tuple `[name, default, bit_length, start, export, id,
    /// bmk, bit_index]`.
    fn from_tuple(key: u32, tuple: &[Value]) -> Result<Self, String> {
        if tuple.len() < 8 {
            return Err(format!("expected 8 fields, got {}", tuple.len()));
        }
        let name = match &tuple[0] {
            Value::String(s) if !s.is_empty() => s.clone(),
            other => return Err(format!("invalid name {other}")),
        };
        let bit_length = as_int(&tuple[2])
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| format!("{name}: invalid bit length {}", tuple[2]))?;
        let start = as_int(&tuple[3])
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| format!("{name}: invalid start offset {}", tuple[3]))?;
        let bit_index = match &tuple[7] {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            other => Some(
                as_int(other)
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| format!("{name}: invalid bit index {other}"))?,
            ),
        };
        Ok(Self {
            key,
            name,
            default: as_default(&tuple[1]),
            bit_length,
            start,
            export: truthy(&tuple[4]),
            id: as_text(&tuple[5]),
            bmk: as_text(&tuple[6]),
            bit_index,
        })
    }
}

fn convert_section(device: &str, section: &BTreeMap<String, Vec<Value>>) -> Vec<IoRecord> {
    let mut records = Vec::with_capacity(section.len());
    for (key, tuple) in section {
        let Ok(num) = key.trim().parse::<u32>() else {
            warn!(device, key = key.as_str(), "IO key is not numeric, ignored");
            continue;
        };
        match IoRecord::from_tuple(num, tuple) {
            Ok(record) => records.push(record),
            Err(e) => warn!(device, key = num, "IO record ignored: {}", e),
        }
    }
    records.sort_by_key(|r| r.key);
    records
}

impl DeviceRecord {
    fn from_raw(raw: &RawDevice) -> Result<Self, String> {
        let position = match &raw.position {
            Value::String(s) if s == "adap." => DevicePosition::Adapter,
            other => DevicePosition::Fixed(
                as_int(other)
                    .and_then(|v| u16::try_from(v).ok())
                    .ok_or_else(|| format!("invalid position {other}"))?,
            ),
        };
        let offset = as_int(&raw.offset)
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| format!("invalid offset {}", raw.offset))?;
        let product_type = as_int(&raw.product_type)
            .and_then(|v| u16::try_from(v).ok())
            .unwrap_or(0);
        Ok(Self {
            name: raw.name.clone(),
            position,
            offset,
            product_type,
            device_type: DeviceType::from(raw.kind.as_str()),
            inp: convert_section(&raw.name, &raw.inp),
            out: convert_section(&raw.name, &raw.out),
            mem: convert_section(&raw.name, &raw.mem),
            bmk: raw.bmk.clone(),
            comment: raw.comment.clone(),
        })
    }

    /// True when `key` selects this device.
    pub fn matches(&self, key: &DeviceKey) -> bool {
        match key {
            DeviceKey::Position(p) => self.position == DevicePosition::Fixed(*p),
            DeviceKey::Name(n) => &self.name == n,
        }
    }
}

impl PiCtoryConfig {
    /// Parse a `config.rsc` document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let mut devices = Vec::with_capacity(raw.devices.len());
        for dev in &raw.devices {
            match DeviceRecord::from_raw(dev) {
                Ok(record) => devices.push(record),
                Err(e) => warn!(device = dev.name.as_str(), "device ignored: {}", e),
            }
        }
        Ok(Self { devices })
    }

    /// Read and parse a `config.rsc` file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound)?;
        Self::from_json(&text)
    }

    /// Keep only the selected devices.
    ///
    /// An empty `keys` list keeps everything that passes the type filter.
    pub fn select(&mut self, keys: &[DeviceKey], device_type: Option<&str>) {
        let wanted_type = device_type.map(DeviceType::from);
        self.devices.retain(|dev| {
            wanted_type.as_ref().is_none_or(|t| &dev.device_type == t)
                && (keys.is_empty() || keys.iter().any(|k| dev.matches(k)))
        });
    }
}
