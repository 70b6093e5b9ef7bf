//! Device Registry: devices by position and by name.
//!
//! Iteration follows the buffer offset, not the position number. Names are
//! not trusted to be unique: when two devices share a name, name lookup is
//! disabled for all of them and a warning names their positions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use procimg_common::config::DeviceKey;
use procimg_common::consts::ADAPTER_POSITION_BASE;
use tracing::warn;

use crate::device::Device;
use crate::error::{SyncError, SyncResult};

/// All built devices of a process image.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    ordered: Vec<Arc<Device>>,
    by_position: BTreeMap<u16, Arc<Device>>,
    by_name: HashMap<String, Arc<Device>>,
    ambiguous: HashSet<String>,
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// True if no device is registered.
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Add a device; a used position is an error.
    pub fn add(&mut self, device: Device) -> SyncResult<Arc<Device>> {
        let position = device.position();
        if self.by_position.contains_key(&position) {
            return Err(SyncError::DuplicatePosition(position));
        }
        let device = Arc::new(device);
        let name = device.name().to_string();
        if self.ambiguous.contains(&name) || self.by_name.contains_key(&name) {
            self.by_name.remove(&name);
            self.ambiguous.insert(name.clone());
            let positions: Vec<String> = self
                .ordered
                .iter()
                .filter(|d| d.name() == name)
                .map(|d| d.position().to_string())
                .chain(std::iter::once(position.to_string()))
                .collect();
            warn!(
                device = name.as_str(),
                positions = positions.join("|").as_str(),
                "equal device name in piCtory configuration, access by position only"
            );
        } else {
            self.by_name.insert(name, Arc::clone(&device));
        }
        self.by_position.insert(position, Arc::clone(&device));
        let idx = self
            .ordered
            .partition_point(|d| d.offset() <= device.offset());
        self.ordered.insert(idx, Arc::clone(&device));
        Ok(device)
    }

    /// Remove a device by position.
    pub fn remove(&mut self, position: u16) -> Option<Arc<Device>> {
        let device = self.by_position.remove(&position)?;
        self.ordered.retain(|d| !Arc::ptr_eq(d, &device));
        if let Some(named) = self.by_name.get(device.name())
            && Arc::ptr_eq(named, &device)
        {
            self.by_name.remove(device.name());
        }
        Some(device)
    }

    /// Device by position.
    pub fn by_position(&self, position: u16) -> Option<&Arc<Device>> {
        self.by_position.get(&position)
    }

    /// Device by unique name.
    pub fn by_name(&self, name: &str) -> Option<&Arc<Device>> {
        self.by_name.get(name)
    }

    /// Device by key, or `UnknownDevice`.
    pub fn get(&self, key: &DeviceKey) -> SyncResult<&Arc<Device>> {
        let found = match key {
            DeviceKey::Position(p) => self.by_position(*p),
            DeviceKey::Name(n) => self.by_name(n),
        };
        found.ok_or_else(|| SyncError::UnknownDevice(key.to_string()))
    }

    /// Devices ordered by buffer offset.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Device>> + '_ {
        self.ordered.iter()
    }

    /// First free position for an adapter device.
    pub fn next_adapter_position(&self) -> u16 {
        let mut position = ADAPTER_POSITION_BASE;
        while self.by_position.contains_key(&position) {
            position += 1;
        }
        position
    }

    /// End of the last device, i.e. the used image length.
    pub fn image_len(&self) -> usize {
        self.ordered.iter().map(|d| d.span().end).max().unwrap_or(0)
    }
}
