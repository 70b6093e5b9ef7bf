//! Devices: one piCtory module with its private copy of the image.
//!
//! A [`Device`] owns the bytes `[offset, offset + length)` of the process
//! image in its [`DeviceState`], guarded by a per-device mutex. The engine
//! copies fresh bytes in and pushes outputs back while holding that lock;
//! consumers read and write values under the same lock.
//!
//! Building a device registers its IOs in the [`IoRegistry`]. The IO kind
//! follows the device kind:
//!
//! | Device        | Byte IOs                                   |
//! |---------------|--------------------------------------------|
//! | DIO/DI/DO     | counters at 6, 10, ..., 66; others integer |
//! | RO            | outputs are relays                         |
//! | Gateway/Virt. | replaceable integers                       |
//! | others        | integers, signed on AIO                    |

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};
use procimg_common::consts::{
    DIO_COUNTER_ADDRESSES, PRODUCT_AIO, PRODUCT_DI, PRODUCT_DIO, PRODUCT_DO, PRODUCT_RO,
};
use procimg_common::io::address::{IoDescriptor, IoKind, RecordPlacement};
use procimg_common::io::config::{DeviceRecord, DeviceType, IoRecord};
use procimg_common::io::registry::IoRegistry;
use procimg_common::io::types::{ByteOrder, IoDirection};
use tracing::{info, warn};

use crate::error::SyncResult;
use crate::events::WatchedIo;

// ─── Kinds ──────────────────────────────────────────────────────────

/// Behavioral variant of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// RevPi base module.
    Base,
    /// DIO/DI/DO with counter inputs.
    Dio,
    /// RO relay module.
    Relay,
    /// Any other IO module.
    Io,
    /// Gateway, IOs are replaceable.
    Gateway,
    /// Virtual device, IOs are replaceable.
    Virtual,
}

impl DeviceKind {
    /// Kind of a configured device; `None` for devices that are not built.
    pub fn classify(record: &DeviceRecord) -> Option<Self> {
        match &record.device_type {
            DeviceType::Base => Some(Self::Base),
            DeviceType::LeftRight => Some(match record.product_type {
                PRODUCT_DIO | PRODUCT_DI | PRODUCT_DO => Self::Dio,
                PRODUCT_RO => Self::Relay,
                _ => Self::Io,
            }),
            DeviceType::Virtual => Some(Self::Virtual),
            DeviceType::Edge => Some(Self::Gateway),
            DeviceType::Right => {
                info!(device = record.name.as_str(), "connect device skipped");
                None
            }
            DeviceType::Unknown(other) => {
                warn!(
                    device = record.name.as_str(),
                    kind = other.as_str(),
                    "device type unknown and will be ignored"
                );
                None
            }
        }
    }

    fn io_kind(self, section: IoDirection, record: &IoRecord) -> IoKind {
        if section == IoDirection::Memory {
            return IoKind::Mem {
                bit_length: record.bit_length,
            };
        }
        if record.bit_index.is_some() {
            return match (self, section) {
                (Self::Relay, IoDirection::Output) => IoKind::Relay,
                _ => IoKind::Raw,
            };
        }
        match self {
            Self::Dio => match DIO_COUNTER_ADDRESSES.iter().position(|&a| a == record.start) {
                Some(id) => IoKind::Counter { id: id as u8 },
                None => IoKind::Int,
            },
            Self::Gateway | Self::Virtual => IoKind::Replaceable,
            Self::Relay if section == IoDirection::Output => IoKind::Relay,
            _ => IoKind::Int,
        }
    }
}

// ─── Device ─────────────────────────────────────────────────────────

/// Mutable part of a device, guarded by the device lock.
#[derive(Debug, Default)]
pub struct DeviceState {
    /// Current bytes of the device.
    pub data: Vec<u8>,
    /// Bytes at the end of the previous event evaluation.
    pub snapshot: Vec<u8>,
    /// IOs set since the last shared write.
    pub shared_marks: Vec<IoDescriptor>,
    /// Registered events.
    pub events: Vec<WatchedIo>,
}

impl DeviceState {
    /// Remember `io` for the next shared write.
    pub fn mark_shared(&mut self, io: &IoDescriptor) {
        if !self.shared_marks.iter().any(|m| m.name == io.name) {
            self.shared_marks.push(io.clone());
        }
    }
}

/// One module of the process image.
#[derive(Debug)]
pub struct Device {
    name: String,
    position: u16,
    offset: usize,
    length: usize,
    product_type: u16,
    kind: DeviceKind,
    bmk: String,
    comment: String,
    inputs: Range<usize>,
    outputs: Range<usize>,
    memory: Range<usize>,
    state: Mutex<DeviceState>,
    autorefresh: AtomicBool,
    shared: AtomicBool,
}

impl Device {
    /// Build a device from its record and register its IOs.
    ///
    /// `image_len` is the end of the devices built so far; IOs below it are
    /// ignored. In simulator mode the `inp` and `out` records swap roles.
    /// Returns `Ok(None)` for device types that are not built.
    pub fn build(
        record: &DeviceRecord,
        position: u16,
        image_len: usize,
        simulator: bool,
        registry: &mut IoRegistry,
    ) -> SyncResult<Option<Self>> {
        let Some(kind) = DeviceKind::classify(record) else {
            return Ok(None);
        };
        let mut builder = SectionBuilder {
            record,
            position,
            kind,
            image_len,
            registry,
        };
        let (inputs, outputs) = if simulator {
            (
                builder.section(&record.out, IoDirection::Input, IoDirection::Output)?,
                builder.section(&record.inp, IoDirection::Output, IoDirection::Input)?,
            )
        } else {
            (
                builder.section(&record.inp, IoDirection::Input, IoDirection::Input)?,
                builder.section(&record.out, IoDirection::Output, IoDirection::Output)?,
            )
        };
        let memory = builder.section(&record.mem, IoDirection::Memory, IoDirection::Memory)?;
        let length = inputs.end.max(outputs.end).max(memory.end);

        Ok(Some(Self {
            name: record.name.clone(),
            position,
            offset: record.offset,
            length,
            product_type: record.product_type,
            kind,
            bmk: record.bmk.clone(),
            comment: record.comment.clone(),
            inputs,
            outputs,
            memory,
            state: Mutex::new(DeviceState {
                data: vec![0; length],
                snapshot: vec![0; length],
                ..DeviceState::default()
            }),
            autorefresh: AtomicBool::new(false),
            shared: AtomicBool::new(false),
        }))
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position number.
    pub fn position(&self) -> u16 {
        self.position
    }

    /// Absolute offset in the process image.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Byte length.
    pub fn length(&self) -> usize {
        self.length
    }

    /// piCtory product type.
    pub fn product_type(&self) -> u16 {
        self.product_type
    }

    /// Behavioral variant.
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Designation.
    pub fn bmk(&self) -> &str {
        &self.bmk
    }

    /// Free comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Device-relative range of a section.
    pub fn section(&self, direction: IoDirection) -> Range<usize> {
        match direction {
            IoDirection::Input => self.inputs.clone(),
            IoDirection::Output => self.outputs.clone(),
            IoDirection::Memory => self.memory.clone(),
        }
    }

    /// Absolute range of a section.
    pub fn absolute(&self, direction: IoDirection) -> Range<usize> {
        let rel = self.section(direction);
        self.offset + rel.start..self.offset + rel.end
    }

    /// Absolute range of the whole device.
    pub fn span(&self) -> Range<usize> {
        self.offset..self.offset + self.length
    }

    /// True while the engine synchronizes this device.
    pub fn is_autorefresh(&self) -> bool {
        self.autorefresh.load(Ordering::SeqCst)
    }

    pub(crate) fn set_autorefresh(&self, value: bool) {
        self.autorefresh.store(value, Ordering::SeqCst);
    }

    /// True if set values are written directly to the image.
    pub fn shared_procimg(&self) -> bool {
        self.shared.load(Ordering::SeqCst)
    }

    /// Switch direct writes of set values on or off.
    ///
    /// Switching off drops marks that were not written yet.
    pub fn set_shared_procimg(&self, value: bool) {
        let mut state = self.state.lock();
        self.shared.store(value, Ordering::SeqCst);
        if !value {
            state.shared_marks.clear();
        }
    }

    /// Copy of the current device bytes.
    pub fn data(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock()
    }

    /// Copy this device's bytes out of a full image buffer.
    ///
    /// `full` copies every section, otherwise only the inputs.
    pub(crate) fn copy_in(&self, state: &mut DeviceState, image: &[u8], full: bool) {
        let range = if full { 0..self.length } else { self.inputs.clone() };
        self.copy_range(state, image, range);
    }

    /// Copy the output section out of a full image buffer.
    pub(crate) fn copy_outputs_in(&self, state: &mut DeviceState, image: &[u8]) {
        self.copy_range(state, image, self.outputs.clone());
    }

    fn copy_range(&self, state: &mut DeviceState, image: &[u8], range: Range<usize>) {
        let start = self.offset + range.start;
        let end = (self.offset + range.end).min(image.len());
        if start < end {
            state.data[range.start..range.start + (end - start)].copy_from_slice(&image[start..end]);
        }
    }
}

struct SectionBuilder<'a> {
    record: &'a DeviceRecord,
    position: u16,
    kind: DeviceKind,
    image_len: usize,
    registry: &'a mut IoRegistry,
}

impl SectionBuilder<'_> {
    /// Register the records of one section, returns its relative range.
    ///
    /// `section` is the piCtory section the records come from and decides
    /// the IO kind; `direction` is how the consumer sees them.
    fn section(
        &mut self,
        records: &[IoRecord],
        direction: IoDirection,
        section: IoDirection,
    ) -> SyncResult<Range<usize>> {
        if records.is_empty() {
            return Ok(0..0);
        }
        let (mut min, mut max) = (usize::MAX, 0);
        for rec in records {
            let kind = self.kind.io_kind(section, rec);
            let signed = kind == IoKind::Int && self.record.product_type == PRODUCT_AIO;
            let placement = RecordPlacement {
                device: self.position,
                device_offset: self.record.offset,
                direction,
                byte_order: ByteOrder::Little,
                signed,
                kind,
            };
            let io = match IoDescriptor::from_record(
                &rec.name,
                &rec.default,
                rec.bit_length,
                rec.start,
                rec.export,
                &rec.bmk,
                rec.bit_index,
                placement,
            ) {
                Ok(io) => io,
                Err(e) => {
                    warn!(io = rec.name.as_str(), "io ignored: {}", e);
                    continue;
                }
            };
            let rel = io.relative();
            min = min.min(rel.start);
            max = max.max(rel.end);
            if io.address < self.image_len {
                warn!(
                    io = io.name.as_str(),
                    device = self.record.name.as_str(),
                    "io is not in the device offset and will be ignored"
                );
                continue;
            }
            self.registry.register(io)?;
        }
        Ok(if min > max { 0..0 } else { min..max })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procimg_common::io::address::DefaultSpec;
    use procimg_common::io::config::DevicePosition;

    fn rec(key: u32, name: &str, bits: u32, start: usize, bit: Option<u32>) -> IoRecord {
        IoRecord {
            key,
            name: name.into(),
            default: DefaultSpec::None,
            bit_length: bits,
            start,
            export: false,
            id: String::new(),
            bmk: String::new(),
            bit_index: bit,
        }
    }

    fn dio(offset: usize) -> DeviceRecord {
        DeviceRecord {
            name: "dio01".into(),
            position: DevicePosition::Fixed(32),
            offset,
            product_type: PRODUCT_DIO,
            device_type: DeviceType::LeftRight,
            inp: vec![
                rec(0, "I_1", 1, 0, Some(0)),
                rec(1, "I_2", 1, 0, Some(1)),
                rec(2, "Counter_1", 32, 6, None),
            ],
            out: vec![rec(3, "O_1", 16, 70, None)],
            mem: vec![rec(4, "Cfg", 8, 72, None)],
            bmk: String::new(),
            comment: String::new(),
        }
    }

    #[test]
    fn builds_sections_and_kinds() {
        let mut reg = IoRegistry::new();
        let mut record = dio(100);
        record.inp.push(rec(5, "Counter_2", 32, 10, None));
        let dev = Device::build(&record, 32, 0, false, &mut reg)
            .unwrap()
            .unwrap();
        assert_eq!(dev.kind(), DeviceKind::Dio);
        assert_eq!(dev.section(IoDirection::Input), 0..14);
        assert_eq!(dev.section(IoDirection::Output), 70..72);
        assert_eq!(dev.absolute(IoDirection::Memory), 172..173);
        assert_eq!(dev.length(), 73);

        assert_eq!(reg.get("Counter_1").unwrap().kind, IoKind::Counter { id: 0 });
        assert_eq!(reg.get("Counter_2").unwrap().kind, IoKind::Counter { id: 1 });
        assert_eq!(reg.get("O_1").unwrap().kind, IoKind::Int);
        assert!(matches!(reg.get("Cfg").unwrap().kind, IoKind::Mem { .. }));
        assert_eq!(reg.get("I_2").unwrap().bit, Some(1));
    }

    #[test]
    fn simulator_swaps_directions() {
        let mut reg = IoRegistry::new();
        let dev = Device::build(&dio(0), 32, 0, true, &mut reg).unwrap().unwrap();
        assert_eq!(reg.get("O_1").unwrap().direction, IoDirection::Input);
        assert_eq!(reg.get("I_1").unwrap().direction, IoDirection::Output);
        assert_eq!(dev.section(IoDirection::Input), 70..72);
        // Counter kind follows the hardware section, not the view.
        assert_eq!(reg.get("Counter_1").unwrap().kind, IoKind::Counter { id: 0 });
    }

    #[test]
    fn ios_below_previous_devices_are_ignored() {
        let mut reg = IoRegistry::new();
        let dev = Device::build(&dio(0), 32, 10, false, &mut reg).unwrap().unwrap();
        assert!(!reg.contains("I_1"));
        assert!(reg.contains("O_1"));
        assert_eq!(dev.length(), 73);
    }

    #[test]
    fn unknown_and_connect_devices_are_skipped() {
        let mut reg = IoRegistry::new();
        let mut record = dio(0);
        record.device_type = DeviceType::Right;
        assert!(Device::build(&record, 32, 0, false, &mut reg).unwrap().is_none());
        record.device_type = DeviceType::Unknown("FOO".into());
        assert!(Device::build(&record, 32, 0, false, &mut reg).unwrap().is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn duplicate_io_name_is_fatal() {
        let mut reg = IoRegistry::new();
        Device::build(&dio(0), 32, 0, false, &mut reg).unwrap();
        assert!(Device::build(&dio(80), 33, 73, false, &mut reg).is_err());
    }

    #[test]
    fn copy_in_respects_sections() {
        let mut reg = IoRegistry::new();
        let dev = Device::build(&dio(2), 32, 0, false, &mut reg).unwrap().unwrap();
        let image: Vec<u8> = (0..80).collect();
        let mut state = dev.lock();
        state.data[10] = 0xaa;
        dev.copy_in(&mut state, &image, false);
        assert_eq!(&state.data[..10], &image[2..12]);
        assert_eq!(state.data[10], 0xaa);
        dev.copy_in(&mut state, &image, true);
        assert_eq!(state.data[10], 12);
    }

    #[test]
    fn relay_outputs() {
        let mut reg = IoRegistry::new();
        let mut record = dio(0);
        record.product_type = PRODUCT_RO;
        record.inp.clear();
        record.out = vec![rec(0, "R_1", 1, 0, Some(0)), rec(1, "R_all", 8, 1, None)];
        Device::build(&record, 31, 0, false, &mut reg).unwrap();
        assert_eq!(reg.get("R_1").unwrap().kind, IoKind::Relay);
        assert_eq!(reg.get("R_all").unwrap().kind, IoKind::Relay);
    }
}
