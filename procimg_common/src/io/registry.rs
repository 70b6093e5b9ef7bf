//! IO Registry: name and offset indices over all IOs of the process image.
//!
//! Descriptors live in an arena addressed by [`IoId`]. Two indices point
//! into it:
//!
//! - `by_name`: unique names.
//! - `by_byte`: one slot per image byte holding the IO that *starts* there,
//!   or eight bit slots for sub-byte values.
//!
//! Replaced IOs leave a redirect in `dead`. Name lookups resolve a dead name
//! to its replacement; `contains` ignores it. Configuration defects
//! (overlapping regions, addresses outside the image) are logged and the
//! offending IO is skipped.

use std::collections::HashMap;
use std::ops::Range;

use tracing::warn;

use super::address::IoDescriptor;
use super::{IoError, IoResult};
use crate::consts::PROCESS_IMAGE_SIZE;

// ─── Identifiers ────────────────────────────────────────────────────

/// Stable handle of a registered IO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IoId(usize);

impl IoId {
    /// Arena index.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Occupancy of one image byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ByteSlot {
    Empty,
    Byte(IoId),
    Bits([Option<IoId>; 8]),
}

/// Redirect left behind by a replaced IO.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadIo {
    /// The IO as it was before it was absorbed.
    pub original: IoDescriptor,
    /// The replacement that absorbed it.
    pub replaced_by: IoId,
}

// ─── IoRegistry ─────────────────────────────────────────────────────

/// Indexed collection of every IO in the process image.
#[derive(Debug, Clone)]
pub struct IoRegistry {
    arena: Vec<Option<IoDescriptor>>,
    by_name: HashMap<String, IoId>,
    by_byte: Vec<ByteSlot>,
    pub(crate) dead: HashMap<String, DeadIo>,
}

impl Default for IoRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IoRegistry {
    /// Empty registry covering the whole process image.
    pub fn new() -> Self {
        Self::with_size(PROCESS_IMAGE_SIZE)
    }

    /// Empty registry covering `size` bytes.
    pub fn with_size(size: usize) -> Self {
        Self {
            arena: Vec::new(),
            by_name: HashMap::new(),
            by_byte: vec![ByteSlot::Empty; size],
            dead: HashMap::new(),
        }
    }

    /// Number of live IOs.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// True if no IO is registered.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Bytes covered by the address index.
    pub fn size(&self) -> usize {
        self.by_byte.len()
    }

    /// True if `name` is a live IO (dead names are not).
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// True if some IO starts at `address`.
    pub fn occupied(&self, address: usize) -> bool {
        !matches!(self.by_byte.get(address), None | Some(ByteSlot::Empty))
    }

    /// True if `name` is taken by a live IO or a redirect.
    pub fn name_taken(&self, name: &str) -> bool {
        self.by_name.contains_key(name) || self.dead.contains_key(name)
    }

    // ─── Registration ───────────────────────────────────────────────

    /// Register an IO built from configuration.
    ///
    /// Returns `Ok(None)` when the IO was skipped because it collides with an
    /// existing one or leaves the image. A duplicate name is an error.
    pub fn register(&mut self, io: IoDescriptor) -> IoResult<Option<IoId>> {
        if self.name_taken(&io.name) {
            return Err(IoError::DuplicateName(io.name));
        }
        if io.span().end > self.by_byte.len() {
            warn!(
                io = io.name.as_str(),
                address = io.address,
                "ignore io, it exceeds the process image"
            );
            return Ok(None);
        }
        if let Some(holder) = self.collision(&io) {
            match io.bit {
                Some(bit) => warn!(
                    io = io.name.as_str(),
                    address = io.address,
                    bit,
                    holder = holder.as_str(),
                    "ignore io, an io already exists at this address. \
                     this can be caused by an incorrect piCtory configuration"
                ),
                None => warn!(
                    io = io.name.as_str(),
                    address = io.address,
                    holder = holder.as_str(),
                    "ignore io, an io already exists at this address. \
                     this can be caused by an incorrect piCtory configuration"
                ),
            }
            return Ok(None);
        }
        Ok(Some(self.insert(io)))
    }

    /// Name of an IO that prevents `io` from being registered.
    fn collision(&self, io: &IoDescriptor) -> Option<String> {
        let holder = |id: &IoId| self.name_of(*id);
        match (io.bit, self.by_byte[io.address]) {
            (_, ByteSlot::Empty) => {}
            (Some(bit), ByteSlot::Bits(slots)) => {
                return slots[bit as usize].as_ref().map(holder);
            }
            (_, ByteSlot::Byte(id)) => return Some(holder(&id)),
            (None, ByteSlot::Bits(slots)) => {
                return slots.iter().flatten().next().map(holder);
            }
        }
        if io.is_bit() {
            return None;
        }
        // Previous byte IO must end before us.
        let previous = self.by_byte[..io.address]
            .iter()
            .rev()
            .find_map(|slot| match slot {
                ByteSlot::Byte(id) => Some(*id),
                _ => None,
            });
        if let Some(id) = previous
            && let Some(prev) = self.descriptor(id)
            && prev.address + prev.length > io.address
        {
            return Some(prev.name.clone());
        }
        // Nothing may start inside our own span.
        self.by_byte[io.address + 1..io.address + io.length]
            .iter()
            .find_map(|slot| match slot {
                ByteSlot::Empty => None,
                ByteSlot::Byte(id) => Some(holder(id)),
                ByteSlot::Bits(slots) => slots.iter().flatten().next().map(holder),
            })
    }

    /// Insert without collision checks; the caller has cleared the slot.
    pub(crate) fn insert(&mut self, io: IoDescriptor) -> IoId {
        let id = IoId(self.arena.len());
        match io.bit {
            Some(bit) => {
                let slot = &mut self.by_byte[io.address];
                let mut slots = match *slot {
                    ByteSlot::Bits(slots) => slots,
                    _ => [None; 8],
                };
                slots[bit as usize] = Some(id);
                *slot = ByteSlot::Bits(slots);
            }
            None => self.by_byte[io.address] = ByteSlot::Byte(id),
        }
        self.by_name.insert(io.name.clone(), id);
        self.arena.push(Some(io));
        id
    }

    /// Remove a live IO from both indices.
    ///
    /// A bit only clears its own slot; the byte entry is dropped when all
    /// eight slots are empty.
    pub fn unregister(&mut self, name: &str) -> IoResult<IoDescriptor> {
        let id = self
            .by_name
            .remove(name)
            .ok_or_else(|| IoError::UnknownIo(name.to_string()))?;
        let io = self.arena[id.0]
            .take()
            .ok_or_else(|| IoError::UnknownIo(name.to_string()))?;
        let slot = &mut self.by_byte[io.address];
        match (io.bit, *slot) {
            (Some(bit), ByteSlot::Bits(mut slots)) => {
                slots[bit as usize] = None;
                *slot = if slots.iter().all(Option::is_none) {
                    ByteSlot::Empty
                } else {
                    ByteSlot::Bits(slots)
                };
            }
            (None, ByteSlot::Byte(_)) => *slot = ByteSlot::Empty,
            _ => {}
        }
        Ok(io)
    }

    // ─── Lookup ─────────────────────────────────────────────────────

    fn name_of(&self, id: IoId) -> String {
        self.descriptor(id)
            .map(|io| io.name.clone())
            .unwrap_or_default()
    }

    /// Id of a live IO, or of the replacement of a dead one.
    pub fn id_of(&self, name: &str) -> Option<IoId> {
        match self.by_name.get(name) {
            Some(id) => Some(*id),
            None => self
                .dead
                .get(name)
                .map(|dead| dead.replaced_by)
                .filter(|id| self.descriptor(*id).is_some()),
        }
    }

    /// Descriptor by name; dead names resolve to their replacement.
    pub fn get(&self, name: &str) -> Option<&IoDescriptor> {
        self.id_of(name).and_then(|id| self.descriptor(id))
    }

    /// Descriptor by name or `UnknownIo`.
    pub fn require(&self, name: &str) -> IoResult<&IoDescriptor> {
        self.get(name)
            .ok_or_else(|| IoError::UnknownIo(name.to_string()))
    }

    /// Descriptor by id.
    pub fn descriptor(&self, id: IoId) -> Option<&IoDescriptor> {
        self.arena.get(id.0).and_then(Option::as_ref)
    }

    /// Mutable descriptor by id.
    pub fn descriptor_mut(&mut self, id: IoId) -> Option<&mut IoDescriptor> {
        self.arena.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Redirect record of a replaced name.
    pub fn dead(&self, name: &str) -> Option<&DeadIo> {
        self.dead.get(name)
    }

    /// IOs starting at `address`: none, one byte IO, or eight bit slots.
    pub fn at(&self, address: usize) -> Vec<Option<&IoDescriptor>> {
        match self.by_byte.get(address) {
            None | Some(ByteSlot::Empty) => Vec::new(),
            Some(ByteSlot::Byte(id)) => vec![self.descriptor(*id)],
            Some(ByteSlot::Bits(slots)) => slots
                .iter()
                .map(|s| s.and_then(|id| self.descriptor(id)))
                .collect(),
        }
    }

    /// [`at`](Self::at) for every byte of `range`.
    pub fn range(&self, range: Range<usize>) -> Vec<Vec<Option<&IoDescriptor>>> {
        range.map(|address| self.at(address)).collect()
    }

    /// Ids starting in `range` ordered by address, then bit.
    pub(crate) fn ids_in(&self, range: Range<usize>) -> Vec<IoId> {
        let end = range.end.min(self.by_byte.len());
        let start = range.start.min(end);
        self.by_byte[start..end]
            .iter()
            .flat_map(|slot| match slot {
                ByteSlot::Empty => Vec::new(),
                ByteSlot::Byte(id) => vec![*id],
                ByteSlot::Bits(slots) => slots.iter().flatten().copied().collect(),
            })
            .collect()
    }

    /// Byte IO starting before `address` whose span still covers it.
    pub(crate) fn covering(&self, address: usize) -> Option<IoId> {
        let end = address.min(self.by_byte.len());
        self.by_byte[..end]
            .iter()
            .rev()
            .find_map(|slot| match slot {
                ByteSlot::Byte(id) => Some(*id),
                _ => None,
            })
            .filter(|id| self.descriptor(*id).is_some_and(|io| io.span().end > address))
    }

    /// Live IOs ordered by address, then bit.
    pub fn iter(&self) -> impl Iterator<Item = &IoDescriptor> + '_ {
        self.ids_in(0..self.by_byte.len())
            .into_iter()
            .filter_map(|id| self.descriptor(id))
    }

    /// Live IOs of one device, ordered by address.
    pub fn device_ios(&self, position: u16) -> impl Iterator<Item = &IoDescriptor> + '_ {
        self.iter().filter(move |io| io.device == position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::address::{DefaultValue, IoKind};
    use crate::io::types::{ByteOrder, IoDirection};
    use proptest::prelude::*;

    fn byte_io(name: &str, address: usize, length: usize) -> IoDescriptor {
        IoDescriptor {
            name: name.to_string(),
            device: 0,
            device_offset: 0,
            direction: IoDirection::Input,
            address,
            length,
            bit: None,
            byte_order: ByteOrder::Little,
            signed: false,
            default: DefaultValue::Bytes(vec![0; length]),
            export: 0,
            bmk: String::new(),
            kind: IoKind::Int,
        }
    }

    fn bit_io(name: &str, address: usize, bit: u8) -> IoDescriptor {
        IoDescriptor {
            length: 0,
            bit: Some(bit),
            default: DefaultValue::Bool(false),
            kind: IoKind::Raw,
            ..byte_io(name, address, 0)
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut reg = IoRegistry::with_size(64);
        let id = reg.register(byte_io("a", 0, 2)).unwrap().unwrap();
        assert_eq!(reg.id_of("a"), Some(id));
        assert_eq!(reg.get("a").unwrap().address, 0);
        assert!(reg.contains("a"));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.at(0).len(), 1);
        assert!(reg.at(1).is_empty());
    }

    #[test]
    fn duplicate_name_is_error() {
        let mut reg = IoRegistry::with_size(64);
        reg.register(byte_io("a", 0, 1)).unwrap();
        let err = reg.register(byte_io("a", 4, 1)).unwrap_err();
        assert!(matches!(err, IoError::DuplicateName(n) if n == "a"));
    }

    #[test]
    fn overlap_with_previous_is_skipped() {
        let mut reg = IoRegistry::with_size(64);
        reg.register(byte_io("a", 0, 4)).unwrap();
        assert_eq!(reg.register(byte_io("b", 2, 2)).unwrap(), None);
        assert_eq!(reg.register(byte_io("c", 0, 1)).unwrap(), None);
        assert!(reg.register(byte_io("d", 4, 1)).unwrap().is_some());
        assert!(!reg.contains("b"));
    }

    #[test]
    fn overlap_with_later_is_skipped() {
        let mut reg = IoRegistry::with_size(64);
        reg.register(byte_io("late", 6, 2)).unwrap();
        assert_eq!(reg.register(byte_io("early", 4, 4)).unwrap(), None);
    }

    #[test]
    fn bits_share_a_byte() {
        let mut reg = IoRegistry::with_size(64);
        reg.register(bit_io("b0", 3, 0)).unwrap().unwrap();
        reg.register(bit_io("b7", 3, 7)).unwrap().unwrap();
        assert_eq!(reg.register(bit_io("again", 3, 0)).unwrap(), None);
        let slots = reg.at(3);
        assert_eq!(slots.len(), 8);
        assert_eq!(slots[0].unwrap().name, "b0");
        assert!(slots[1].is_none());
        assert_eq!(slots[7].unwrap().name, "b7");
    }

    #[test]
    fn unregister_bit_keeps_siblings() {
        let mut reg = IoRegistry::with_size(64);
        reg.register(bit_io("b0", 3, 0)).unwrap();
        reg.register(bit_io("b1", 3, 1)).unwrap();
        reg.unregister("b0").unwrap();
        assert_eq!(reg.at(3).len(), 8);
        reg.unregister("b1").unwrap();
        assert!(reg.at(3).is_empty());
        assert!(!reg.occupied(3));
        assert!(matches!(reg.unregister("b1"), Err(IoError::UnknownIo(_))));
    }

    #[test]
    fn iteration_by_address_then_bit() {
        let mut reg = IoRegistry::with_size(64);
        reg.register(byte_io("w", 10, 2)).unwrap();
        reg.register(bit_io("x1", 2, 1)).unwrap();
        reg.register(bit_io("x0", 2, 0)).unwrap();
        reg.register(byte_io("v", 0, 1)).unwrap();
        let names: Vec<_> = reg.iter().map(|io| io.name.as_str()).collect();
        assert_eq!(names, ["v", "x0", "x1", "w"]);
    }

    #[test]
    fn covering_finds_io_reaching_into_address() {
        let mut reg = IoRegistry::with_size(16);
        let word = reg.register(byte_io("w", 2, 4)).unwrap().unwrap();
        reg.register(bit_io("x", 7, 3)).unwrap();
        assert_eq!(reg.covering(3), Some(word));
        assert_eq!(reg.covering(5), Some(word));
        assert_eq!(reg.covering(2), None);
        assert_eq!(reg.covering(6), None);
        assert_eq!(reg.covering(8), None);
    }

    #[test]
    fn range_lookup() {
        let mut reg = IoRegistry::with_size(16);
        reg.register(byte_io("a", 1, 1)).unwrap();
        let lists = reg.range(0..3);
        assert_eq!(lists.len(), 3);
        assert!(lists[0].is_empty());
        assert_eq!(lists[1][0].unwrap().name, "a");
    }

    #[test]
    fn outside_image_is_skipped() {
        let mut reg = IoRegistry::with_size(8);
        assert_eq!(reg.register(byte_io("a", 7, 2)).unwrap(), None);
    }

    proptest! {
        #[test]
        fn registered_ios_never_overlap(
            entries in proptest::collection::vec((0usize..120, 1usize..9, proptest::option::of(0u8..8)), 1..60)
        ) {
            let mut reg = IoRegistry::with_size(128);
            for (i, (address, length, bit)) in entries.into_iter().enumerate() {
                let io = match bit {
                    Some(b) => bit_io(&format!("io{i}"), address, b),
                    None => byte_io(&format!("io{i}"), address, length),
                };
                let _ = reg.register(io).unwrap();
            }
            let all: Vec<_> = reg.iter().collect();
            for (i, a) in all.iter().enumerate() {
                for b in &all[i + 1..] {
                    if a.bit.is_none() && b.bit.is_none() {
                        prop_assert!(a.span().end <= b.span().start || b.span().end <= a.span().start);
                    }
                    if a.bit.is_some() && b.bit.is_some() && a.address == b.address {
                        prop_assert_ne!(a.bit, b.bit);
                    }
                }
            }
        }
    }
}
