//! `IoDescriptor`: one named logical value and its place in the image.
//!
//! A descriptor is plain data. It does not own bytes; every accessor takes
//! the owning device's private buffer and slices it with the device-relative
//! range of the value.
//!
//! # Layout rules
//!
//! - Byte values occupy `[address, address + length)`.
//! - Bit values have `length == 0` but physically occupy the byte at
//!   `address`. A configured bit index `n` lands in byte `start + n / 8` at
//!   bit `n % 8`.

use std::ops::Range;

use super::format::{IoValue, StructFormat, int_from_bytes, int_to_bytes, swap_word_order};
use super::types::{ByteOrder, IoCapabilities, IoDirection};
use super::{IoError, IoResult};

// ─── Defaults ───────────────────────────────────────────────────────

/// Stored default of an IO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultValue {
    /// Bit IOs.
    Bool(bool),
    /// Byte IOs, exactly `length` bytes in the IO's byte order.
    Bytes(Vec<u8>),
}

impl DefaultValue {
    /// Raw bytes of a byte default; a bit default yields one byte 0/1.
    pub fn bytes(&self) -> Vec<u8> {
        match self {
            Self::Bool(b) => vec![*b as u8],
            Self::Bytes(b) => b.clone(),
        }
    }
}

/// Default as found in a configuration record or a replace request.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DefaultSpec {
    /// No default given.
    #[default]
    None,
    /// Numeric literal.
    Int(i128),
    /// Boolean literal.
    Bool(bool),
    /// String literal (digits are parsed, other text is ASCII-padded).
    Text(String),
    /// Explicit raw bytes.
    Bytes(Vec<u8>),
}

impl DefaultSpec {
    /// Default of a bit: anything non-zero is true, unparsable is false.
    pub fn to_bit(&self) -> bool {
        match self {
            Self::None => false,
            Self::Int(i) => *i != 0,
            Self::Bool(b) => *b,
            Self::Text(s) => s.trim().parse::<i128>().map(|i| i != 0).unwrap_or(false),
            Self::Bytes(b) => b.iter().any(|&x| x != 0),
        }
    }

    /// Default of a byte value of `length` bytes.
    ///
    /// Numbers are converted in `order`, explicit bytes must match the length,
    /// ASCII text is zero-padded when it fits, everything else is zero-fill.
    pub fn to_bytes(&self, name: &str, length: usize, order: ByteOrder) -> IoResult<Vec<u8>> {
        let numeric = |value: i128| {
            int_to_bytes(value, length, order, false).ok_or(IoError::ValueRange {
                name: name.to_string(),
                value,
            })
        };
        match self {
            Self::Int(i) if *i >= 0 => numeric(*i),
            Self::Bool(b) => numeric(*b as i128),
            Self::Text(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => {
                let value = s.parse::<i128>().map_err(|_| IoError::ValueRange {
                    name: name.to_string(),
                    value: i128::MAX,
                })?;
                numeric(value)
            }
            Self::Text(s) if s.is_ascii() && s.len() <= length => {
                let mut buf = s.as_bytes().to_vec();
                buf.resize(length, 0);
                Ok(buf)
            }
            Self::Bytes(b) => {
                if b.len() == length {
                    Ok(b.clone())
                } else {
                    Err(IoError::DefaultLength {
                        name: name.to_string(),
                        expected: length,
                        actual: b.len(),
                    })
                }
            }
            _ => Ok(vec![0; length]),
        }
    }
}

// ─── Kinds ──────────────────────────────────────────────────────────

/// Extra layout of a replacement value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructInfo {
    /// Type code.
    pub format: StructFormat,
    /// Word order applied before the byte order, `None` = ignored.
    pub word_order: Option<ByteOrder>,
    /// Name of the IO this value was carved from.
    pub parent: String,
    /// Absolute address of the parent region.
    pub parent_address: usize,
    /// Byte length of the parent region.
    pub parent_length: usize,
}

/// Behavioral variant of an IO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoKind {
    /// Plain bytes or a bit.
    Raw,
    /// Integer interpretation.
    Int,
    /// DIO counter input, `id` selects the reset bit.
    Counter { id: u8 },
    /// Integer that may be reinterpreted with `replace`.
    Replaceable,
    /// Relay output (integer or bit) with switching-cycle counters.
    Relay,
    /// Configuration memory; its value is the configured default.
    Mem { bit_length: u32 },
    /// Replacement value with a struct type code.
    Struct(StructInfo),
}

// ─── IoDescriptor ───────────────────────────────────────────────────

/// Where an IO lives and how its bytes are interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct IoDescriptor {
    /// Unique name (global namespace).
    pub name: String,
    /// Position of the owning device.
    pub device: u16,
    /// Absolute offset of the owning device.
    pub device_offset: usize,
    /// Input, output or memory.
    pub direction: IoDirection,
    /// Absolute byte offset.
    pub address: usize,
    /// Byte length, 0 for bits.
    pub length: usize,
    /// Bit index inside the byte at `address`.
    pub bit: Option<u8>,
    /// Byte order for integer interpretation.
    pub byte_order: ByteOrder,
    /// Signed integer interpretation.
    pub signed: bool,
    /// Stored default.
    pub default: DefaultValue,
    /// Bit 0: export flag, bit 1: flag was set explicitly.
    pub export: u8,
    /// Free-text designation.
    pub bmk: String,
    /// Behavioral variant.
    pub kind: IoKind,
}

/// Placement of a configuration record inside its device.
#[derive(Debug, Clone)]
pub struct RecordPlacement {
    /// Device position.
    pub device: u16,
    /// Absolute device offset.
    pub device_offset: usize,
    /// Section the record belongs to.
    pub direction: IoDirection,
    /// Byte order for integers.
    pub byte_order: ByteOrder,
    /// Signed integers.
    pub signed: bool,
    /// Behavioral variant.
    pub kind: IoKind,
}

impl IoDescriptor {
    /// Build a descriptor from the fields of a configuration record.
    ///
    /// `start` is device-relative, `bit_index` may exceed 7 and then folds
    /// into a later byte.
    #[allow(clippy::too_many_arguments)]
    pub fn from_record(
        name: &str,
        default: &DefaultSpec,
        bit_length: u32,
        start: usize,
        export: bool,
        bmk: &str,
        bit_index: Option<u32>,
        placement: RecordPlacement,
    ) -> IoResult<Self> {
        let (rel, length, bit) = match bit_index {
            Some(idx) => (start + (idx / 8) as usize, 0, Some((idx % 8) as u8)),
            None => (start, ((bit_length / 8) as usize).max(1), None),
        };
        let default = match bit {
            Some(_) => DefaultValue::Bool(default.to_bit()),
            None => DefaultValue::Bytes(default.to_bytes(name, length, placement.byte_order)?),
        };
        Ok(Self {
            name: name.to_string(),
            device: placement.device,
            device_offset: placement.device_offset,
            direction: placement.direction,
            address: placement.device_offset + rel,
            length,
            bit,
            byte_order: placement.byte_order,
            signed: placement.signed,
            default,
            export: export as u8,
            bmk: bmk.to_string(),
            kind: placement.kind,
        })
    }

    /// Physical span in the process image (bits occupy one byte).
    pub fn span(&self) -> Range<usize> {
        self.address..self.address + self.length.max(1)
    }

    /// Span relative to the owning device's buffer.
    pub fn relative(&self) -> Range<usize> {
        let start = self.address - self.device_offset;
        start..start + self.length.max(1)
    }

    /// Mask of the bit inside its byte.
    pub fn bit_mask(&self) -> Option<u8> {
        self.bit.map(|b| 1u8 << b)
    }

    /// True for single-bit values.
    pub fn is_bit(&self) -> bool {
        self.bit.is_some()
    }

    /// True for replacement values.
    pub fn is_struct(&self) -> bool {
        matches!(self.kind, IoKind::Struct(_))
    }

    /// Struct layout of a replacement value.
    pub fn struct_info(&self) -> Option<&StructInfo> {
        match &self.kind {
            IoKind::Struct(info) => Some(info),
            _ => None,
        }
    }

    /// Operations this IO supports beyond get/set.
    pub fn capabilities(&self) -> IoCapabilities {
        match &self.kind {
            IoKind::Raw | IoKind::Mem { .. } | IoKind::Struct(_) => IoCapabilities::empty(),
            IoKind::Int => IoCapabilities::INTEGER,
            IoKind::Counter { .. } => IoCapabilities::INTEGER | IoCapabilities::SUPPORTS_RESET,
            IoKind::Replaceable => IoCapabilities::INTEGER | IoCapabilities::REPLACEABLE,
            IoKind::Relay => IoCapabilities::INTEGER | IoCapabilities::SUPPORTS_COUNTER_QUERY,
        }
    }

    /// Export flag as shown to the user.
    pub fn export_flag(&self) -> bool {
        self.export & 1 != 0
    }

    /// Set the export flag and remember that it was set explicitly.
    pub fn set_export(&mut self, value: bool) {
        self.export = 2 + value as u8;
    }

    /// Change the byte order; the stored default is reversed with it.
    pub fn set_byte_order(&mut self, order: ByteOrder) {
        if order != self.byte_order {
            if let DefaultValue::Bytes(b) = &mut self.default {
                b.reverse();
            }
            self.byte_order = order;
        }
    }

    /// Raw bytes of this IO inside `device_data`.
    pub fn raw<'a>(&self, device_data: &'a [u8]) -> &'a [u8] {
        &device_data[self.relative()]
    }

    /// Current bit state, `None` for byte IOs.
    pub fn read_bit(&self, device_data: &[u8]) -> Option<bool> {
        let mask = self.bit_mask()?;
        Some(device_data[self.relative().start] & mask != 0)
    }

    /// Decode the current value from the device buffer.
    pub fn read(&self, device_data: &[u8]) -> IoValue {
        if let IoKind::Mem { .. } = self.kind {
            return self.default_value();
        }
        if let Some(state) = self.read_bit(device_data) {
            return IoValue::Bool(state);
        }
        self.decode(self.raw(device_data))
    }

    /// Interpret `raw` (exactly the IO's bytes) according to the kind.
    fn decode(&self, raw: &[u8]) -> IoValue {
        match &self.kind {
            IoKind::Raw => IoValue::Bytes(raw.to_vec()),
            IoKind::Int | IoKind::Counter { .. } | IoKind::Replaceable | IoKind::Relay => {
                IoValue::Int(int_from_bytes(raw, self.byte_order, self.signed))
            }
            IoKind::Mem { bit_length } => {
                if *bit_length > 64 {
                    let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
                    let end = raw.iter().rposition(|&b| b != 0).map_or(start, |i| i + 1);
                    let trimmed = raw[start..end].to_vec();
                    match String::from_utf8(trimmed) {
                        Ok(s) => IoValue::Text(s),
                        Err(_) => IoValue::Bytes(raw.to_vec()),
                    }
                } else {
                    IoValue::Int(int_from_bytes(raw, self.byte_order, self.signed))
                }
            }
            IoKind::Struct(info) => {
                if info.word_order == Some(ByteOrder::Little) && self.length > 2 {
                    info.format.unpack(&swap_word_order(raw), self.byte_order)
                } else {
                    info.format.unpack(raw, self.byte_order)
                }
            }
        }
    }

    /// The default interpreted like the value.
    pub fn default_value(&self) -> IoValue {
        match &self.default {
            DefaultValue::Bool(b) => IoValue::Bool(*b),
            DefaultValue::Bytes(b) => self.decode(b),
        }
    }

    /// Encode a value into the IO's raw bytes.
    ///
    /// Bit IOs accept any value and use its truth; byte IOs need the variant
    /// of their kind.
    pub fn encode(&self, value: &IoValue) -> IoResult<Vec<u8>> {
        if self.is_bit() {
            return Ok(vec![value.truthy() as u8]);
        }
        let type_err = |expected| IoError::ValueType {
            name: self.name.clone(),
            expected,
        };
        match &self.kind {
            IoKind::Raw | IoKind::Mem { .. } => {
                let bytes = value.as_bytes().ok_or_else(|| type_err("bytes"))?;
                if bytes.len() != self.length {
                    return Err(IoError::ValueLength {
                        name: self.name.clone(),
                        expected: self.length,
                        actual: bytes.len(),
                    });
                }
                Ok(bytes.to_vec())
            }
            IoKind::Int | IoKind::Counter { .. } | IoKind::Replaceable | IoKind::Relay => {
                let v = match value {
                    IoValue::Int(i) => *i,
                    IoValue::Bool(b) => *b as i128,
                    _ => return Err(type_err("integer")),
                };
                int_to_bytes(v, self.length, self.byte_order, self.signed).ok_or(
                    IoError::ValueRange {
                        name: self.name.clone(),
                        value: v,
                    },
                )
            }
            IoKind::Struct(info) => {
                let packed = info.format.pack(&self.name, value, self.byte_order)?;
                if info.word_order == Some(ByteOrder::Little) && self.length > 2 {
                    Ok(swap_word_order(&packed))
                } else {
                    Ok(packed)
                }
            }
        }
    }

    /// Write a value into the device buffer.
    ///
    /// Bits modify only their own bit; sibling bits keep their state.
    pub fn write(&self, device_data: &mut [u8], value: &IoValue) -> IoResult<()> {
        let encoded = self.encode(value)?;
        self.write_raw(device_data, &encoded);
        Ok(())
    }

    /// Write already encoded bytes (or a 0/1 byte for bits).
    pub fn write_raw(&self, device_data: &mut [u8], encoded: &[u8]) {
        let range = self.relative();
        match self.bit_mask() {
            Some(mask) => {
                let byte = &mut device_data[range.start];
                if encoded.first().is_some_and(|&b| b != 0) {
                    *byte |= mask;
                } else {
                    *byte &= !mask;
                }
            }
            None => device_data[range].copy_from_slice(encoded),
        }
    }

    /// Write the stored default into the device buffer.
    pub fn write_default(&self, device_data: &mut [u8]) {
        self.write_raw(device_data, &self.default.bytes());
    }

    /// Compare two device buffers for this IO.
    ///
    /// Returns `Some(level)` if the value changed; `level` is the new bit for
    /// bit IOs and `true` for byte IOs. Changes of sibling bits are ignored.
    pub fn detect_change(&self, old: &[u8], new: &[u8]) -> Option<bool> {
        let range = self.relative();
        if old[range.clone()] == new[range.clone()] {
            return None;
        }
        match self.bit_mask() {
            Some(mask) => {
                let before = old[range.start] & mask;
                let after = new[range.start] & mask;
                (before != after).then_some(after != 0)
            }
            None => Some(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placement(kind: IoKind) -> RecordPlacement {
        RecordPlacement {
            device: 32,
            device_offset: 10,
            direction: IoDirection::Input,
            byte_order: ByteOrder::Little,
            signed: false,
            kind,
        }
    }

    #[test]
    fn bit_index_folds_into_later_byte() {
        let io = IoDescriptor::from_record(
            "bit11",
            &DefaultSpec::Int(1),
            1,
            2,
            false,
            "",
            Some(11),
            placement(IoKind::Raw),
        )
        .unwrap();
        assert_eq!(io.address, 10 + 2 + 1);
        assert_eq!(io.bit, Some(3));
        assert_eq!(io.length, 0);
        assert_eq!(io.span(), 13..14);
        assert_eq!(io.default, DefaultValue::Bool(true));
    }

    #[test]
    fn numeric_default_in_byte_order() {
        let mut p = placement(IoKind::Int);
        p.byte_order = ByteOrder::Big;
        let io = IoDescriptor::from_record(
            "word",
            &DefaultSpec::Text("300".to_string()),
            16,
            0,
            true,
            "",
            None,
            p,
        )
        .unwrap();
        assert_eq!(io.default, DefaultValue::Bytes(vec![0x01, 0x2c]));
        assert_eq!(io.default_value(), IoValue::Int(300));
        assert!(io.export_flag());
    }

    #[test]
    fn explicit_bytes_default_must_match_length() {
        let err = IoDescriptor::from_record(
            "word",
            &DefaultSpec::Bytes(vec![0, 0, 0]),
            16,
            0,
            false,
            "",
            None,
            placement(IoKind::Int),
        )
        .unwrap_err();
        assert!(matches!(err, IoError::DefaultLength { expected: 2, actual: 3, .. }));
    }

    #[test]
    fn text_default_is_ascii_padded() {
        let spec = DefaultSpec::Text("ab".to_string());
        assert_eq!(
            spec.to_bytes("x", 4, ByteOrder::Little).unwrap(),
            vec![b'a', b'b', 0, 0]
        );
        let spec = DefaultSpec::Text("toolong".to_string());
        assert_eq!(spec.to_bytes("x", 4, ByteOrder::Little).unwrap(), vec![0; 4]);
        assert_eq!(DefaultSpec::None.to_bytes("x", 2, ByteOrder::Little).unwrap(), vec![0, 0]);
    }

    #[test]
    fn bit_write_keeps_sibling_bits() {
        let io = IoDescriptor::from_record(
            "b2",
            &DefaultSpec::None,
            1,
            0,
            false,
            "",
            Some(2),
            placement(IoKind::Raw),
        )
        .unwrap();
        let mut data = vec![0b1000_0001u8];
        io.write(&mut data, &IoValue::Bool(true)).unwrap();
        assert_eq!(data[0], 0b1000_0101);
        io.write(&mut data, &IoValue::Bool(false)).unwrap();
        assert_eq!(data[0], 0b1000_0001);
    }

    #[test]
    fn change_detection_ignores_sibling_bits() {
        let io = IoDescriptor::from_record(
            "b0",
            &DefaultSpec::None,
            1,
            0,
            false,
            "",
            Some(0),
            placement(IoKind::Raw),
        )
        .unwrap();
        assert_eq!(io.detect_change(&[0x00], &[0x02]), None);
        assert_eq!(io.detect_change(&[0x00], &[0x01]), Some(true));
        assert_eq!(io.detect_change(&[0x03], &[0x02]), Some(false));
    }

    #[test]
    fn set_byte_order_reverses_default() {
        let mut io = IoDescriptor::from_record(
            "w",
            &DefaultSpec::Int(1),
            16,
            0,
            false,
            "",
            None,
            placement(IoKind::Int),
        )
        .unwrap();
        assert_eq!(io.default, DefaultValue::Bytes(vec![1, 0]));
        io.set_byte_order(ByteOrder::Big);
        assert_eq!(io.default, DefaultValue::Bytes(vec![0, 1]));
        assert_eq!(io.default_value(), IoValue::Int(1));
    }

    #[test]
    fn export_flag_marks_explicit_set() {
        let mut io = IoDescriptor::from_record(
            "w",
            &DefaultSpec::None,
            8,
            0,
            true,
            "",
            None,
            placement(IoKind::Int),
        )
        .unwrap();
        assert_eq!(io.export, 1);
        io.set_export(false);
        assert_eq!(io.export, 2);
        assert!(!io.export_flag());
        io.set_export(true);
        assert_eq!(io.export, 3);
    }

    #[test]
    fn memory_text_value() {
        let io = IoDescriptor::from_record(
            "name",
            &DefaultSpec::Text("abc".to_string()),
            80,
            0,
            false,
            "",
            None,
            placement(IoKind::Mem { bit_length: 80 }),
        )
        .unwrap();
        assert_eq!(io.read(&[0; 10]), IoValue::Text("abc".to_string()));
    }
}
