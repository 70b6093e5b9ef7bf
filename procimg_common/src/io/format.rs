//! Struct type codes and value codecs.
//!
//! A replacement names its type with a single struct code (`?`, `c`, `b`,
//! `B`, `h`, `H`, `i`, `I`, `l`, `L`, `q`, `Q`, `e`, `f`, `d`) or with
//! `Ns` for an N-byte opaque blob. Sizes are the standard (packed) sizes.

use core::fmt;
use core::str::FromStr;

use super::types::ByteOrder;
use super::{IoError, IoResult};

// ─── IoValue ────────────────────────────────────────────────────────

/// Decoded value of a logical IO.
#[derive(Debug, Clone, PartialEq)]
pub enum IoValue {
    /// Single bit.
    Bool(bool),
    /// Integer of any width up to 64 bit, signed or unsigned.
    Int(i128),
    /// Half, single or double precision float.
    Float(f64),
    /// Raw bytes (`c`, `Ns` and plain byte IOs).
    Bytes(Vec<u8>),
    /// Text memory value.
    Text(String),
}

impl IoValue {
    /// Truth value used for edge evaluation.
    pub fn truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Bytes(b) => b.iter().any(|&x| x != 0),
            Self::Text(s) => !s.is_empty(),
        }
    }

    /// Boolean content, if this is a bit value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer content, if this is an integer value.
    pub fn as_int(&self) -> Option<i128> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Float content, if this is a float value.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Byte content, if this is a byte value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Display for IoValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bytes(b) => {
                f.write_str("b\"")?;
                for byte in b {
                    write!(f, "\\x{byte:02x}")?;
                }
                f.write_str("\"")
            }
            Self::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for IoValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for IoValue {
    fn from(v: i64) -> Self {
        Self::Int(v as i128)
    }
}

impl From<u64> for IoValue {
    fn from(v: u64) -> Self {
        Self::Int(v as i128)
    }
}

impl From<i32> for IoValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i128)
    }
}

impl From<f64> for IoValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<Vec<u8>> for IoValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<&[u8]> for IoValue {
    fn from(v: &[u8]) -> Self {
        Self::Bytes(v.to_vec())
    }
}

// ─── Integer helpers ────────────────────────────────────────────────

/// Interpret `raw` as an integer.
pub fn int_from_bytes(raw: &[u8], order: ByteOrder, signed: bool) -> i128 {
    if raw.is_empty() {
        return 0;
    }
    let mut value: u128 = 0;
    let mut push = |b: u8| value = (value << 8) | b as u128;
    match order {
        ByteOrder::Big => raw.iter().copied().for_each(&mut push),
        ByteOrder::Little => raw.iter().rev().copied().for_each(&mut push),
    }
    let bits = (raw.len().min(16) * 8) as u32;
    if signed && bits < 128 && value & (1u128 << (bits - 1)) != 0 {
        (value as i128) - (1i128 << bits)
    } else {
        value as i128
    }
}

/// Encode `value` into `len` bytes; `None` if it does not fit.
pub fn int_to_bytes(value: i128, len: usize, order: ByteOrder, signed: bool) -> Option<Vec<u8>> {
    let bits = (len * 8) as u32;
    if bits == 0 {
        return None;
    }
    if bits < 128 {
        let (min, max) = if signed {
            (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
        } else {
            (0, (1i128 << bits) - 1)
        };
        if value < min || value > max {
            return None;
        }
    } else if !signed && value < 0 {
        return None;
    }
    let le = value.to_le_bytes();
    let mut out: Vec<u8> = (0..len).map(|i| if i < 16 { le[i] } else if value < 0 { 0xff } else { 0 }).collect();
    if order == ByteOrder::Big {
        out.reverse();
    }
    Some(out)
}

/// Reverse the order of 16-bit words, keeping byte order inside each word.
pub fn swap_word_order(raw: &[u8]) -> Vec<u8> {
    raw.chunks(2).rev().flatten().copied().collect()
}

// ─── Half precision ─────────────────────────────────────────────────

fn f16_to_f64(bits: u16) -> f64 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exp = ((bits >> 10) & 0x1f) as i32;
    let frac = (bits & 0x03ff) as f64;
    match exp {
        0 => sign * frac * 2f64.powi(-24),
        0x1f if frac == 0.0 => sign * f64::INFINITY,
        0x1f => f64::NAN,
        _ => sign * (1.0 + frac / 1024.0) * 2f64.powi(exp - 15),
    }
}

fn f64_to_f16(value: f64) -> Option<u16> {
    if value.is_nan() {
        return Some(0x7e00);
    }
    let sign: u16 = if value.is_sign_negative() { 0x8000 } else { 0 };
    let abs = value.abs();
    if abs == 0.0 {
        return Some(sign);
    }
    if abs.is_infinite() {
        return Some(sign | 0x7c00);
    }
    if abs >= 65520.0 {
        return None;
    }
    if abs < 2f64.powi(-14) {
        let frac = (abs / 2f64.powi(-24)).round() as u16;
        return Some(sign | frac);
    }
    let mut exp = abs.log2().floor() as i32;
    let mut frac = ((abs / 2f64.powi(exp) - 1.0) * 1024.0).round() as u32;
    if frac == 1024 {
        frac = 0;
        exp += 1;
    }
    Some(sign | (((exp + 15) as u16) << 10) | frac as u16)
}

// ─── StructFormat ───────────────────────────────────────────────────

/// Value class of a struct code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    /// `?` - single bit.
    Bool,
    /// `c` - one raw byte.
    Char,
    /// `b B h H i I l L q Q`.
    Int { signed: bool },
    /// `e f d`.
    Float,
    /// `Ns` - N opaque bytes.
    Blob,
}

/// Parsed struct type code of a replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructFormat {
    code: String,
    kind: FormatKind,
    width: usize,
}

impl StructFormat {
    /// Parse a type code.
    pub fn parse(frm: &str) -> IoResult<Self> {
        let invalid = || IoError::InvalidFormat(frm.to_string());

        if let Some(count) = frm.strip_suffix('s') {
            if !count.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid());
            }
            let width = if count.is_empty() {
                1
            } else {
                count.parse::<usize>().map_err(|_| invalid())?
            };
            if width == 0 {
                return Err(invalid());
            }
            return Ok(Self {
                code: frm.to_string(),
                kind: FormatKind::Blob,
                width,
            });
        }

        let mut chars = frm.chars();
        let (Some(c), None) = (chars.next(), chars.next()) else {
            return Err(invalid());
        };
        let (kind, width) = match c {
            '?' => (FormatKind::Bool, 1),
            'c' => (FormatKind::Char, 1),
            'b' | 'B' => (FormatKind::Int { signed: c == 'b' }, 1),
            'h' | 'H' => (FormatKind::Int { signed: c == 'h' }, 2),
            'i' | 'I' | 'l' | 'L' => (
                FormatKind::Int {
                    signed: c.is_ascii_lowercase(),
                },
                4,
            ),
            'q' | 'Q' => (FormatKind::Int { signed: c == 'q' }, 8),
            'e' => (FormatKind::Float, 2),
            'f' => (FormatKind::Float, 4),
            'd' => (FormatKind::Float, 8),
            _ => return Err(invalid()),
        };
        Ok(Self {
            code: frm.to_string(),
            kind,
            width,
        })
    }

    /// The type code as given.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Value class.
    pub fn kind(&self) -> FormatKind {
        self.kind
    }

    /// Packed size in bytes.
    pub fn width(&self) -> usize {
        self.width
    }

    /// `?` replacements address a single bit.
    pub fn is_bit(&self) -> bool {
        self.kind == FormatKind::Bool
    }

    /// Blob replacements carry bytes defaults.
    pub fn is_blob(&self) -> bool {
        self.kind == FormatKind::Blob
    }

    /// Lowercase codes are signed.
    pub fn signed(&self) -> bool {
        self.code == self.code.to_lowercase()
    }

    /// Decode packed bytes. `raw` must be `width()` long.
    pub fn unpack(&self, raw: &[u8], order: ByteOrder) -> IoValue {
        match self.kind {
            FormatKind::Bool => IoValue::Bool(raw.first().is_some_and(|&b| b != 0)),
            FormatKind::Char | FormatKind::Blob => IoValue::Bytes(raw.to_vec()),
            FormatKind::Int { signed } => IoValue::Int(int_from_bytes(raw, order, signed)),
            FormatKind::Float => {
                let bits = int_from_bytes(raw, order, false) as u64;
                IoValue::Float(match self.width {
                    2 => f16_to_f64(bits as u16),
                    4 => f32::from_bits(bits as u32) as f64,
                    _ => f64::from_bits(bits),
                })
            }
        }
    }

    /// Encode a value into `width()` bytes.
    pub fn pack(&self, name: &str, value: &IoValue, order: ByteOrder) -> IoResult<Vec<u8>> {
        let type_err = |expected| IoError::ValueType {
            name: name.to_string(),
            expected,
        };
        match self.kind {
            FormatKind::Bool => Ok(vec![value.truthy() as u8]),
            FormatKind::Char | FormatKind::Blob => {
                let bytes = value.as_bytes().ok_or_else(|| type_err("bytes"))?;
                if bytes.len() != self.width {
                    return Err(IoError::ValueLength {
                        name: name.to_string(),
                        expected: self.width,
                        actual: bytes.len(),
                    });
                }
                Ok(bytes.to_vec())
            }
            FormatKind::Int { signed } => {
                let v = match value {
                    IoValue::Int(i) => *i,
                    IoValue::Bool(b) => *b as i128,
                    _ => return Err(type_err("integer")),
                };
                int_to_bytes(v, self.width, order, signed).ok_or(IoError::ValueRange {
                    name: name.to_string(),
                    value: v,
                })
            }
            FormatKind::Float => {
                let v = match value {
                    IoValue::Float(f) => *f,
                    IoValue::Int(i) => *i as f64,
                    _ => return Err(type_err("float")),
                };
                let bits: u64 = match self.width {
                    2 => f64_to_f16(v).ok_or(IoError::ValueRange {
                        name: name.to_string(),
                        value: v as i128,
                    })? as u64,
                    4 => (v as f32).to_bits() as u64,
                    _ => v.to_bits(),
                };
                int_to_bytes(bits as i128, self.width, order, false).ok_or(IoError::ValueRange {
                    name: name.to_string(),
                    value: v as i128,
                })
            }
        }
    }
}

impl FromStr for StructFormat {
    type Err = IoError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for StructFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths_follow_type_code() {
        for (code, width) in [
            ("?", 1),
            ("c", 1),
            ("b", 1),
            ("B", 1),
            ("h", 2),
            ("H", 2),
            ("i", 4),
            ("I", 4),
            ("l", 4),
            ("f", 4),
            ("e", 2),
            ("q", 8),
            ("Q", 8),
            ("d", 8),
            ("s", 1),
            ("4s", 4),
            ("12s", 12),
        ] {
            assert_eq!(StructFormat::parse(code).unwrap().width(), width, "{code}");
        }
    }

    #[test]
    fn malformed_codes_rejected() {
        for code in ["", "hf", "ss", "x", "0s", "4x", "s4", "?h"] {
            assert!(
                matches!(StructFormat::parse(code), Err(IoError::InvalidFormat(_))),
                "{code}"
            );
        }
    }

    #[test]
    fn signedness_from_case() {
        assert!(StructFormat::parse("h").unwrap().signed());
        assert!(!StructFormat::parse("H").unwrap().signed());
        assert!(StructFormat::parse("8s").unwrap().signed());
    }

    #[test]
    fn int_conversions() {
        assert_eq!(int_from_bytes(&[0x2c, 0x01], ByteOrder::Little, false), 300);
        assert_eq!(int_from_bytes(&[0x01, 0x2c], ByteOrder::Big, false), 300);
        assert_eq!(int_from_bytes(&[0xff, 0xff], ByteOrder::Little, true), -1);
        assert_eq!(int_from_bytes(&[0xff, 0xff], ByteOrder::Little, false), 65535);
        assert_eq!(
            int_to_bytes(500, 2, ByteOrder::Little, false),
            Some(vec![0xf4, 0x01])
        );
        assert_eq!(int_to_bytes(-1, 2, ByteOrder::Big, true), Some(vec![0xff, 0xff]));
        assert_eq!(int_to_bytes(65536, 2, ByteOrder::Little, false), None);
        assert_eq!(int_to_bytes(-1, 2, ByteOrder::Little, false), None);
        assert_eq!(int_to_bytes(-32769, 2, ByteOrder::Little, true), None);
    }

    #[test]
    fn word_order_swap() {
        assert_eq!(swap_word_order(&[1, 2, 3, 4]), vec![3, 4, 1, 2]);
        assert_eq!(
            swap_word_order(&[1, 2, 3, 4, 5, 6, 7, 8]),
            vec![7, 8, 5, 6, 3, 4, 1, 2]
        );
    }

    #[test]
    fn pack_and_unpack_float() {
        let f = StructFormat::parse("f").unwrap();
        let raw = f.pack("x", &IoValue::Float(1.5), ByteOrder::Little).unwrap();
        assert_eq!(raw, 1.5f32.to_le_bytes().to_vec());
        assert_eq!(f.unpack(&raw, ByteOrder::Little), IoValue::Float(1.5));

        let e = StructFormat::parse("e").unwrap();
        let raw = e.pack("x", &IoValue::Float(-2.5), ByteOrder::Big).unwrap();
        assert_eq!(raw, vec![0xc1, 0x00]);
        assert_eq!(e.unpack(&raw, ByteOrder::Big), IoValue::Float(-2.5));
    }

    #[test]
    fn pack_rejects_wrong_type_and_length() {
        let blob = StructFormat::parse("4s").unwrap();
        assert!(matches!(
            blob.pack("x", &IoValue::Bytes(vec![0; 3]), ByteOrder::Little),
            Err(IoError::ValueLength { expected: 4, actual: 3, .. })
        ));
        assert!(matches!(
            blob.pack("x", &IoValue::Int(1), ByteOrder::Little),
            Err(IoError::ValueType { .. })
        ));
        let h = StructFormat::parse("h").unwrap();
        assert!(matches!(
            h.pack("x", &IoValue::Int(40000), ByteOrder::Little),
            Err(IoError::ValueRange { .. })
        ));
    }
}
