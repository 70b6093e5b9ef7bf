//! Small value types of the IO address model.
//!
//! `IoDirection` mirrors the three piCtory sections (`inp`, `out`, `mem`),
//! `ByteOrder` the integer interpretation and `Edge` the event filter.

use bitflags::bitflags;
use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use super::IoError;

// ─── IoDirection ────────────────────────────────────────────────────

/// Direction of an IO as seen by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoDirection {
    /// Read-only value delivered by the hardware.
    Input,
    /// Writable value pushed to the hardware.
    Output,
    /// Read-only configuration memory.
    Memory,
}

impl IoDirection {
    /// Only outputs accept writes.
    pub fn is_writable(self) -> bool {
        self == Self::Output
    }

    /// Section key in the piCtory configuration.
    pub fn section(self) -> &'static str {
        match self {
            Self::Input => "inp",
            Self::Output => "out",
            Self::Memory => "mem",
        }
    }
}

impl fmt::Display for IoDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

// ─── ByteOrder ──────────────────────────────────────────────────────

/// Byte order of multi-byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    /// Least significant byte first (process image default).
    #[default]
    Little,
    /// Most significant byte first.
    Big,
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Little => write!(f, "little"),
            Self::Big => write!(f, "big"),
        }
    }
}

impl FromStr for ByteOrder {
    type Err = IoError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "little" => Ok(Self::Little),
            "big" => Ok(Self::Big),
            _ => Err(IoError::InvalidByteOrder(s.to_string())),
        }
    }
}

// ─── Edge ───────────────────────────────────────────────────────────

/// Transition filter for events and waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    /// off -> on.
    Rising,
    /// on -> off.
    Falling,
    /// Any change.
    #[default]
    Both,
}

impl Edge {
    /// Whether a transition to `new_value` passes this filter.
    ///
    /// `Both` always matches, `Rising` needs a true target, `Falling` a
    /// false one.
    #[inline]
    pub fn matches(self, new_value: bool) -> bool {
        match self {
            Self::Both => true,
            Self::Rising => new_value,
            Self::Falling => !new_value,
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rising => write!(f, "RISING"),
            Self::Falling => write!(f, "FALLING"),
            Self::Both => write!(f, "BOTH"),
        }
    }
}

// ─── Capabilities ───────────────────────────────────────────────────

bitflags! {
    /// Extra operations an IO kind supports beyond get/set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IoCapabilities: u8 {
        /// Hardware counter that can be reset via ioctl.
        const SUPPORTS_RESET         = 0x01;
        /// Relay output with switching-cycle counters.
        const SUPPORTS_COUNTER_QUERY = 0x02;
        /// Region may be reinterpreted with `replace`.
        const REPLACEABLE            = 0x04;
        /// Value is interpreted as integer.
        const INTEGER                = 0x08;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_filter() {
        assert!(Edge::Both.matches(true));
        assert!(Edge::Both.matches(false));
        assert!(Edge::Rising.matches(true));
        assert!(!Edge::Rising.matches(false));
        assert!(Edge::Falling.matches(false));
        assert!(!Edge::Falling.matches(true));
    }

    #[test]
    fn byte_order_parse() {
        assert_eq!("little".parse::<ByteOrder>().unwrap(), ByteOrder::Little);
        assert_eq!("big".parse::<ByteOrder>().unwrap(), ByteOrder::Big);
        assert!(matches!(
            "test".parse::<ByteOrder>(),
            Err(IoError::InvalidByteOrder(_))
        ));
    }

    #[test]
    fn only_outputs_writable() {
        assert!(IoDirection::Output.is_writable());
        assert!(!IoDirection::Input.is_writable());
        assert!(!IoDirection::Memory.is_writable());
        assert_eq!(IoDirection::Memory.section(), "mem");
    }
}
