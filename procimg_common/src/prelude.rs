//! Prelude module for common re-exports.
//!
//! ```rust
//! use procimg_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, DeviceKey, LogLevel, SyncSettings};

// ─── System Constants ───────────────────────────────────────────────
pub use crate::consts::{DEFAULT_CYCLE_TIME_MS, PROCESS_IMAGE_SIZE};

// ─── I/O ────────────────────────────────────────────────────────────
pub use crate::io::address::{DefaultSpec, DefaultValue, IoDescriptor, IoKind};
pub use crate::io::config::{DeviceRecord, IoRecord, PiCtoryConfig};
pub use crate::io::format::{IoValue, StructFormat};
pub use crate::io::registry::{IoId, IoRegistry};
pub use crate::io::replace::ReplaceRequest;
pub use crate::io::replace_file::{ReplaceDefinition, ReplaceFileError};
pub use crate::io::types::{ByteOrder, Edge, IoCapabilities, IoDirection};
pub use crate::io::{IoError, IoResult};
