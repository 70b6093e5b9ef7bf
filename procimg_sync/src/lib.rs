//! # Process Image Sync Library
//!
//! Keeps in-memory copies of RevPi device sections in step with the
//! process image and turns value changes into callbacks.
//!
//! # Module Structure
//!
//! - [`source`] - `ByteSource` trait, device file and in-memory sources
//! - [`device`] - Device sections, per-device buffers and locks
//! - [`device_registry`] - Devices by position and by name
//! - [`engine`] - Cyclic sync thread, change detection, IO error budget
//! - [`events`] - Callbacks, delayed events, queues and the dispatcher
//! - [`signal`] - New-data generations and cancel tokens
//! - [`modio`] - `ProcessImage` facade, IO and device handles, loops
//! - [`cycletools`] - Flags and timers for `cycleloop`
//! - [`error`] - `SyncError` and `SyncResult`
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        procimg_sync                              │
//! │  ┌─────────────┐    ┌──────────────┐    ┌─────────────────────┐  │
//! │  │ ByteSource  │◄──►│  SyncEngine  │───►│  EventQueue         │  │
//! │  │ (/dev/piCon)│    │  (cycle loop)│    │  inline | threaded  │  │
//! │  └─────────────┘    └──────┬───────┘    └──────────┬──────────┘  │
//! │                            │                       │             │
//! │                            ▼                       ▼             │
//! │                   ┌────────────────┐     ┌──────────────────┐    │
//! │                   │ Device buffers │◄────│  ProcessImage    │    │
//! │                   │ (per device)   │     │  mainloop/cycle  │    │
//! │                   └────────────────┘     └──────────────────┘    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

#![deny(warnings)]
#![deny(missing_docs)]

pub mod cycletools;
pub mod device;
pub mod device_registry;
pub mod engine;
pub mod error;
pub mod events;
pub mod modio;
pub mod signal;
pub mod source;

// Re-export key types for convenience
pub use crate::cycletools::Cycletools;
pub use crate::engine::SyncEngine;
pub use crate::error::{SyncError, SyncResult};
pub use crate::events::{EventContext, EventHandler, EventSpec};
pub use crate::modio::{DeviceHandle, IoHandle, ProcessImage, SwitchingCycles, WaitOutcome};
pub use crate::signal::CancelToken;
pub use crate::source::{ByteSource, FileSource, MemoryByteSource};
