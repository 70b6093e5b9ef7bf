//! System-wide constants for the process image workspace.
//!
//! Single source of truth for image size, cycle bounds, ioctl request codes
//! and default paths. Imported by all crates, no duplication permitted.

use std::time::Duration;

/// Size of the complete process image in bytes.
pub const PROCESS_IMAGE_SIZE: usize = 4096;

/// Default character device of the process image driver.
pub const DEFAULT_PROCIMG: &str = "/dev/piControl0";

/// Known locations of the piCtory configuration, searched in order.
pub const CONFIG_RSC_PATHS: [&str; 2] = ["/etc/revpi/config.rsc", "/opt/KUNBUS/config.rsc"];

/// Lower bound of the synchronization cycle in milliseconds.
pub const MIN_CYCLE_TIME_MS: u32 = 5;

/// Upper bound of the synchronization cycle in milliseconds.
pub const MAX_CYCLE_TIME_MS: u32 = 2000;

/// Default cycle time on multi-core controllers (50 Hz).
pub const DEFAULT_CYCLE_TIME_MS: u32 = 20;

/// Default cycle time on single-core controllers (25 Hz).
pub const SINGLE_CPU_CYCLE_TIME_MS: u32 = 40;

/// Bounded wait for a new-data signal before a loop presumes the engine dead.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_millis(2500);

/// Poll interval of the inline event queue in `mainloop`.
pub const EVENT_QUEUE_POLL: Duration = Duration::from_secs(1);

/// ioctl: set a single bit (`u16 LE address, u8 bit [, u8 on]`).
pub const IOCTL_SET_BIT: u32 = 19216;

/// ioctl: reset a DIO counter (`u8 position, 0x00, u16 LE bitfield`).
pub const IOCTL_RESET_COUNTER: u32 = 19220;

/// ioctl: read relay switching counters (`u8 position, 4 x u32`).
pub const IOCTL_RELAY_COUNTERS: u32 = 19229;

/// Number of relay counters returned by [`IOCTL_RELAY_COUNTERS`].
pub const RELAY_COUNTERS: usize = 4;

/// Packed argument size of [`IOCTL_RELAY_COUNTERS`].
pub const RELAY_COUNTERS_ARG_LEN: usize = 1 + 4 * RELAY_COUNTERS;

/// Module-relative start offsets of the 16 counter inputs on DIO/DI/DO modules.
pub const DIO_COUNTER_ADDRESSES: [usize; 16] = [
    6, 10, 14, 18, 22, 26, 30, 34, 38, 42, 46, 50, 54, 58, 62, 66,
];

/// Product type of the DIO module.
pub const PRODUCT_DIO: u16 = 96;

/// Product type of the DI module.
pub const PRODUCT_DI: u16 = 97;

/// Product type of the DO module.
pub const PRODUCT_DO: u16 = 98;

/// Product type of the AIO module (signed integers).
pub const PRODUCT_AIO: u16 = 103;

/// Product type of the RO relay module.
pub const PRODUCT_RO: u16 = 137;

/// First position assigned to adapter devices of old piCtory versions.
pub const ADAPTER_POSITION_BASE: u16 = 64;

/// Warnings of a recurring fault are logged for the first N occurrences.
pub const WARN_BURST: u64 = 10;

/// ...then only every N-th occurrence.
pub const WARN_EVERY: u64 = 1000;

/// Returns true when the n-th occurrence of a recurring warning is logged.
pub fn should_warn(occurrence: u64) -> bool {
    occurrence <= WARN_BURST || occurrence % WARN_EVERY == 0
}
