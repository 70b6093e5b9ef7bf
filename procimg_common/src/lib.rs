//! Process Image Common Library
//!
//! Pure building blocks shared by the process-image workspace: constants,
//! settings, the piCtory configuration records and the IO address model.
//! Nothing in here spawns threads or touches the device file.
//!
//! # Module Structure
//!
//! - [`consts`] - Image size, cycle bounds, ioctl request codes
//! - [`config`] - TOML settings and the `ConfigLoader` trait
//! - [`io`] - IO descriptors, struct formats, registry, replace
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use procimg_common::prelude::*;
//!
//! let registry = IoRegistry::new();
//! assert!(registry.is_empty());
//! ```

pub mod config;
pub mod consts;
pub mod io;
pub mod prelude;
