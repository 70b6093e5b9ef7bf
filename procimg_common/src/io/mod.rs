//! IO address model.
//!
//! Maps named logical values onto byte and bit offsets of the process image,
//! keeps them in an indexed registry and supports reinterpreting regions
//! with new types ("replace").
//!
//! # Module Structure
//!
//! - [`types`] - Direction, byte order, edge and capability flags
//! - [`format`] - Struct type codes (`h`, `I`, `8s`, ...) and value codecs
//! - [`address`] - `IoDescriptor`: one logical value and its layout
//! - [`config`] - piCtory JSON records
//! - [`registry`] - `IoRegistry` with name/offset indices and dead-io redirects
//! - [`replace`] - Replace requests and the absorption algorithm
//! - [`replace_file`] - Persisted replace definitions (INI)

use thiserror::Error;

pub mod address;
pub mod config;
pub mod format;
pub mod registry;
pub mod replace;
pub mod replace_file;
pub mod types;

/// Errors of the address model and the IO registry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IoError {
    /// Type code does not match `^([0-9]*s|[cbB?hHiIlLqQefd])$`.
    #[error("parameter frm has to be a single sign from [cbB?hHiIlLqQefd] or 'COUNTs' e.g. '8s', got '{0}'")]
    InvalidFormat(String),

    /// Bit index outside the replaced region.
    #[error("bitaddress must be a value between 0 and {max}, got {bit}")]
    InvalidBit { bit: u32, max: u32 },

    /// Byte order other than little/big.
    #[error("byteorder must be 'little' or 'big', got '{0}'")]
    InvalidByteOrder(String),

    /// Word order other than little/big.
    #[error("wordorder must be 'little' or 'big', got '{0}'")]
    InvalidWordOrder(String),

    /// Word order requested for a single bit.
    #[error("you can not use wordorder for bit based ios")]
    WordOrderOnBit,

    /// Word order requested for an odd byte length.
    #[error("the byte length of new io must be even to use wordorder, got {0}")]
    WordOrderOddLength(usize),

    /// Explicit default bytes with wrong length.
    #[error("given bytes for default value of '{name}' must have a length of {expected} but {actual} was given")]
    DefaultLength {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// Name already registered.
    #[error("attribute {0} already exists - can not set io")]
    DuplicateName(String),

    /// Bit already taken by another replacement.
    #[error("bit {bit} already assigned to '{holder}'")]
    BitAssigned { bit: u8, holder: String },

    /// Byte replacement over an existing replacement.
    #[error("new io '{name}' overlaps memory of '{holder}'")]
    Overlap { name: String, holder: String },

    /// Span leaves the device section of the replaced IO.
    #[error("registered value '{0}' does not fit process image scope")]
    OutOfScope(String),

    /// No IO with this name or at this address.
    #[error("unknown io '{0}'")]
    UnknownIo(String),

    /// IO kind does not support replace.
    #[error("io '{0}' can not be replaced")]
    NotReplaceable(String),

    /// Value variant does not fit the IO kind.
    #[error("'{name}' requires a {expected} value")]
    ValueType { name: String, expected: &'static str },

    /// Byte value with wrong length.
    #[error("'{name}' requires a bytes object of length {expected}, but {actual} was given")]
    ValueLength {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// Integer does not fit the IO width.
    #[error("value {value} does not fit into '{name}'")]
    ValueRange { name: String, value: i128 },
}

/// Result alias for address model operations.
pub type IoResult<T> = Result<T, IoError>;
