//! Consumer-facing error type of the sync crate.

use procimg_common::config::ConfigError;
use procimg_common::io::replace_file::ReplaceFileError;
use procimg_common::io::types::{Edge, IoDirection};
use procimg_common::io::IoError;
use thiserror::Error;

/// Errors raised by the process image, its devices and IO handles.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Address model or registry error.
    #[error(transparent)]
    Io(#[from] IoError),

    /// Settings or piCtory configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Replace-file error.
    #[error(transparent)]
    ReplaceFile(#[from] ReplaceFileError),

    /// Byte source failure.
    #[error("process image access failed: {0}")]
    Source(#[from] std::io::Error),

    /// Write to an input or memory IO.
    #[error("can not write to {direction} '{name}'")]
    ReadOnly {
        /// IO name.
        name: String,
        /// Direction of the IO.
        direction: IoDirection,
    },

    /// Write to an input that is an output of the real system.
    #[error("can not write to output '{0}' in simulator mode")]
    SimulatorReadOnly(String),

    /// Explicit bulk operation on a device that the engine owns.
    #[error("device '{0}' is in autorefresh mode")]
    DeviceInAutorefresh(String),

    /// Wait on a device that receives no new data.
    #[error("autorefresh is not activated for device '{0}' - there will never be new data")]
    NoAutorefresh(String),

    /// Consumer loop without any autorefresh device.
    #[error("no device is in autorefresh mode")]
    NoLiveDevices,

    /// Second mainloop/cycleloop.
    #[error("can not start multiple mainloop/cycleloop at the same time")]
    LoopRunning,

    /// Prefire registration while the mainloop runs.
    #[error("prefire can not be used if mainloop is running")]
    PrefireWhileRunning,

    /// Same callback registered twice with conflicting edges.
    #[error("io '{name}' with this function already registered for edge {edge}")]
    DuplicateCallback {
        /// IO name.
        name: String,
        /// Edge of the existing registration.
        edge: Edge,
    },

    /// Consumer loop lost its sync engine.
    #[error("sync engine is not running - no new io data")]
    EngineNotRunning,

    /// The error threshold was reached and the engine stopped.
    #[error("reached max io errors ({0}), sync engine stopped")]
    MaxIoErrors(u32),

    /// Operation forbidden in monitoring mode.
    #[error("can not {0} in monitoring mode")]
    MonitoringMode(&'static str),

    /// Operation forbidden in simulator mode.
    #[error("can not {0} in simulator mode")]
    SimulatorMode(&'static str),

    /// ioctl without a usable fallback.
    #[error("ioctl request {0} is not supported by this process image")]
    UnsupportedIoctl(u32),

    /// No device with this position or name.
    #[error("unknown device '{0}'")]
    UnknownDevice(String),

    /// IO or device kind lacks the requested operation.
    #[error("'{name}' does not support {operation}")]
    Capability {
        /// IO or device name.
        name: String,
        /// Requested operation.
        operation: &'static str,
    },

    /// Edge filter on a byte IO.
    #[error("parameter 'edge' can be used with bit io objects only, '{0}' is not a bit")]
    InvalidEdge(String),

    /// Two devices at one position.
    #[error("device position {0} is used twice")]
    DuplicatePosition(u16),
}

impl SyncError {
    /// True if the sync engine is gone and live devices must be shut down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::EngineNotRunning | Self::MaxIoErrors(_))
    }
}

/// Result alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_lower_layers() {
        let err: SyncError = IoError::UnknownIo("x".into()).into();
        assert!(matches!(err, SyncError::Io(IoError::UnknownIo(_))));

        let err: SyncError = std::io::Error::other("bus").into();
        assert!(err.to_string().contains("bus"));
    }

    #[test]
    fn liveness_errors_are_fatal() {
        assert!(SyncError::EngineNotRunning.is_fatal());
        assert!(SyncError::MaxIoErrors(3).is_fatal());
        assert!(!SyncError::LoopRunning.is_fatal());
        assert!(!SyncError::InvalidEdge("I_1".into()).is_fatal());
    }

    #[test]
    fn read_only_message_names_direction() {
        let err = SyncError::ReadOnly {
            name: "I_1".into(),
            direction: IoDirection::Input,
        };
        assert_eq!(err.to_string(), "can not write to input 'I_1'");
    }
}
