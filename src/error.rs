use std::io;

use crate::pubdef::SessionState;


/// Emulation core error.
///
/// Only set-up, configuration and supervision paths return this type. The real-time loops never
/// fail: they report through their status slot instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The shared region was already split into actor ports.
    #[error("already instantiated")]
    AlreadyInstantiated,
    #[error("permission denied")]
    PermissionDenied,
    #[error("device not found")]
    DeviceNotFound,
    #[error("other device error: {0}")]
    OtherDeviceError(io::Error),
    #[error("shared region too small: {available} bytes available, {required} required")]
    RegionTooSmall { available: usize, required: usize },
    #[error("canary mismatch: expected {expected:#010x}, found {found:#010x}")]
    CanaryMismatch { expected: u32, found: u32 },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("cannot parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("invalid session transition from {from:?} to {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },
    #[error("reset not acknowledged by the co-processors")]
    ResetPending,
    #[error("{count} sample buffers still held across a session reset")]
    BuffersHeld { count: usize },
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::NotFound => Error::DeviceNotFound,
            io::ErrorKind::PermissionDenied => Error::PermissionDenied,
            _ => Error::OtherDeviceError(err),
        }
    }
}
