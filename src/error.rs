//! Crate-level error types.

use std::fmt;

use crate::gpu::device::DeviceError;
use crate::gpu::upload::AllocError;

/// Errors produced by the lantern crate.
#[derive(Debug)]
pub enum EngineError {
    /// Fatal device-level failure (creation, submission, device lost).
    Device(DeviceError),
    /// Transient-allocator capacity failure.
    Alloc(AllocError),
    /// TOML options parsing/serialization failure.
    OptionsParse(String),
    /// Generic I/O failure.
    Io(std::io::Error),
    /// Failed to spawn a background thread.
    ThreadSpawn(std::io::Error),
    /// A required compiled-shader blob was missing or empty.
    MissingShader(&'static str),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(e) => write!(f, "device error: {e}"),
            Self::Alloc(e) => write!(f, "allocation error: {e}"),
            Self::OptionsParse(msg) => {
                write!(f, "options parse error: {msg}")
            }
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::ThreadSpawn(e) => {
                write!(f, "failed to spawn thread: {e}")
            }
            Self::MissingShader(stage) => {
                write!(f, "missing shader byte-code for {stage}")
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Device(e) => Some(e),
            Self::Alloc(e) => Some(e),
            Self::Io(e) | Self::ThreadSpawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DeviceError> for EngineError {
    fn from(e: DeviceError) -> Self {
        Self::Device(e)
    }
}

impl From<AllocError> for EngineError {
    fn from(e: AllocError) -> Self {
        Self::Alloc(e)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
