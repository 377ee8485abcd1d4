//! Centralized engine configuration with TOML preset support.
//!
//! All tunables (frame pacing, allocator page sizes, fence timeouts, debug
//! toggles) are consolidated here. Options serialize to/from TOML; all
//! sub-structs use `#[serde(default)]` so partial files (e.g. only
//! overriding `[gpu]`) work correctly.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Frame-pacing and recycling options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FrameOptions {
    /// How many frames may be recorded ahead of GPU completion.
    pub frames_in_flight: u32,
    /// Frames a freed descriptor span is held back before reuse.
    /// `None` falls back to `frames_in_flight`.
    pub frame_latency: Option<u64>,
}

impl Default for FrameOptions {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            frame_latency: None,
        }
    }
}

impl FrameOptions {
    /// The stale-descriptor hold-back actually applied.
    #[must_use]
    pub fn effective_frame_latency(&self) -> u64 {
        self.frame_latency
            .unwrap_or(u64::from(self.frames_in_flight))
    }
}

/// GPU allocator and synchronization options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GpuOptions {
    /// Slots per descriptor page (grown per-request when a span needs
    /// more).
    pub descriptor_page_size: u32,
    /// Bytes per upload-heap page.
    pub upload_page_size: usize,
    /// Bounded fence wait; exceeding it escalates to a device-lost error.
    pub fence_timeout_ms: u64,
}

impl Default for GpuOptions {
    fn default() -> Self {
        Self {
            descriptor_page_size: 256,
            upload_page_size: 2 * 1024 * 1024,
            fence_timeout_ms: 2000,
        }
    }
}

impl GpuOptions {
    /// The fence timeout as a [`Duration`].
    #[must_use]
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }
}

/// Debug and diagnostics toggles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DebugOptions {
    /// Forward debug names of engine-created resources to the device.
    pub label_resources: bool,
}

impl Default for DebugOptions {
    fn default() -> Self {
        Self {
            label_resources: true,
        }
    }
}

/// Top-level options container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct EngineOptions {
    /// Frame pacing and recycling.
    pub frame: FrameOptions,
    /// GPU allocator and synchronization tunables.
    pub gpu: GpuOptions,
    /// Debug toggles.
    pub debug: DebugOptions,
}

impl EngineOptions {
    /// Parse options from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, EngineError> {
        toml::from_str(text).map_err(|e| EngineError::OptionsParse(e.to_string()))
    }

    /// Serialize options to pretty TOML.
    pub fn to_toml(&self) -> Result<String, EngineError> {
        toml::to_string_pretty(self).map_err(|e| EngineError::OptionsParse(e.to_string()))
    }

    /// Load options from a TOML file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Save options to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        let text = self.to_toml()?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_toml() {
        let opts = EngineOptions::default();
        let toml_str = opts.to_toml().unwrap();
        let parsed = EngineOptions::from_toml(&toml_str).unwrap();
        assert_eq!(opts, parsed);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let toml_str = r"
[gpu]
upload_page_size = 65536
";
        let opts = EngineOptions::from_toml(toml_str).unwrap();
        assert_eq!(opts.gpu.upload_page_size, 65536);
        // Everything else should be default
        assert_eq!(opts.gpu.descriptor_page_size, 256);
        assert_eq!(opts.frame.frames_in_flight, 3);
        assert!(opts.debug.label_resources);
    }

    #[test]
    fn frame_latency_falls_back_to_frames_in_flight() {
        let mut opts = EngineOptions::default();
        assert_eq!(opts.frame.effective_frame_latency(), 3);
        opts.frame.frame_latency = Some(1);
        assert_eq!(opts.frame.effective_frame_latency(), 1);
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = EngineOptions::from_toml("[gpu\nupload_page_size = ").unwrap_err();
        assert!(matches!(err, EngineError::OptionsParse(_)));
    }
}
