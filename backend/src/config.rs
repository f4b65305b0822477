//! Configuration Module
//!
//! Handles configuration file parsing.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use pvgpu_protocol::{PVGPU_COMMAND_RING_SIZE, PVGPU_DEFAULT_SHMEM_SIZE};

/// Backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listen address for the virtual device link
    #[serde(default = "default_link_addr")]
    pub link_addr: String,

    /// Shared memory backing file path
    #[serde(default = "default_shmem_path")]
    pub shmem_path: String,

    /// Shared memory region size in bytes
    #[serde(default = "default_shmem_size")]
    pub shmem_size: usize,

    /// Command ring size in bytes (power of two)
    #[serde(default = "default_ring_size")]
    pub ring_size: usize,

    /// Presentation mode: "headless", "windowed", "dual"
    #[serde(default = "default_presentation_mode")]
    pub presentation_mode: String,

    /// Initial display width
    #[serde(default = "default_width")]
    pub width: u32,

    /// Initial display height
    #[serde(default = "default_height")]
    pub height: u32,

    /// Initial refresh rate
    #[serde(default = "default_refresh_rate")]
    pub refresh_rate: u32,

    /// VSync enabled
    #[serde(default = "default_vsync")]
    pub vsync: bool,

    /// Number of frame buffers (2 or 3)
    #[serde(default = "default_buffer_count")]
    pub buffer_count: u32,
}

fn default_link_addr() -> String {
    "127.0.0.1:41300".to_string()
}

fn default_shmem_path() -> String {
    "/dev/shm/pvgpu-shmem".to_string()
}

fn default_shmem_size() -> usize {
    PVGPU_DEFAULT_SHMEM_SIZE
}

fn default_ring_size() -> usize {
    PVGPU_COMMAND_RING_SIZE
}

fn default_presentation_mode() -> String {
    "headless".to_string()
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_refresh_rate() -> u32 {
    60
}

fn default_vsync() -> bool {
    true
}

fn default_buffer_count() -> u32 {
    2
}

impl Default for Config {
    fn default() -> Self {
        Self {
            link_addr: default_link_addr(),
            shmem_path: default_shmem_path(),
            shmem_size: default_shmem_size(),
            ring_size: default_ring_size(),
            presentation_mode: default_presentation_mode(),
            width: default_width(),
            height: default_height(),
            refresh_rate: default_refresh_rate(),
            vsync: default_vsync(),
            buffer_count: default_buffer_count(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.shmem_size, 0x10000000);
        assert_eq!(config.ring_size, 0x1000000);
        assert_eq!(config.presentation_mode, "headless");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str("width = 1280\nheight = 720\n").unwrap();
        assert_eq!(config.width, 1280);
        assert_eq!(config.height, 720);
        assert_eq!(config.ring_size, PVGPU_COMMAND_RING_SIZE);
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pvgpu.toml");
        let mut config = Config::default();
        config.width = 2560;
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.width, 2560);
        assert_eq!(loaded.link_addr, config.link_addr);
    }
}
