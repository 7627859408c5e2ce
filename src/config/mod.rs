//! Configuration management for the graphics stack
//!
//! Loads, validates and saves the TOML file that selects the buffer
//! platform, sizes the buffer pools and lays out the outputs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::buffer::pool::MAX_RING_DEPTH;
use crate::buffer::PixelFormat;
use crate::display::Orientation;
use crate::geometry::{Point, Rectangle, Size};
use crate::platform::PlatformKind;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphicsConfig {
    /// Buffer platform selection
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Per-surface buffer pools
    #[serde(default)]
    pub pool: PoolConfig,

    /// Outputs, in screen-space order
    #[serde(default = "default_outputs")]
    pub outputs: Vec<OutputConfig>,

    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlatformConfig {
    /// "shm" or "gbm"
    pub backend: PlatformKind,

    /// DRM node used by the gbm backend and by KMS outputs
    pub drm_device: PathBuf,

    /// Replaces the $XDG_RUNTIME_DIR → /dev/shm → /tmp search when non-empty
    pub shm_directories: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Buffers kept per surface (1 = single buffering)
    pub ring_depth: usize,

    /// Pixel format of pool buffers
    pub format: PixelFormat,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Virtual output in memory
    #[default]
    Headless,
    /// Kernel mode-setting connector
    Kms,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    pub name: String,

    #[serde(default)]
    pub kind: OutputKind,

    /// Top-left corner in screen space
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,

    /// Mode size. KMS outputs use the connector's preferred mode instead.
    pub width: u32,
    pub height: u32,

    #[serde(default)]
    pub orientation: Orientation,

    /// Output rotates in hardware; the renderer never does
    #[serde(default)]
    pub self_rotating: bool,

    /// Allow direct scanout of client buffers
    #[serde(default = "default_true")]
    pub bypass: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable debug logging
    pub debug: bool,

    /// Frames the demo loop renders per output
    pub frames: u32,
}

fn default_true() -> bool {
    true
}

fn default_outputs() -> Vec<OutputConfig> {
    vec![OutputConfig::default()]
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            platform: PlatformConfig::default(),
            pool: PoolConfig::default(),
            outputs: default_outputs(),
            general: GeneralConfig::default(),
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            backend: PlatformKind::Shm,
            drm_device: PathBuf::from("/dev/dri/card0"),
            shm_directories: Vec::new(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            ring_depth: 1,
            format: PixelFormat::Argb8888,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            name: "HEADLESS-1".to_string(),
            kind: OutputKind::Headless,
            x: 0,
            y: 0,
            width: 1920,
            height: 1080,
            orientation: Orientation::Normal,
            self_rotating: false,
            bypass: true,
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            debug: false,
            frames: 60,
        }
    }
}

impl OutputConfig {
    /// Unrotated mode rectangle
    pub fn area(&self) -> Rectangle {
        Rectangle::new(Point::new(self.x, self.y), Size::new(self.width, self.height))
    }
}

impl GraphicsConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Expand ~ to home directory
        let expanded_path = if path.to_string_lossy().starts_with('~') {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            Path::new(&home).join(path.strip_prefix("~").unwrap_or(path))
        } else {
            path.to_path_buf()
        };

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: GraphicsConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.pool.ring_depth == 0 || self.pool.ring_depth > MAX_RING_DEPTH {
            anyhow::bail!(
                "Invalid ring_depth {}: must be between 1 and {}",
                self.pool.ring_depth,
                MAX_RING_DEPTH
            );
        }

        if self.outputs.is_empty() {
            anyhow::bail!("At least one output must be configured");
        }

        let mut names = HashSet::new();
        let mut kms_outputs = 0;
        for output in &self.outputs {
            if output.name.is_empty() {
                anyhow::bail!("Output names must not be empty");
            }
            if !names.insert(output.name.as_str()) {
                anyhow::bail!("Duplicate output name: {}", output.name);
            }
            if output.width == 0 || output.height == 0 {
                anyhow::bail!("Output {} has a zero-sized mode", output.name);
            }
            if output.kind == OutputKind::Kms {
                kms_outputs += 1;
                if self.platform.backend != PlatformKind::Gbm {
                    anyhow::bail!("KMS output {} requires the gbm backend", output.name);
                }
            }
        }

        // Page-flip events are consumed per card
        if kms_outputs > 1 {
            anyhow::bail!("Only one KMS output per DRM device is supported");
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }

    /// Merge a partial configuration into this one
    /// Sections of the partial config that differ from the defaults win
    pub fn merge_partial(mut self, partial: GraphicsConfig) -> Self {
        let default_config = GraphicsConfig::default();

        if partial.platform != default_config.platform {
            self.platform = partial.platform;
        }
        if partial.pool != default_config.pool {
            self.pool = partial.pool;
        }
        if partial.outputs != default_config.outputs {
            self.outputs = partial.outputs;
        }
        if partial.general != default_config.general {
            self.general = partial.general;
        }

        self
    }
}


#[cfg(test)]
mod property_tests;
