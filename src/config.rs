//! Cluster configuration for cavewarp
//!
//! One TOML file is shared verbatim across every node of the installation.
//! The display list doubles as the discovery boundary: its order is the
//! deterministic cluster-wide target order the replicated protocol addresses
//! by index, so the file must be identical on all machines.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Warp grid dimensions, in cells. Fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GridConfig {
    pub cols: usize,
    pub rows: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            cols: crate::mesh::GRID_COLS,
            rows: crate::mesh::GRID_ROWS,
        }
    }
}

/// Cluster networking endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address the authority listens on for replica subscriptions.
    pub bind: String,
    /// Address replicas connect to.
    pub authority: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9043".to_string(),
            authority: "127.0.0.1:9043".to_string(),
        }
    }
}

/// Fractional overlap with the neighboring screen, per edge, each in [0,1].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BlendConfig {
    #[serde(default)]
    pub left: f32,
    #[serde(default)]
    pub right: f32,
    #[serde(default)]
    pub top: f32,
    #[serde(default)]
    pub bottom: f32,
}

impl BlendConfig {
    /// Clamp every fraction into [0,1], warning about out-of-range values.
    pub fn clamped(&self) -> Self {
        let clamp = |name: &str, v: f32| {
            if !(0.0..=1.0).contains(&v) {
                tracing::warn!("{} blend fraction {} outside [0,1], clamping", name, v);
            }
            v.clamp(0.0, 1.0)
        };
        Self {
            left: clamp("left", self.left),
            right: clamp("right", self.right),
            top: clamp("top", self.top),
            bottom: clamp("bottom", self.bottom),
        }
    }
}

/// One physical display surface and the machine that drives it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub name: String,
    pub machine: String,
    /// Physical screen size in meters.
    #[serde(default = "default_screen_size")]
    pub width: f32,
    #[serde(default = "default_screen_size")]
    pub height: f32,
    /// Render resolution before warp correction.
    #[serde(default = "default_resolution")]
    pub resolution: [u32; 2],
    /// Stereo displays warp a left and a right eye image; mono a single one.
    #[serde(default)]
    pub stereo: bool,
    /// Initial local placement of the display surface.
    #[serde(default)]
    pub position: [f32; 3],
    /// Initial local rotation, Euler degrees.
    #[serde(default)]
    pub rotation: [f32; 3],
    #[serde(default)]
    pub blend: BlendConfig,
}

fn default_screen_size() -> f32 {
    2.0
}

fn default_resolution() -> [u32; 2] {
    [1280, 720]
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// This node's machine identity; must match `DisplayConfig::machine`
    /// entries for the displays it drives.
    #[serde(default = "default_machine")]
    pub machine: String,

    /// Root directory for persisted calibration artifacts.
    #[serde(default = "default_calibration_dir")]
    pub calibration_dir: PathBuf,

    /// Whether persisted calibration is read from disk at startup, or the
    /// in-memory defaults are assumed already correct.
    #[serde(default = "default_true")]
    pub load_calibration_on_start: bool,

    /// At teardown, save only the displays this machine drives instead of
    /// every record in the cluster list.
    #[serde(default = "default_true")]
    pub save_this_machine_only: bool,

    #[serde(default)]
    pub grid: GridConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default = "default_displays")]
    pub displays: Vec<DisplayConfig>,
}

fn default_machine() -> String {
    "localhost".to_string()
}

fn default_calibration_dir() -> PathBuf {
    PathBuf::from("configs")
}

fn default_true() -> bool {
    true
}

fn default_displays() -> Vec<DisplayConfig> {
    vec![DisplayConfig {
        name: "display-0".to_string(),
        machine: default_machine(),
        width: default_screen_size(),
        height: default_screen_size(),
        resolution: default_resolution(),
        stereo: false,
        position: [0.0; 3],
        rotation: [0.0; 3],
        blend: BlendConfig::default(),
    }]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            machine: default_machine(),
            calibration_dir: default_calibration_dir(),
            load_calibration_on_start: true,
            save_this_machine_only: true,
            grid: GridConfig::default(),
            network: NetworkConfig::default(),
            displays: default_displays(),
        }
    }
}

impl Config {
    /// Load configuration from a file, or create a default one if it doesn't
    /// exist.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory {:?}", parent))?;
            }
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        Ok(())
    }
}
