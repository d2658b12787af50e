//! Configuration loader.
//!
//! An INI file overrides the compiled defaults; a missing file or a
//! missing key silently keeps the default, so a bare install runs with the
//! stock machine profile. Sections:
//!
//! ```ini
//! [cli]
//! auto_cycle = true
//! mdi_mode = true
//! report_inches = false
//!
//! [machine]
//! junction_deviation = 0.01
//! arc_tolerance = 0.002
//! step_frequency = 40000
//! laser_power_correction = true
//! laser_s_max = 1000
//! pulse_device = /tmp/lumen-pulse.bin
//!
//! [axis_x]           ; likewise axis_y, axis_z
//! steps_per_mm = 106.667
//! max_rate = 5000
//! acceleration = 720000
//! max_travel = -495.3
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use configparser::ini::Ini;
use motion::settings::Settings;
use tracing::info;

/// Host-side knobs that do not belong to the motion core.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Start a cycle automatically when the plan buffer fills.
    pub auto_cycle: bool,
    /// Execute each accepted line immediately.
    pub mdi_mode: bool,
    /// Report positions in inches instead of millimeters.
    pub report_inches: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            auto_cycle: true,
            mdi_mode: true,
            report_inches: false,
        }
    }
}

/// Full host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub cli: CliConfig,
    pub motion: Settings,
    /// Where the step byte stream goes.
    pub pulse_device: PathBuf,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            cli: CliConfig::default(),
            motion: Settings::default(),
            pulse_device: PathBuf::from("/tmp/lumen-pulse.bin"),
        }
    }
}

impl HostConfig {
    /// Load from `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<HostConfig> {
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(HostConfig::default());
        }
        let mut ini = Ini::new();
        ini.load(path)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("loading configuration {}", path.display()))?;
        Self::from_ini(&ini)
    }

    /// Parse an already-loaded INI document.
    pub fn from_ini(ini: &Ini) -> Result<HostConfig> {
        let mut config = HostConfig::default();

        if let Ok(Some(value)) = ini.getbool("cli", "auto_cycle") {
            config.cli.auto_cycle = value;
        }
        if let Ok(Some(value)) = ini.getbool("cli", "mdi_mode") {
            config.cli.mdi_mode = value;
        }
        if let Ok(Some(value)) = ini.getbool("cli", "report_inches") {
            config.cli.report_inches = value;
        }

        if let Ok(Some(value)) = ini.getfloat("machine", "junction_deviation") {
            config.motion.junction_deviation = value as f32;
        }
        if let Ok(Some(value)) = ini.getfloat("machine", "arc_tolerance") {
            config.motion.arc_tolerance = value as f32;
        }
        if let Ok(Some(value)) = ini.getuint("machine", "step_frequency") {
            config.motion.step_frequency = value as u32;
        }
        if let Ok(Some(value)) = ini.getbool("machine", "laser_power_correction") {
            config.motion.laser_power_correction = value;
        }
        if let Ok(Some(value)) = ini.getfloat("machine", "laser_s_max") {
            config.motion.laser_s_max = value as f32;
        }
        if let Some(value) = ini.get("machine", "pulse_device") {
            config.pulse_device = PathBuf::from(value);
        }

        for (idx, section) in ["axis_x", "axis_y", "axis_z"].iter().enumerate() {
            if let Ok(Some(value)) = ini.getfloat(section, "steps_per_mm") {
                config.motion.steps_per_mm[idx] = value as f32;
            }
            if let Ok(Some(value)) = ini.getfloat(section, "max_rate") {
                config.motion.max_rate[idx] = value as f32;
            }
            if let Ok(Some(value)) = ini.getfloat(section, "acceleration") {
                config.motion.acceleration[idx] = value as f32;
            }
            if let Ok(Some(value)) = ini.getfloat(section, "max_travel") {
                config.motion.max_travel[idx] = value as f32;
            }
        }

        Ok(config)
    }
}
