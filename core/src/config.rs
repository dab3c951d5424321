//! Construction-time filter configuration.
//!
//! The process noise standard deviations are tuning parameters. The measurement noise standard
//! deviations come from the sensor manufacturer and are not meant to be tuned, but they are kept
//! configurable so other sensor pairs can be modeled. Configuration files can be written and read
//! as TOML or JSON, chosen by file extension.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::FilterError;
use crate::measurements::{LaserModel, RadarModel};

fn default_true() -> bool {
    true
}
fn default_std_a() -> f64 {
    3.0
}
fn default_std_yawdd() -> f64 {
    2.5
}
fn default_std_laspx() -> f64 {
    0.15
}
fn default_std_laspy() -> f64 {
    0.15
}
fn default_std_radr() -> f64 {
    0.3
}
fn default_std_radphi() -> f64 {
    0.03
}
fn default_std_radrd() -> f64 {
    0.3
}

/// Filter configuration fixed at construction.
///
/// # Example
///
/// ```rust
/// use fusion::config::FilterConfig;
///
/// let config = FilterConfig {
///     std_a: 1.5,
///     use_radar: false,
///     ..FilterConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// If false, laser measurements are ignored except to initialize the filter.
    #[serde(default = "default_true")]
    pub use_laser: bool,
    /// If false, radar measurements are ignored except to initialize the filter.
    #[serde(default = "default_true")]
    pub use_radar: bool,
    /// Process noise standard deviation of longitudinal acceleration in m/s^2
    #[serde(default = "default_std_a")]
    pub std_a: f64,
    /// Process noise standard deviation of yaw acceleration in rad/s^2
    #[serde(default = "default_std_yawdd")]
    pub std_yawdd: f64,
    /// Laser measurement noise standard deviation along x in m
    #[serde(default = "default_std_laspx")]
    pub std_laspx: f64,
    /// Laser measurement noise standard deviation along y in m
    #[serde(default = "default_std_laspy")]
    pub std_laspy: f64,
    /// Radar measurement noise standard deviation of range in m
    #[serde(default = "default_std_radr")]
    pub std_radr: f64,
    /// Radar measurement noise standard deviation of bearing in rad
    #[serde(default = "default_std_radphi")]
    pub std_radphi: f64,
    /// Radar measurement noise standard deviation of range-rate in m/s
    #[serde(default = "default_std_radrd")]
    pub std_radrd: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            use_laser: true,
            use_radar: true,
            std_a: default_std_a(),
            std_yawdd: default_std_yawdd(),
            std_laspx: default_std_laspx(),
            std_laspy: default_std_laspy(),
            std_radr: default_std_radr(),
            std_radphi: default_std_radphi(),
            std_radrd: default_std_radrd(),
        }
    }
}

impl FilterConfig {
    /// Reject non-finite or non-positive standard deviations.
    pub fn validate(&self) -> Result<(), FilterError> {
        let fields = [
            ("std_a", self.std_a),
            ("std_yawdd", self.std_yawdd),
            ("std_laspx", self.std_laspx),
            ("std_laspy", self.std_laspy),
            ("std_radr", self.std_radr),
            ("std_radphi", self.std_radphi),
            ("std_radrd", self.std_radrd),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value <= 0.0 {
                return Err(FilterError::InvalidConfig(format!(
                    "{} must be a positive finite standard deviation, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
    pub fn laser_model(&self) -> LaserModel {
        LaserModel::new(self.std_laspx, self.std_laspy)
    }
    pub fn radar_model(&self) -> RadarModel {
        RadarModel::new(self.std_radr, self.std_radphi, self.std_radrd)
    }
}

/// File I/O shared by the serializable configuration types.
///
/// The format is picked from the extension: `.toml` or `.json`.
pub trait ConfigFile: Serialize + for<'de> Deserialize<'de> + Sized {
    /// Write the configuration as TOML.
    fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    /// Read the configuration from TOML.
    fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }
    /// Write the configuration to a JSON file (pretty-printed).
    fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
    /// Read the configuration from a JSON file.
    fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }
    /// Generic write: choose format by file extension (.json/.toml)
    fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("toml") => self.to_toml(p),
            _ => Err(unsupported(p)),
        }
    }
    /// Generic read: choose format by file extension (.json/.toml)
    fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(unsupported(p)),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!(
            "unsupported config extension for {}; use .toml or .json",
            path.display()
        ),
    )
}

impl ConfigFile for FilterConfig {}
