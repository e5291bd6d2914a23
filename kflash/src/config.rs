//! Global settings and the configuration directory
//!
//! Everything kflash persists lives in one directory, by default the
//! platform configuration directory (`~/.config/kflash` on Linux):
//!
//! - `kflash.toml`: global [Settings]
//! - `devices.toml`: the device registry
//! - `configs/<key>/.config`: cached Klipper build configuration per device

use std::{
    fs::{create_dir_all, read_to_string},
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use directories::{BaseDirs, ProjectDirs};
use log::debug;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::Error;

const SETTINGS_FILE: &str = "kflash.toml";
const REGISTRY_FILE: &str = "devices.toml";

/// The directory holding all persisted state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDir {
    root: PathBuf,
}

impl ConfigDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Use `explicit` when given, the platform configuration directory
    /// otherwise
    pub fn locate(explicit: Option<PathBuf>) -> Result<Self, Error> {
        if let Some(root) = explicit {
            return Ok(Self::new(root));
        }

        let dirs = ProjectDirs::from("", "", "kflash").ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "could not determine the home directory",
            ))
        })?;
        Ok(Self::new(dirs.config_dir()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    /// Cached Klipper `.config` for a device
    pub fn build_config(&self, key: &str) -> PathBuf {
        self.root.join("configs").join(key).join(".config")
    }
}

/// Global settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Klipper checkout, `~` is expanded
    pub klipper_dir: String,
    /// Katapult checkout, `~` is expanded
    pub katapult_dir: String,
    /// Seconds to let USB settle after a board re-enumerates
    pub stagger_delay: f64,
    /// Seconds to let the bus settle between CAN nodes
    pub can_stagger_delay: f64,
    /// Moonraker API base URL
    pub moonraker_url: String,
    /// systemd unit running Klipper
    pub service: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            klipper_dir: "~/klipper".into(),
            katapult_dir: "~/katapult".into(),
            stagger_delay: 2.0,
            can_stagger_delay: 5.0,
            moonraker_url: "http://localhost:7125".into(),
            service: "klipper".into(),
        }
    }
}

impl Settings {
    /// Load settings, falling back to defaults when the file does not exist
    pub fn load(dir: &ConfigDir) -> Result<Self, Error> {
        let path = dir.settings_path();
        let settings = match read_to_string(&path) {
            Ok(data) => toml::from_str(&data).map_err(|source| Error::Parse {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Settings::default(),
            Err(err) => return Err(err.into()),
        };

        debug!("Settings: {settings:#?}");
        Ok(settings)
    }

    pub fn save(&self, dir: &ConfigDir) -> Result<(), Error> {
        write_toml(self, &dir.settings_path())
    }

    pub fn klipper_dir(&self) -> PathBuf {
        expand_home(&self.klipper_dir)
    }

    pub fn katapult_dir(&self) -> PathBuf {
        expand_home(&self.katapult_dir)
    }

    pub fn stagger(&self) -> Duration {
        seconds(self.stagger_delay)
    }

    pub fn can_stagger(&self) -> Duration {
        seconds(self.can_stagger_delay)
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Expand a leading `~` to the user's home directory
pub fn expand_home(path: &str) -> PathBuf {
    let home = || BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf());

    if path == "~" {
        if let Some(home) = home() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home() {
            return home.join(rest);
        }
    }

    PathBuf::from(path)
}

/// Serialize `value` to `path`, creating parent directories as needed. The
/// file is replaced atomically, so readers never see a partial write.
pub(crate) fn write_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), Error> {
    let serialized = toml::to_string(value)?;

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    create_dir_all(parent)?;

    let mut staged = NamedTempFile::new_in(parent)?;
    staged.write_all(serialized.as_bytes())?;
    staged.persist(path).map_err(|err| Error::Io(err.error))?;
    Ok(())
}
