//! Locations of the Klipper and Katapult tooling on the host

use std::path::{Path, PathBuf};

use crate::{config::Settings, error::Error};

/// Paths to the checkouts and virtualenvs the flashing tools live in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub klipper_dir: PathBuf,
    pub katapult_dir: PathBuf,
}

impl Toolchain {
    pub fn new(klipper_dir: impl Into<PathBuf>, katapult_dir: impl Into<PathBuf>) -> Self {
        Self {
            klipper_dir: klipper_dir.into(),
            katapult_dir: katapult_dir.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.klipper_dir(), settings.katapult_dir())
    }

    pub fn klipper_scripts(&self) -> PathBuf {
        self.klipper_dir.join("scripts")
    }

    /// Katapult's flashing tool
    pub fn flashtool(&self) -> PathBuf {
        self.katapult_dir.join("scripts").join("flashtool.py")
    }

    /// Klipper's SD card flashing script
    pub fn sdcard_script(&self) -> PathBuf {
        self.klipper_scripts().join("flash-sdcard.sh")
    }

    /// Python from the `klippy-env` virtualenv next to the Klipper checkout
    pub fn klippy_python(&self) -> PathBuf {
        self.sibling_python("klippy-env")
    }

    /// Python from the `moonraker-env` virtualenv next to the Klipper checkout
    pub fn moonraker_python(&self) -> PathBuf {
        self.sibling_python("moonraker-env")
    }

    fn sibling_python(&self, env: &str) -> PathBuf {
        let candidate = self
            .klipper_dir
            .parent()
            .unwrap_or(Path::new("/"))
            .join(env)
            .join("bin")
            .join("python3");

        if candidate.exists() {
            candidate
        } else {
            PathBuf::from("python3")
        }
    }

    /// Fail with [Error::MissingTool] unless the path exists
    pub fn require(&self, path: PathBuf) -> Result<PathBuf, Error> {
        if path.exists() {
            Ok(path)
        } else {
            Err(Error::MissingTool(path))
        }
    }
}
