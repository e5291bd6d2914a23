//! The device registry
//!
//! Registrations are stored in `devices.toml`, one table per device:
//!
//! ```toml
//! [devices.octopus]
//! name = "Octopus Pro"
//! mcu = "stm32h723"
//! serial_pattern = "usb-Klipper_stm32h723xx_29001A*"
//! bootloader_method = "usb"
//! flash_command = "katapult"
//!
//! [[blocked_devices]]
//! pattern = "usb-Beacon_*"
//! reason = "probe, not flashable"
//! ```

use std::{
    collections::BTreeMap,
    fs::read_to_string,
    io,
    path::{Path, PathBuf},
};

use chrono::{Local, SecondsFormat};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    config::write_toml,
    device::{validate_key, Registration, Role, Transport},
    discovery::glob_matches,
    error::Error,
};

/// Endpoints matching `pattern` are never offered for registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedDevice {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BlockedDevice {
    pub fn matches(&self, filename: &str) -> bool {
        glob_matches(&self.pattern, filename)
    }
}

/// Persistent store of registrations
pub trait Registry {
    fn get(&self, key: &str) -> Result<Option<Registration>, Error>;

    /// Every registration, ordered by key
    fn list(&self) -> Result<Vec<Registration>, Error>;

    fn blocked(&self) -> Result<Vec<BlockedDevice>, Error>;

    /// Add a new registration; the key must be unused
    fn add(&self, registration: Registration) -> Result<(), Error>;

    /// Returns `false` when there was nothing to remove
    fn remove(&self, key: &str) -> Result<bool, Error>;

    /// Modify a registration in place. Returns `false` for an unknown key.
    fn update(&self, key: &str, change: &mut dyn FnMut(&mut Registration)) -> Result<bool, Error>;

    /// Stamp a successful flash with the current local time
    fn record_flash(&self, key: &str) -> Result<bool, Error> {
        let now = Local::now().to_rfc3339_opts(SecondsFormat::Secs, false);
        self.update(key, &mut |registration: &mut Registration| {
            registration.last_flash = Some(now.clone())
        })
    }
}

/// The on-disk shape of a registration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawDevice {
    name: String,
    mcu: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    serial_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    canbus_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    canbus_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bootloader_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    flash_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bootloader_baud: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uf2_mount_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdcard_board: Option<String>,
    #[serde(default = "flashable_default")]
    flashable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_flash_timestamp: Option<String>,
}

fn flashable_default() -> bool {
    true
}

impl RawDevice {
    fn into_registration(self, key: &str) -> Result<Registration, Error> {
        let transport =
            Transport::from_parts(self.serial_pattern, self.canbus_uuid, self.canbus_interface)?;

        Ok(Registration {
            key: key.to_string(),
            name: self.name,
            mcu: self.mcu,
            transport,
            bootloader_method: self.bootloader_method,
            flash_method: self.flash_command,
            bootloader_baud: self.bootloader_baud,
            uf2_mount_path: self.uf2_mount_path,
            sdcard_board: self.sdcard_board,
            flashable: self.flashable,
            notes: self.notes,
            role: self.role,
            last_flash: self.last_flash_timestamp,
        })
    }
}

impl From<Registration> for RawDevice {
    fn from(registration: Registration) -> Self {
        let (serial_pattern, canbus_uuid, canbus_interface) = match registration.transport {
            Transport::Usb { pattern } => (Some(pattern), None, None),
            Transport::Can { uuid, interface } => (None, Some(uuid), interface),
        };

        Self {
            name: registration.name,
            mcu: registration.mcu,
            serial_pattern,
            canbus_uuid,
            canbus_interface,
            bootloader_method: registration.bootloader_method,
            flash_command: registration.flash_method,
            bootloader_baud: registration.bootloader_baud,
            uf2_mount_path: registration.uf2_mount_path,
            sdcard_board: registration.sdcard_board,
            flashable: registration.flashable,
            notes: registration.notes,
            role: registration.role,
            last_flash_timestamp: registration.last_flash,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    devices: BTreeMap<String, RawDevice>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    blocked_devices: Vec<BlockedDevice>,
}

/// [Registry] backed by a TOML file, re-read on every call
#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<RegistryFile, Error> {
        match read_to_string(&self.path) {
            Ok(data) => toml::from_str(&data).map_err(|source| Error::Parse {
                path: self.path.clone(),
                source,
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("No registry at {}, starting empty", self.path.display());
                Ok(RegistryFile::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, file: &RegistryFile) -> Result<(), Error> {
        write_toml(file, &self.path)
    }
}

impl Registry for FileRegistry {
    fn get(&self, key: &str) -> Result<Option<Registration>, Error> {
        self.load()?
            .devices
            .remove(key)
            .map(|raw| raw.into_registration(key))
            .transpose()
    }

    fn list(&self) -> Result<Vec<Registration>, Error> {
        self.load()?
            .devices
            .into_iter()
            .map(|(key, raw)| raw.into_registration(&key))
            .collect()
    }

    fn blocked(&self) -> Result<Vec<BlockedDevice>, Error> {
        Ok(self.load()?.blocked_devices)
    }

    fn add(&self, registration: Registration) -> Result<(), Error> {
        validate_key(&registration.key)?;

        let mut file = self.load()?;
        if file.devices.contains_key(&registration.key) {
            return Err(Error::DuplicateDevice(registration.key));
        }

        file.devices
            .insert(registration.key.clone(), registration.into());
        self.save(&file)
    }

    fn remove(&self, key: &str) -> Result<bool, Error> {
        let mut file = self.load()?;
        if file.devices.remove(key).is_none() {
            return Ok(false);
        }

        self.save(&file)?;
        Ok(true)
    }

    fn update(&self, key: &str, change: &mut dyn FnMut(&mut Registration)) -> Result<bool, Error> {
        let mut file = self.load()?;
        let Some(raw) = file.devices.remove(key) else {
            return Ok(false);
        };

        let mut registration = raw.into_registration(key)?;
        change(&mut registration);
        // The key is the table name; renames are not updates
        registration.key = key.to_string();

        file.devices.insert(key.to_string(), registration.into());
        self.save(&file)?;
        Ok(true)
    }
}
