//! Registered devices and the strategies used to flash them
//!
//! A [Registration] is the persistent description of one physical board. It
//! always carries exactly one [Transport] identity: a glob pattern matched
//! against `/dev/serial/by-id`, or a CAN bus UUID. The bootloader entry and
//! flash transfer strategies are stored as raw tags and only parsed when the
//! device is about to be flashed, so an unknown tag fails that device alone
//! rather than the whole registry.

use std::{path::PathBuf, str::FromStr, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, VariantNames};

use crate::error::Error;

/// Default CAN interface when a registration does not name one
pub const DEFAULT_CAN_INTERFACE: &str = "can0";

/// Baud rates accepted for serial Katapult entry
pub const SUPPORTED_BAUD_RATES: &[u32] = &[250_000];

static KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").unwrap());
static CAN_UUID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9a-f]{12}$").unwrap());
static CAN_INTERFACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^can\d+$").unwrap());

/// How a board is forced from its application into its bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, VariantNames)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[cfg_attr(feature = "cli", value(rename_all = "snake_case"))]
#[strum(serialize_all = "snake_case")]
pub enum BootloaderMethod {
    /// Toggle the USB interface through Klipper's `flash_usb` helper
    Usb,
    /// Reset request through Katapult's `flashtool.py` over the serial port
    Serial,
    /// The operator puts the board into its bootloader by hand
    Manual,
    /// The board is flashed from its current mode
    None,
    /// Reset request through `flashtool.py` on a CAN interface
    Can,
}

/// How firmware is transferred once the board is in its bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, VariantNames)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[cfg_attr(feature = "cli", value(rename_all = "snake_case"))]
#[strum(serialize_all = "snake_case")]
pub enum FlashMethod {
    /// `flashtool.py -d <device> -f <firmware>`
    Katapult,
    /// `flashtool.py -i <interface> -u <uuid> -f <firmware>`
    KatapultCan,
    /// `make FLASH_DEVICE=<device> flash`
    MakeFlash,
    /// Klipper's `flash-sdcard.sh <device> <board>`
    FlashSdcard,
    /// Copy the image onto a UF2 mass storage volume
    #[strum(serialize = "uf2_mount")]
    #[cfg_attr(feature = "cli", value(name = "uf2_mount"))]
    Uf2Mount,
}

/// Position of a CAN node in the flashing order
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    /// Flashed first; depends on a bridge that must stay up until it is done
    Toolhead,
    /// Flashed last; other CAN nodes reach the host through it
    Bridge,
}

/// Bootloader/flash combinations that are known to work, together with the
/// fields each combination needs
const COMPATIBLE_PAIRS: &[(BootloaderMethod, FlashMethod, &[&str])] = &[
    (BootloaderMethod::Usb, FlashMethod::Katapult, &[]),
    (BootloaderMethod::Usb, FlashMethod::MakeFlash, &[]),
    (BootloaderMethod::Serial, FlashMethod::Katapult, &["bootloader_baud"]),
    (
        BootloaderMethod::Can,
        FlashMethod::KatapultCan,
        &["canbus_uuid", "canbus_interface"],
    ),
    (BootloaderMethod::Manual, FlashMethod::MakeFlash, &[]),
    (BootloaderMethod::Manual, FlashMethod::Uf2Mount, &["uf2_mount_path"]),
    (BootloaderMethod::Manual, FlashMethod::Katapult, &[]),
    (BootloaderMethod::None, FlashMethod::FlashSdcard, &["sdcard_board"]),
    (BootloaderMethod::None, FlashMethod::MakeFlash, &[]),
];

/// The single transport identity of a registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Matched against `/dev/serial/by-id` filenames
    Usb { pattern: String },
    /// Addressed on a CAN bus through Katapult
    Can {
        uuid: String,
        interface: Option<String>,
    },
}

impl Transport {
    /// Build a transport from optional user input, enforcing that exactly one
    /// identity is given. Blank strings count as absent.
    pub fn from_parts(
        serial_pattern: Option<String>,
        canbus_uuid: Option<String>,
        canbus_interface: Option<String>,
    ) -> Result<Self, Error> {
        let present = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        match (present(serial_pattern), present(canbus_uuid)) {
            (Some(_), Some(_)) => Err(Error::BothTransports),
            (None, None) => Err(Error::NoTransport),
            (Some(pattern), None) => Ok(Transport::Usb { pattern }),
            (None, Some(uuid)) => {
                let interface = present(canbus_interface);
                if let Some(interface) = &interface {
                    validate_can_interface(interface)?;
                }

                Ok(Transport::Can {
                    uuid: validate_can_uuid(&uuid)?,
                    interface,
                })
            }
        }
    }

    pub fn is_can(&self) -> bool {
        matches!(self, Transport::Can { .. })
    }
}

/// A registered board
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Unique registry key
    pub key: String,
    /// Display name
    pub name: String,
    /// Declared MCU type, e.g. `stm32h723`
    pub mcu: String,
    pub transport: Transport,
    /// Raw bootloader strategy tag
    pub bootloader_method: Option<String>,
    /// Raw flash strategy tag
    pub flash_method: Option<String>,
    pub bootloader_baud: Option<u32>,
    pub uf2_mount_path: Option<PathBuf>,
    pub sdcard_board: Option<String>,
    /// Excluded devices are never flashed
    pub flashable: bool,
    pub notes: Option<String>,
    pub role: Option<Role>,
    /// ISO-8601 timestamp of the last successful flash
    pub last_flash: Option<String>,
}

impl Registration {
    /// A flashable registration with no strategies configured yet
    pub fn new(
        key: impl Into<String>,
        name: impl Into<String>,
        mcu: impl Into<String>,
        transport: Transport,
    ) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            mcu: mcu.into(),
            transport,
            bootloader_method: None,
            flash_method: None,
            bootloader_baud: None,
            uf2_mount_path: None,
            sdcard_board: None,
            flashable: true,
            notes: None,
            role: None,
            last_flash: None,
        }
    }

    /// Set both strategy tags
    pub fn with_methods(mut self, bootloader: BootloaderMethod, flash: FlashMethod) -> Self {
        self.bootloader_method = Some(bootloader.to_string());
        self.flash_method = Some(flash.to_string());
        self
    }

    pub fn is_can(&self) -> bool {
        self.transport.is_can()
    }

    pub fn serial_pattern(&self) -> Option<&str> {
        match &self.transport {
            Transport::Usb { pattern } => Some(pattern),
            Transport::Can { .. } => None,
        }
    }

    pub fn can_uuid(&self) -> Option<&str> {
        match &self.transport {
            Transport::Can { uuid, .. } => Some(uuid),
            Transport::Usb { .. } => None,
        }
    }

    /// The CAN interface, defaulting to `can0`
    pub fn can_interface(&self) -> Option<&str> {
        match &self.transport {
            Transport::Can { interface, .. } => {
                Some(interface.as_deref().unwrap_or(DEFAULT_CAN_INTERFACE))
            }
            Transport::Usb { .. } => None,
        }
    }

    /// Role only has a meaning for CAN nodes
    pub fn effective_role(&self) -> Option<Role> {
        if self.is_can() {
            self.role
        } else {
            None
        }
    }

    /// Parse the bootloader strategy tag
    pub fn bootloader(&self) -> Result<BootloaderMethod, Error> {
        let tag = self
            .bootloader_method
            .as_deref()
            .ok_or_else(|| Error::MissingBootloaderMethod(self.key.clone()))?;

        BootloaderMethod::from_str(tag).map_err(|_| Error::UnknownBootloaderMethod(tag.into()))
    }

    /// Parse the flash strategy tag
    pub fn flash(&self) -> Result<FlashMethod, Error> {
        let tag = self
            .flash_method
            .as_deref()
            .ok_or_else(|| Error::MissingFlashMethod(self.key.clone()))?;

        FlashMethod::from_str(tag).map_err(|_| Error::UnknownFlashMethod(tag.into()))
    }

    /// Check that this registration can be flashed as configured, returning
    /// the parsed strategies. Runs before any subprocess is started.
    pub fn validate(&self) -> Result<(BootloaderMethod, FlashMethod), Error> {
        let bootloader = self.bootloader()?;
        let flash = self.flash()?;

        let Some((_, _, required)) = COMPATIBLE_PAIRS
            .iter()
            .find(|(b, f, _)| *b == bootloader && *f == flash)
        else {
            return Err(Error::IncompatibleMethods {
                bootloader: bootloader.to_string(),
                flash: flash.to_string(),
            });
        };

        let is_can_pair =
            bootloader == BootloaderMethod::Can && flash == FlashMethod::KatapultCan;
        match &self.transport {
            Transport::Can { .. } if !is_can_pair => return Err(Error::CanMethodsRequired),
            Transport::Usb { .. } if bootloader == BootloaderMethod::Can => {
                return Err(Error::CanMethodOnUsb(bootloader.to_string()))
            }
            Transport::Usb { .. } if flash == FlashMethod::KatapultCan => {
                return Err(Error::CanMethodOnUsb(flash.to_string()))
            }
            _ => {}
        }

        for field in required.iter().copied() {
            if !self.has_field(field) {
                return Err(Error::MissingField {
                    method: format!("{bootloader}+{flash}"),
                    field,
                });
            }
        }

        if let Transport::Can { uuid, interface } = &self.transport {
            validate_can_uuid(uuid)?;
            if let Some(interface) = interface {
                validate_can_interface(interface)?;
            }
        }
        if let Some(baud) = self.bootloader_baud {
            validate_baud(baud)?;
        }

        Ok((bootloader, flash))
    }

    fn has_field(&self, field: &str) -> bool {
        let filled = |value: Option<&str>| value.is_some_and(|v| !v.trim().is_empty());

        match field {
            "bootloader_baud" => self.bootloader_baud.is_some(),
            "uf2_mount_path" => self.uf2_mount_path.is_some(),
            "sdcard_board" => filled(self.sdcard_board.as_deref()),
            "canbus_uuid" => filled(self.can_uuid()),
            "canbus_interface" => match &self.transport {
                Transport::Can { interface, .. } => filled(interface.as_deref()),
                Transport::Usb { .. } => false,
            },
            _ => false,
        }
    }
}

/// Validate a registry key
pub fn validate_key(key: &str) -> Result<(), Error> {
    if KEY_RE.is_match(key) {
        Ok(())
    } else {
        Err(Error::InvalidKey(key.into()))
    }
}

/// Validate a CAN UUID, returning it lowercased
pub fn validate_can_uuid(uuid: &str) -> Result<String, Error> {
    let normalized = uuid.trim().to_ascii_lowercase();
    if CAN_UUID_RE.is_match(&normalized) {
        Ok(normalized)
    } else {
        Err(Error::InvalidCanUuid(uuid.into()))
    }
}

pub fn validate_can_interface(interface: &str) -> Result<(), Error> {
    if CAN_INTERFACE_RE.is_match(interface) {
        Ok(())
    } else {
        Err(Error::InvalidCanInterface(interface.into()))
    }
}

pub fn validate_baud(baud: u32) -> Result<(), Error> {
    if SUPPORTED_BAUD_RATES.contains(&baud) {
        Ok(())
    } else {
        Err(Error::InvalidBaud(baud))
    }
}
