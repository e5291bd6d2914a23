//! Library and application errors

use std::{io, path::PathBuf, time::Duration};

use miette::Diagnostic;
use strum::{Display, VariantNames};
use thiserror::Error;

use crate::device::{BootloaderMethod, FlashMethod};

/// Coarse classification of an [Error], used for reporting and retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Category {
    /// Missing, invalid or incompatible registration fields
    Configuration,
    /// More than one endpoint claims the same identity
    Ambiguity,
    /// The device is not attached
    Disconnected,
    /// A polling deadline or subprocess timeout expired
    Timeout,
    /// An external tool exited unsuccessfully
    Transport,
    /// The device came back in an unexpected state
    Anomaly,
    /// Stopping or starting the supervising service failed
    Service,
    /// Firmware could not be produced
    Build,
    /// The device registry could not be read or written
    Registry,
    /// The printer is busy
    Busy,
    /// The operator aborted the operation
    Cancelled,
    /// Filesystem or other I/O failure
    Io,
}

/// All possible errors returned by kflash
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Device '{0}' has no bootloader_method configured")]
    #[diagnostic(
        code(kflash::config::missing_bootloader_method),
        help("Supported bootloader methods are: {}", BootloaderMethod::VARIANTS.join(", "))
    )]
    MissingBootloaderMethod(String),

    #[error("No flash_command configured for device '{0}'")]
    #[diagnostic(
        code(kflash::config::missing_flash_method),
        help("Supported flash methods are: {}", FlashMethod::VARIANTS.join(", "))
    )]
    MissingFlashMethod(String),

    #[error("Unknown bootloader method '{0}'")]
    #[diagnostic(
        code(kflash::config::unknown_bootloader_method),
        help("Supported bootloader methods are: {}", BootloaderMethod::VARIANTS.join(", "))
    )]
    UnknownBootloaderMethod(String),

    #[error("Unknown flash method '{0}'")]
    #[diagnostic(
        code(kflash::config::unknown_flash_method),
        help("Supported flash methods are: {}", FlashMethod::VARIANTS.join(", "))
    )]
    UnknownFlashMethod(String),

    #[error("Bootloader method '{bootloader}' cannot be combined with flash method '{flash}'")]
    #[diagnostic(
        code(kflash::config::incompatible_methods),
        help("Valid combinations are: usb+katapult, usb+make_flash, serial+katapult, can+katapult_can, \
              manual+make_flash, manual+uf2_mount, manual+katapult, none+flash_sdcard, none+make_flash")
    )]
    IncompatibleMethods { bootloader: String, flash: String },

    #[error("Device cannot have both serial_pattern and canbus_uuid")]
    #[diagnostic(code(kflash::config::both_transports))]
    BothTransports,

    #[error("Device must have either serial_pattern or canbus_uuid")]
    #[diagnostic(code(kflash::config::no_transport))]
    NoTransport,

    #[error("CAN devices must use bootloader method 'can' with flash method 'katapult_can'")]
    #[diagnostic(code(kflash::config::can_methods_required))]
    CanMethodsRequired,

    #[error("USB devices cannot use the CAN method '{0}'")]
    #[diagnostic(code(kflash::config::can_method_on_usb))]
    CanMethodOnUsb(String),

    #[error("CAN devices cannot use make_flash; configure Katapult CAN")]
    #[diagnostic(code(kflash::config::make_flash_on_can))]
    MakeFlashOnCan,

    #[error("'{method}' requires {field} to be configured")]
    #[diagnostic(code(kflash::config::missing_field))]
    MissingField { method: String, field: &'static str },

    #[error("Invalid CAN UUID '{0}'")]
    #[diagnostic(
        code(kflash::config::invalid_can_uuid),
        help("A CAN UUID is exactly 12 hexadecimal digits, for example 48ca7afe7a44")
    )]
    InvalidCanUuid(String),

    #[error("Invalid CAN interface '{0}'")]
    #[diagnostic(
        code(kflash::config::invalid_can_interface),
        help("CAN interface names look like can0, can1, ...")
    )]
    InvalidCanInterface(String),

    #[error("Unsupported bootloader baud rate {0}")]
    #[diagnostic(
        code(kflash::config::invalid_baud),
        help("Supported baud rates are: 250000")
    )]
    InvalidBaud(u32),

    #[error("Invalid device key '{0}'")]
    #[diagnostic(
        code(kflash::config::invalid_key),
        help("Keys start with a lowercase letter or digit and contain only lowercase letters, digits, '-' and '_'")
    )]
    InvalidKey(String),

    #[error("Required tool not found: {}", .0.display())]
    #[diagnostic(
        code(kflash::config::missing_tool),
        help("Check klipper_dir and katapult_dir in kflash.toml")
    )]
    MissingTool(PathBuf),

    #[error("Flash method '{0}' needs a device path but none was resolved")]
    #[diagnostic(code(kflash::config::no_endpoint))]
    NoEndpoint(String),

    #[error("CAN interface '{interface}' is not usable: {reason}")]
    #[diagnostic(
        code(kflash::config::can_interface),
        help("Bring the interface up, e.g. `sudo ip link set {interface} up type can bitrate 1000000`, \
              and set `txqueuelen 128` or higher")
    )]
    CanInterface { interface: String, reason: String },

    #[error("Manual bootloader entry needs an interactive terminal")]
    #[diagnostic(
        code(kflash::config::no_operator),
        help("Flash this device on its own with `kflash flash <key>`")
    )]
    NoOperator,

    #[error("Device '{0}' is marked as non-flashable")]
    #[diagnostic(
        code(kflash::config::excluded),
        help("Set `flashable = true` for this device in devices.toml to include it again")
    )]
    Excluded(String),

    #[error("Pattern matches multiple connected USB devices: {}", .matches.join(", "))]
    #[diagnostic(
        code(kflash::ambiguity::multiple_matches),
        help("Make the serial_pattern for '{pattern}' specific enough to match a single board")
    )]
    AmbiguousDevice {
        pattern: String,
        matches: Vec<String>,
    },

    #[error("USB path already targeted by prior device: {}", .0.display())]
    #[diagnostic(
        code(kflash::ambiguity::duplicate_path),
        help("Two registrations resolve to the same board; remove or correct one of them")
    )]
    DuplicatePath(PathBuf),

    #[error("Device not found on USB (pattern '{0}')")]
    #[diagnostic(
        code(kflash::disconnected),
        help("Check USB connection and board power, and list connected devices with `ls /dev/serial/by-id/`")
    )]
    NotConnected(String),

    #[error("Device did not leave its current mode within {}s", .0.as_secs())]
    #[diagnostic(
        code(kflash::timeout::never_left),
        help("The board never rebooted. Check the USB cable, or put the board into its bootloader by hand \
              and use the manual bootloader method")
    )]
    NeverLeft(Duration),

    #[error("Device did not reappear within {}s after a reset", .0.as_secs())]
    #[diagnostic(
        code(kflash::timeout::never_returned),
        help("Check kernel messages with `dmesg | tail -20` and try unplugging and replugging the board")
    )]
    NeverReturned(Duration),

    #[error("Timeout after {}s waiting for device", .0.as_secs())]
    #[diagnostic(
        code(kflash::timeout::verification),
        help("Check the USB cable, replug the board and look at `ls /dev/serial/by-id/`; \
              the board may need manual bootloader entry")
    )]
    VerifyTimeout(Duration),

    #[error("CAN device {uuid} did not report Klipper within {}s{}", .waited.as_secs(), last_seen(.last_application))]
    #[diagnostic(
        code(kflash::timeout::can_verification),
        help("Query the bus with `flashtool.py -i <interface> -q` and check the board's power and termination")
    )]
    CanVerifyTimeout {
        uuid: String,
        last_application: Option<String>,
        waited: Duration,
    },

    #[error("{tool} timed out after {}s", .timeout.as_secs())]
    #[diagnostic(code(kflash::timeout::command))]
    CommandTimeout { tool: String, timeout: Duration },

    #[error("No UF2 mount point appeared within {}s", .0.as_secs())]
    #[diagnostic(
        code(kflash::timeout::uf2_mount),
        help("Hold BOOTSEL while resetting the board and make sure the drive is auto-mounted, \
              or set uf2_mount_path")
    )]
    Uf2MountTimeout(Duration),

    #[error("{tool} exited with code {code}{}", detail_suffix(.detail))]
    #[diagnostic(
        code(kflash::transport::tool_failed),
        help("Power cycle the board with BOOT held, check `ls /dev/serial/by-id/ | grep -i katapult`, \
              then retry once the board is in its bootloader")
    )]
    ToolFailed {
        tool: String,
        code: i32,
        detail: String,
    },

    #[error("Failed to launch {tool}")]
    #[diagnostic(code(kflash::transport::launch))]
    Launch {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{last} (after {attempts} attempts)")]
    #[diagnostic(code(kflash::transport::retries_exhausted))]
    RetriesExhausted { attempts: u32, last: Box<Error> },

    #[error("Failed to copy firmware onto {}", .mount.display())]
    #[diagnostic(code(kflash::transport::uf2_copy))]
    Uf2Copy {
        mount: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Device in bootloader mode (katapult): {0}")]
    #[diagnostic(
        code(kflash::anomaly::still_in_bootloader),
        help("The flash may have failed. Check `ls /dev/serial/by-id/ | grep katapult` and flash again")
    )]
    StillInBootloader(String),

    #[error("Unexpected device prefix: {0}")]
    #[diagnostic(code(kflash::anomaly::unexpected_prefix))]
    UnexpectedPrefix(String),

    #[error("MCU mismatch: USB='{found}', registry='{expected}'")]
    #[diagnostic(
        code(kflash::anomaly::mcu_mismatch),
        help("Update the registered MCU if the board changed, or fix the serial_pattern")
    )]
    McuMismatch { found: String, expected: String },

    #[error("Failed to stop {service}{}", detail_suffix(.detail))]
    #[diagnostic(
        code(kflash::service::stop),
        help("Check `sudo systemctl status {service}` and verify passwordless sudo with `sudo -n true`")
    )]
    ServiceStop { service: String, detail: String },

    #[error("Failed to start {service}{}", detail_suffix(.detail))]
    #[diagnostic(
        code(kflash::service::start),
        help("Start it manually with `sudo systemctl start {service}` and check `sudo journalctl -u {service} -n 50`. \
              The firmware was flashed; the issue is the service, not the board")
    )]
    ServiceStart { service: String, detail: String },

    #[error("No cached build config for '{0}'")]
    #[diagnostic(
        code(kflash::build::missing_config),
        help("Run `make menuconfig` in your Klipper directory and save the result as the device's cached .config")
    )]
    MissingBuildConfig(String),

    #[error("Config MCU '{found}' does not match registered MCU '{expected}'")]
    #[diagnostic(
        code(kflash::build::config_mismatch),
        help("Verify the cached config with `grep CONFIG_MCU .config`")
    )]
    BuildConfigMismatch { found: String, expected: String },

    #[error("{step} failed{}", detail_suffix(.detail))]
    #[diagnostic(
        code(kflash::build::failed),
        help("Run `make menuconfig` in your Klipper directory, make sure the toolchain is installed, \
              then retry `make clean && make`")
    )]
    BuildFailed { step: String, detail: String },

    #[error("Build succeeded but firmware not found in {}", .0.display())]
    #[diagnostic(code(kflash::build::artifact_missing))]
    ArtifactMissing(PathBuf),

    #[error("Firmware file not found: {}", .0.display())]
    #[diagnostic(code(kflash::build::firmware_missing))]
    FirmwareMissing(PathBuf),

    #[error("Firmware file is empty: {}", .0.display())]
    #[diagnostic(code(kflash::build::firmware_empty))]
    FirmwareEmpty(PathBuf),

    #[error("No device registered with key '{0}'")]
    #[diagnostic(
        code(kflash::registry::unknown_device),
        help("List registered devices with `kflash list`; keys are case-sensitive")
    )]
    UnknownDevice(String),

    #[error("A device with key '{0}' is already registered")]
    #[diagnostic(code(kflash::registry::duplicate_device))]
    DuplicateDevice(String),

    #[error("Failed to parse {}", .path.display())]
    #[diagnostic(code(kflash::registry::parse))]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize configuration")]
    #[diagnostic(code(kflash::registry::serialize))]
    Serialize(#[from] toml::ser::Error),

    #[error("Cannot flash while the printer is {state}")]
    #[diagnostic(
        code(kflash::busy),
        help("Wait for the current print to complete or cancel it, or pass --force")
    )]
    PrinterBusy { state: String },

    #[error("Operation was cancelled by the user")]
    #[diagnostic(code(kflash::cancelled))]
    Cancelled,

    #[error(transparent)]
    #[diagnostic(code(kflash::io))]
    Io(#[from] io::Error),

    #[cfg(feature = "cli")]
    #[error(transparent)]
    #[diagnostic(code(kflash::dialoguer_error))]
    DialoguerError(#[from] dialoguer::Error),
}

fn detail_suffix(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {detail}")
    }
}

fn last_seen(application: &Option<String>) -> String {
    match application {
        Some(app) => format!(" (last seen running {app})"),
        None => String::new(),
    }
}

impl Error {
    /// The category this error belongs to
    pub fn category(&self) -> Category {
        use Error::*;

        match self {
            MissingBootloaderMethod(_)
            | MissingFlashMethod(_)
            | UnknownBootloaderMethod(_)
            | UnknownFlashMethod(_)
            | IncompatibleMethods { .. }
            | BothTransports
            | NoTransport
            | CanMethodsRequired
            | CanMethodOnUsb(_)
            | MakeFlashOnCan
            | MissingField { .. }
            | InvalidCanUuid(_)
            | InvalidCanInterface(_)
            | InvalidBaud(_)
            | InvalidKey(_)
            | MissingTool(_)
            | NoEndpoint(_)
            | CanInterface { .. }
            | NoOperator
            | Excluded(_) => Category::Configuration,
            AmbiguousDevice { .. } | DuplicatePath(_) => Category::Ambiguity,
            NotConnected(_) => Category::Disconnected,
            NeverLeft(_)
            | NeverReturned(_)
            | VerifyTimeout(_)
            | CanVerifyTimeout { .. }
            | CommandTimeout { .. }
            | Uf2MountTimeout(_) => Category::Timeout,
            ToolFailed { .. } | Launch { .. } | Uf2Copy { .. } => Category::Transport,
            RetriesExhausted { last, .. } => last.category(),
            StillInBootloader(_) | UnexpectedPrefix(_) | McuMismatch { .. } => Category::Anomaly,
            ServiceStop { .. } | ServiceStart { .. } => Category::Service,
            MissingBuildConfig(_)
            | BuildConfigMismatch { .. }
            | BuildFailed { .. }
            | ArtifactMissing(_)
            | FirmwareMissing(_)
            | FirmwareEmpty(_) => Category::Build,
            UnknownDevice(_) | DuplicateDevice(_) | Parse { .. } | Serialize(_) => {
                Category::Registry
            }
            PrinterBusy { .. } => Category::Busy,
            Cancelled => Category::Cancelled,
            Io(_) => Category::Io,
            #[cfg(feature = "cli")]
            DialoguerError(_) => Category::Io,
        }
    }

    /// Whether an interactive operator may be offered a second attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), Category::Timeout | Category::Transport)
    }

    /// One-line rendering with the category label, as shown in batch summaries
    pub fn summary(&self) -> String {
        format!("[{}] {self}", self.category())
    }
}
