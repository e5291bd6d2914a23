//! Command-line plumbing for the `kflash` binary
//!
//! No stability guarantees apply

use std::{path::PathBuf, time::Duration};

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use miette::{miette, Result, WrapErr};

use self::operator::TerminalOperator;
use crate::{
    batch::render_summary,
    config::{ConfigDir, Settings},
    device::{
        BootloaderMethod, FlashMethod, Registration, Role, Transport, DEFAULT_CAN_INTERFACE,
    },
    discovery::SerialById,
    error::Error,
    firmware::{Firmware, FirmwareProvider, MakeBuilder, Prebuilt},
    host::{Host, Interrupt, SystemClock},
    pipeline::{Pipeline, Report},
    process::SystemRunner,
    registry::{FileRegistry, Registry},
    service::{Restart, Systemctl},
    status::{safety_gate, Moonraker},
    tools::Toolchain,
};

pub mod inventory;
pub mod operator;

/// Flash a single registered device
#[derive(Debug, Args)]
pub struct FlashArgs {
    /// Registry key of the device
    pub key: String,
    /// Flash this image instead of building one
    #[arg(long, value_name = "PATH")]
    pub firmware: Option<PathBuf>,
    /// Flash even while a print is running
    #[arg(long)]
    pub force: bool,
}

/// Flash every registered device that is not excluded
#[derive(Debug, Args)]
pub struct FlashAllArgs {
    /// Flash even while a print is running
    #[arg(long)]
    pub force: bool,
}

/// Register a device
#[derive(Debug, Args)]
pub struct AddArgs {
    /// Registry key: lowercase letters, digits, `-` and `_`
    pub key: String,
    /// Display name
    #[arg(long)]
    pub name: String,
    /// MCU type, e.g. `stm32h723` or `rp2040`
    #[arg(long)]
    pub mcu: String,
    /// Glob matched against /dev/serial/by-id, e.g. `usb-Klipper_stm32h723xx_29001A*`
    #[arg(long, required_unless_present = "can_uuid", conflicts_with = "can_uuid")]
    pub serial_pattern: Option<String>,
    /// 12 hex digit Katapult UUID of a CAN node
    #[arg(long)]
    pub can_uuid: Option<String>,
    /// CAN interface the node is on [default: can0]
    #[arg(long, requires = "can_uuid")]
    pub can_interface: Option<String>,
    /// How the board enters its bootloader
    #[arg(long, value_enum)]
    pub bootloader: BootloaderMethod,
    /// How firmware is transferred
    #[arg(long, value_enum)]
    pub flash: FlashMethod,
    /// Baud rate for serial bootloader entry
    #[arg(long)]
    pub baud: Option<u32>,
    /// Mount point of the UF2 volume
    #[arg(long, value_name = "PATH")]
    pub uf2_mount: Option<PathBuf>,
    /// Board name understood by flash-sdcard.sh
    #[arg(long)]
    pub sdcard_board: Option<String>,
    /// Position in the CAN flashing order
    #[arg(long, value_enum)]
    pub role: Option<Role>,
    #[arg(long)]
    pub notes: Option<String>,
    /// Register the device but leave it out of `flash-all`
    #[arg(long)]
    pub exclude: bool,
}

/// Remove a registered device
#[derive(Debug, Args)]
pub struct RemoveArgs {
    /// Registry key of the device
    pub key: String,
}

/// Loaded configuration shared by every command
pub struct Session {
    pub dir: ConfigDir,
    pub settings: Settings,
    pub tools: Toolchain,
    pub registry: FileRegistry,
    pub interrupt: Interrupt,
}

impl Session {
    pub fn open(config_dir: Option<PathBuf>, interrupt: Interrupt) -> Result<Self> {
        let dir = ConfigDir::locate(config_dir)?;
        let settings = Settings::load(&dir)?;
        let tools = Toolchain::from_settings(&settings);
        let registry = FileRegistry::new(dir.registry_path());

        Ok(Self {
            dir,
            settings,
            tools,
            registry,
            interrupt,
        })
    }
}

/// Shows a spinner while the wrapped provider works
struct Spinning<'a>(&'a dyn FirmwareProvider);

impl FirmwareProvider for Spinning<'_> {
    fn validate(&self, registration: &Registration) -> Result<(), Error> {
        self.0.validate(registration)
    }

    fn provide(&self, registration: &Registration) -> Result<Firmware, Error> {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed}]") {
            spinner.set_style(style);
        }
        spinner.set_message(format!("Preparing firmware for '{}'", registration.key));
        spinner.enable_steady_tick(Duration::from_millis(120));

        let firmware = self.0.provide(registration);
        match &firmware {
            Ok(firmware) => spinner.finish_with_message(format!(
                "Firmware ready: {} ({:.1} KiB)",
                firmware.file_name(),
                firmware.size as f64 / 1024.0
            )),
            Err(_) => spinner.abandon_with_message(format!(
                "No firmware for '{}'",
                registration.key
            )),
        }
        firmware
    }
}

/// Stopping the service needs sudo without a password prompt
fn require_sudo(systemctl: &Systemctl<'_>) -> Result<()> {
    if systemctl.verify_passwordless_sudo() {
        Ok(())
    } else {
        Err(miette!(
            help = "Add a sudoers rule allowing `systemctl stop` and `systemctl start` without a password",
            "Passwordless sudo is required to stop and start the Klipper service"
        ))
    }
}

fn conclude(report: Report) -> Result<()> {
    println!("{}", render_summary(&report));

    if let Some(service) = &report.service {
        if let Restart::Failed(_) = service.restart {
            return Err(miette!(
                help = format!("Start it by hand with `sudo systemctl start {}`", service.service),
                "{service}"
            ));
        }
    }

    let failed = report.failed();
    let total = report.results.len();
    match report.results.into_iter().find_map(|result| result.error) {
        None => Ok(()),
        Some(err) if total == 1 => Err(err.into()),
        Some(_) => Err(miette!("{failed} of {total} device(s) failed")),
    }
}

pub fn flash(args: FlashArgs, session: &Session) -> Result<()> {
    let moonraker = Moonraker::new(&session.settings.moonraker_url);
    safety_gate(&moonraker, args.force)?;

    let runner = SystemRunner;
    let systemctl = Systemctl::new(&runner, &session.settings.service);
    require_sudo(&systemctl)?;

    let provider: Box<dyn FirmwareProvider + '_> = match args.firmware {
        Some(path) => Box::new(Prebuilt::new(path)),
        None => Box::new(MakeBuilder::new(&runner, &session.tools, session.dir.clone())?),
    };
    let firmware = Spinning(provider.as_ref());

    let endpoints = SerialById::default();
    let clock = SystemClock;
    let host = Host::new(&endpoints, &runner, &clock).with_interrupt(session.interrupt.clone());
    let operator = TerminalOperator::new(session.interrupt.clone());

    let report = Pipeline::new(&host, &session.tools, &session.registry, &systemctl, &firmware)
        .with_stagger(session.settings.stagger(), session.settings.can_stagger())
        .with_status(&moonraker)
        .flash_one(&args.key, Some(&operator))
        .wrap_err_with(|| format!("Failed to flash '{}'", args.key))?;

    conclude(report)
}

pub fn flash_all(args: FlashAllArgs, session: &Session) -> Result<()> {
    let moonraker = Moonraker::new(&session.settings.moonraker_url);
    safety_gate(&moonraker, args.force)?;

    let runner = SystemRunner;
    let systemctl = Systemctl::new(&runner, &session.settings.service);
    require_sudo(&systemctl)?;

    let builder = MakeBuilder::new(&runner, &session.tools, session.dir.clone())?;
    let firmware = Spinning(&builder);

    let endpoints = SerialById::default();
    let clock = SystemClock;
    let host = Host::new(&endpoints, &runner, &clock).with_interrupt(session.interrupt.clone());
    let operator = TerminalOperator::new(session.interrupt.clone());

    let report = Pipeline::new(&host, &session.tools, &session.registry, &systemctl, &firmware)
        .with_stagger(session.settings.stagger(), session.settings.can_stagger())
        .with_status(&moonraker)
        .flash_all(Some(&operator))?;

    if report.results.is_empty() {
        println!("Nothing to flash");
        return Ok(());
    }
    conclude(report)
}

pub fn add(args: AddArgs, session: &Session) -> Result<()> {
    let can_interface = args.can_interface.or_else(|| {
        args.can_uuid
            .as_ref()
            .map(|_| DEFAULT_CAN_INTERFACE.to_string())
    });
    let transport = Transport::from_parts(args.serial_pattern, args.can_uuid, can_interface)?;

    let mut registration = Registration::new(&args.key, args.name, args.mcu, transport)
        .with_methods(args.bootloader, args.flash);
    registration.bootloader_baud = args.baud;
    registration.uf2_mount_path = args.uf2_mount;
    registration.sdcard_board = args.sdcard_board;
    registration.role = args.role;
    registration.notes = args.notes;
    registration.flashable = !args.exclude;

    registration
        .validate()
        .wrap_err_with(|| format!("'{}' cannot be flashed as configured", args.key))?;
    session.registry.add(registration)?;
    println!("Registered '{}'", args.key);

    let build_config = session.dir.build_config(&args.key);
    if !build_config.is_file() {
        println!(
            "Copy a Klipper `.config` for this board to {} before flashing",
            build_config.display()
        );
    }

    Ok(())
}

pub fn remove(args: RemoveArgs, session: &Session) -> Result<()> {
    if session.registry.remove(&args.key)? {
        println!("Removed '{}'", args.key);
        Ok(())
    } else {
        Err(Error::UnknownDevice(args.key).into())
    }
}
