//! Putting a board into its bootloader
//!
//! Every strategy except `none` and `can` follows the same protocol once its
//! mode-change request has been issued:
//!
//! 1. wait for the original `/dev/serial/by-id` entry to disappear, proving
//!    the board actually rebooted;
//! 2. wait for an entry with the same [DeviceSignature](crate::discovery::DeviceSignature) to appear, under
//!    whichever prefix the board now presents.
//!
//! Both phases share one deadline. Once the board is back, a stagger delay
//! lets the USB subsystem settle before anything else touches it.

use std::{process::Command, time::Duration};

use log::{debug, info};

use crate::{
    device::{BootloaderMethod, FlashMethod, Registration},
    discovery::Endpoint,
    error::Error,
    host::{Deadline, Host},
    operator::Operator,
    process::Output,
    tools::Toolchain,
};

/// Hard limit on the mode-change subprocess
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
/// Time allowed for the board to leave and come back
pub const REENUMERATION_TIMEOUT: Duration = Duration::from_secs(10);
/// Interval between endpoint listings while waiting
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Result of one bootloader entry attempt
#[derive(Debug)]
pub struct BootloaderOutcome {
    /// The endpoint now presented by the board; `None` for transports
    /// without a USB path, or when the flash method does not need one
    pub result: Result<Option<Endpoint>, Error>,
    pub elapsed: Duration,
}

impl BootloaderOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.result.as_ref().ok().and_then(Option::as_ref)
    }

    pub fn error(&self) -> Option<&Error> {
        self.result.as_ref().err()
    }
}

/// Drives registrations into their bootloader
pub struct BootloaderEntry<'a> {
    host: &'a Host<'a>,
    tools: &'a Toolchain,
    operator: Option<&'a dyn Operator>,
    stagger: Duration,
    reenumeration_timeout: Duration,
    poll_interval: Duration,
}

impl<'a> BootloaderEntry<'a> {
    pub fn new(host: &'a Host<'a>, tools: &'a Toolchain, stagger: Duration) -> Self {
        Self {
            host,
            tools,
            operator: None,
            stagger,
            reenumeration_timeout: REENUMERATION_TIMEOUT,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Operator used by the `manual` strategy
    pub fn with_operator(mut self, operator: Option<&'a dyn Operator>) -> Self {
        self.operator = operator;
        self
    }

    /// One attempt for `registration`, currently presenting as `endpoint`.
    /// Polling never runs past `ceiling` when one is given.
    pub fn enter(
        &self,
        registration: &Registration,
        endpoint: Option<&Endpoint>,
        ceiling: Option<Deadline>,
    ) -> BootloaderOutcome {
        let start = self.host.deadline(Duration::ZERO);
        let result = self.dispatch(registration, endpoint, ceiling);

        BootloaderOutcome {
            result,
            elapsed: start.elapsed(self.host.clock),
        }
    }

    fn dispatch(
        &self,
        registration: &Registration,
        endpoint: Option<&Endpoint>,
        ceiling: Option<Deadline>,
    ) -> Result<Option<Endpoint>, Error> {
        let method = registration.bootloader()?;
        debug!("Using {method} bootloader entry for '{}'", registration.key);

        match method {
            BootloaderMethod::Usb => self.usb(registration, endpoint, ceiling),
            BootloaderMethod::Serial => self.serial(registration, endpoint, ceiling),
            BootloaderMethod::Manual => self.manual(registration, endpoint, ceiling),
            BootloaderMethod::None => self.none(registration, endpoint),
            BootloaderMethod::Can => self.can(registration),
        }
    }

    /// Klipper's `flash_usb.enter_bootloader()` toggles the USB interface
    fn usb(
        &self,
        registration: &Registration,
        endpoint: Option<&Endpoint>,
        ceiling: Option<Deadline>,
    ) -> Result<Option<Endpoint>, Error> {
        let endpoint = required(registration, endpoint)?;
        let script = format!(
            "import sys; sys.path.insert(0, {}); from flash_usb import enter_bootloader; enter_bootloader({})",
            python_str(&self.tools.klipper_scripts().to_string_lossy()),
            python_str(&endpoint.path.to_string_lossy()),
        );

        let mut cmd = Command::new(self.tools.klippy_python());
        cmd.arg("-c").arg(script);

        // The board drops off the bus mid-call, so the exit status means nothing
        let exit = self.host.runner.run(&mut cmd, COMMAND_TIMEOUT, Output::Capture)?;
        debug!("USB bootloader request exited with {}", exit.code);

        self.await_reenumeration(endpoint, ceiling).map(Some)
    }

    /// Katapult's `flashtool.py -r` requests a reset over the serial port
    fn serial(
        &self,
        registration: &Registration,
        endpoint: Option<&Endpoint>,
        ceiling: Option<Deadline>,
    ) -> Result<Option<Endpoint>, Error> {
        let endpoint = required(registration, endpoint)?;
        let flashtool = self.tools.require(self.tools.flashtool())?;

        let mut cmd = Command::new(self.tools.moonraker_python());
        cmd.arg(flashtool).arg("-r").arg("-d").arg(&endpoint.path);

        let exit = self.host.runner.run(&mut cmd, COMMAND_TIMEOUT, Output::Capture)?;
        debug!("Serial bootloader request exited with {}", exit.code);

        self.await_reenumeration(endpoint, ceiling).map(Some)
    }

    /// The operator resets the board by hand
    fn manual(
        &self,
        registration: &Registration,
        endpoint: Option<&Endpoint>,
        ceiling: Option<Deadline>,
    ) -> Result<Option<Endpoint>, Error> {
        let operator = self.operator.ok_or(Error::NoOperator)?;
        operator.acknowledge(&format!(
            "Put '{}' into bootloader mode, then press Enter",
            registration.name
        ))?;
        self.host.interrupt.check()?;

        // A UF2 board comes back as a mass storage volume, not a serial port
        if registration.flash().ok() == Some(FlashMethod::Uf2Mount) {
            return Ok(None);
        }

        let endpoint = required(registration, endpoint)?;
        self.await_reenumeration(endpoint, ceiling).map(Some)
    }

    /// No mode change; the board must simply still be there
    fn none(
        &self,
        registration: &Registration,
        endpoint: Option<&Endpoint>,
    ) -> Result<Option<Endpoint>, Error> {
        let endpoint = required(registration, endpoint)?;
        self.host
            .endpoints
            .scan()
            .into_iter()
            .find(|listed| listed.filename == endpoint.filename)
            .map(Some)
            .ok_or_else(|| Error::NotConnected(endpoint.filename.clone()))
    }

    /// `flashtool.py -r` addressed to a CAN node; success is the tool's exit
    /// status since there is no USB identity to watch
    fn can(&self, registration: &Registration) -> Result<Option<Endpoint>, Error> {
        let uuid = registration.can_uuid().ok_or(Error::MissingField {
            method: BootloaderMethod::Can.to_string(),
            field: "canbus_uuid",
        })?;
        let interface = registration
            .can_interface()
            .unwrap_or(crate::device::DEFAULT_CAN_INTERFACE);
        let flashtool = self.tools.require(self.tools.flashtool())?;

        let mut cmd = Command::new("python3");
        cmd.arg(flashtool)
            .args(["-i", interface, "-r", "-u", uuid]);

        self.host
            .runner
            .run(&mut cmd, COMMAND_TIMEOUT, Output::Capture)?
            .into_result("flashtool.py")?;

        info!("CAN node {uuid} entered Katapult");
        self.host.pause(self.stagger)?;
        Ok(None)
    }

    /// The two-phase wait, followed by the stagger delay
    fn await_reenumeration(
        &self,
        original: &Endpoint,
        ceiling: Option<Deadline>,
    ) -> Result<Endpoint, Error> {
        let mut deadline = self.host.deadline(self.reenumeration_timeout);
        if let Some(ceiling) = ceiling {
            deadline = deadline.min(ceiling);
        }
        let waited = deadline.remaining(self.host.clock);

        debug!("Waiting for {} to disappear", original.filename);
        let gone = self.host.poll(deadline, self.poll_interval, || {
            let listing = self.host.endpoints.scan();
            (!listing.iter().any(|e| e.filename == original.filename)).then_some(())
        })?;
        if gone.is_none() {
            return Err(Error::NeverLeft(waited));
        }

        let signature = original.signature();
        debug!("Waiting for a device matching {signature:?}");
        let found = self.host.poll(deadline, self.poll_interval, || {
            let signature = signature.as_ref()?;
            self.host
                .endpoints
                .scan()
                .into_iter()
                .find(|e| e.signature().as_ref() == Some(signature))
        })?;
        let Some(found) = found else {
            return Err(Error::NeverReturned(waited));
        };

        info!("Device re-enumerated as {}", found.filename);
        self.host.pause(self.stagger)?;
        Ok(found)
    }

    #[cfg(test)]
    fn with_polling(mut self, timeout: Duration, interval: Duration) -> Self {
        self.reenumeration_timeout = timeout;
        self.poll_interval = interval;
        self
    }
}

fn required<'e>(
    registration: &Registration,
    endpoint: Option<&'e Endpoint>,
) -> Result<&'e Endpoint, Error> {
    endpoint.ok_or_else(|| {
        Error::NotConnected(registration.serial_pattern().unwrap_or(&registration.key).to_string())
    })
}

/// A single-quoted Python string literal
fn python_str(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}
