//! The per-device flashing pipeline
//!
//! ```text
//! validate -> build -> locate -> [stop service] -> bootloader -> flash -> verify -> [restart service]
//! ```
//!
//! Everything up to locating the device happens with the service still
//! running. The hardware phases run inside a [ServiceGuard].

use std::{path::PathBuf, time::Duration};

use log::{debug, info, warn};

use crate::{
    bootloader::BootloaderEntry,
    device::{BootloaderMethod, FlashMethod, Registration, Transport, DEFAULT_CAN_INTERFACE},
    discovery::{check_can_interface, extract_mcu, resolve, Endpoint, SYSFS_NET},
    error::Error,
    firmware::{Firmware, FirmwareProvider},
    flasher::Flasher,
    host::Host,
    operator::{confirm, Operator},
    registry::Registry,
    service::{ServiceGuard, ServiceManager, ServiceState},
    status::StatusSource,
    tools::Toolchain,
    verify::{verify_can, verify_usb},
    version::{firmware_version, host_version, is_downgrade, is_dirty},
};

/// Upper bound on bootloader entry for one device, retries included
pub const BOOTLOADER_CEILING: Duration = Duration::from_secs(60);

/// How far one device got, phase by phase
#[derive(Debug)]
pub struct DeviceResult {
    pub key: String,
    pub name: String,
    /// Registration and cached build config are usable
    pub config_ok: bool,
    pub built: bool,
    pub bootloader_ok: bool,
    pub flashed: bool,
    pub verified: bool,
    pub error: Option<Error>,
    /// A bootloader or flash command was issued for this device
    pub touched_hardware: bool,
}

impl DeviceResult {
    pub fn new(registration: &Registration) -> Self {
        Self {
            key: registration.key.clone(),
            name: registration.name.clone(),
            config_ok: false,
            built: false,
            bootloader_ok: false,
            flashed: false,
            verified: false,
            error: None,
            touched_hardware: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.verified
    }

    pub(crate) fn fail(&mut self, err: Error) {
        warn!("'{}': {}", self.key, err.summary());
        self.error = Some(err);
    }
}

/// Outcome of a single-device or batch run
#[derive(Debug)]
pub struct Report {
    pub results: Vec<DeviceResult>,
    /// `None` when no device reached the hardware phases
    pub service: Option<ServiceState>,
}

impl Report {
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.passed()
    }

    /// Every device succeeded and the service came back
    pub fn is_success(&self) -> bool {
        self.failed() == 0
            && !self
                .service
                .as_ref()
                .is_some_and(ServiceState::restart_failed)
    }
}

/// Everything the pipeline needs, wired together once per run
pub struct Pipeline<'a> {
    pub(crate) host: &'a Host<'a>,
    pub(crate) tools: &'a Toolchain,
    pub(crate) registry: &'a dyn Registry,
    pub(crate) service: &'a dyn ServiceManager,
    pub(crate) firmware: &'a dyn FirmwareProvider,
    pub(crate) stagger: Duration,
    pub(crate) can_stagger: Duration,
    pub(crate) sysfs: PathBuf,
    /// Running firmware versions; no version checks without it
    pub(crate) status: Option<&'a dyn StatusSource>,
    uf2_roots: Option<Vec<PathBuf>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        host: &'a Host<'a>,
        tools: &'a Toolchain,
        registry: &'a dyn Registry,
        service: &'a dyn ServiceManager,
        firmware: &'a dyn FirmwareProvider,
    ) -> Self {
        Self {
            host,
            tools,
            registry,
            service,
            firmware,
            stagger: Duration::from_secs(2),
            can_stagger: Duration::from_secs(5),
            sysfs: PathBuf::from(SYSFS_NET),
            status: None,
            uf2_roots: None,
        }
    }

    /// Settle time after re-enumeration, and between CAN nodes in a batch
    pub fn with_stagger(mut self, usb: Duration, can: Duration) -> Self {
        self.stagger = usb;
        self.can_stagger = can;
        self
    }

    /// Where network interfaces are listed, `/sys/class/net` by default
    pub fn with_sysfs(mut self, sysfs: impl Into<PathBuf>) -> Self {
        self.sysfs = sysfs.into();
        self
    }

    /// Compare the host's Klipper version with what the MCUs run before
    /// flashing
    pub fn with_status(mut self, status: &'a dyn StatusSource) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_uf2_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.uf2_roots = Some(roots);
        self
    }

    /// Flash one registered device.
    ///
    /// Failures before the service is stopped (unknown device, invalid
    /// configuration, build errors, device absent) are returned as errors.
    /// Once the hardware phases start, failures are recorded in the report
    /// alongside the service restart outcome.
    pub fn flash_one(&self, key: &str, operator: Option<&dyn Operator>) -> Result<Report, Error> {
        let registration = self
            .registry
            .get(key)?
            .ok_or_else(|| Error::UnknownDevice(key.into()))?;
        if !registration.flashable {
            return Err(Error::Excluded(key.into()));
        }

        let mut result = DeviceResult::new(&registration);
        registration.validate()?;
        self.firmware.validate(&registration)?;
        result.config_ok = true;
        self.check_version(&registration, operator);

        let firmware = self.firmware.provide(&registration)?;
        result.built = true;

        let endpoint = self.locate(&registration)?;
        if let Some(endpoint) = &endpoint {
            if let Err(mismatch) = check_mcu(&registration, endpoint) {
                caution(operator, &mismatch.to_string());
                if !confirm(operator, "Flash anyway?", false)? {
                    return Err(mismatch);
                }
            }
        }

        let guard = ServiceGuard::acquire(self.service)?;
        if let Err(err) = self.run_hardware(
            &registration,
            endpoint.as_ref(),
            &firmware,
            operator,
            true,
            &mut result,
        ) {
            result.fail(err);
        }

        Ok(Report {
            results: vec![result],
            service: Some(guard.release()),
        })
    }

    /// Warn about a dirty Klipper checkout, or when flashing would take the
    /// MCU back to an older version. Never blocks.
    fn check_version(&self, registration: &Registration, operator: Option<&dyn Operator>) {
        let Some(status) = self.status else {
            return;
        };
        let Some(host) = host_version(self.host, self.tools) else {
            debug!("Host Klipper version unknown, skipping version checks");
            return;
        };

        if is_dirty(&host) {
            caution(operator, "Klipper repo has uncommitted changes");
        }

        let versions = status.firmware_versions().unwrap_or_default();
        let Some(running) = firmware_version(&versions, registration) else {
            return;
        };
        info!("'{}' currently runs {running}, host has {host}", registration.key);
        if is_downgrade(&host, running) == Some(true) {
            caution(
                operator,
                &format!("MCU firmware {running} is newer than host {host} (downgrade)"),
            );
        }
    }

    /// Find the device: a preflighted CAN interface, or exactly one USB
    /// endpoint
    fn locate(&self, registration: &Registration) -> Result<Option<Endpoint>, Error> {
        match &registration.transport {
            Transport::Can { .. } => {
                let interface = registration.can_interface().unwrap_or(DEFAULT_CAN_INTERFACE);
                check_can_interface(&self.sysfs, interface)?;
                Ok(None)
            }
            Transport::Usb { pattern } => {
                let listing = self.host.endpoints.scan();
                match resolve(pattern, &listing)? {
                    Some(endpoint) => Ok(Some(endpoint.clone())),
                    None if may_be_absent(registration) => Ok(None),
                    None => Err(Error::NotConnected(pattern.clone())),
                }
            }
        }
    }

    /// Bootloader, flash, verify and timestamp, updating `result` as each
    /// phase completes. Retries are only offered when `interactive` and an
    /// operator is present.
    pub(crate) fn run_hardware(
        &self,
        registration: &Registration,
        endpoint: Option<&Endpoint>,
        firmware: &Firmware,
        operator: Option<&dyn Operator>,
        interactive: bool,
        result: &mut DeviceResult,
    ) -> Result<(), Error> {
        let retry_operator = if interactive { operator } else { None };
        let (bootloader_method, _) = registration.validate()?;
        result.touched_hardware = true;

        let entry =
            BootloaderEntry::new(self.host, self.tools, self.stagger).with_operator(operator);
        let ceiling = self.host.deadline(BOOTLOADER_CEILING);
        let mut current = endpoint.cloned();
        let mut retried = false;

        let bootloader_endpoint = loop {
            let outcome = entry.enter(registration, current.as_ref(), Some(ceiling));
            let err = match outcome.result {
                Ok(found) => {
                    info!("'{}' entered its bootloader in {:.1?}", registration.key, outcome.elapsed);
                    break found;
                }
                Err(err) => err,
            };

            let may_retry = !retried
                && err.is_retryable()
                && bootloader_method != BootloaderMethod::None
                && !ceiling.is_expired(self.host.clock);
            if !may_retry
                || !confirm(retry_operator, &format!("Bootloader entry failed: {err}. Retry?"), true)?
            {
                return Err(err);
            }

            retried = true;
            if let Some(rescanned) = self.rescan(registration) {
                current = Some(rescanned);
            }
        };
        result.bootloader_ok = true;

        let mut flasher = Flasher::new(self.host, self.tools);
        if let Some(roots) = &self.uf2_roots {
            flasher = flasher.with_uf2_roots(roots.clone());
        }

        let mut outcome = flasher.flash(registration, bootloader_endpoint.as_ref(), firmware);
        if let Err(err) = &outcome.result {
            if err.is_retryable()
                && confirm(retry_operator, &format!("Flash failed: {err}. Retry?"), true)?
            {
                outcome = flasher.flash(registration, bootloader_endpoint.as_ref(), firmware);
            }
        }
        let method = outcome.method_name();
        outcome.result?;
        info!(
            "'{}' flashed with {method} in {:.1?}",
            registration.key, outcome.elapsed
        );
        result.flashed = true;

        self.verify(registration)?;
        result.verified = true;

        if let Err(err) = self.registry.record_flash(&registration.key) {
            warn!("Could not record flash time for '{}': {err}", registration.key);
        }
        Ok(())
    }

    fn verify(&self, registration: &Registration) -> Result<(), Error> {
        match &registration.transport {
            Transport::Usb { pattern } => verify_usb(self.host, pattern).map(|_| ()),
            Transport::Can { uuid, .. } => verify_can(
                self.host,
                self.tools,
                uuid,
                registration.can_interface().unwrap_or(DEFAULT_CAN_INTERFACE),
            ),
        }
    }

    /// Wherever the board presents now, if it can be told apart
    fn rescan(&self, registration: &Registration) -> Option<Endpoint> {
        let pattern = registration.serial_pattern()?;
        let listing = self.host.endpoints.scan();
        resolve(pattern, &listing).ok().flatten().cloned()
    }
}

/// Compare the MCU in the endpoint's filename, package suffix dropped, with
/// the registered one. Only an exact match passes; filenames without a
/// recognisable MCU pass too.
pub fn check_mcu(registration: &Registration, endpoint: &Endpoint) -> Result<(), Error> {
    match extract_mcu(&endpoint.filename) {
        Some(found) if found != registration.mcu.to_ascii_lowercase() => Err(Error::McuMismatch {
            found,
            expected: registration.mcu.clone(),
        }),
        _ => Ok(()),
    }
}

/// Warn through the operator when there is one, the log otherwise
pub(crate) fn caution(operator: Option<&dyn Operator>, message: &str) {
    match operator {
        Some(operator) => operator.warn(message),
        None => warn!("{message}"),
    }
}

/// A board flashed through its UF2 volume has no serial port to find
/// beforehand
pub(crate) fn may_be_absent(registration: &Registration) -> bool {
    registration.bootloader().ok() == Some(BootloaderMethod::Manual)
        && registration.flash().ok() == Some(FlashMethod::Uf2Mount)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{cell::RefCell, collections::BTreeMap};

    use super::*;
    use crate::registry::BlockedDevice;

    /// In-memory registry
    #[derive(Default)]
    pub struct MemoryRegistry {
        pub devices: RefCell<BTreeMap<String, Registration>>,
    }

    impl MemoryRegistry {
        pub fn with(registrations: Vec<Registration>) -> Self {
            Self {
                devices: RefCell::new(
                    registrations
                        .into_iter()
                        .map(|r| (r.key.clone(), r))
                        .collect(),
                ),
            }
        }
    }

    impl Registry for MemoryRegistry {
        fn get(&self, key: &str) -> Result<Option<Registration>, Error> {
            Ok(self.devices.borrow().get(key).cloned())
        }

        fn list(&self) -> Result<Vec<Registration>, Error> {
            Ok(self.devices.borrow().values().cloned().collect())
        }

        fn blocked(&self) -> Result<Vec<BlockedDevice>, Error> {
            Ok(Vec::new())
        }

        fn add(&self, registration: Registration) -> Result<(), Error> {
            self.devices
                .borrow_mut()
                .insert(registration.key.clone(), registration);
            Ok(())
        }

        fn remove(&self, key: &str) -> Result<bool, Error> {
            Ok(self.devices.borrow_mut().remove(key).is_some())
        }

        fn update(&self, key: &str, change: &mut dyn FnMut(&mut Registration)) -> Result<bool, Error> {
            match self.devices.borrow_mut().get_mut(key) {
                Some(registration) => {
                    change(registration);
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

    /// Hands out one shared image; fails for the listed keys
    pub struct FakeFirmware {
        pub image: Firmware,
        pub broken: Vec<String>,
    }

    impl FirmwareProvider for FakeFirmware {
        fn validate(&self, registration: &Registration) -> Result<(), Error> {
            if self.broken.contains(&registration.key) {
                Err(Error::MissingBuildConfig(registration.key.clone()))
            } else {
                Ok(())
            }
        }

        fn provide(&self, registration: &Registration) -> Result<Firmware, Error> {
            self.validate(registration)?;
            Ok(self.image.clone())
        }
    }

    pub fn image(dir: &std::path::Path) -> Firmware {
        let path = dir.join("klipper.bin");
        std::fs::write(&path, vec![0u8; 32 * 1024]).unwrap();
        Firmware::open(path).unwrap()
    }

    /// Temporary Katapult checkout with `flashtool.py`
    pub fn katapult_tools(dir: &std::path::Path) -> Toolchain {
        let scripts = dir.join("katapult/scripts");
        std::fs::create_dir_all(&scripts).unwrap();
        std::fs::write(scripts.join("flashtool.py"), "").unwrap();
        Toolchain::new(dir.join("klipper"), dir.join("katapult"))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{
        testing::{image, katapult_tools, FakeFirmware, MemoryRegistry},
        *,
    };
    use crate::{
        discovery::{testing::ScriptedEndpoints, SERIAL_BY_ID},
        host::testing::VirtualClock,
        operator::testing::ScriptedOperator,
        process::testing::{exit, ScriptedRunner},
        service::{testing::FakeService, Restart},
    };

    const APP: &str = "usb-Klipper_stm32h723xx_29001A-if00";
    const BOOT: &str = "usb-katapult_stm32h723xx_29001A-if00";

    fn octopus() -> Registration {
        Registration::new(
            "octopus",
            "Octopus Pro",
            "stm32h723",
            Transport::Usb {
                pattern: "usb-Klipper_stm32h723xx_29001A*".into(),
            },
        )
        .with_methods(BootloaderMethod::Usb, FlashMethod::Katapult)
    }

    #[test]
    fn full_usb_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let tools = katapult_tools(dir.path());
        let firmware = FakeFirmware {
            image: image(dir.path()),
            broken: Vec::new(),
        };
        // locate, leave, return in Katapult, then back as Klipper after flashing
        let endpoints = ScriptedEndpoints::new(&[&[APP], &[], &[BOOT], &[APP]]);
        let runner = ScriptedRunner::new();
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);
        let registry = MemoryRegistry::with(vec![octopus()]);
        let service = FakeService::active();

        let pipeline = Pipeline::new(&host, &tools, &registry, &service, &firmware);
        let report = pipeline.flash_one("octopus", None).unwrap();

        let result = &report.results[0];
        assert!(result.succeeded(), "{:?}", result.error);
        assert!(result.touched_hardware);
        assert_eq!(report.service.as_ref().unwrap().restart, Restart::Succeeded);
        assert!(report.is_success());
        assert!(registry.get("octopus").unwrap().unwrap().last_flash.is_some());

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].has_arg(&format!("{SERIAL_BY_ID}/{BOOT}")));
    }

    #[test]
    fn absent_device_fails_before_stopping_service() {
        let dir = tempfile::tempdir().unwrap();
        let tools = katapult_tools(dir.path());
        let firmware = FakeFirmware {
            image: image(dir.path()),
            broken: Vec::new(),
        };
        let endpoints = ScriptedEndpoints::new(&[&[]]);
        let runner = ScriptedRunner::new();
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);
        let registry = MemoryRegistry::with(vec![octopus()]);
        let service = FakeService::active();

        let pipeline = Pipeline::new(&host, &tools, &registry, &service, &firmware);
        assert!(matches!(
            pipeline.flash_one("octopus", None),
            Err(Error::NotConnected(_))
        ));
        assert!(service.calls.borrow().is_empty());
        assert!(matches!(
            pipeline.flash_one("missing", None),
            Err(Error::UnknownDevice(_))
        ));
    }

    #[test]
    fn bootloader_timeout_is_retried_once_with_operator() {
        let dir = tempfile::tempdir().unwrap();
        let tools = katapult_tools(dir.path());
        let firmware = FakeFirmware {
            image: image(dir.path()),
            broken: Vec::new(),
        };
        let endpoints = ScriptedEndpoints::new(&[&[APP]]);
        let runner = ScriptedRunner::new();
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);
        let registry = MemoryRegistry::with(vec![octopus()]);
        let service = FakeService::active();
        let operator = ScriptedOperator::answering(&[true, true]);

        let pipeline = Pipeline::new(&host, &tools, &registry, &service, &firmware);
        let report = pipeline.flash_one("octopus", Some(&operator)).unwrap();

        let result = &report.results[0];
        assert!(matches!(result.error, Some(Error::NeverLeft(_))));
        assert!(!result.bootloader_ok);
        // One retry only, even though the operator would keep saying yes
        assert_eq!(operator.prompts.borrow().len(), 1);
        assert_eq!(runner.calls().len(), 2);
        assert_eq!(service.calls.borrow().last(), Some(&"start"));
        assert!(!report.is_success());
    }

    #[test]
    fn no_retry_without_operator() {
        let dir = tempfile::tempdir().unwrap();
        let tools = katapult_tools(dir.path());
        let firmware = FakeFirmware {
            image: image(dir.path()),
            broken: Vec::new(),
        };
        let endpoints = ScriptedEndpoints::new(&[&[APP]]);
        let runner = ScriptedRunner::new();
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);
        let registry = MemoryRegistry::with(vec![octopus()]);
        let service = FakeService::active();

        let pipeline = Pipeline::new(&host, &tools, &registry, &service, &firmware);
        let report = pipeline.flash_one("octopus", None).unwrap();

        assert_eq!(runner.calls().len(), 1);
        assert!(matches!(report.results[0].error, Some(Error::NeverLeft(_))));
    }

    #[test]
    fn mcu_mismatch_needs_operator_override() {
        let dir = tempfile::tempdir().unwrap();
        let tools = katapult_tools(dir.path());
        let firmware = FakeFirmware {
            image: image(dir.path()),
            broken: Vec::new(),
        };
        let mut registration = octopus();
        registration.mcu = "stm32f446".into();
        registration.transport = Transport::Usb {
            pattern: "usb-Klipper_*_29001A*".into(),
        };

        let endpoints = ScriptedEndpoints::new(&[&[APP]]);
        let runner = ScriptedRunner::new();
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);
        let registry = MemoryRegistry::with(vec![registration]);
        let service = FakeService::active();
        let pipeline = Pipeline::new(&host, &tools, &registry, &service, &firmware);

        let declining = ScriptedOperator::answering(&[false]);
        assert!(matches!(
            pipeline.flash_one("octopus", Some(&declining)),
            Err(Error::McuMismatch { .. })
        ));
        assert!(service.calls.borrow().is_empty());
        assert_eq!(
            declining.messages.borrow().as_slice(),
            ["MCU mismatch: USB='stm32h723', registry='stm32f446'"]
        );

        let accepting = ScriptedOperator::answering(&[true]);
        let report = pipeline.flash_one("octopus", Some(&accepting)).unwrap();
        assert!(report.results[0].touched_hardware);
    }

    #[test]
    fn mcu_cross_check_is_exact() {
        let endpoint = Endpoint::new(SERIAL_BY_ID, APP);
        let mut registration = octopus();
        assert!(check_mcu(&registration, &endpoint).is_ok());

        registration.mcu = "STM32H723".into();
        assert!(check_mcu(&registration, &endpoint).is_ok());

        for near_miss in ["stm32", "stm32h7", "stm32h7233", "stm32h723xx"] {
            registration.mcu = near_miss.into();
            assert!(
                matches!(check_mcu(&registration, &endpoint), Err(Error::McuMismatch { .. })),
                "{near_miss} accepted for stm32h723"
            );
        }

        let unknown = Endpoint::new(SERIAL_BY_ID, "usb-1a86_USB_Serial-if00");
        assert!(check_mcu(&registration, &unknown).is_ok());
    }

    #[test]
    fn can_pipeline_checks_interface_first() {
        let dir = tempfile::tempdir().unwrap();
        let tools = katapult_tools(dir.path());
        let firmware = FakeFirmware {
            image: image(dir.path()),
            broken: Vec::new(),
        };
        let registration = Registration::new(
            "ebb36",
            "EBB36",
            "stm32g0b1",
            Transport::Can {
                uuid: "48ca7afe7a44".into(),
                interface: Some("can0".into()),
            },
        )
        .with_methods(BootloaderMethod::Can, FlashMethod::KatapultCan);

        let endpoints = ScriptedEndpoints::new(&[&[]]);
        let runner = ScriptedRunner::with(|call| {
            if call.has_arg("-q") {
                exit(0, "Detected UUID: 48ca7afe7a44, Application: Klipper\n")
            } else {
                exit(0, "")
            }
        });
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);
        let registry = MemoryRegistry::with(vec![registration]);
        let service = FakeService::active();

        let sysfs = dir.path().join("net");
        let pipeline = Pipeline::new(&host, &tools, &registry, &service, &firmware)
            .with_sysfs(&sysfs);
        assert!(matches!(
            pipeline.flash_one("ebb36", None),
            Err(Error::CanInterface { .. })
        ));

        let can0 = sysfs.join("can0");
        std::fs::create_dir_all(&can0).unwrap();
        std::fs::write(can0.join("type"), "280\n").unwrap();
        std::fs::write(can0.join("operstate"), "up\n").unwrap();
        std::fs::write(can0.join("tx_queue_len"), "1024\n").unwrap();

        let report = pipeline.flash_one("ebb36", None).unwrap();
        assert!(report.results[0].succeeded(), "{:?}", report.results[0].error);
        let lines: Vec<String> = runner.calls().iter().map(|c| c.args[1..].join(" ")).collect();
        assert_eq!(
            lines,
            [
                "-i can0 -r -u 48ca7afe7a44",
                format!("-i can0 -u 48ca7afe7a44 -f {}", firmware.image.path.display()).as_str(),
                "-i can0 -q",
            ]
        );
    }
}
