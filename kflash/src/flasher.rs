//! Writing firmware onto a board that is already in its bootloader
//!
//! There is exactly one strategy per registration. A failing strategy is
//! reported as is; nothing falls back to a different one.

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    device::{FlashMethod, Registration, DEFAULT_CAN_INTERFACE},
    discovery::Endpoint,
    error::Error,
    firmware::Firmware,
    host::Host,
    process::Output,
    tools::Toolchain,
};

pub const FLASH_TIMEOUT: Duration = Duration::from_secs(60);
pub const SDCARD_TIMEOUT: Duration = Duration::from_secs(120);
/// Per attempt; CAN transfers are slow
pub const CAN_FLASH_TIMEOUT: Duration = Duration::from_secs(120);
pub const CAN_FLASH_ATTEMPTS: u32 = 3;
pub const CAN_RETRY_PAUSE: Duration = Duration::from_secs(2);
pub const UF2_MOUNT_TIMEOUT: Duration = Duration::from_secs(15);
pub const UF2_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Volume labels an RP2040 in BOOTSEL mode mounts under
const UF2_LABELS: &[&str] = &["RPI-RP2", "RP2040"];

/// Result of one flash attempt
#[derive(Debug)]
pub struct FlashOutcome {
    /// `None` when the registration names no usable strategy
    pub method: Option<FlashMethod>,
    pub result: Result<(), Error>,
    pub elapsed: Duration,
}

impl FlashOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Strategy label for reporting, `unknown` when unconfigured
    pub fn method_name(&self) -> String {
        self.method
            .map(|method| method.to_string())
            .unwrap_or_else(|| "unknown".into())
    }
}

pub struct Flasher<'a> {
    host: &'a Host<'a>,
    tools: &'a Toolchain,
    uf2_roots: Vec<PathBuf>,
}

impl<'a> Flasher<'a> {
    pub fn new(host: &'a Host<'a>, tools: &'a Toolchain) -> Self {
        Self {
            host,
            tools,
            uf2_roots: default_uf2_roots(current_user().as_deref()),
        }
    }

    /// Directories searched for an RP2040 mass storage volume
    pub fn with_uf2_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.uf2_roots = roots;
        self
    }

    /// Flash `firmware` using the registration's strategy. `endpoint` is the
    /// bootloader endpoint returned by bootloader entry, if any.
    pub fn flash(
        &self,
        registration: &Registration,
        endpoint: Option<&Endpoint>,
        firmware: &Firmware,
    ) -> FlashOutcome {
        let start = self.host.deadline(Duration::ZERO);
        let (method, result) = match registration.flash() {
            Ok(method) => {
                info!("Flashing '{}' with {method}", registration.key);
                (Some(method), self.dispatch(method, registration, endpoint, firmware))
            }
            Err(err) => (None, Err(err)),
        };

        FlashOutcome {
            method,
            result,
            elapsed: start.elapsed(self.host.clock),
        }
    }

    fn dispatch(
        &self,
        method: FlashMethod,
        registration: &Registration,
        endpoint: Option<&Endpoint>,
        firmware: &Firmware,
    ) -> Result<(), Error> {
        match method {
            FlashMethod::Katapult => self.katapult(endpoint, firmware),
            FlashMethod::KatapultCan => self.katapult_can(registration, firmware),
            FlashMethod::MakeFlash => self.make_flash(registration, endpoint),
            FlashMethod::FlashSdcard => self.flash_sdcard(registration, endpoint),
            FlashMethod::Uf2Mount => self.uf2_mount(registration, firmware),
        }
    }

    fn katapult(&self, endpoint: Option<&Endpoint>, firmware: &Firmware) -> Result<(), Error> {
        let endpoint = device_path(FlashMethod::Katapult, endpoint)?;
        let flashtool = self.tools.require(self.tools.flashtool())?;

        let mut cmd = Command::new(self.tools.klippy_python());
        cmd.arg(flashtool)
            .arg("-d")
            .arg(endpoint)
            .arg("-f")
            .arg(&firmware.path);

        self.host
            .runner
            .run(&mut cmd, FLASH_TIMEOUT, Output::Inherit)?
            .into_result("flashtool.py")
            .map(|_| ())
    }

    /// Klipper's own `make flash`, rebuilding nothing since the `.config`
    /// and `out/` are already in place
    fn make_flash(&self, registration: &Registration, endpoint: Option<&Endpoint>) -> Result<(), Error> {
        if registration.is_can() {
            return Err(Error::MakeFlashOnCan);
        }
        let endpoint = device_path(FlashMethod::MakeFlash, endpoint)?;

        let mut cmd = Command::new("make");
        cmd.arg(format!("FLASH_DEVICE={}", endpoint.display()))
            .arg("flash")
            .current_dir(&self.tools.klipper_dir);

        self.host
            .runner
            .run(&mut cmd, FLASH_TIMEOUT, Output::Inherit)?
            .into_result("make flash")
            .map(|_| ())
    }

    fn flash_sdcard(&self, registration: &Registration, endpoint: Option<&Endpoint>) -> Result<(), Error> {
        let board = registration
            .sdcard_board
            .as_deref()
            .filter(|board| !board.trim().is_empty())
            .ok_or(Error::MissingField {
                method: FlashMethod::FlashSdcard.to_string(),
                field: "sdcard_board",
            })?;
        let endpoint = device_path(FlashMethod::FlashSdcard, endpoint)?;
        let script = self.tools.require(self.tools.sdcard_script())?;

        let mut cmd = Command::new(script);
        cmd.arg(endpoint)
            .arg(board)
            .current_dir(&self.tools.klipper_dir);

        self.host
            .runner
            .run(&mut cmd, SDCARD_TIMEOUT, Output::Inherit)?
            .into_result("flash-sdcard.sh")
            .map(|_| ())
    }

    /// Copy the image onto the RP2040's BOOTSEL volume
    fn uf2_mount(&self, registration: &Registration, firmware: &Firmware) -> Result<(), Error> {
        let candidates = uf2_candidates(registration.uf2_mount_path.as_deref(), &self.uf2_roots);
        debug!("Looking for a UF2 volume in {candidates:?}");

        let deadline = self.host.deadline(UF2_MOUNT_TIMEOUT);
        let mount = self
            .host
            .poll(deadline, UF2_POLL_INTERVAL, || {
                candidates.iter().find(|path| path.is_dir()).cloned()
            })?
            .ok_or(Error::Uf2MountTimeout(UF2_MOUNT_TIMEOUT))?;

        let target = mount.join(firmware.file_name());
        info!("Copying {} to {}", firmware.path.display(), target.display());
        fs::copy(&firmware.path, &target).map_err(|source| Error::Uf2Copy {
            mount: mount.clone(),
            source,
        })?;

        Ok(())
    }

    /// Katapult over CAN, retried because a busy bus drops transfers
    fn katapult_can(&self, registration: &Registration, firmware: &Firmware) -> Result<(), Error> {
        let uuid = registration
            .can_uuid()
            .filter(|uuid| !uuid.is_empty())
            .ok_or(Error::MissingField {
                method: FlashMethod::KatapultCan.to_string(),
                field: "canbus_uuid",
            })?;
        let interface = registration.can_interface().unwrap_or(DEFAULT_CAN_INTERFACE);
        let flashtool = self.tools.require(self.tools.flashtool())?;

        let mut attempt = 1;
        loop {
            let mut cmd = Command::new("python3");
            cmd.arg(&flashtool)
                .args(["-i", interface, "-u", uuid, "-f"])
                .arg(&firmware.path);

            let err = match self
                .host
                .runner
                .run(&mut cmd, CAN_FLASH_TIMEOUT, Output::Inherit)
                .and_then(|exit| exit.into_result("flashtool.py"))
            {
                Ok(_) => return Ok(()),
                // Retrying cannot fix a missing interpreter
                Err(err @ Error::Launch { .. }) => return Err(err),
                Err(err) => err,
            };

            if attempt == CAN_FLASH_ATTEMPTS {
                return Err(Error::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            warn!("CAN flash attempt {attempt}/{CAN_FLASH_ATTEMPTS} failed: {err}");
            self.host.pause(CAN_RETRY_PAUSE)?;
            attempt += 1;
        }
    }
}

fn device_path(method: FlashMethod, endpoint: Option<&Endpoint>) -> Result<&Path, Error> {
    endpoint
        .map(|endpoint| endpoint.path.as_path())
        .ok_or_else(|| Error::NoEndpoint(method.to_string()))
}

fn current_user() -> Option<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .ok()
        .filter(|user| !user.is_empty())
}

/// Where desktop automounters and common fstab setups put removable volumes
fn default_uf2_roots(user: Option<&str>) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Some(user) = user {
        roots.push(Path::new("/media").join(user));
    }
    roots.push(PathBuf::from("/media"));
    if let Some(user) = user {
        roots.push(Path::new("/run/media").join(user));
    }
    roots.push(PathBuf::from("/mnt"));
    roots
}

/// An explicit mount path wins outright; otherwise every label under every
/// root
fn uf2_candidates(explicit: Option<&Path>, roots: &[PathBuf]) -> Vec<PathBuf> {
    if let Some(explicit) = explicit {
        return vec![explicit.to_path_buf()];
    }

    UF2_LABELS
        .iter()
        .flat_map(|label| roots.iter().map(move |root| root.join(label)))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        device::{BootloaderMethod, Transport},
        discovery::{testing::ScriptedEndpoints, SERIAL_BY_ID},
        host::testing::VirtualClock,
        process::testing::{exit, ScriptedRunner},
    };

    const BOOT: &str = "usb-katapult_stm32h723xx_29001A-if00";

    struct Bench {
        home: tempfile::TempDir,
        tools: Toolchain,
        firmware: Firmware,
    }

    fn bench() -> Bench {
        let home = tempfile::tempdir().unwrap();
        let katapult = home.path().join("katapult/scripts");
        let klipper = home.path().join("klipper/scripts");
        fs::create_dir_all(&katapult).unwrap();
        fs::create_dir_all(&klipper).unwrap();
        fs::write(katapult.join("flashtool.py"), "").unwrap();
        fs::write(klipper.join("flash-sdcard.sh"), "").unwrap();

        let image = home.path().join("klipper.bin");
        fs::write(&image, vec![7u8; 24 * 1024]).unwrap();

        Bench {
            tools: Toolchain::new(home.path().join("klipper"), home.path().join("katapult")),
            firmware: Firmware::open(image).unwrap(),
            home,
        }
    }

    fn usb(flash: FlashMethod) -> Registration {
        Registration::new(
            "octopus",
            "Octopus Pro",
            "stm32h723",
            Transport::Usb {
                pattern: "usb-Klipper_stm32h723xx_29001A*".into(),
            },
        )
        .with_methods(BootloaderMethod::Usb, flash)
    }

    fn can() -> Registration {
        Registration::new(
            "ebb",
            "EBB36",
            "stm32g0b1",
            Transport::Can {
                uuid: "1a2b3c4d5e6f".into(),
                interface: None,
            },
        )
        .with_methods(BootloaderMethod::Can, FlashMethod::KatapultCan)
    }

    #[test]
    fn katapult_passes_device_and_image() {
        let bench = bench();
        let endpoints = ScriptedEndpoints::new(&[&[]]);
        let runner = ScriptedRunner::new();
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);
        let flasher = Flasher::new(&host, &bench.tools);

        let boot = Endpoint::new(SERIAL_BY_ID, BOOT);
        let outcome = flasher.flash(&usb(FlashMethod::Katapult), Some(&boot), &bench.firmware);

        assert!(outcome.is_success());
        assert_eq!(outcome.method_name(), "katapult");
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].timeout, FLASH_TIMEOUT);
        assert!(calls[0].args[0].ends_with("flashtool.py"));
        assert_eq!(
            calls[0].args[1..],
            [
                "-d".to_string(),
                format!("{SERIAL_BY_ID}/{BOOT}"),
                "-f".to_string(),
                bench.firmware.path.display().to_string(),
            ]
        );
    }

    #[test]
    fn katapult_without_endpoint_runs_nothing() {
        let bench = bench();
        let endpoints = ScriptedEndpoints::new(&[&[]]);
        let runner = ScriptedRunner::new();
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);

        let outcome = Flasher::new(&host, &bench.tools).flash(
            &usb(FlashMethod::Katapult),
            None,
            &bench.firmware,
        );

        assert!(matches!(outcome.result, Err(Error::NoEndpoint(_))));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn make_flash_runs_in_klipper_checkout() {
        let bench = bench();
        let endpoints = ScriptedEndpoints::new(&[&[]]);
        let runner = ScriptedRunner::with(|_| exit(2, "flash failed"));
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);

        let boot = Endpoint::new(SERIAL_BY_ID, BOOT);
        let outcome = Flasher::new(&host, &bench.tools).flash(
            &usb(FlashMethod::MakeFlash),
            Some(&boot),
            &bench.firmware,
        );

        let calls = runner.calls();
        assert_eq!(
            calls[0].line(),
            format!("make FLASH_DEVICE={SERIAL_BY_ID}/{BOOT} flash")
        );
        assert_eq!(calls[0].cwd.as_deref(), Some(bench.tools.klipper_dir.as_path()));
        assert!(matches!(
            outcome.result,
            Err(Error::ToolFailed { code: 2, .. })
        ));
    }

    #[test]
    fn sdcard_needs_board_name() {
        let bench = bench();
        let endpoints = ScriptedEndpoints::new(&[&[]]);
        let runner = ScriptedRunner::new();
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);
        let flasher = Flasher::new(&host, &bench.tools);
        let boot = Endpoint::new(SERIAL_BY_ID, BOOT);

        let mut registration = usb(FlashMethod::FlashSdcard);
        let outcome = flasher.flash(&registration, Some(&boot), &bench.firmware);
        assert!(matches!(
            outcome.result,
            Err(Error::MissingField { field: "sdcard_board", .. })
        ));

        registration.sdcard_board = Some("btt-skr-v1.3".into());
        let outcome = flasher.flash(&registration, Some(&boot), &bench.firmware);
        assert!(outcome.is_success());
        let calls = runner.calls();
        assert_eq!(calls[0].timeout, SDCARD_TIMEOUT);
        assert!(calls[0].program.ends_with("flash-sdcard.sh"));
        assert_eq!(calls[0].args[1], "btt-skr-v1.3");
    }

    #[test]
    fn can_flash_retries_then_reports_attempts() {
        let bench = bench();
        let endpoints = ScriptedEndpoints::new(&[&[]]);
        let runner = ScriptedRunner::with(|_| exit(1, "Timed out waiting for response"));
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);

        let outcome = Flasher::new(&host, &bench.tools).flash(&can(), None, &bench.firmware);

        assert_eq!(runner.calls().len(), 3);
        assert_eq!(clock.elapsed(), CAN_RETRY_PAUSE * 2);
        let err = outcome.result.unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert!(err.to_string().ends_with("(after 3 attempts)"));

        let call = &runner.calls()[0];
        assert_eq!(call.program, "python3");
        assert_eq!(call.args[1..5], ["-i", "can0", "-u", "1a2b3c4d5e6f"]);
        assert_eq!(call.timeout, CAN_FLASH_TIMEOUT);
    }

    #[test]
    fn can_flash_succeeds_on_second_attempt() {
        let bench = bench();
        let endpoints = ScriptedEndpoints::new(&[&[]]);
        let attempts = Rc::new(Cell::new(0));
        let counter = attempts.clone();
        let runner = ScriptedRunner::with(move |_| {
            counter.set(counter.get() + 1);
            if counter.get() == 1 {
                Err(Error::CommandTimeout {
                    tool: "flashtool.py".into(),
                    timeout: CAN_FLASH_TIMEOUT,
                })
            } else {
                exit(0, "")
            }
        });
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);

        let outcome = Flasher::new(&host, &bench.tools).flash(&can(), None, &bench.firmware);
        assert!(outcome.is_success());
        assert_eq!(attempts.get(), 2);
    }

    #[test]
    fn can_flash_does_not_retry_launch_failure() {
        let bench = bench();
        let endpoints = ScriptedEndpoints::new(&[&[]]);
        let runner = ScriptedRunner::with(|_| {
            Err(Error::Launch {
                tool: "python3".into(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        });
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);

        let outcome = Flasher::new(&host, &bench.tools).flash(&can(), None, &bench.firmware);
        assert!(matches!(outcome.result, Err(Error::Launch { .. })));
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn uf2_copies_onto_volume() {
        let bench = bench();
        let roots = bench.home.path().join("media");
        let volume = roots.join("RP2040");
        fs::create_dir_all(&volume).unwrap();

        let endpoints = ScriptedEndpoints::new(&[&[]]);
        let runner = ScriptedRunner::new();
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);
        let flasher = Flasher::new(&host, &bench.tools).with_uf2_roots(vec![roots]);

        let registration = usb(FlashMethod::Uf2Mount);
        let outcome = flasher.flash(&registration, None, &bench.firmware);

        assert!(outcome.is_success());
        assert_eq!(fs::read(volume.join("klipper.bin")).unwrap().len(), 24 * 1024);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn uf2_gives_up_after_timeout() {
        let bench = bench();
        let endpoints = ScriptedEndpoints::new(&[&[]]);
        let runner = ScriptedRunner::new();
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);
        let flasher = Flasher::new(&host, &bench.tools)
            .with_uf2_roots(vec![bench.home.path().join("nowhere")]);

        let outcome = flasher.flash(&usb(FlashMethod::Uf2Mount), None, &bench.firmware);
        assert!(matches!(outcome.result, Err(Error::Uf2MountTimeout(_))));
        assert_eq!(clock.elapsed(), UF2_MOUNT_TIMEOUT);
    }

    #[test]
    fn unconfigured_method_is_unknown() {
        let bench = bench();
        let endpoints = ScriptedEndpoints::new(&[&[]]);
        let runner = ScriptedRunner::new();
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);

        let registration = Registration::new(
            "octopus",
            "Octopus Pro",
            "stm32h723",
            Transport::Usb {
                pattern: "usb-Klipper_stm32h723xx_29001A*".into(),
            },
        );
        let outcome = Flasher::new(&host, &bench.tools).flash(&registration, None, &bench.firmware);

        assert_eq!(outcome.method_name(), "unknown");
        assert!(matches!(outcome.result, Err(Error::MissingFlashMethod(_))));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn uf2_search_order() {
        let roots = default_uf2_roots(Some("pi"));
        let candidates = uf2_candidates(None, &roots);
        assert_eq!(candidates[0], PathBuf::from("/media/pi/RPI-RP2"));
        assert_eq!(candidates[3], PathBuf::from("/mnt/RPI-RP2"));
        assert_eq!(candidates[4], PathBuf::from("/media/pi/RP2040"));
        assert_eq!(
            uf2_candidates(Some(Path::new("/srv/pico")), &roots),
            vec![PathBuf::from("/srv/pico")]
        );
    }
}
