use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, VecDeque},
    fs,
    path::{Path, PathBuf},
    process::Command,
    time::{Duration, Instant},
};

use kflash::{
    bootloader::BootloaderEntry,
    discovery::{Endpoint, EndpointSource},
    firmware::Prebuilt,
    host::{Clock, Host, Interrupt},
    operator::Operator,
    process::{CommandRunner, Exit, Output},
    registry::{FileRegistry, Registry},
    service::{Restart, ServiceManager},
    status::{PrintStatus, StatusSource},
    tools::Toolchain,
    BootloaderMethod, Error, FlashMethod, Pipeline, Registration, Transport,
};
use pretty_assertions::assert_eq;

const APP: &str = "usb-Klipper_stm32h723xx_29001A-if00";
const BOOT: &str = "usb-katapult_stm32h723xx_29001A-if00";
const BY_ID: &str = "/dev/serial/by-id";

/// One listing per scan, the last one repeating
struct Listings {
    listings: Vec<Vec<Endpoint>>,
    scans: Cell<usize>,
}

impl Listings {
    fn new(listings: &[&[&str]]) -> Self {
        Self {
            listings: listings
                .iter()
                .map(|names| names.iter().map(|name| Endpoint::new(BY_ID, *name)).collect())
                .collect(),
            scans: Cell::new(0),
        }
    }
}

impl EndpointSource for Listings {
    fn scan(&self) -> Vec<Endpoint> {
        let index = self.scans.get().min(self.listings.len() - 1);
        self.scans.set(self.scans.get() + 1);
        self.listings[index].clone()
    }
}

/// Succeeds at everything and remembers each command line. Optionally pulls
/// the interrupt when a command mentions `trip_on`, and answers `git` with
/// `describe`.
#[derive(Default)]
struct Runner {
    lines: RefCell<Vec<String>>,
    trip_on: Option<(&'static str, Interrupt)>,
    describe: Option<&'static str>,
}

impl CommandRunner for Runner {
    fn run(&self, cmd: &mut Command, _timeout: Duration, _output: Output) -> Result<Exit, Error> {
        let line = std::iter::once(cmd.get_program())
            .chain(cmd.get_args())
            .map(|part| part.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");

        if let Some((needle, interrupt)) = &self.trip_on {
            if line.contains(needle) {
                interrupt.trigger();
            }
        }

        let stdout = match self.describe {
            Some(version) if line.starts_with("git ") => format!("{version}\n"),
            _ => String::new(),
        };

        self.lines.borrow_mut().push(line);
        Ok(Exit {
            stdout,
            ..Default::default()
        })
    }
}

/// Answers yes/no questions from a script and keeps everything it was told
#[derive(Default)]
struct Answers {
    answers: RefCell<VecDeque<bool>>,
    prompts: RefCell<Vec<String>>,
    said: RefCell<Vec<String>>,
}

impl Answers {
    fn new(answers: &[bool]) -> Self {
        Self {
            answers: RefCell::new(answers.iter().copied().collect()),
            ..Default::default()
        }
    }
}

impl Operator for Answers {
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool, Error> {
        self.prompts.borrow_mut().push(prompt.to_string());
        Ok(self.answers.borrow_mut().pop_front().unwrap_or(default))
    }

    fn acknowledge(&self, prompt: &str) -> Result<(), Error> {
        self.prompts.borrow_mut().push(prompt.to_string());
        Ok(())
    }

    fn info(&self, message: &str) {
        self.said.borrow_mut().push(message.to_string());
    }

    fn warn(&self, message: &str) {
        self.said.borrow_mut().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.said.borrow_mut().push(message.to_string());
    }
}

/// Moonraker with a fixed set of MCU versions
struct Moonraker(BTreeMap<String, String>);

impl Moonraker {
    fn reporting(versions: &[(&str, &str)]) -> Self {
        Self(
            versions
                .iter()
                .map(|(name, version)| (name.to_string(), version.to_string()))
                .collect(),
        )
    }
}

impl StatusSource for Moonraker {
    fn print_status(&self) -> Option<PrintStatus> {
        None
    }

    fn firmware_versions(&self) -> Option<BTreeMap<String, String>> {
        Some(self.0.clone())
    }
}

/// Time only moves when someone sleeps
struct FakeClock {
    start: Instant,
    now: Cell<Instant>,
}

impl FakeClock {
    fn new() -> Self {
        let start = Instant::now();
        Self {
            start,
            now: Cell::new(start),
        }
    }

    fn elapsed(&self) -> Duration {
        self.now.get() - self.start
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

#[derive(Default)]
struct Service {
    calls: RefCell<Vec<&'static str>>,
}

impl ServiceManager for Service {
    fn name(&self) -> &str {
        "klipper"
    }

    fn is_active(&self) -> bool {
        self.calls.borrow_mut().push("is-active");
        true
    }

    fn stop(&self) -> Result<(), Error> {
        self.calls.borrow_mut().push("stop");
        Ok(())
    }

    fn start(&self) -> Result<(), Error> {
        self.calls.borrow_mut().push("start");
        Ok(())
    }
}

struct Bench {
    _dir: tempfile::TempDir,
    tools: Toolchain,
    registry: FileRegistry,
    image: PathBuf,
}

fn bench() -> Bench {
    let dir = tempfile::tempdir().unwrap();

    let scripts = dir.path().join("katapult/scripts");
    fs::create_dir_all(&scripts).unwrap();
    fs::write(scripts.join("flashtool.py"), "").unwrap();
    let tools = Toolchain::new(dir.path().join("klipper"), dir.path().join("katapult"));

    let image = dir.path().join("klipper.bin");
    fs::write(&image, vec![0u8; 40 * 1024]).unwrap();

    let registry = FileRegistry::new(dir.path().join("devices.toml"));
    registry.add(octopus()).unwrap();

    Bench {
        _dir: dir,
        tools,
        registry,
        image,
    }
}

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

fn by_id(name: &str) -> String {
    Path::new(BY_ID).join(name).display().to_string()
}

#[test]
fn usb_board_is_flashed_end_to_end() {
    let bench = bench();
    // Located, gone, back in Katapult, back in Klipper
    let endpoints = Listings::new(&[&[APP], &[], &[BOOT], &[APP]]);
    let runner = Runner::default();
    let clock = FakeClock::new();
    let host = Host::new(&endpoints, &runner, &clock);
    let service = Service::default();
    let firmware = Prebuilt::new(&bench.image);

    let report = Pipeline::new(&host, &bench.tools, &bench.registry, &service, &firmware)
        .flash_one("octopus", None)
        .unwrap();

    assert!(report.is_success(), "{:?}", report.results[0].error);
    assert_eq!(report.service.unwrap().restart, Restart::Succeeded);
    assert_eq!(*service.calls.borrow(), ["is-active", "stop", "start"]);

    let lines = runner.lines.borrow();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("enter_bootloader"));
    assert!(lines[0].contains(&by_id(APP)));
    assert!(lines[1].ends_with(&format!(
        "flashtool.py -d {} -f {}",
        by_id(BOOT),
        bench.image.display()
    )));

    // The timestamp went to disk
    let reloaded = FileRegistry::new(bench.registry.path());
    assert!(reloaded.get("octopus").unwrap().unwrap().last_flash.is_some());
}

#[test]
fn cancellation_mid_run_still_restarts_the_service() {
    let bench = bench();
    let endpoints = Listings::new(&[&[APP], &[], &[BOOT]]);
    let interrupt = Interrupt::new();
    let runner = Runner {
        trip_on: Some(("flashtool.py", interrupt.clone())),
        ..Default::default()
    };
    let clock = FakeClock::new();
    let host = Host::new(&endpoints, &runner, &clock).with_interrupt(interrupt);
    let service = Service::default();
    let firmware = Prebuilt::new(&bench.image);

    let report = Pipeline::new(&host, &bench.tools, &bench.registry, &service, &firmware)
        .flash_one("octopus", None)
        .unwrap();

    let result = &report.results[0];
    assert!(result.flashed);
    assert!(!result.verified);
    assert!(matches!(result.error, Some(Error::Cancelled)));
    assert_eq!(service.calls.borrow().last(), Some(&"start"));
    assert!(bench.registry.get("octopus").unwrap().unwrap().last_flash.is_none());
}

#[test]
fn board_that_never_leaves_times_out_without_waiting_for_return() {
    let bench = bench();
    let endpoints = Listings::new(&[&[APP]]);
    let runner = Runner::default();
    let clock = FakeClock::new();
    let host = Host::new(&endpoints, &runner, &clock);
    let endpoint = Endpoint::new(BY_ID, APP);

    let outcome = BootloaderEntry::new(&host, &bench.tools, Duration::from_secs(2)).enter(
        &octopus(),
        Some(&endpoint),
        None,
    );

    assert!(matches!(outcome.result, Err(Error::NeverLeft(_))));
    assert_eq!(clock.elapsed(), Duration::from_secs(10));
    // One scan per second, none at the deadline itself
    assert_eq!(endpoints.scans.get(), 10);
}

#[test]
fn only_outdated_boards_are_flashed() {
    let bench = bench();
    let pico = Registration::new(
        "pico",
        "Pico",
        "rp2040",
        Transport::Usb {
            pattern: "usb-Klipper_rp2040_E6625C05E7*".into(),
        },
    )
    .with_methods(BootloaderMethod::Usb, FlashMethod::Katapult);
    bench.registry.add(pico).unwrap();

    let endpoints = Listings::new(&[&[APP], &[], &[BOOT], &[APP]]);
    let runner = Runner {
        describe: Some("v0.12.0-50-g7ce409d"),
        ..Default::default()
    };
    let clock = FakeClock::new();
    let host = Host::new(&endpoints, &runner, &clock);
    let service = Service::default();
    let firmware = Prebuilt::new(&bench.image);
    let moonraker = Moonraker::reporting(&[
        ("octopus", "v0.12.0-45-gabcdef0"),
        ("pico", "v0.12.0-50-g7ce409d"),
    ]);
    let operator = Answers::new(&[true]);

    let report = Pipeline::new(&host, &bench.tools, &bench.registry, &service, &firmware)
        .with_status(&moonraker)
        .flash_all(Some(&operator))
        .unwrap();

    assert_eq!(*operator.prompts.borrow(), ["Flash only outdated devices?"]);
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].key, "octopus");
    assert!(report.is_success(), "{:?}", report.results[0].error);

    let said = operator.said.borrow();
    assert_eq!(said[0], "Host runs Klipper v0.12.0-50-g7ce409d");
    assert!(said.contains(&"Up-to-date devices:\n  - Pico".to_string()));

    let lines = runner.lines.borrow();
    assert!(lines[0].starts_with("git describe"));
    assert_eq!(lines.len(), 3);
    assert!(bench.registry.get("pico").unwrap().unwrap().last_flash.is_none());
}

#[test]
fn single_flash_warns_about_downgrade_and_dirty_checkout() {
    let bench = bench();
    let endpoints = Listings::new(&[&[APP], &[], &[BOOT], &[APP]]);
    let runner = Runner {
        describe: Some("v0.12.0-45-g7ce409d-dirty"),
        ..Default::default()
    };
    let clock = FakeClock::new();
    let host = Host::new(&endpoints, &runner, &clock);
    let service = Service::default();
    let firmware = Prebuilt::new(&bench.image);
    let moonraker = Moonraker::reporting(&[("octopus", "v0.12.0-60-gabcdef0")]);
    let operator = Answers::default();

    let report = Pipeline::new(&host, &bench.tools, &bench.registry, &service, &firmware)
        .with_status(&moonraker)
        .flash_one("octopus", Some(&operator))
        .unwrap();

    // Warnings only: the flash still goes ahead without a question
    assert!(report.is_success(), "{:?}", report.results[0].error);
    assert!(operator.prompts.borrow().is_empty());
    assert_eq!(
        *operator.said.borrow(),
        [
            "Klipper repo has uncommitted changes",
            "MCU firmware v0.12.0-60-gabcdef0 is newer than host v0.12.0-45-g7ce409d-dirty (downgrade)",
        ]
    );
}
