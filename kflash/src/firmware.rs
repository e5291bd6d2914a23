//! Firmware images and where they come from
//!
//! The pipeline treats an image as an opaque file: it only ever checks that
//! the file exists and is not empty.

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    sync::LazyLock,
    time::Duration,
};

use log::{debug, info, warn};
use regex::Regex;
use tempfile::{NamedTempFile, TempDir};

use crate::{
    config::ConfigDir,
    device::Registration,
    discovery::mcu_matches,
    error::Error,
    process::{CommandRunner, Output},
    tools::Toolchain,
};

/// Images smaller than this are suspicious, but still flashed
pub const MIN_PLAUSIBLE_SIZE: u64 = 16 * 1024;

/// Hard limit on each `make` invocation
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(300);

static CONFIG_MCU_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^CONFIG_MCU="([^"]+)""#).unwrap());
static CONFIG_BOARD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^CONFIG_BOARD_DIRECTORY="([^"]+)""#).unwrap());

/// A firmware image on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firmware {
    pub path: PathBuf,
    pub size: u64,
}

impl Firmware {
    /// Check that `path` is a non-empty file
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let metadata = match fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => return Err(Error::FirmwareMissing(path)),
        };

        let size = metadata.len();
        if size == 0 {
            return Err(Error::FirmwareEmpty(path));
        }
        if size < MIN_PLAUSIBLE_SIZE {
            warn!(
                "Firmware {} is only {size} bytes, which is unusually small",
                path.display()
            );
        }

        Ok(Self { path, size })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "klipper.bin".into())
    }
}

/// Produces the image to flash for a registration
pub trait FirmwareProvider {
    /// Check, without building, that an image can be produced
    fn validate(&self, registration: &Registration) -> Result<(), Error>;

    fn provide(&self, registration: &Registration) -> Result<Firmware, Error>;
}

/// An image supplied on the command line
#[derive(Debug, Clone)]
pub struct Prebuilt {
    path: PathBuf,
}

impl Prebuilt {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FirmwareProvider for Prebuilt {
    fn validate(&self, _registration: &Registration) -> Result<(), Error> {
        Firmware::open(&self.path).map(|_| ())
    }

    fn provide(&self, _registration: &Registration) -> Result<Firmware, Error> {
        Firmware::open(&self.path)
    }
}

/// Builds Klipper from each device's cached `.config`
pub struct MakeBuilder<'a> {
    runner: &'a dyn CommandRunner,
    klipper_dir: PathBuf,
    config: ConfigDir,
    jobs: usize,
    artifacts: TempDir,
}

impl<'a> MakeBuilder<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        tools: &Toolchain,
        config: ConfigDir,
    ) -> Result<Self, Error> {
        let jobs = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Ok(Self {
            runner,
            klipper_dir: tools.klipper_dir.clone(),
            config,
            jobs,
            artifacts: tempfile::Builder::new().prefix("kflash-").tempdir()?,
        })
    }

    fn make(&self, step: &str, args: &[String]) -> Result<(), Error> {
        let mut cmd = Command::new("make");
        cmd.args(args).current_dir(&self.klipper_dir);

        match self.runner.run(&mut cmd, BUILD_TIMEOUT, Output::Capture) {
            Ok(exit) if exit.success() => Ok(()),
            Ok(exit) => Err(Error::BuildFailed {
                step: step.into(),
                detail: exit.detail(),
            }),
            Err(Error::CommandTimeout { timeout, .. }) => Err(Error::BuildFailed {
                step: step.into(),
                detail: format!("timed out after {}s", timeout.as_secs()),
            }),
            Err(err) => Err(err),
        }
    }

    /// Copy the cached config into the Klipper checkout through a temporary
    /// file so an interrupted copy never leaves a truncated `.config`
    fn install_config(&self, cached: &Path) -> Result<(), Error> {
        fs::create_dir_all(&self.klipper_dir)?;
        let staged = NamedTempFile::new_in(&self.klipper_dir)?;
        fs::copy(cached, staged.path())?;
        staged
            .persist(self.klipper_dir.join(".config"))
            .map_err(|err| Error::Io(err.error))?;
        Ok(())
    }
}

impl FirmwareProvider for MakeBuilder<'_> {
    fn validate(&self, registration: &Registration) -> Result<(), Error> {
        let cached = self.config.build_config(&registration.key);
        if !cached.is_file() {
            return Err(Error::MissingBuildConfig(registration.key.clone()));
        }

        let found = config_mcu(&fs::read_to_string(&cached)?).unwrap_or_else(|| "unknown".into());
        if mcu_matches(&found, &registration.mcu) {
            Ok(())
        } else {
            Err(Error::BuildConfigMismatch {
                found,
                expected: registration.mcu.clone(),
            })
        }
    }

    fn provide(&self, registration: &Registration) -> Result<Firmware, Error> {
        self.validate(registration)?;
        self.install_config(&self.config.build_config(&registration.key))?;

        info!("Building firmware for '{}'", registration.key);
        self.make("make clean", &["clean".into()])?;
        self.make("make", &[format!("-j{}", self.jobs)])?;

        let out = self.klipper_dir.join("out");
        let built = ["klipper.bin", "klipper.uf2"]
            .iter()
            .map(|name| out.join(name))
            .find(|path| path.is_file())
            .ok_or_else(|| Error::ArtifactMissing(out.clone()))?;

        // The next device's build overwrites out/, so keep a private copy
        let extension = built.extension().unwrap_or_default().to_string_lossy();
        let kept = self
            .artifacts
            .path()
            .join(format!("{}.{extension}", registration.key));
        fs::copy(&built, &kept)?;
        debug!("Kept {} as {}", built.display(), kept.display());

        Firmware::open(kept)
    }
}

/// MCU named by a Klipper `.config`, falling back to the board directory for
/// architectures that have no `CONFIG_MCU`
pub fn config_mcu(contents: &str) -> Option<String> {
    CONFIG_MCU_RE
        .captures(contents)
        .or_else(|| CONFIG_BOARD_RE.captures(contents))
        .map(|caps| caps[1].to_string())
}
