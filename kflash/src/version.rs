//! Comparing the host's Klipper checkout with the firmware the MCUs run
//!
//! The host version comes from `git describe` in the Klipper directory. MCU
//! versions come from Moonraker through a
//! [StatusSource](crate::status::StatusSource). Both use the
//! `v0.12.0-45-g7ce409d` form, optionally with a `-dirty` suffix. Kalico uses
//! date tags (`v2025.01.15-...`) in the same shape.

use std::{collections::BTreeMap, path::Path, process::Command, sync::LazyLock, time::Duration};

use log::debug;
use regex::Regex;

use crate::{
    device::Registration,
    discovery::mcu_matches,
    host::Host,
    process::Output,
    tools::Toolchain,
};

/// Timeout for each `git` query
pub const GIT_TIMEOUT: Duration = Duration::from_secs(5);

static DESCRIBE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(v[0-9A-Za-z._-]+?)(?:-([0-9]+)-g[0-9a-fA-F]+)?(?:-dirty)?$").unwrap()
});
static RELEASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^v?(\d+)\.(\d+)\.(\d+)(?:-(\d+)-g[0-9a-fA-F]+)?(?:-dirty)?$").unwrap()
});
static KALICO_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^v?(20[2-9]\d)\.").unwrap());
static KLIPPER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^v?\d+\.\d+\.\d+").unwrap());

/// Version of the Klipper checkout, always with a commit count and hash.
/// `None` when git is unavailable or the directory is not a repository.
pub fn host_version(host: &Host<'_>, tools: &Toolchain) -> Option<String> {
    let dir = tools.klipper_dir.as_path();
    let describe = git(host, dir, &["describe", "--always", "--tags", "--long", "--dirty"])?;
    if describe.contains("-g") {
        return Some(describe);
    }

    // A bare tag or hash: rebuild the long form by hand
    let tag = if describe.starts_with('v') {
        Some(describe)
    } else {
        git(host, dir, &["describe", "--tags", "--abbrev=0"])
    };
    let count = git(host, dir, &["rev-list", "--count", "HEAD"])?;
    let hash = git(host, dir, &["rev-parse", "--short", "HEAD"])?;

    Some(match tag {
        Some(tag) => format!("{tag}-{count}-g{hash}"),
        None => format!("{count}-g{hash}"),
    })
}

fn git(host: &Host<'_>, dir: &Path, args: &[&str]) -> Option<String> {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(dir);

    match host.runner.run(&mut cmd, GIT_TIMEOUT, Output::Capture) {
        Ok(exit) if exit.success() => {
            let stdout = exit.stdout.trim();
            (!stdout.is_empty()).then(|| stdout.to_string())
        }
        Ok(exit) => {
            debug!("git {} failed: {}", args.join(" "), exit.detail());
            None
        }
        Err(err) => {
            debug!("git {} failed: {err}", args.join(" "));
            None
        }
    }
}

/// `Kalico`, `Klipper` or `Unknown`, judged by the tag format
pub fn flavor(version: &str) -> &'static str {
    let kalico = KALICO_RE
        .captures(version)
        .and_then(|caps| caps[1].parse::<u32>().ok())
        .is_some_and(|year| year >= 2025);

    if kalico {
        "Kalico"
    } else if KLIPPER_RE.is_match(version) {
        "Klipper"
    } else {
        "Unknown"
    }
}

/// The checkout has uncommitted changes
pub fn is_dirty(version: &str) -> bool {
    version.ends_with("-dirty")
}

/// Tag and commit count of a `git describe` string
fn describe(version: &str) -> Option<(&str, Option<u32>)> {
    let caps = DESCRIBE_RE.captures(version)?;
    let tag = caps.get(1)?.as_str();
    let count = caps.get(2).and_then(|count| count.as_str().parse().ok());
    Some((tag, count))
}

/// Whether the MCU firmware is behind the host. A different tag counts as
/// behind; on the same tag the commit counts decide.
pub fn is_outdated(host: &str, mcu: &str) -> bool {
    let (host, mcu) = (host.trim(), mcu.trim());
    if host.is_empty() || mcu.is_empty() {
        return false;
    }

    match (describe(host), describe(mcu)) {
        (Some((host_tag, host_count)), Some((mcu_tag, mcu_count))) => {
            if host_tag != mcu_tag {
                return true;
            }
            match (host_count, mcu_count) {
                (Some(host_count), Some(mcu_count)) => mcu_count < host_count,
                _ => false,
            }
        }
        _ => host != mcu,
    }
}

fn release(version: &str) -> Option<(u32, u32, u32, u32)> {
    let caps = RELEASE_RE.captures(version.trim())?;
    let part = |index: usize| -> Option<u32> {
        caps.get(index)
            .map_or(Some(0), |part| part.as_str().parse().ok())
    };
    Some((part(1)?, part(2)?, part(3)?, part(4)?))
}

/// Whether flashing the host version would move the MCU backwards. `None`
/// when either version is not in release form.
pub fn is_downgrade(host: &str, mcu: &str) -> Option<bool> {
    Some(release(mcu)? > release(host)?)
}

/// The running firmware version of a registered MCU, looked up by key and
/// then by chip type
pub fn firmware_version<'v>(
    versions: &'v BTreeMap<String, String>,
    registration: &Registration,
) -> Option<&'v str> {
    versions
        .get(&registration.key)
        .or_else(|| {
            versions
                .iter()
                .find(|(name, _)| mcu_matches(name, &registration.mcu))
                .map(|(_, version)| version)
        })
        .map(String::as_str)
}

/// Registrations grouped by how their firmware compares with the host
#[derive(Debug, Default)]
pub struct VersionSplit<'r> {
    pub outdated: Vec<&'r Registration>,
    pub current: Vec<&'r Registration>,
    /// CAN nodes Moonraker reports no version for
    pub unknown: Vec<&'r Registration>,
}

impl<'r> VersionSplit<'r> {
    /// A USB board without a known version is treated as outdated
    pub fn new(
        host: &str,
        versions: &BTreeMap<String, String>,
        registrations: &'r [Registration],
    ) -> Self {
        let mut split = Self::default();

        for registration in registrations {
            match firmware_version(versions, registration) {
                None if registration.is_can() => split.unknown.push(registration),
                Some(version) if !is_outdated(host, version) => split.current.push(registration),
                _ => split.outdated.push(registration),
            }
        }

        split
    }

    pub fn all_current(&self) -> bool {
        self.outdated.is_empty() && self.unknown.is_empty()
    }
}
