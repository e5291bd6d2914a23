//! Flashing every registered device in one run
//!
//! When printer status is available, devices whose firmware already matches
//! the host's Klipper version can be left out first. All builds then happen
//! with the service still running. The service is
//! then stopped once, every device goes through the pipeline in turn, and the
//! service is started again at the end. A failing device never stops the
//! batch; only cancellation does.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
};

use comfy_table::{modifiers, presets::UTF8_FULL, Attribute, Cell, Color, Table};
use log::{info, warn};

use crate::{
    device::{Registration, Role, Transport, DEFAULT_CAN_INTERFACE},
    discovery::{check_can_interface, resolve, Endpoint},
    error::Error,
    firmware::Firmware,
    operator::Operator,
    pipeline::{caution, check_mcu, may_be_absent, DeviceResult, Pipeline, Report},
    service::ServiceGuard,
    version::{flavor, host_version, VersionSplit},
};

/// Flash order: CAN toolheads, then USB and role-less CAN nodes, then CAN
/// bridges, each group by key. Bridges go last because the toolheads talk
/// through them.
pub fn sort_devices(mut registrations: Vec<Registration>) -> Vec<Registration> {
    fn group(registration: &Registration) -> u8 {
        match registration.effective_role() {
            Some(Role::Toolhead) => 0,
            None => 1,
            Some(Role::Bridge) => 2,
        }
    }

    registrations.sort_by(|a, b| (group(a), &a.key).cmp(&(group(b), &b.key)));
    registrations
}

/// State carried from one device to the next
#[derive(Default)]
struct BatchState {
    targeted: HashSet<PathBuf>,
    /// Preflight result per CAN interface; `Some` holds the failure reason
    interfaces: HashMap<String, Option<String>>,
}

/// Ask the operator, or take the default when nobody is there
fn ask(operator: Option<&dyn Operator>, prompt: &str, default: bool) -> Result<bool, Error> {
    match operator {
        Some(operator) => operator.confirm(prompt, default),
        None => Ok(default),
    }
}

fn tell(operator: Option<&dyn Operator>, message: &str) {
    match operator {
        Some(operator) => operator.info(message),
        None => info!("{message}"),
    }
}

fn names(group: &[&Registration]) -> String {
    group
        .iter()
        .map(|registration| format!("  - {}", registration.name))
        .collect::<Vec<_>>()
        .join("\n")
}

impl Pipeline<'_> {
    /// Flash every flashable registration. `operator` answers the version
    /// questions and manual bootloader prompts; there are no retries or
    /// overrides.
    pub fn flash_all(&self, operator: Option<&dyn Operator>) -> Result<Report, Error> {
        let registrations: Vec<Registration> = self
            .registry
            .list()?
            .into_iter()
            .filter(|registration| {
                if !registration.flashable {
                    info!("Skipping '{}', it is excluded from flashing", registration.key);
                }
                registration.flashable
            })
            .collect();
        let registrations = self.select_by_version(sort_devices(registrations), operator)?;

        let mut jobs: Vec<(&Registration, Option<Firmware>, DeviceResult)> = registrations
            .iter()
            .map(|registration| {
                let mut result = DeviceResult::new(registration);
                let firmware = self.build(registration, &mut result);
                (registration, firmware, result)
            })
            .collect();

        if jobs.iter().all(|(_, firmware, _)| firmware.is_none()) {
            return Ok(Report {
                results: jobs.into_iter().map(|(_, _, result)| result).collect(),
                service: None,
            });
        }

        let guard = ServiceGuard::acquire(self.service)?;
        let mut state = BatchState::default();
        let mut previous: Option<&Registration> = None;
        let mut cancelled = false;

        for (registration, firmware, result) in &mut jobs {
            let Some(firmware) = firmware else {
                continue;
            };
            if cancelled {
                result.fail(Error::Cancelled);
                continue;
            }

            if let Some(previous) = previous {
                let delay = if previous.is_can() {
                    self.can_stagger
                } else {
                    self.stagger
                };
                if let Err(err) = self.host.pause(delay) {
                    cancelled = true;
                    result.fail(err);
                    continue;
                }
            }

            info!("Flashing '{}' ({})", registration.key, registration.name);
            if let Err(err) = self.flash_in_batch(registration, firmware, operator, &mut state, result) {
                cancelled = matches!(err, Error::Cancelled);
                result.fail(err);
            }

            previous = result.touched_hardware.then_some(*registration);
        }

        Ok(Report {
            results: jobs.into_iter().map(|(_, _, result)| result).collect(),
            service: Some(guard.release()),
        })
    }

    /// Narrow the batch down by comparing each MCU's firmware with the host
    /// version. Without a host version or MCU versions everything is kept.
    fn select_by_version(
        &self,
        registrations: Vec<Registration>,
        operator: Option<&dyn Operator>,
    ) -> Result<Vec<Registration>, Error> {
        let Some(status) = self.status else {
            return Ok(registrations);
        };
        let (Some(host), Some(versions)) = (
            host_version(self.host, self.tools),
            status.firmware_versions(),
        ) else {
            caution(operator, "Version check unavailable, flashing all devices");
            return Ok(registrations);
        };
        tell(operator, &format!("Host runs {} {host}", flavor(&host)));
        if registrations.is_empty() {
            return Ok(registrations);
        }

        let split = VersionSplit::new(&host, &versions, &registrations);
        let mut skipped: HashSet<String> = HashSet::new();

        if split.all_current() {
            tell(operator, "All devices already match the host version");
            if !ask(operator, "Flash anyway?", false)? {
                info!("Nothing to flash, firmware is already current");
                return Ok(Vec::new());
            }
        } else if !split.current.is_empty() {
            tell(operator, &format!("Outdated devices:\n{}", names(&split.outdated)));
            tell(operator, &format!("Up-to-date devices:\n{}", names(&split.current)));
            if ask(operator, "Flash only outdated devices?", true)? {
                skipped.extend(split.current.iter().map(|r| r.key.clone()));
            }
        }

        if !split.unknown.is_empty() {
            let nodes = split
                .unknown
                .iter()
                .map(|registration| {
                    let interface = registration.can_interface().unwrap_or(DEFAULT_CAN_INTERFACE);
                    let uuid = registration.can_uuid().unwrap_or_default();
                    format!("  - {} ({interface}: {uuid})", registration.name)
                })
                .collect::<Vec<_>>()
                .join("\n");
            tell(operator, &format!("CAN devices with unknown firmware version:\n{nodes}"));
            if !ask(operator, "Include devices with an unknown version?", true)? {
                skipped.extend(split.unknown.iter().map(|r| r.key.clone()));
            }
        }

        if !skipped.is_empty() {
            warn!("Leaving out {} device(s) after the version check", skipped.len());
        }
        Ok(registrations
            .into_iter()
            .filter(|registration| !skipped.contains(&registration.key))
            .collect())
    }

    fn build(&self, registration: &Registration, result: &mut DeviceResult) -> Option<Firmware> {
        let validated = registration
            .validate()
            .and_then(|_| self.firmware.validate(registration));
        if let Err(err) = validated {
            result.fail(err);
            return None;
        }
        result.config_ok = true;

        match self.firmware.provide(registration) {
            Ok(firmware) => {
                result.built = true;
                Some(firmware)
            }
            Err(err) => {
                result.fail(err);
                None
            }
        }
    }

    fn flash_in_batch(
        &self,
        registration: &Registration,
        firmware: &Firmware,
        operator: Option<&dyn Operator>,
        state: &mut BatchState,
        result: &mut DeviceResult,
    ) -> Result<(), Error> {
        let endpoint = match &registration.transport {
            Transport::Can { .. } => {
                let interface = registration.can_interface().unwrap_or(DEFAULT_CAN_INTERFACE);
                self.preflight(interface, state)?;
                None
            }
            Transport::Usb { pattern } => self.claim_endpoint(registration, pattern, state)?,
        };

        self.run_hardware(registration, endpoint.as_ref(), firmware, operator, false, result)
    }

    /// Resolve a USB device afresh, refusing ambiguous matches, ports already
    /// flashed in this batch and MCU mismatches
    fn claim_endpoint(
        &self,
        registration: &Registration,
        pattern: &str,
        state: &mut BatchState,
    ) -> Result<Option<Endpoint>, Error> {
        let listing = self.host.endpoints.scan();
        let endpoint = match resolve(pattern, &listing)? {
            Some(endpoint) => endpoint.clone(),
            None if may_be_absent(registration) => return Ok(None),
            None => return Err(Error::NotConnected(pattern.into())),
        };

        let real_path = endpoint.real_path();
        if state.targeted.contains(&real_path) {
            return Err(Error::DuplicatePath(real_path));
        }
        check_mcu(registration, &endpoint)?;

        state.targeted.insert(real_path);
        Ok(Some(endpoint))
    }

    fn preflight(&self, interface: &str, state: &mut BatchState) -> Result<(), Error> {
        let failure = state
            .interfaces
            .entry(interface.to_string())
            .or_insert_with(|| match check_can_interface(&self.sysfs, interface) {
                Ok(()) => None,
                Err(Error::CanInterface { reason, .. }) => Some(reason),
                Err(other) => Some(other.to_string()),
            });

        match failure {
            None => Ok(()),
            Some(reason) => Err(Error::CanInterface {
                interface: interface.into(),
                reason: reason.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pass,
    Fail,
    Skip,
}

impl Phase {
    fn cell(self) -> Cell {
        match self {
            Phase::Pass => Cell::new("PASS").fg(Color::Green),
            Phase::Fail => Cell::new("FAIL")
                .fg(Color::Red)
                .add_attribute(Attribute::Bold),
            Phase::Skip => Cell::new("SKIP").fg(Color::DarkGrey),
        }
    }
}

/// Build, Boot, Flash and Verify; everything after the first failure is
/// skipped
fn phases(result: &DeviceResult) -> [Phase; 4] {
    let reached = [
        result.config_ok && result.built,
        result.bootloader_ok,
        result.flashed,
        result.verified,
    ];

    let mut failed = false;
    reached.map(|ok| {
        if ok && !failed {
            Phase::Pass
        } else if !failed {
            failed = true;
            Phase::Fail
        } else {
            Phase::Skip
        }
    })
}

/// Per-device table followed by totals, failure details and the service
/// outcome
pub fn render_summary(report: &Report) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
        .set_header(
            ["Device", "Build", "Boot", "Flash", "Verify"]
                .into_iter()
                .map(|title| Cell::new(title).add_attribute(Attribute::Bold)),
        );

    for result in &report.results {
        let mut row = vec![Cell::new(&result.name)];
        row.extend(phases(result).into_iter().map(Phase::cell));
        table.add_row(row);
    }

    let mut lines = vec![
        table.to_string(),
        format!(
            "{} passed, {} failed out of {} device(s)",
            report.passed(),
            report.failed(),
            report.results.len()
        ),
    ];
    for result in &report.results {
        if let Some(err) = &result.error {
            lines.push(format!("  {}: {}", result.key, err.summary()));
        }
    }
    if let Some(service) = &report.service {
        lines.push(service.to_string());
    }

    lines.join("\n")
}
