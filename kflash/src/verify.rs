//! Confirming that a board came back running Klipper after a flash

use std::time::Duration;

use log::{debug, info};

use crate::{
    discovery::{match_endpoints, query_can_bus, Endpoint, Prefix},
    error::{Category, Error},
    host::Host,
    tools::Toolchain,
};

pub const USB_VERIFY_TIMEOUT: Duration = Duration::from_secs(30);
pub const USB_VERIFY_INTERVAL: Duration = Duration::from_millis(500);
pub const CAN_VERIFY_TIMEOUT: Duration = Duration::from_secs(15);
pub const CAN_VERIFY_INTERVAL: Duration = Duration::from_secs(2);
pub const CAN_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Application name reported by a CAN node running Klipper
const KLIPPER_APPLICATION: &str = "Klipper";

/// Wait for a USB board matching `pattern` to present under the Klipper
/// prefix.
///
/// Sightings under the Katapult prefix keep the wait going, since the final
/// reboot into the application takes a moment. If the deadline passes while
/// the board is still in Katapult, that is reported as such rather than as a
/// plain timeout.
pub fn verify_usb(host: &Host<'_>, pattern: &str) -> Result<Endpoint, Error> {
    let deadline = host.deadline(USB_VERIFY_TIMEOUT);
    let mut in_bootloader: Option<String> = None;

    let found = host.poll(deadline, USB_VERIFY_INTERVAL, || {
        let listing = host.endpoints.scan();
        let matches = match_endpoints(pattern, &listing);

        if let Some(klipper) = matches.iter().find(|e| e.prefix() == Prefix::Klipper) {
            return Some(Ok((*klipper).clone()));
        }
        if let Some(other) = matches.iter().find(|e| e.prefix() == Prefix::Other) {
            return Some(Err(Error::UnexpectedPrefix(other.filename.clone())));
        }

        in_bootloader = matches
            .iter()
            .find(|e| e.prefix() == Prefix::Katapult)
            .map(|e| e.filename.clone())
            .or(in_bootloader.take());
        if let Some(filename) = &in_bootloader {
            debug!("{filename} is still in Katapult");
        }
        None
    })?;

    match found {
        Some(result) => {
            let endpoint = result?;
            info!("Verified {} is running Klipper", endpoint.filename);
            Ok(endpoint)
        }
        None => Err(match in_bootloader {
            Some(filename) => Error::StillInBootloader(filename),
            None => Error::VerifyTimeout(USB_VERIFY_TIMEOUT),
        }),
    }
}

/// Wait for the node `uuid` on `interface` to report the Klipper application
pub fn verify_can(
    host: &Host<'_>,
    tools: &Toolchain,
    uuid: &str,
    interface: &str,
) -> Result<(), Error> {
    let deadline = host.deadline(CAN_VERIFY_TIMEOUT);
    let mut last_application: Option<String> = None;
    let mut fatal: Option<Error> = None;

    let verified = host.poll(deadline, CAN_VERIFY_INTERVAL, || {
        let nodes = match query_can_bus(host, tools, interface, CAN_QUERY_TIMEOUT) {
            Ok(nodes) => nodes,
            Err(err) if matches!(err.category(), Category::Configuration | Category::Cancelled) => {
                fatal = Some(err);
                return Some(());
            }
            Err(err) => {
                debug!("CAN query failed, retrying: {err}");
                return None;
            }
        };

        let node = nodes.into_iter().find(|node| node.uuid.eq_ignore_ascii_case(uuid))?;
        if node.application == KLIPPER_APPLICATION {
            return Some(());
        }

        debug!("CAN node {uuid} reports {}", node.application);
        last_application = Some(node.application);
        None
    })?;

    if let Some(err) = fatal {
        return Err(err);
    }
    match verified {
        Some(()) => {
            info!("Verified CAN node {uuid} is running Klipper");
            Ok(())
        }
        None => Err(Error::CanVerifyTimeout {
            uuid: uuid.into(),
            last_application,
            waited: CAN_VERIFY_TIMEOUT,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use super::*;
    use crate::{
        discovery::testing::ScriptedEndpoints,
        host::testing::VirtualClock,
        process::testing::{exit, ScriptedRunner},
    };

    const PATTERN: &str = "usb-Klipper_stm32h723xx_29001A*";
    const APP: &str = "usb-Klipper_stm32h723xx_29001A-if00";
    const BOOT: &str = "usb-katapult_stm32h723xx_29001A-if00";

    fn can_tools() -> (tempfile::TempDir, Toolchain) {
        let home = tempfile::tempdir().unwrap();
        let scripts = home.path().join("katapult/scripts");
        std::fs::create_dir_all(&scripts).unwrap();
        std::fs::write(scripts.join("flashtool.py"), "").unwrap();
        let tools = Toolchain::new(home.path().join("klipper"), home.path().join("katapult"));
        (home, tools)
    }

    #[test]
    fn usb_waits_through_bootloader_sightings() {
        let endpoints = ScriptedEndpoints::new(&[&[], &[BOOT], &[BOOT], &[APP]]);
        let runner = ScriptedRunner::new();
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);

        let endpoint = verify_usb(&host, PATTERN).unwrap();
        assert_eq!(endpoint.filename, APP);
        assert_eq!(clock.elapsed(), USB_VERIFY_INTERVAL * 3);
    }

    #[test]
    fn usb_stuck_in_bootloader_is_distinct_from_absent() {
        let endpoints = ScriptedEndpoints::new(&[&[BOOT]]);
        let runner = ScriptedRunner::new();
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);
        assert!(matches!(
            verify_usb(&host, PATTERN),
            Err(Error::StillInBootloader(name)) if name == BOOT
        ));
        assert_eq!(clock.elapsed(), USB_VERIFY_TIMEOUT);

        let endpoints = ScriptedEndpoints::new(&[&[]]);
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);
        assert!(matches!(verify_usb(&host, PATTERN), Err(Error::VerifyTimeout(_))));
    }

    #[test]
    fn usb_unknown_prefix_is_reported_verbatim() {
        let endpoints = ScriptedEndpoints::new(&[&["usb-Beacon_stm32h723xx_29001A-if00"]]);
        let runner = ScriptedRunner::new();
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);

        match verify_usb(&host, "usb-*_stm32h723xx_29001A*") {
            Err(Error::UnexpectedPrefix(name)) => {
                assert_eq!(name, "usb-Beacon_stm32h723xx_29001A-if00")
            }
            other => panic!("expected unexpected prefix, got {other:?}"),
        }
    }

    #[test]
    fn can_node_returns_as_klipper() {
        let (_home, tools) = can_tools();
        let endpoints = ScriptedEndpoints::new(&[&[]]);
        let queries = Rc::new(Cell::new(0));
        let counter = queries.clone();
        let runner = ScriptedRunner::with(move |_| {
            counter.set(counter.get() + 1);
            let application = if counter.get() == 1 { "Katapult" } else { "Klipper" };
            exit(
                0,
                &format!("Detected UUID: 48ca7afe7a44, Application: {application}\nQuery Complete\n"),
            )
        });
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);

        verify_can(&host, &tools, "48ca7afe7a44", "can0").unwrap();
        assert_eq!(queries.get(), 2);
        assert_eq!(clock.elapsed(), CAN_VERIFY_INTERVAL);

        let call = &runner.calls()[0];
        assert_eq!(call.args[1..], ["-i", "can0", "-q"]);
        assert_eq!(call.timeout, CAN_QUERY_TIMEOUT);
    }

    #[test]
    fn can_timeout_remembers_last_application() {
        let (_home, tools) = can_tools();
        let endpoints = ScriptedEndpoints::new(&[&[]]);
        let runner =
            ScriptedRunner::with(|_| exit(0, "Detected UUID: 48ca7afe7a44, Application: Katapult\n"));
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);

        match verify_can(&host, &tools, "48ca7afe7a44", "can0") {
            Err(Error::CanVerifyTimeout { last_application, .. }) => {
                assert_eq!(last_application.as_deref(), Some("Katapult"))
            }
            other => panic!("expected CAN timeout, got {other:?}"),
        }
        assert_eq!(clock.elapsed(), CAN_VERIFY_TIMEOUT);
    }

    #[test]
    fn can_missing_flashtool_fails_immediately() {
        let endpoints = ScriptedEndpoints::new(&[&[]]);
        let runner = ScriptedRunner::new();
        let clock = VirtualClock::new();
        let host = Host::new(&endpoints, &runner, &clock);
        let tools = Toolchain::new("/nonexistent/klipper", "/nonexistent/katapult");

        assert!(matches!(
            verify_can(&host, &tools, "48ca7afe7a44", "can0"),
            Err(Error::MissingTool(_))
        ));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }
}
