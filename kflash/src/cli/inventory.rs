//! `list` and `scan`: what is registered and what is attached

use std::{collections::HashMap, path::Path, slice};

use comfy_table::{modifiers, presets::UTF8_FULL, Attribute, Cell, Color, Table};
use log::debug;
use miette::Result;

use super::Session;
use crate::{
    device::{Registration, Transport, DEFAULT_CAN_INTERFACE},
    discovery::{
        can_interfaces, check_can_interface, extract_mcu, is_supported, match_endpoints,
        query_can_bus, resolve, serial_pattern_for, CanEndpoint, Endpoint,
        EndpointSource, Prefix, SerialById, SYSFS_NET,
    },
    error::Error,
    host::{Host, SystemClock},
    pipeline::may_be_absent,
    process::SystemRunner,
    registry::Registry,
    status::{Moonraker, StatusSource},
    verify::CAN_QUERY_TIMEOUT,
    version::firmware_version,
};

fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
        .set_header(header.iter().map(|title| {
            Cell::new(title)
                .fg(Color::Green)
                .add_attribute(Attribute::Bold)
        }));
    table
}

/// CAN nodes per interface, queried at most once. `None` when the interface
/// is unusable or Katapult is not installed.
struct CanBus<'a> {
    host: &'a Host<'a>,
    session: &'a Session,
    nodes: HashMap<String, Option<Vec<CanEndpoint>>>,
}

impl<'a> CanBus<'a> {
    fn new(host: &'a Host<'a>, session: &'a Session) -> Self {
        Self {
            host,
            session,
            nodes: HashMap::new(),
        }
    }

    fn nodes(&mut self, interface: &str) -> Option<&[CanEndpoint]> {
        let (host, session) = (self.host, self.session);
        self.nodes
            .entry(interface.to_string())
            .or_insert_with(|| {
                let query = check_can_interface(Path::new(SYSFS_NET), interface).and_then(|_| {
                    query_can_bus(host, &session.tools, interface, CAN_QUERY_TIMEOUT)
                });
                query
                    .map_err(|err| debug!("Skipping CAN query on {interface}: {err}"))
                    .ok()
            })
            .as_deref()
    }
}

fn usb_status(registration: &Registration, pattern: &str, listing: &[Endpoint]) -> Cell {
    match resolve(pattern, listing) {
        Ok(Some(endpoint)) => match endpoint.prefix() {
            Prefix::Katapult => Cell::new("in bootloader").fg(Color::Yellow),
            _ => Cell::new("connected").fg(Color::Green),
        },
        Ok(None) if may_be_absent(registration) => Cell::new("manual").fg(Color::DarkGrey),
        Ok(None) => Cell::new("not found").fg(Color::Red),
        Err(Error::AmbiguousDevice { matches, .. }) => {
            Cell::new(format!("ambiguous ({})", matches.len())).fg(Color::Red)
        }
        Err(_) => Cell::new("error").fg(Color::Red),
    }
}

fn can_status(uuid: &str, nodes: Option<&[CanEndpoint]>) -> Cell {
    let Some(nodes) = nodes else {
        return Cell::new("unknown").fg(Color::DarkGrey);
    };

    match nodes.iter().find(|node| node.uuid == uuid) {
        Some(node) if node.application == "Klipper" => Cell::new("online").fg(Color::Green),
        Some(node) => Cell::new(format!("online ({})", node.application)).fg(Color::Yellow),
        None => Cell::new("not found").fg(Color::Red),
    }
}

/// Show every registration with its connection state
pub fn list(session: &Session) -> Result<()> {
    let registrations = session.registry.list()?;
    if registrations.is_empty() {
        println!("No devices registered, add one with `kflash add`");
        return Ok(());
    }

    let endpoints = SerialById::default();
    let (runner, clock) = (SystemRunner, SystemClock);
    let host = Host::new(&endpoints, &runner, &clock).with_interrupt(session.interrupt.clone());
    let listing = endpoints.scan();
    let mut bus = CanBus::new(&host, session);
    let versions = Moonraker::new(&session.settings.moonraker_url)
        .firmware_versions()
        .unwrap_or_default();

    let mut table = table(&[
        "Key",
        "Name",
        "MCU",
        "Connection",
        "Status",
        "Methods",
        "Firmware",
        "Last flash",
    ]);
    for registration in &registrations {
        let (connection, status) = match &registration.transport {
            Transport::Usb { pattern } => (
                pattern.clone(),
                usb_status(registration, pattern, &listing),
            ),
            Transport::Can { uuid, .. } => {
                let interface = registration.can_interface().unwrap_or(DEFAULT_CAN_INTERFACE);
                (format!("{uuid} on {interface}"), can_status(uuid, bus.nodes(interface)))
            }
        };

        let methods = format!(
            "{} / {}",
            registration.bootloader_method.as_deref().unwrap_or("-"),
            registration.flash_method.as_deref().unwrap_or("-"),
        );
        let methods = if registration.flashable {
            Cell::new(methods)
        } else {
            Cell::new(format!("{methods} (excluded)")).fg(Color::DarkGrey)
        };

        table.add_row(vec![
            Cell::new(&registration.key).add_attribute(Attribute::Bold),
            Cell::new(&registration.name),
            Cell::new(&registration.mcu),
            Cell::new(connection),
            status,
            methods,
            Cell::new(firmware_version(&versions, registration).unwrap_or("-")),
            Cell::new(registration.last_flash.as_deref().unwrap_or("never")),
        ]);
    }

    println!("{table}");
    Ok(())
}

/// Show attached Klipper/Katapult devices and CAN nodes, with the
/// registration each belongs to
pub fn scan(session: &Session) -> Result<()> {
    let registrations = session.registry.list()?;
    let blocked = session.registry.blocked()?;

    let endpoints = SerialById::default();
    let (runner, clock) = (SystemRunner, SystemClock);
    let host = Host::new(&endpoints, &runner, &clock).with_interrupt(session.interrupt.clone());

    let (hidden, shown): (Vec<Endpoint>, Vec<Endpoint>) = endpoints
        .scan()
        .into_iter()
        .filter(|endpoint| is_supported(&endpoint.filename))
        .partition(|endpoint| blocked.iter().any(|b| b.matches(&endpoint.filename)));

    let mut table = table(&["Device", "Mode", "MCU", "Registered as"]);
    for endpoint in &shown {
        let owners: Vec<&str> = registrations
            .iter()
            .filter(|registration| {
                registration.serial_pattern().is_some_and(|pattern| {
                    !match_endpoints(pattern, slice::from_ref(endpoint)).is_empty()
                })
            })
            .map(|registration| registration.key.as_str())
            .collect();

        let mode = match endpoint.prefix() {
            Prefix::Katapult => Cell::new("bootloader").fg(Color::Yellow),
            _ => Cell::new("application"),
        };
        let owner = if owners.is_empty() {
            Cell::new(format!("- (pattern {})", serial_pattern_for(&endpoint.filename)))
                .fg(Color::DarkGrey)
        } else {
            Cell::new(owners.join(", ")).fg(Color::Green)
        };

        table.add_row(vec![
            Cell::new(&endpoint.filename),
            mode,
            Cell::new(extract_mcu(&endpoint.filename).unwrap_or_default()),
            owner,
        ]);
    }

    let mut bus = CanBus::new(&host, session);
    for interface in can_interfaces(Path::new(SYSFS_NET)) {
        let Some(nodes) = bus.nodes(&interface) else {
            continue;
        };
        for node in nodes {
            let owner = registrations
                .iter()
                .find(|registration| registration.can_uuid() == Some(node.uuid.as_str()))
                .map(|registration| Cell::new(&registration.key).fg(Color::Green))
                .unwrap_or_else(|| Cell::new("-").fg(Color::DarkGrey));

            table.add_row(vec![
                Cell::new(format!("{} on {interface}", node.uuid)),
                Cell::new(&node.application),
                Cell::new(""),
                owner,
            ]);
        }
    }

    if table.row_iter().next().is_none() {
        println!("No Klipper or Katapult devices found");
    } else {
        println!("{table}");
    }
    if !hidden.is_empty() {
        println!("{} blocked device(s) hidden", hidden.len());
    }

    Ok(())
}
