//! Printer status from Moonraker, used as a safety gate before flashing
//!
//! Moonraker being unreachable is never fatal: the gate warns and lets the
//! flash proceed.

use std::{collections::BTreeMap, fmt, time::Duration};

use log::{debug, warn};
use reqwest::blocking::Client;
use serde_json::Value;

use crate::error::Error;

/// Request timeout for every Moonraker call
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// States in which touching the MCUs would ruin a print
const BLOCKING_STATES: &[&str] = &["startup", "printing", "paused"];

/// What the printer is doing right now
#[derive(Debug, Clone, PartialEq)]
pub struct PrintStatus {
    /// `standby`, `printing`, `paused`, `complete`, `error` or `cancelled`
    pub state: String,
    pub filename: Option<String>,
    /// Between 0.0 and 1.0
    pub progress: f64,
}

impl PrintStatus {
    pub fn is_blocking(&self) -> bool {
        BLOCKING_STATES.contains(&self.state.as_str())
    }
}

impl fmt::Display for PrintStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state)?;
        if let Some(filename) = &self.filename {
            write!(f, " ({filename}, {:.0}%)", self.progress * 100.0)?;
        }
        Ok(())
    }
}

/// Source of printer state and MCU firmware versions
pub trait StatusSource {
    /// `None` when the source is unreachable
    fn print_status(&self) -> Option<PrintStatus>;

    /// Firmware version per MCU, keyed by MCU name (`main` for `[mcu]`,
    /// `nhk` for `[mcu nhk]`) and also by chip type
    fn firmware_versions(&self) -> Option<BTreeMap<String, String>>;
}

/// Moonraker's HTTP API
pub struct Moonraker {
    url: String,
    client: Option<Client>,
}

impl Moonraker {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| warn!("Could not create HTTP client: {err}"))
            .ok();

        Self {
            url: url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn get(&self, path_and_query: &str) -> Option<Value> {
        let client = self.client.as_ref()?;
        let url = format!("{}{path_and_query}", self.url);

        let result = client
            .get(&url)
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.json::<Value>());

        match result {
            Ok(value) => Some(value),
            Err(err) => {
                debug!("GET {url} failed: {err}");
                None
            }
        }
    }
}

impl StatusSource for Moonraker {
    fn print_status(&self) -> Option<PrintStatus> {
        self.get("/printer/objects/query?print_stats&virtual_sdcard")
            .as_ref()
            .and_then(parse_print_status)
    }

    fn firmware_versions(&self) -> Option<BTreeMap<String, String>> {
        let listing = self.get("/printer/objects/list")?;
        let objects = mcu_objects(&listing);
        if objects.is_empty() {
            return None;
        }

        let query = objects
            .iter()
            .map(|name| name.replace(' ', "%20"))
            .collect::<Vec<_>>()
            .join("&");
        let status = self.get(&format!("/printer/objects/query?{query}"))?;

        let versions = parse_versions(&status);
        (!versions.is_empty()).then_some(versions)
    }
}

fn parse_print_status(body: &Value) -> Option<PrintStatus> {
    let status = body.get("result")?.get("status")?;
    let print_stats = &status["print_stats"];

    Some(PrintStatus {
        state: print_stats["state"].as_str().unwrap_or("standby").to_string(),
        filename: print_stats["filename"]
            .as_str()
            .filter(|name| !name.is_empty())
            .map(str::to_string),
        progress: status["virtual_sdcard"]["progress"].as_f64().unwrap_or(0.0),
    })
}

fn mcu_objects(body: &Value) -> Vec<String> {
    body["result"]["objects"]
        .as_array()
        .map(|objects| {
            objects
                .iter()
                .filter_map(Value::as_str)
                .filter(|name| *name == "mcu" || name.starts_with("mcu "))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_versions(body: &Value) -> BTreeMap<String, String> {
    let mut versions = BTreeMap::new();
    let Some(status) = body["result"]["status"].as_object() else {
        return versions;
    };

    for (object, data) in status {
        let Some(version) = data["mcu_version"].as_str() else {
            continue;
        };

        let name = match object.strip_prefix("mcu ") {
            Some(name) => name.to_string(),
            None => "main".to_string(),
        };
        versions.insert(name, version.to_string());

        if let Some(chip) = data["mcu_constants"]["MCU"].as_str() {
            versions
                .entry(chip.to_string())
                .or_insert_with(|| version.to_string());
        }
    }

    versions
}

/// Refuse to flash while a print is active, unless forced
pub fn safety_gate(source: &dyn StatusSource, force: bool) -> Result<(), Error> {
    let Some(status) = source.print_status() else {
        warn!("Moonraker is unreachable, print status unknown; continuing");
        return Ok(());
    };
    debug!("Printer is {status}");

    if status.is_blocking() {
        if force {
            warn!("Printer is {status}, flashing anyway because of --force");
            return Ok(());
        }
        return Err(Error::PrinterBusy {
            state: status.to_string(),
        });
    }

    if status.state == "error" {
        warn!("Printer reports an error state; continuing");
    }
    Ok(())
}
