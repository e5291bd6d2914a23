//! Finding attached boards
//!
//! USB boards show up as symlinks in `/dev/serial/by-id`. Klipper names them
//! `usb-Klipper_<mcu>_<serial>-if00` and Katapult `usb-katapult_<mcu>_<serial>-if00`,
//! so the same board changes name when it moves between its application and
//! its bootloader. Matching therefore tries both prefixes, and a
//! [DeviceSignature] made of the MCU and serial tokens recognises the board
//! across the change.
//!
//! CAN nodes are found by asking Katapult's `flashtool.py` to query the bus.

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    sync::LazyLock,
    time::Duration,
};

use log::debug;
use regex::Regex;

use crate::{
    error::Error,
    host::Host,
    process::Output,
    tools::Toolchain,
};

/// Directory listing USB serial devices by their stable identity
pub const SERIAL_BY_ID: &str = "/dev/serial/by-id";

/// sysfs directory listing network interfaces
pub const SYSFS_NET: &str = "/sys/class/net";

/// `ARPHRD_CAN` from `linux/if_arp.h`
const ARPHRD_CAN: u32 = 280;

/// Smallest transmit queue that survives a Katapult transfer
pub const MINIMUM_CAN_QUEUE_LEN: u32 = 128;

const KLIPPER_PREFIX: &str = "usb-klipper_";
const KATAPULT_PREFIX: &str = "usb-katapult_";

static SIGNATURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"usb-(?:Klipper|katapult)_([a-zA-Z0-9]+)_([A-Fa-f0-9]+)").unwrap()
});
static MCU_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)usb-(?:Klipper|katapult)_([a-z0-9]+?)(?:x[a-z0-9]*)?_").unwrap()
});
static INTERFACE_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-if\d+$").unwrap());
static CAN_QUERY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Detected UUID:\s+([0-9a-f]{12}),\s+Application:\s+(\S+)").unwrap()
});
static CAN_INTERFACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^can\d+$").unwrap());

/// An attached USB serial device, observed during a single scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub path: PathBuf,
    pub filename: String,
}

impl Endpoint {
    pub fn new(dir: impl AsRef<Path>, filename: impl Into<String>) -> Self {
        let filename = filename.into();
        Self {
            path: dir.as_ref().join(&filename),
            filename,
        }
    }

    pub fn prefix(&self) -> Prefix {
        Prefix::of(&self.filename)
    }

    pub fn signature(&self) -> Option<DeviceSignature> {
        DeviceSignature::from_filename(&self.filename)
    }

    /// The symlink target, or the path itself when it cannot be resolved
    pub fn real_path(&self) -> PathBuf {
        fs::canonicalize(&self.path).unwrap_or_else(|_| self.path.clone())
    }
}

/// Which firmware a USB filename says is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    /// `usb-Klipper_`: application firmware
    Klipper,
    /// `usb-katapult_`: bootloader
    Katapult,
    /// Anything else
    Other,
}

impl Prefix {
    pub fn of(filename: &str) -> Self {
        let lower = filename.to_ascii_lowercase();
        if lower.starts_with(KLIPPER_PREFIX) {
            Prefix::Klipper
        } else if lower.starts_with(KATAPULT_PREFIX) {
            Prefix::Katapult
        } else {
            Prefix::Other
        }
    }
}

/// Source of the current USB endpoint listing. Implementations must read
/// fresh state on every call.
pub trait EndpointSource {
    fn scan(&self) -> Vec<Endpoint>;
}

/// Lists a `/dev/serial/by-id` style directory
#[derive(Debug, Clone)]
pub struct SerialById {
    dir: PathBuf,
}

impl SerialById {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Default for SerialById {
    fn default() -> Self {
        Self::new(SERIAL_BY_ID)
    }
}

impl EndpointSource for SerialById {
    fn scan(&self) -> Vec<Endpoint> {
        // The directory only exists while at least one device is attached
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut endpoints: Vec<Endpoint> = entries
            .filter_map(Result::ok)
            .map(|entry| Endpoint {
                path: entry.path(),
                filename: entry.file_name().to_string_lossy().into_owned(),
            })
            .collect();
        endpoints.sort_by(|a, b| a.filename.cmp(&b.filename));
        endpoints
    }
}

/// Whether a filename belongs to a Klipper or Katapult USB device
pub fn is_supported(filename: &str) -> bool {
    Prefix::of(filename) != Prefix::Other
}

/// A pattern under both the Klipper and Katapult prefixes
pub fn prefix_variants(pattern: &str) -> Vec<String> {
    let lower = pattern.to_ascii_lowercase();
    if lower.starts_with(KLIPPER_PREFIX) {
        vec![
            pattern.to_string(),
            format!("usb-katapult_{}", &pattern[KLIPPER_PREFIX.len()..]),
        ]
    } else if lower.starts_with(KATAPULT_PREFIX) {
        vec![
            pattern.to_string(),
            format!("usb-Klipper_{}", &pattern[KATAPULT_PREFIX.len()..]),
        ]
    } else {
        vec![pattern.to_string()]
    }
}

/// Shell-style glob match (`*`, `?`, `[...]`, `[!...]`), case-sensitive
pub fn glob_matches(pattern: &str, name: &str) -> bool {
    match Regex::new(&glob_to_regex(pattern)) {
        Ok(re) => re.is_match(name),
        Err(err) => {
            debug!("Unusable pattern {pattern:?}: {err}");
            false
        }
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut j = i + 1;
                if j < chars.len() && chars[j] == '!' {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ']' {
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }

                if j >= chars.len() {
                    out.push_str(r"\[");
                } else {
                    let mut class: String = chars[i + 1..j].iter().collect();
                    if let Some(rest) = class.strip_prefix('!') {
                        class = format!("^{rest}");
                    }
                    out.push('[');
                    out.push_str(&class.replace('\\', r"\\").replace('[', r"\["));
                    out.push(']');
                    i = j;
                }
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    out.push('$');
    out
}

/// Every endpoint matching a pattern under either prefix
pub fn match_endpoints<'a>(pattern: &str, endpoints: &'a [Endpoint]) -> Vec<&'a Endpoint> {
    let variants = prefix_variants(pattern);
    endpoints
        .iter()
        .filter(|endpoint| {
            variants
                .iter()
                .any(|variant| glob_matches(variant, &endpoint.filename))
        })
        .collect()
}

/// Resolve a pattern to at most one endpoint. More than one match is an
/// ambiguity error, never a guess.
pub fn resolve<'a>(pattern: &str, endpoints: &'a [Endpoint]) -> Result<Option<&'a Endpoint>, Error> {
    let matches = match_endpoints(pattern, endpoints);
    match matches.as_slice() {
        [] => Ok(None),
        [endpoint] => Ok(Some(endpoint)),
        _ => Err(Error::AmbiguousDevice {
            pattern: pattern.into(),
            matches: matches.iter().map(|e| e.filename.clone()).collect(),
        }),
    }
}

/// MCU and serial tokens that identify one physical board in either mode
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceSignature {
    /// Lowercased MCU token, e.g. `stm32h723xx`
    pub mcu: String,
    /// Hexadecimal serial token, e.g. `29001A`
    pub serial: String,
}

impl DeviceSignature {
    pub fn from_filename(filename: &str) -> Option<Self> {
        let caps = SIGNATURE_RE.captures(filename)?;
        Some(Self {
            mcu: caps[1].to_ascii_lowercase(),
            serial: caps[2].to_string(),
        })
    }
}

/// MCU family from a filename with the package suffix dropped:
/// `stm32h723xx` becomes `stm32h723`
pub fn extract_mcu(filename: &str) -> Option<String> {
    MCU_RE
        .captures(filename)
        .map(|caps| caps[1].to_ascii_lowercase())
}

/// Default registration pattern for a discovered filename
pub fn serial_pattern_for(filename: &str) -> String {
    format!("{}*", INTERFACE_SUFFIX_RE.replace(filename, ""))
}

/// Whether two MCU names refer to the same part, allowing either to carry a
/// package suffix
pub fn mcu_matches(found: &str, expected: &str) -> bool {
    let found = found.to_ascii_lowercase();
    let expected = expected.to_ascii_lowercase();
    found.starts_with(&expected) || expected.starts_with(&found)
}

/// A node reported by a CAN bus query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanEndpoint {
    pub uuid: String,
    /// Running application, `Klipper` or `Katapult`
    pub application: String,
}

/// Parse `flashtool.py -q` output
pub fn parse_can_query(output: &str) -> Vec<CanEndpoint> {
    CAN_QUERY_RE
        .captures_iter(output)
        .map(|caps| CanEndpoint {
            uuid: caps[1].to_string(),
            application: caps[2].to_string(),
        })
        .collect()
}

/// Ask Katapult which nodes are on a CAN interface
pub fn query_can_bus(
    host: &Host<'_>,
    tools: &Toolchain,
    interface: &str,
    timeout: Duration,
) -> Result<Vec<CanEndpoint>, Error> {
    let flashtool = tools.require(tools.flashtool())?;

    let mut cmd = Command::new("python3");
    cmd.arg(flashtool).args(["-i", interface, "-q"]);

    let exit = host.runner.run(&mut cmd, timeout, Output::Capture)?;
    let nodes = parse_can_query(&exit.stdout);
    debug!("CAN query on {interface} found {} node(s)", nodes.len());

    Ok(nodes)
}

/// CAN interfaces present in sysfs whose hardware type is CAN
pub fn can_interfaces(sysfs: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(sysfs) else {
        return Vec::new();
    };

    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| CAN_INTERFACE_RE.is_match(name))
        .filter(|name| read_sysfs::<u32>(&sysfs.join(name).join("type")) == Some(ARPHRD_CAN))
        .collect();
    names.sort();
    names
}

/// Check that a CAN interface exists, is up and has a usable queue length
pub fn check_can_interface(sysfs: &Path, interface: &str) -> Result<(), Error> {
    let fail = |reason: String| Error::CanInterface {
        interface: interface.into(),
        reason,
    };

    if !CAN_INTERFACE_RE.is_match(interface) {
        return Err(Error::InvalidCanInterface(interface.into()));
    }

    let dir = sysfs.join(interface);
    if !dir.is_dir() {
        return Err(fail("interface does not exist".into()));
    }
    if read_sysfs::<u32>(&dir.join("type")) != Some(ARPHRD_CAN) {
        return Err(fail("not a CAN interface".into()));
    }

    let operstate = read_sysfs::<String>(&dir.join("operstate")).unwrap_or_default();
    if !operstate.eq_ignore_ascii_case("up") {
        return Err(fail(format!("link is {}", if operstate.is_empty() { "unknown" } else { &operstate })));
    }

    match read_sysfs::<u32>(&dir.join("tx_queue_len")) {
        Some(len) if len >= MINIMUM_CAN_QUEUE_LEN => Ok(()),
        Some(len) => Err(fail(format!(
            "tx_queue_len is {len}, at least {MINIMUM_CAN_QUEUE_LEN} is required"
        ))),
        None => Err(fail("tx_queue_len is unreadable".into())),
    }
}

fn read_sysfs<T: std::str::FromStr>(path: &Path) -> Option<T> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
