//! Build and flash Klipper firmware onto the MCUs of a 3D printer
//!
//! The library holds the flashing engine: locating boards by their
//! `/dev/serial/by-id` name or CAN UUID, moving them into their bootloader,
//! transferring firmware, verifying that they came back running Klipper, and
//! keeping the Klipper service stopped for the duration. Every interaction
//! with the outside world goes through a trait ([discovery::EndpointSource],
//! [process::CommandRunner], [host::Clock], [service::ServiceManager],
//! [registry::Registry], [operator::Operator]) so the whole pipeline can be
//! driven without hardware.
//!
//! The `cli` feature, enabled by default, adds the command-line front end
//! used by the `kflash` binary.

pub mod batch;
pub mod bootloader;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod firmware;
pub mod flasher;
pub mod host;
pub mod operator;
pub mod pipeline;
pub mod process;
pub mod registry;
pub mod service;
pub mod status;
pub mod tools;
pub mod verify;
pub mod version;

#[cfg(feature = "cli")]
pub mod cli;
#[cfg(feature = "cli")]
pub mod logging;

pub use device::{BootloaderMethod, FlashMethod, Registration, Role, Transport};
pub use error::Error;
pub use pipeline::{Pipeline, Report};
