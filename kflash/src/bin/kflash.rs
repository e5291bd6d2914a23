use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kflash::{
    cli::{self, inventory, AddArgs, FlashAllArgs, FlashArgs, RemoveArgs, Session},
    host::Interrupt,
    logging::initialize_logger,
};
use log::{debug, LevelFilter};
use miette::{IntoDiagnostic, Result, WrapErr};

#[derive(Debug, Parser)]
#[command(about, version, propagate_version = true)]
struct Cli {
    /// Directory holding kflash.toml, devices.toml and cached build configs
    #[arg(long, global = true, env = "KFLASH_CONFIG_DIR", value_name = "DIR")]
    config_dir: Option<PathBuf>,
    /// Log debug output, including every external command
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build and flash one registered device
    Flash(FlashArgs),
    /// Build and flash every registered device, toolheads first and bridges last
    FlashAll(FlashAllArgs),
    /// Show registered devices and whether they are connected
    List,
    /// Show attached Klipper and Katapult devices
    Scan,
    /// Register a device
    Add(AddArgs),
    /// Remove a registered device
    Remove(RemoveArgs),
}

impl Commands {
    /// Commands that stop the Klipper service and so must see Ctrl-C through
    /// to the restart. Everything else keeps the default behaviour of exiting
    /// at once.
    fn traps_interrupt(&self) -> bool {
        matches!(self, Commands::Flash(_) | Commands::FlashAll(_))
    }
}

fn main() -> Result<()> {
    miette::set_panic_hook();

    // Attempt to parse any provided command-line arguments, or print the help
    // message and terminate if the invocation is not correct.
    let args = Cli::parse();
    initialize_logger(if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    debug!("{:#?}", args);

    // While flashing, Ctrl-C is turned into cooperative cancellation so a
    // stopped Klipper service is always started again on the way out.
    let interrupt = Interrupt::new();
    if args.subcommand.traps_interrupt() {
        let handler = interrupt.clone();
        ctrlc::set_handler(move || handler.trigger())
            .into_diagnostic()
            .wrap_err("Failed to install the Ctrl-C handler")?;
    }

    let session = Session::open(args.config_dir, interrupt)?;

    match args.subcommand {
        Commands::Flash(args) => cli::flash(args, &session),
        Commands::FlashAll(args) => cli::flash_all(args, &session),
        Commands::List => inventory::list(&session),
        Commands::Scan => inventory::scan(&session),
        Commands::Add(args) => cli::add(args, &session),
        Commands::Remove(args) => cli::remove(args, &session),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_flashing_traps_ctrl_c() {
        let trapped = |argv: &[&str]| {
            Cli::try_parse_from(argv)
                .unwrap()
                .subcommand
                .traps_interrupt()
        };

        assert!(trapped(&["kflash", "flash", "octopus"]));
        assert!(trapped(&["kflash", "flash-all"]));
        assert!(!trapped(&["kflash", "list"]));
        assert!(!trapped(&["kflash", "scan"]));
        assert!(!trapped(&["kflash", "remove", "octopus"]));
    }
}
