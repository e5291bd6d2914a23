//! Keeping the Klipper service off the hardware while flashing
//!
//! [ServiceGuard] stops the service when acquired and starts it again when
//! released or dropped, so every exit path, including `?` returns, panics
//! and Ctrl-C (which surfaces as [Error::Cancelled]), restarts the service.

use std::{fmt, process::Command, time::Duration};

use log::{debug, error, info, warn};

use crate::{
    error::Error,
    process::{CommandRunner, Output},
};

/// Limit for `systemctl stop`/`start`
pub const SERVICE_TIMEOUT: Duration = Duration::from_secs(30);
/// Limit for `systemctl is-active` and the sudo probe
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// A supervised service that can be stopped and started
pub trait ServiceManager {
    fn name(&self) -> &str;

    /// Whether the service is running. When the state cannot be determined
    /// this reports `true`, so the service is restarted afterwards.
    fn is_active(&self) -> bool;

    fn stop(&self) -> Result<(), Error>;
    fn start(&self) -> Result<(), Error>;
}

/// systemd, driven through non-interactive sudo
pub struct Systemctl<'a> {
    runner: &'a dyn CommandRunner,
    service: String,
}

impl<'a> Systemctl<'a> {
    pub fn new(runner: &'a dyn CommandRunner, service: impl Into<String>) -> Self {
        Self {
            runner,
            service: service.into(),
        }
    }

    /// Whether `sudo` works without a password prompt
    pub fn verify_passwordless_sudo(&self) -> bool {
        let mut cmd = Command::new("sudo");
        cmd.args(["-n", "true"]);

        matches!(
            self.runner.run(&mut cmd, QUERY_TIMEOUT, Output::Capture),
            Ok(exit) if exit.success()
        )
    }

    fn systemctl(&self, action: &str) -> Result<(), String> {
        let mut cmd = Command::new("sudo");
        cmd.args(["-n", "systemctl", action, &self.service]);

        match self.runner.run(&mut cmd, SERVICE_TIMEOUT, Output::Capture) {
            Ok(exit) if exit.success() => Ok(()),
            Ok(exit) => Err(exit.detail()),
            Err(err) => Err(err.to_string()),
        }
    }
}

impl ServiceManager for Systemctl<'_> {
    fn name(&self) -> &str {
        &self.service
    }

    fn is_active(&self) -> bool {
        let mut cmd = Command::new("systemctl");
        cmd.args(["is-active", &self.service]);

        match self.runner.run(&mut cmd, QUERY_TIMEOUT, Output::Capture) {
            Ok(exit) => exit.stdout.trim() == "active",
            Err(err) => {
                warn!("Could not query {}: {err}", self.service);
                true
            }
        }
    }

    fn stop(&self) -> Result<(), Error> {
        self.systemctl("stop").map_err(|detail| Error::ServiceStop {
            service: self.service.clone(),
            detail,
        })
    }

    fn start(&self) -> Result<(), Error> {
        self.systemctl("start").map_err(|detail| Error::ServiceStart {
            service: self.service.clone(),
            detail,
        })
    }
}

/// What happened to the service when the guarded scope ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Restart {
    /// The service was not running beforehand, so it was left alone
    Skipped,
    Succeeded,
    /// The restart failed; the message is the rendered error
    Failed(String),
}

/// The service's state across one guarded scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceState {
    pub service: String,
    pub was_active: bool,
    pub restart: Restart,
}

impl ServiceState {
    pub fn restart_attempted(&self) -> bool {
        self.was_active
    }

    pub fn restart_failed(&self) -> bool {
        matches!(self.restart, Restart::Failed(_))
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.restart {
            Restart::Skipped => write!(f, "{} was not running, restart skipped", self.service),
            Restart::Succeeded => write!(f, "{} restarted", self.service),
            Restart::Failed(reason) => write!(f, "{} failed to restart: {reason}", self.service),
        }
    }
}

/// Holds the service stopped for as long as it lives
pub struct ServiceGuard<'a> {
    manager: &'a dyn ServiceManager,
    was_active: bool,
    finished: bool,
}

impl<'a> ServiceGuard<'a> {
    /// Stop the service if it is running. Failure to stop is fatal and leaves
    /// nothing to restart.
    pub fn acquire(manager: &'a dyn ServiceManager) -> Result<Self, Error> {
        let was_active = manager.is_active();

        if was_active {
            info!("Stopping {}", manager.name());
            manager.stop()?;
        } else {
            info!("{} is not running", manager.name());
        }

        Ok(Self {
            manager,
            was_active,
            finished: false,
        })
    }

    pub fn was_active(&self) -> bool {
        self.was_active
    }

    /// End the scope and report how the restart went
    pub fn release(mut self) -> ServiceState {
        self.finish()
    }

    fn finish(&mut self) -> ServiceState {
        self.finished = true;
        let service = self.manager.name().to_string();

        let restart = if !self.was_active {
            info!("{service} was not running, skipping restart");
            Restart::Skipped
        } else {
            info!("Starting {service}");
            match self.manager.start() {
                Ok(()) => Restart::Succeeded,
                Err(err) => {
                    error!("{err}");
                    Restart::Failed(err.to_string())
                }
            }
        };

        ServiceState {
            service,
            was_active: self.was_active,
            restart,
        }
    }
}

impl Drop for ServiceGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let state = self.finish();
            debug!("Service guard dropped: {state}");
        }
    }
}
