//! The host machine as seen by the flashing pipeline
//!
//! Everything that waits goes through [Host::poll], which re-probes on a fixed
//! interval until a [Deadline] taken from a monotonic [Clock] expires. Tests
//! substitute a virtual clock so that deadlines of several seconds elapse
//! instantly.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use log::debug;

use crate::{discovery::EndpointSource, error::Error, process::CommandRunner};

/// Monotonic time source
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation of [Clock]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Cooperative cancellation flag, set from the Ctrl-C handler
#[derive(Debug, Default, Clone)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [Error::Cancelled] once triggered
    pub fn check(&self) -> Result<(), Error> {
        if self.is_triggered() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A point in time after which polling gives up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    start: Instant,
    end: Instant,
}

impl Deadline {
    pub fn after(clock: &dyn Clock, timeout: Duration) -> Self {
        let start = clock.now();
        Self {
            start,
            end: start + timeout,
        }
    }

    pub fn is_expired(&self, clock: &dyn Clock) -> bool {
        clock.now() >= self.end
    }

    pub fn remaining(&self, clock: &dyn Clock) -> Duration {
        self.end.saturating_duration_since(clock.now())
    }

    /// Time since this deadline was set
    pub fn elapsed(&self, clock: &dyn Clock) -> Duration {
        clock.now().saturating_duration_since(self.start)
    }

    /// The total span this deadline was created with
    pub fn span(&self) -> Duration {
        self.end - self.start
    }

    /// The earlier of two deadlines
    pub fn min(self, other: Deadline) -> Deadline {
        if other.end < self.end {
            other
        } else {
            self
        }
    }
}

/// Collaborators the pipeline needs from the machine it runs on
#[derive(Clone)]
pub struct Host<'a> {
    pub endpoints: &'a dyn EndpointSource,
    pub runner: &'a dyn CommandRunner,
    pub clock: &'a dyn Clock,
    pub interrupt: Interrupt,
}

impl<'a> Host<'a> {
    pub fn new(
        endpoints: &'a dyn EndpointSource,
        runner: &'a dyn CommandRunner,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            endpoints,
            runner,
            clock,
            interrupt: Interrupt::new(),
        }
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn deadline(&self, timeout: Duration) -> Deadline {
        Deadline::after(self.clock, timeout)
    }

    /// Probe until it yields a value or the deadline expires. The probe always
    /// runs at least once and never at the expiry instant itself, so a 10 s
    /// deadline polled every second probes ten times. `Ok(None)` means the
    /// deadline expired.
    pub fn poll<T>(
        &self,
        deadline: Deadline,
        interval: Duration,
        mut probe: impl FnMut() -> Option<T>,
    ) -> Result<Option<T>, Error> {
        loop {
            self.interrupt.check()?;

            if let Some(value) = probe() {
                return Ok(Some(value));
            }

            self.clock
                .sleep(interval.min(deadline.remaining(self.clock)));
            if deadline.is_expired(self.clock) {
                debug!("Polling gave up after {:?}", deadline.span());
                return Ok(None);
            }
        }
    }

    /// Sleep, honouring cancellation
    pub fn pause(&self, duration: Duration) -> Result<(), Error> {
        self.interrupt.check()?;
        if !duration.is_zero() {
            self.clock.sleep(duration);
        }
        self.interrupt.check()
    }
}
