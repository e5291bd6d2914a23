//! Running external tools with a hard timeout

use std::{
    ffi::OsStr,
    io::Read,
    path::Path,
    process::{Command, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::error::Error;

const CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Where a child's stdout/stderr go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    /// Collected and returned in [Exit]
    Capture,
    /// Streamed to the terminal
    Inherit,
}

/// How a finished child exited
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exit {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Exit {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// The most useful part of the captured output for an error message
    pub fn detail(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };

        let lines: Vec<&str> = text.lines().collect();
        lines[lines.len().saturating_sub(20)..].join("\n")
    }

    /// Turn a non-zero exit into [Error::ToolFailed]
    pub fn into_result(self, tool: &str) -> Result<Exit, Error> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::ToolFailed {
                tool: tool.into(),
                code: self.code,
                detail: self.detail(),
            })
        }
    }
}

/// Runs a prepared [Command] to completion or until the timeout expires
pub trait CommandRunner {
    /// A launch failure is [Error::Launch], expiry is [Error::CommandTimeout]
    /// (the child is killed), anything else is an [Exit] regardless of code.
    fn run(&self, cmd: &mut Command, timeout: Duration, output: Output) -> Result<Exit, Error>;
}

/// Spawns real processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &mut Command, timeout: Duration, output: Output) -> Result<Exit, Error> {
        debug!("Running command: {cmd:?}");
        let tool = tool_name(cmd);

        match output {
            Output::Capture => {
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
            }
            Output::Inherit => {
                cmd.stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }
        }

        let mut child = cmd.spawn().map_err(|source| Error::Launch {
            tool: tool.clone(),
            source,
        })?;

        let stdout = child.stdout.take().map(read_in_background);
        let stderr = child.stderr.take().map(read_in_background);

        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }

            if Instant::now() >= deadline {
                warn!(
                    "Command timed out after {timeout:?}, killing process {}",
                    child.id()
                );
                // The reader threads are left to finish on their own; a
                // grandchild may still hold the pipes open.
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::CommandTimeout { tool, timeout });
            }

            thread::sleep(CHECK_INTERVAL);
        };

        let collect = |handle: Option<JoinHandle<String>>| {
            handle
                .and_then(|handle| handle.join().ok())
                .unwrap_or_default()
        };

        // Killed by a signal
        let code = status.code().unwrap_or(-1);
        debug!("Command exit code: {code}");

        Ok(Exit {
            code,
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }
}

fn read_in_background<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = pipe.read_to_end(&mut buffer);
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

/// Short name of the tool a command runs, for messages: the script for
/// interpreter invocations, otherwise the program itself
pub fn tool_name(cmd: &Command) -> String {
    let file_name = |s: &OsStr| {
        Path::new(s)
            .file_name()
            .unwrap_or(s)
            .to_string_lossy()
            .into_owned()
    };

    let program = file_name(cmd.get_program());
    if program.starts_with("python") {
        if let Some(script) = cmd.get_args().next().filter(|arg| *arg != "-c") {
            return file_name(script);
        }
    }

    program
}
