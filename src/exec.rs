// Copyright 2024-2025 Tree xie.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::error::{Error, Result};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::fmt;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{info, warn};

static LOG_TARGET: &str = "certwrap::exec";

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Failure policy for a single external tool invocation.
///
/// The generation path of the ACME strategy is best effort: a non-zero
/// exit is logged and the merge step decides whether usable material
/// exists. The renewal paths are strict: a failed renewal must never be
/// counted as a fresh certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Tolerate,
    Propagate,
}

/// An external tool invocation: the certificate inspection tool, the
/// certificate authority CLI or the ACME client.
#[derive(Debug, Clone, Default)]
pub struct ExternalCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl fmt::Display for ExternalCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

impl ExternalCommand {
    pub fn new<P: ToString>(program: P, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|item| item.to_string()).collect(),
        }
    }

    /// Runs the command to completion with a deadline, the child is
    /// killed once the deadline passes. Stdout is inherited.
    pub fn run(&self, timeout: Duration) -> Result<ExitStatus> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .spawn()
            .map_err(|e| Error::CommandSpawn {
                command: self.to_string(),
                source: e,
            })?;
        self.wait_with_deadline(child, timeout)
    }

    /// Runs the command with a deadline and captures stdout, which is
    /// returned only for a zero exit. The pipe is drained while polling
    /// so output larger than the pipe buffer cannot stall the tool.
    pub fn run_capture(&self, timeout: Duration) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| Error::CommandSpawn {
                command: self.to_string(),
                source: e,
            })?;
        let mut stdout = child.stdout.take();
        if let Some(out) = stdout.as_ref() {
            self.set_non_blocking(out)?;
        }
        let mut buf = Vec::new();
        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(out) = stdout.as_mut() {
                drain_stdout(out, &mut buf);
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {},
                Err(e) => {
                    return Err(Error::Io {
                        source: e,
                        path: self.program.clone(),
                    });
                },
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::CommandTimeout {
                    command: self.to_string(),
                    seconds: timeout.as_secs(),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        };
        // pick up anything written between the last drain and exit
        if let Some(out) = stdout.as_mut() {
            drain_stdout(out, &mut buf);
        }
        if !status.success() {
            return Err(Error::CommandFailed {
                command: self.to_string(),
                code: status.code().unwrap_or(-1),
            });
        }
        Ok(String::from_utf8_lossy(&buf).to_string())
    }

    fn set_non_blocking(&self, stdout: &ChildStdout) -> Result<()> {
        let to_io_error = |e: nix::errno::Errno| Error::Io {
            source: std::io::Error::from_raw_os_error(e as i32),
            path: self.program.clone(),
        };
        let fd = stdout.as_raw_fd();
        let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(to_io_error)?;
        let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
        fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(to_io_error)?;
        Ok(())
    }

    /// Runs the command and applies the failure policy to a non-zero
    /// exit. Spawn failures and timeouts are always propagated.
    pub fn run_with_policy(
        &self,
        timeout: Duration,
        policy: FailurePolicy,
    ) -> Result<()> {
        info!(target: LOG_TARGET, command = %self, "run external command");
        let status = self.run(timeout)?;
        if status.success() {
            return Ok(());
        }
        let code = status.code().unwrap_or(-1);
        match policy {
            FailurePolicy::Tolerate => {
                warn!(
                    target: LOG_TARGET,
                    command = %self,
                    code,
                    "external command fail, continue"
                );
                Ok(())
            },
            FailurePolicy::Propagate => Err(Error::CommandFailed {
                command: self.to_string(),
                code,
            }),
        }
    }

    fn wait_with_deadline(
        &self,
        mut child: Child,
        timeout: Duration,
    ) -> Result<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {},
                Err(e) => {
                    return Err(Error::Io {
                        source: e,
                        path: self.program.clone(),
                    });
                },
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::CommandTimeout {
                    command: self.to_string(),
                    seconds: timeout.as_secs(),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Reads everything currently buffered in a non-blocking pipe.
fn drain_stdout(out: &mut ChildStdout, buf: &mut Vec<u8>) {
    let mut chunk = [0u8; 4096];
    loop {
        match out.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(_) => break,
        }
    }
}
