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

use crate::certificate::CertificateManager;
use crate::error::{Error, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

static LOG_TARGET: &str = "certwrap::process";

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The fixed command line of the supervised proxy.
#[derive(Debug, Clone)]
pub struct ProxyCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for ProxyCommand {
    fn default() -> Self {
        Self {
            program: "haproxy".to_string(),
            args: vec![
                "-f".to_string(),
                "/usr/local/etc/haproxy/haproxy.cfg".to_string(),
            ],
        }
    }
}

/// Outcome of one wait interval of the main loop.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WaitOutcome {
    /// The interval elapsed, run a renewal check.
    Completed,
    /// A termination signal was observed.
    Interrupted,
    /// The proxy exited on its own.
    ChildExited(String),
}

/// Owns the proxy child process and interleaves certificate maintenance
/// with its lifecycle.
///
/// Single threaded by design: certificate operations run to completion on
/// the control thread, signal handlers only flip the shared shutdown flag
/// and the loop observes it within one second.
pub struct Supervisor {
    manager: CertificateManager,
    proxy: ProxyCommand,
    check_interval: Duration,
    grace_period: Duration,
    shutdown: Arc<AtomicBool>,
    child: Option<Child>,
}

impl Supervisor {
    pub fn new(
        manager: CertificateManager,
        proxy: ProxyCommand,
        check_interval: Duration,
        grace_period: Duration,
    ) -> Self {
        Self {
            manager,
            proxy,
            check_interval,
            grace_period,
            shutdown: Arc::new(AtomicBool::new(false)),
            child: None,
        }
    }

    /// Registers SIGINT and SIGTERM onto the shutdown flag. The handler
    /// does nothing besides the flag update.
    pub fn install_signal_handlers(&self) -> Result<()> {
        for sig in [SIGINT, SIGTERM] {
            signal_hook::flag::register(sig, Arc::clone(&self.shutdown))
                .map_err(|e| Error::Io {
                    source: e,
                    path: "signal handler".to_string(),
                })?;
        }
        Ok(())
    }

    /// Shared shutdown flag, set by signal handlers.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Runs the supervision state machine until a termination signal or a
    /// fatal condition.
    ///
    /// Startup generates any missing certificates and launches the proxy,
    /// a launch failure is fatal with no retry. Each cycle waits for the
    /// check interval, then renews due certificates and reloads the proxy
    /// when any changed. An unexpected proxy exit tears the supervisor
    /// down, the proxy is never restarted after crashing on its own.
    pub fn run(&mut self) -> Result<()> {
        info!(target: LOG_TARGET, "starting up");
        self.manager.ensure_all();
        self.start_proxy()?;

        info!(target: LOG_TARGET, "starting main loop");
        loop {
            match self.wait_interval() {
                WaitOutcome::Interrupted => break,
                WaitOutcome::ChildExited(status) => {
                    error!(
                        target: LOG_TARGET,
                        status,
                        "proxy has terminated, terminating"
                    );
                    return Err(Error::ProxyExited { status });
                },
                WaitOutcome::Completed => {
                    let renewed = self.manager.renew_due();
                    if renewed > 0 {
                        info!(
                            target: LOG_TARGET,
                            renewed,
                            "certificates were renewed, reloading proxy"
                        );
                        self.stop_proxy();
                        self.start_proxy()?;
                    }
                },
            }
        }

        self.stop_proxy();
        info!(target: LOG_TARGET, "finished");
        Ok(())
    }

    /// Sleeps for up to the check interval in one second increments,
    /// breaking immediately on shutdown or proxy exit.
    fn wait_interval(&mut self) -> WaitOutcome {
        info!(
            target: LOG_TARGET,
            seconds = self.check_interval.as_secs(),
            "waiting before next certificate check"
        );
        for _ in 0..self.check_interval.as_secs() {
            if self.shutdown.load(Ordering::Relaxed) {
                info!(target: LOG_TARGET, "received termination signal");
                return WaitOutcome::Interrupted;
            }
            if let Some(status) = self.poll_child_exit() {
                return WaitOutcome::ChildExited(status);
            }
            std::thread::sleep(Duration::from_secs(1));
        }
        if self.shutdown.load(Ordering::Relaxed) {
            info!(target: LOG_TARGET, "received termination signal");
            return WaitOutcome::Interrupted;
        }
        WaitOutcome::Completed
    }

    /// Reaps the child if it has exited, returning its exit status.
    fn poll_child_exit(&mut self) -> Option<String> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                self.child = None;
                Some(status.to_string())
            },
            Ok(None) => None,
            Err(e) => {
                self.child = None;
                Some(format!("wait fail: {e}"))
            },
        }
    }

    fn start_proxy(&mut self) -> Result<()> {
        info!(
            target: LOG_TARGET,
            program = self.proxy.program,
            args = self.proxy.args.join(" "),
            "starting proxy"
        );
        let child = Command::new(&self.proxy.program)
            .args(&self.proxy.args)
            .spawn()
            .map_err(|e| Error::ProxyLaunch { source: e })?;
        self.child = Some(child);
        Ok(())
    }

    /// Stops the proxy, identically for a reload and for final shutdown:
    /// request cooperative termination, wait up to the grace period, then
    /// force kill.
    fn stop_proxy(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        info!(target: LOG_TARGET, "stopping proxy gracefully");
        if let Err(e) = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM) {
            error!(
                target: LOG_TARGET,
                error = %e,
                "fail to signal proxy"
            );
        }
        let mut waited = Duration::ZERO;
        while waited < self.grace_period {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            std::thread::sleep(STOP_POLL_INTERVAL);
            waited += STOP_POLL_INTERVAL;
        }
        warn!(
            target: LOG_TARGET,
            "stopping proxy gracefully failed, killing proxy"
        );
        let _ = child.kill();
        let _ = child.wait();
    }
}
