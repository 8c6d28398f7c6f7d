// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::fork::Child;
use crate::procs::{GroupId, ProcessGroups};
use crate::Error;

/// Supervision state of a started application
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Running,
    Terminating,
    Terminated,
}

/// One successfully started application, owns the process handle of its `start` step
#[derive(Debug)]
pub struct RunningApp {
    name: String,
    child: tokio::process::Child,
    pid: u32,
    group: GroupId,
    state: RunState,
    started_at: DateTime<Utc>,
    stopped_at: Option<DateTime<Utc>>,
}

impl RunningApp {
    pub fn new(name: impl Into<String>, child: Child, group: GroupId) -> Self {
        Self {
            name: name.into(),
            child: child.child,
            pid: child.pid,
            group,
            state: RunState::Running,
            started_at: Utc::now(),
            stopped_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.stopped_at
    }

    /// Checks the recorded exit state without signaling the process
    ///
    /// Returns `true` while no exit has been observed. The first observed exit sets `stopped_at`.
    pub fn refresh(&mut self) -> bool {
        if self.stopped_at.is_some() {
            return false;
        }

        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(app = %self.name, %status, "exit observed");
                self.mark_stopped();
                false
            }
            Err(e) => {
                // can't tell, report what we last knew
                warn!(app = %self.name, "failed to poll process: {}", e);
                true
            }
        }
    }

    /// Whole seconds between start and the observed stop, or now if still running
    pub fn uptime_seconds(&self, now: DateTime<Utc>) -> i64 {
        let end = self.stopped_at.unwrap_or(now);
        end.signed_duration_since(self.started_at).num_seconds()
    }

    fn mark_stopped(&mut self) {
        if self.stopped_at.is_none() {
            self.stopped_at = Some(Utc::now());
        }
    }
}

/// Append-only list of started applications, in start order
///
/// The launcher appends, the status endpoint and the shutdown read. One lock guards all of it.
#[derive(Debug, Default)]
pub struct Registry {
    apps: Mutex<Vec<RunningApp>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, app: RunningApp) {
        info!(app = %app.name, pid = app.pid, "{} is running (PID {})", app.name, app.pid);
        self.apps.lock().await.push(app);
    }

    pub async fn len(&self) -> usize {
        self.apps.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.apps.lock().await.is_empty()
    }

    /// Names in registry order
    pub async fn names(&self) -> Vec<String> {
        self.apps
            .lock()
            .await
            .iter()
            .map(|a| a.name.clone())
            .collect()
    }

    pub async fn lock(&self) -> MutexGuard<'_, Vec<RunningApp>> {
        self.apps.lock().await
    }
}

/// Outcome of one shutdown pass
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Every app a termination was attempted for, in registry order
    pub terminated: Vec<String>,
    /// Kill attempts that failed, these are not retried
    pub failures: Vec<Error>,
    /// Apps whose direct child was not reaped before the grace deadline
    pub lingering: Vec<String>,
}

/// Owns the shutdown protocol over the registry
///
/// Rules:
///   - every registry entry is handled exactly once, in registry order
///   - the direct process is killed if still alive, then the whole group, unconditionally
///   - a failed kill never stops the remaining entries from being handled
#[derive(Debug)]
pub struct Supervisor {
    registry: Arc<Registry>,
    groups: Arc<dyn ProcessGroups>,
    grace: Duration,
}

impl Supervisor {
    pub fn new(registry: Arc<Registry>, groups: Arc<dyn ProcessGroups>) -> Self {
        Self {
            registry,
            groups,
            grace: crate::config::DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Bound on waiting for killed children to be reaped, zero skips the wait entirely
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        let mut apps = self.registry.lock().await;

        info!(apps = apps.len(), groups = self.groups.name(), "shutting down all apps");

        for app in apps.iter_mut() {
            app.state = RunState::Terminating;

            match app.child.try_wait() {
                Ok(None) => {
                    if let Err(e) = app.child.start_kill() {
                        warn!(app = %app.name, "failed to kill pid {}: {}", app.pid, e);
                        report.failures.push(termination_error(&app.name, e));
                    }
                }
                Ok(Some(status)) => {
                    debug!(app = %app.name, %status, "already exited");
                    app.mark_stopped();
                }
                Err(e) => {
                    warn!(app = %app.name, "failed to poll pid {}: {}", app.pid, e);
                    report.failures.push(termination_error(&app.name, e));
                }
            }

            // descendants of the leader are only reachable through the group
            if let Err(e) = self.groups.kill_group(app.group).await {
                warn!(app = %app.name, group = ?app.group, "failed to kill group: {}", e);
                report.failures.push(termination_error(&app.name, e));
            }

            app.state = RunState::Terminated;
            info!(app = %app.name, "Terminated {}", app.name);
            report.terminated.push(app.name.clone());
        }

        if !self.grace.is_zero() {
            let deadline = Instant::now() + self.grace;

            for app in apps.iter_mut().filter(|a| a.stopped_at.is_none()) {
                match timeout_at(deadline, app.child.wait()).await {
                    Ok(Ok(_)) => app.mark_stopped(),
                    Ok(Err(e)) => warn!(app = %app.name, "failed to reap pid {}: {}", app.pid, e),
                    Err(_) => {
                        warn!(app = %app.name, pid = app.pid, "did not exit within the grace period");
                        report.lingering.push(app.name.clone());
                    }
                }
            }
        }

        report
    }
}

fn termination_error(app: &str, reason: impl ToString) -> Error {
    Error::from(ErrorKind::Termination {
        app: app.to_string(),
        reason: reason.to_string(),
    })
}
