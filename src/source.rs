// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Getting application sources onto disk

use std::fmt::Debug;
use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::error::ErrorKind;
use crate::fork::OutputMode;
use crate::Error;

/// What a materialization did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    /// The source marker already existed, nothing was done
    Present,
    /// The source was fetched
    Fetched,
}

/// Ensures an application's working directory is populated
///
/// Implementations must be idempotent, a second call on a populated directory is a no-op.
#[async_trait]
pub trait Materializer: Debug + Send + Sync + 'static {
    async fn materialize(&self, app: &AppConfig, apps_root: &Path) -> Result<Source, Error>;
}

/// Clone-if-absent with the `git` binary
#[derive(Clone, Debug)]
pub struct GitClone {
    output: OutputMode,
}

impl GitClone {
    pub fn new(output: OutputMode) -> Self {
        Self { output }
    }
}

#[async_trait]
impl Materializer for GitClone {
    async fn materialize(&self, app: &AppConfig, apps_root: &Path) -> Result<Source, Error> {
        let marker = app.source_marker(apps_root);
        if marker.exists() {
            debug!(app = %app.name, marker = %marker.display(), "source present");
            return Ok(Source::Present);
        }

        let dir = app.working_dir(apps_root);
        let failed = |reason: String| {
            Error::from(ErrorKind::Materialize {
                app: app.name.clone(),
                reason,
            })
        };

        // git refuses to clone into a non-empty directory
        if is_populated(&dir).await {
            return Err(failed(format!(
                "{} is already populated but {} is missing",
                dir.display(),
                marker.display()
            )));
        }

        tokio::fs::create_dir_all(apps_root)
            .await
            .map_err(|e| failed(format!("could not create {}: {}", apps_root.display(), e)))?;

        info!(app = %app.name, "Cloning {} into {}...", app.repo, dir.display());

        let stdio = self.output.stdio();
        let mut child = Command::new("git")
            .arg("clone")
            .arg(&app.repo)
            .arg(&dir)
            .stdin(stdio.stdin)
            .stdout(stdio.stdout)
            .stderr(stdio.stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(format!("could not run git: {}", e)))?;

        if self.output == OutputMode::Capture {
            crate::procs::forward_output(&app.name, "clone", &mut child);
        }

        let status = child
            .wait()
            .await
            .map_err(|e| failed(format!("git did not finish: {}", e)))?;

        if !status.success() {
            return Err(failed(format!("git clone {} exited with {}", app.repo, status)));
        }

        Ok(Source::Fetched)
    }
}

async fn is_populated(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}
