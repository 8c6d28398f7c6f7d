// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::ErrorKind;
use crate::fork::{self, Child, LaunchSpec, OutputMode};
use crate::procs::{GroupId, ProcessGroups, Registry, RunningApp, Step};
use crate::source::Materializer;
use crate::Error;

/// Result of setting up one application
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Launched {
    /// `start` is running and was registered
    Running { pid: u32 },
    /// Setup succeeded but there is no `start` command, nothing to supervise
    NoStart,
}

/// Launch programs
///
/// Rules:
/// - applications are set up one at a time, in manifest order
/// - `build` then `test` run to completion, the first failure abandons the application
/// - `start` is launched without waiting and registered only if it launched
/// - nothing that happens to one application stops the next one
#[derive(Debug)]
pub struct Launcher {
    apps_root: PathBuf,
    registry: Arc<Registry>,
    groups: Arc<dyn ProcessGroups>,
    materializer: Arc<dyn Materializer>,
    output: OutputMode,
}

impl Launcher {
    pub fn new(
        apps_root: impl Into<PathBuf>,
        registry: Arc<Registry>,
        groups: Arc<dyn ProcessGroups>,
        materializer: Arc<dyn Materializer>,
    ) -> Self {
        Self {
            apps_root: apps_root.into(),
            registry,
            groups,
            materializer,
            output: OutputMode::Inherit,
        }
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    pub fn apps_root(&self) -> &Path {
        &self.apps_root
    }

    /// Sets up every application in order, returns how many are now running
    pub async fn launch_all(&self, apps: &[AppConfig]) -> usize {
        let mut running = 0;

        for app in apps {
            match self.launch(app).await {
                Ok(Launched::Running { .. }) => running += 1,
                Ok(Launched::NoStart) => {
                    info!(app = %app.name, "No start command for {}, skipping", app.name)
                }
                Err(e) => error!(app = %app.name, "abandoning {}: {}", app.name, e),
            }
        }

        info!(running, configured = apps.len(), "setup complete");
        running
    }

    /// Materializes, builds, tests and starts a single application
    pub async fn launch(&self, app: &AppConfig) -> Result<Launched, Error> {
        let dir = app.working_dir(&self.apps_root);

        if !app.source_marker(&self.apps_root).exists() {
            self.materializer
                .materialize(app, &self.apps_root)
                .await?;
        }

        for step in Step::SETUP.iter().copied() {
            let command = match app.command(step) {
                Some(command) => command,
                None => continue,
            };

            info!(app = %app.name, step = %step, "Running {} command for {}...", step, app.name);

            let mut child = self.spawn(app, step, command, &dir)?;
            let status = child.child.wait().await.map_err(|source| ErrorKind::Launch {
                app: app.name.clone(),
                step,
                source,
            })?;

            if !status.success() {
                return Err(ErrorKind::Step {
                    app: app.name.clone(),
                    step,
                    status,
                }
                .into());
            }

            debug!(app = %app.name, step = %step, "step succeeded");
        }

        let command = match app.command(Step::Start) {
            Some(command) => command,
            None => return Ok(Launched::NoStart),
        };

        info!(app = %app.name, step = %Step::Start, "Running start command for {}...", app.name);
        let child = self.spawn(app, Step::Start, command, &dir)?;
        let pid = child.pid;

        let group = self.groups.group_id(pid).unwrap_or_else(|e| {
            // the leader's pid still names its tree
            warn!(app = %app.name, pid, "could not resolve process group: {}", e);
            GroupId::Tree(pid)
        });

        self.registry
            .register(RunningApp::new(app.name.clone(), child, group))
            .await;

        Ok(Launched::Running { pid })
    }

    fn spawn(&self, app: &AppConfig, step: Step, command: &str, dir: &Path) -> Result<Child, Error> {
        let spec = LaunchSpec {
            app: &app.name,
            step,
            command,
            dir,
            env: &app.env,
            output: self.output,
        };

        fork::launch(spec, self.groups.as_ref())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::procs::UnixGroups;
    use crate::source::Source;

    /// Creates the directory instead of cloning
    #[derive(Debug, Default)]
    struct MkDir {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Materializer for MkDir {
        async fn materialize(&self, app: &AppConfig, apps_root: &Path) -> Result<Source, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::create_dir_all(app.working_dir(apps_root)).await?;
            Ok(Source::Fetched)
        }
    }

    #[derive(Debug)]
    struct Unreachable;

    #[async_trait]
    impl Materializer for Unreachable {
        async fn materialize(&self, app: &AppConfig, _apps_root: &Path) -> Result<Source, Error> {
            Err(ErrorKind::Materialize {
                app: app.name.clone(),
                reason: "unreachable".to_string(),
            }
            .into())
        }
    }

    fn app(name: &str, commands: &[(&str, &str)]) -> AppConfig {
        AppConfig {
            name: name.to_string(),
            repo: format!("file:///repos/{}.git", name),
            env: HashMap::new(),
            commands: commands
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            entry: None,
        }
    }

    fn launcher(root: &Path, materializer: Arc<dyn Materializer>) -> Launcher {
        Launcher::new(
            root,
            Arc::new(Registry::new()),
            Arc::new(UnixGroups),
            materializer,
        )
        .with_output(OutputMode::Discard)
    }

    async fn kill_all(launcher: &Launcher) {
        crate::procs::Supervisor::new(Arc::clone(&launcher.registry), Arc::new(UnixGroups))
            .shutdown()
            .await;
    }

    #[tokio::test]
    async fn test_materializes_only_when_absent() {
        let root = tempfile::tempdir().unwrap();
        let mkdir = Arc::new(MkDir::default());
        let launcher = launcher(root.path(), mkdir.clone());
        let svc = app("svc", &[("build", "true")]);

        assert_eq!(launcher.launch(&svc).await.unwrap(), Launched::NoStart);
        assert_eq!(launcher.launch(&svc).await.unwrap(), Launched::NoStart);
        assert_eq!(mkdir.calls.load(Ordering::SeqCst), 1);
        assert!(launcher.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_build_never_starts() {
        let root = tempfile::tempdir().unwrap();
        let launcher = launcher(root.path(), Arc::new(MkDir::default()));
        let svc = app("svc", &[("build", "false"), ("start", "touch started")]);

        let err = launcher.launch(&svc).await.unwrap_err();
        match err.kind() {
            ErrorKind::Step { step, .. } => assert_eq!(*step, Step::Build),
            other => panic!("unexpected error: {:?}", other),
        }

        assert!(!root.path().join("svc").join("started").exists());
        assert!(launcher.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_test_never_starts() {
        let root = tempfile::tempdir().unwrap();
        let launcher = launcher(root.path(), Arc::new(MkDir::default()));
        let svc = app(
            "svc",
            &[("build", "touch built"), ("test", "false"), ("start", "touch started")],
        );

        let err = launcher.launch(&svc).await.unwrap_err();
        match err.kind() {
            ErrorKind::Step { step, .. } => assert_eq!(*step, Step::Test),
            other => panic!("unexpected error: {:?}", other),
        }

        let dir = root.path().join("svc");
        assert!(dir.join("built").exists());
        assert!(!dir.join("started").exists());
    }

    #[tokio::test]
    async fn test_empty_start_creates_no_record() {
        let root = tempfile::tempdir().unwrap();
        let launcher = launcher(root.path(), Arc::new(MkDir::default()));
        let svc = app("svc", &[("build", "true"), ("test", "true"), ("start", "   ")]);

        assert_eq!(launcher.launch(&svc).await.unwrap(), Launched::NoStart);
        assert_eq!(launcher.registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_unlaunchable_start_creates_no_record() {
        let root = tempfile::tempdir().unwrap();
        let launcher = launcher(root.path(), Arc::new(MkDir::default()));
        let svc = app("svc", &[("start", "no-such-binary-for-readyset")]);

        let err = launcher.launch(&svc).await.unwrap_err();
        match err.kind() {
            ErrorKind::Launch { step, .. } => assert_eq!(*step, Step::Start),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(launcher.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_materialize_failure_abandons_app() {
        let root = tempfile::tempdir().unwrap();
        let launcher = launcher(root.path(), Arc::new(Unreachable));
        let svc = app("svc", &[("start", "sleep 30")]);

        assert!(launcher.launch(&svc).await.is_err());
        assert_eq!(launcher.launch_all(&[svc]).await, 0);
        assert!(launcher.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_start_is_registered_with_its_group() {
        let root = tempfile::tempdir().unwrap();
        let launcher = launcher(root.path(), Arc::new(MkDir::default()));
        let svc = app("svc", &[("start", "sleep 30")]);

        let pid = match launcher.launch(&svc).await.unwrap() {
            Launched::Running { pid } => pid,
            other => panic!("unexpected outcome: {:?}", other),
        };

        {
            let apps = launcher.registry.lock().await;
            assert_eq!(apps.len(), 1);
            assert_eq!(apps[0].name(), "svc");
            assert_eq!(apps[0].pid(), pid);
            assert_eq!(apps[0].group(), GroupId::Group(pid as i32));
        }

        kill_all(&launcher).await;
    }

    #[tokio::test]
    async fn test_registry_follows_manifest_order_skipping_failures() {
        let root = tempfile::tempdir().unwrap();
        let launcher = launcher(root.path(), Arc::new(MkDir::default()));
        let apps = vec![
            app("one", &[("start", "sleep 30")]),
            app("broken", &[("build", "false"), ("start", "sleep 30")]),
            app("idle", &[("build", "true")]),
            app("two", &[("start", "sleep 30")]),
        ];

        assert_eq!(launcher.launch_all(&apps).await, 2);
        assert_eq!(launcher.registry.names().await, vec!["one", "two"]);

        kill_all(&launcher).await;
    }
}
