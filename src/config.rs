// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Application manifest and runtime settings

use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::ErrorKind;
use crate::fork::OutputMode;
use crate::procs::Step;
use crate::Error;

pub const DEFAULT_CONFIG: &str = "config.yaml";
pub const DEFAULT_APPS_DIR: &str = "apps";
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The ordered list of applications to bring up
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

/// One application descriptor, immutable once loaded
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    /// Directory name beneath the apps root, must be unique
    pub name: String,
    /// Git repository URL
    #[serde(alias = "repository")]
    pub repo: String,
    /// Overrides merged over the inherited environment
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Step name to command line, e.g. `build: cargo build`
    #[serde(default)]
    pub commands: HashMap<String, String>,
    /// Optional file whose presence marks the source as already materialized
    ///
    /// A populated working directory without this file is never cloned over, the
    /// application is abandoned until the directory is cleared or the file appears.
    #[serde(default)]
    pub entry: Option<PathBuf>,
}

impl AppConfig {
    /// Returns the command line for the step, `None` if absent or blank
    pub fn command(&self, step: Step) -> Option<&str> {
        self.commands
            .get(step.as_str())
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
    }

    /// `<apps-root>/<name>`
    pub fn working_dir(&self, apps_root: &Path) -> PathBuf {
        apps_root.join(&self.name)
    }

    /// The path whose existence means the source does not need to be fetched
    pub fn source_marker(&self, apps_root: &Path) -> PathBuf {
        let dir = self.working_dir(apps_root);
        match self.entry {
            Some(ref entry) => dir.join(entry),
            None => dir,
        }
    }
}

impl Manifest {
    /// Reads and validates the manifest, any failure here aborts the run
    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = fs::read_to_string(path).map_err(|e| config_error(path, e.to_string()))?;
        Self::from_yaml(&data).map_err(|e| {
            if e.is_fatal() {
                e
            } else {
                config_error(path, e.to_string())
            }
        })
    }

    pub fn from_yaml(data: &str) -> Result<Self, Error> {
        let manifest: Manifest = serde_yaml::from_str(data)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), Error> {
        let mut seen = HashSet::new();

        for app in &self.apps {
            let mut components = Path::new(&app.name).components();
            let single_component = matches!(
                (components.next(), components.next()),
                (Some(Component::Normal(_)), None)
            );

            if !single_component {
                return Err(format!("invalid app name: {:?}", app.name).into());
            }

            if !seen.insert(app.name.as_str()) {
                return Err(format!("duplicate app name: {}", app.name).into());
            }

            for step in app.commands.keys() {
                if Step::from_name(step).is_none() {
                    warn!(app = %app.name, step = %step, "ignoring unknown step");
                }
            }
        }

        Ok(())
    }
}

fn config_error(path: &Path, reason: String) -> Error {
    Error::from(ErrorKind::Config {
        path: path.to_path_buf(),
        reason,
    })
}

/// Runtime options for one launcher process
#[derive(Clone, Debug)]
pub struct Settings {
    pub config: PathBuf,
    pub apps_dir: PathBuf,
    pub listen: SocketAddr,
    pub output: OutputMode,
    /// Upper bound on waiting for killed children, zero disables the wait
    pub shutdown_grace: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
apps:
  - name: api
    repo: https://example.com/api.git
    env:
      PORT: "3000"
    commands:
      build: make build
      test: "  "
      start: ./bin/api --port 3000
  - name: web
    repository: https://example.com/web.git
    entry: package.json
    commands:
      start: npm start
"#;

    #[test]
    fn test_parses_apps_in_order() {
        let manifest = Manifest::from_yaml(MANIFEST).unwrap();
        let names: Vec<_> = manifest.apps.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["api", "web"]);
        assert_eq!(manifest.apps[1].repo, "https://example.com/web.git");
        assert_eq!(manifest.apps[0].env["PORT"], "3000");
    }

    #[test]
    fn test_blank_commands_are_absent() {
        let manifest = Manifest::from_yaml(MANIFEST).unwrap();
        let api = &manifest.apps[0];
        assert_eq!(api.command(Step::Build), Some("make build"));
        assert_eq!(api.command(Step::Test), None);
        assert_eq!(manifest.apps[1].command(Step::Build), None);
    }

    #[test]
    fn test_source_marker() {
        let manifest = Manifest::from_yaml(MANIFEST).unwrap();
        let root = Path::new("apps");
        assert_eq!(manifest.apps[0].source_marker(root), root.join("api"));
        assert_eq!(
            manifest.apps[1].source_marker(root),
            root.join("web").join("package.json")
        );
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let yaml = "apps:\n  - {name: a, repo: x}\n  - {name: a, repo: y}\n";
        assert!(Manifest::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_path_like_names() {
        for name in &["../escape", "a/b", "", "."] {
            let yaml = format!("apps:\n  - {{name: {:?}, repo: x}}\n", name);
            assert!(Manifest::from_yaml(&yaml).is_err(), "accepted {:?}", name);
        }
    }

    #[test]
    fn test_load_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = Manifest::load(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(err.is_fatal());

        let bad = dir.path().join("bad.yaml");
        fs::write(&bad, "apps: [name: {").unwrap();
        assert!(Manifest::load(&bad).unwrap_err().is_fatal());
    }
}
