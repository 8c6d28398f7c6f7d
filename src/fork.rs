// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Launching of lifecycle commands as group-leading child processes

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;

use tokio::process::Command;
use tracing::debug;

use crate::error::ErrorKind;
use crate::procs::{self, ProcessGroups, Step};
use crate::Error;

/// Where the output of launched processes goes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    /// Pass-through to our own stdout and stderr
    Inherit,
    /// Pipe and re-emit each line through the log
    Capture,
    /// Drop it
    Discard,
}

impl OutputMode {
    pub fn stdio(self) -> StdIoConf {
        let out = || match self {
            OutputMode::Inherit => Stdio::inherit(),
            OutputMode::Capture => Stdio::piped(),
            OutputMode::Discard => Stdio::null(),
        };

        StdIoConf {
            // nothing is ever fed to children
            stdin: Stdio::null(),
            stdout: out(),
            stderr: out(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutputMode::Inherit => "inherit",
            OutputMode::Capture => "capture",
            OutputMode::Discard => "discard",
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "inherit" => Ok(OutputMode::Inherit),
            "capture" => Ok(OutputMode::Capture),
            "discard" => Ok(OutputMode::Discard),
            other => Err(format!("unknown output mode: {}", other).into()),
        }
    }
}

pub struct StdIoConf {
    pub stdin: Stdio,
    pub stderr: Stdio,
    pub stdout: Stdio,
}

/// A command line split into program and arguments
///
/// Splitting is on whitespace only. There is no quoting or escaping, `echo "a b"` yields the
///  arguments `"a` and `b"`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn parse(line: &str) -> Result<Self, Error> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| ErrorKind::InvalidCommand(line.to_string()))?;

        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

/// Everything needed to start one step of an application
#[derive(Clone, Copy, Debug)]
pub struct LaunchSpec<'a> {
    pub app: &'a str,
    pub step: Step,
    pub command: &'a str,
    pub dir: &'a Path,
    /// Overrides on top of the inherited environment, these win on collision
    pub env: &'a HashMap<String, String>,
    pub output: OutputMode,
}

pub struct Child {
    pub child: tokio::process::Child,
    pub pid: u32,
}

/// Starts the command as the leader of a new process group, does not wait for it
pub fn launch(spec: LaunchSpec<'_>, groups: &dyn ProcessGroups) -> Result<Child, Error> {
    let launch_error = |source| ErrorKind::Launch {
        app: spec.app.to_string(),
        step: spec.step,
        source,
    };

    let line = CommandLine::parse(spec.command)
        .map_err(|e| launch_error(io::Error::new(io::ErrorKind::InvalidInput, e.to_string())))?;
    let stdio = spec.output.stdio();

    let mut command = std::process::Command::new(&line.program);
    command
        .args(&line.args)
        .current_dir(spec.dir)
        .envs(spec.env)
        .stdin(stdio.stdin)
        .stdout(stdio.stdout)
        .stderr(stdio.stderr);
    groups.make_leader(&mut command);
    let mut command = Command::from(command);

    let mut child = command.spawn().map_err(launch_error)?;
    let pid = child.id().ok_or_else(|| {
        launch_error(io::Error::new(
            io::ErrorKind::Other,
            "process exited before its pid was read",
        ))
    })?;

    debug!(app = spec.app, step = %spec.step, pid, program = %line.program, "spawned");

    if spec.output == OutputMode::Capture {
        procs::forward_output(spec.app, spec.step.as_str(), &mut child);
    }

    Ok(Child { child, pid })
}
