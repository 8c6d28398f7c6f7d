// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

use crate::procs::Step;

#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("io error: {0}")]
    IoError(#[from] io::Error),
    #[cfg(unix)]
    #[error("nix error: {0}")]
    NixError(#[from] nix::Error),
    #[error("yaml error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("failed to load config {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },
    #[error("failed to materialize source for {app}: {reason}")]
    Materialize { app: String, reason: String },
    #[error("{step} step for {app} failed: {status}")]
    Step {
        app: String,
        step: Step,
        status: ExitStatus,
    },
    #[error("failed to launch {step} step for {app}: {source}")]
    Launch {
        app: String,
        step: Step,
        #[source]
        source: io::Error,
    },
    #[error("failed to terminate {app}: {reason}")]
    Termination { app: String, reason: String },
    #[error("invalid command line: {0:?}")]
    InvalidCommand(String),
    #[error("an error occured: {0}")]
    ErrorMsg(String),
    #[error("an error occured: {0}")]
    ErrorStr(&'static str),
}

#[derive(Error, Debug)]
#[error(transparent)]
pub struct Error(ErrorKind);

impl Error {
    fn from_kind(kind: ErrorKind) -> Self {
        Self(kind)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    /// True for the only failure that is allowed to abort the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(self.0, ErrorKind::Config { .. })
    }
}

impl<E> From<E> for Error
where
    E: Into<ErrorKind>,
{
    fn from(err: E) -> Self {
        Self::from_kind(err.into())
    }
}

impl From<&'static str> for Error {
    fn from(err: &'static str) -> Self {
        Self::from_kind(ErrorKind::ErrorStr(err))
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Self::from_kind(ErrorKind::ErrorMsg(err))
    }
}
