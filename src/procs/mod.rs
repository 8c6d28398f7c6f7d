// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod group;
mod launcher;
mod logger;
mod supervisor;

#[cfg(unix)]
pub use group::UnixGroups;
pub use group::{NoGroups, TaskkillGroups};
pub use launcher::{Launched, Launcher};
pub use logger::forward_output;
pub use supervisor::{Registry, RunState, RunningApp, ShutdownReport, Supervisor};

use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use async_trait::async_trait;

use crate::Error;

/// A named lifecycle step of an application
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    Build,
    Test,
    Start,
}

impl Step {
    /// Steps that must run to completion, in order, before `Start`
    pub const SETUP: [Step; 2] = [Step::Build, Step::Test];

    pub fn as_str(self) -> &'static str {
        match self {
            Step::Build => "build",
            Step::Test => "test",
            Step::Start => "start",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "build" => Some(Step::Build),
            "test" => Some(Step::Test),
            "start" => Some(Step::Start),
            _ => None,
        }
    }
}

impl Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle used to terminate everything a launched process has spawned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupId {
    /// A process group id, the leader's group on group-capable platforms
    Group(i32),
    /// The leader's pid, used as the root of a process tree
    Tree(u32),
    /// No group semantics, never a kill target
    Unsupported,
}

/// Process-group capabilities of the host platform
///
/// The launcher uses this to make each launched step the leader of its own group, and the
///  supervisor uses it to kill that group (and any descendants) on shutdown.
#[async_trait]
pub trait ProcessGroups: Debug + Send + Sync + 'static {
    /// Name of the variant, for logging
    fn name(&self) -> &'static str;

    /// Configure the command so the spawned process leads a new group
    fn make_leader(&self, command: &mut std::process::Command);

    /// Resolve the group identifier of a spawned leader
    fn group_id(&self, pid: u32) -> Result<GroupId, Error>;

    /// Forcefully terminate every process in the group
    async fn kill_group(&self, group: GroupId) -> Result<(), Error>;
}

/// Selects the group implementation for the platform we are running on
pub fn detect() -> Arc<dyn ProcessGroups> {
    #[cfg(unix)]
    let groups: Arc<dyn ProcessGroups> = Arc::new(UnixGroups);
    #[cfg(windows)]
    let groups: Arc<dyn ProcessGroups> = Arc::new(TaskkillGroups);
    #[cfg(not(any(unix, windows)))]
    let groups: Arc<dyn ProcessGroups> = Arc::new(NoGroups);

    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_names() {
        for step in &[Step::Build, Step::Test, Step::Start] {
            assert_eq!(Step::from_name(step.as_str()), Some(*step));
        }
        assert_eq!(Step::from_name("deploy"), None);
        assert_eq!(Step::SETUP, [Step::Build, Step::Test]);
    }

    #[cfg(unix)]
    #[test]
    fn test_detect_unix() {
        assert_eq!(detect().name(), "unix");
    }
}
