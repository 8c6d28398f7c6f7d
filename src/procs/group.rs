// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#[cfg(unix)]
use std::convert::TryFrom;
use std::process::{self, Stdio};

use async_trait::async_trait;
use tokio::process::Command;

use crate::procs::{GroupId, ProcessGroups};
use crate::Error;

/// POSIX process groups: `setpgid(0, 0)` in the child, `killpg(SIGKILL)` on shutdown
#[cfg(unix)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UnixGroups;

#[cfg(unix)]
#[async_trait]
impl ProcessGroups for UnixGroups {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn make_leader(&self, command: &mut process::Command) {
        use std::os::unix::process::CommandExt;

        // 0 makes the child's pid its pgid, detaching it from our own group
        command.process_group(0);
    }

    fn group_id(&self, pid: u32) -> Result<GroupId, Error> {
        use nix::unistd::{getpgid, Pid};

        let pid =
            i32::try_from(pid).map_err(|_| Error::from(format!("pid out of range: {}", pid)))?;
        let pgid = getpgid(Some(Pid::from_raw(pid)))?;

        Ok(GroupId::Group(pgid.as_raw()))
    }

    async fn kill_group(&self, group: GroupId) -> Result<(), Error> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::{getpgrp, Pid};

        let pgid = match group {
            GroupId::Group(pgid) => pgid,
            GroupId::Tree(pid) => i32::try_from(pid)
                .map_err(|_| Error::from(format!("pid out of range: {}", pid)))?,
            GroupId::Unsupported => return Ok(()),
        };

        // never signal init, "every process", or the group we ourselves belong to
        if pgid <= 1 || pgid == getpgrp().as_raw() {
            return Err(format!("refusing to kill process group {}", pgid).into());
        }

        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            // the whole group already exited
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Windows style: new process group at creation, `taskkill /T /F` for the whole tree
#[derive(Clone, Copy, Debug, Default)]
pub struct TaskkillGroups;

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

#[async_trait]
impl ProcessGroups for TaskkillGroups {
    fn name(&self) -> &'static str {
        "taskkill"
    }

    #[allow(unused_variables)]
    fn make_leader(&self, command: &mut process::Command) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }
    }

    fn group_id(&self, pid: u32) -> Result<GroupId, Error> {
        Ok(GroupId::Tree(pid))
    }

    async fn kill_group(&self, group: GroupId) -> Result<(), Error> {
        let pid = match group {
            GroupId::Tree(pid) => pid.to_string(),
            GroupId::Group(pgid) => pgid.to_string(),
            GroupId::Unsupported => return Ok(()),
        };

        let status = Command::new("taskkill")
            .args(&["/PID", pid.as_str(), "/T", "/F"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;

        if !status.success() {
            return Err(format!("taskkill for {} exited with {}", pid, status).into());
        }

        Ok(())
    }
}

/// No group semantics at all, only the direct kill of the leader is possible
#[derive(Clone, Copy, Debug, Default)]
pub struct NoGroups;

#[async_trait]
impl ProcessGroups for NoGroups {
    fn name(&self) -> &'static str {
        "none"
    }

    fn make_leader(&self, _command: &mut process::Command) {}

    fn group_id(&self, _pid: u32) -> Result<GroupId, Error> {
        Ok(GroupId::Unsupported)
    }

    async fn kill_group(&self, _group: GroupId) -> Result<(), Error> {
        Ok(())
    }
}
