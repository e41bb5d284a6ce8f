//! Host process table access: find by signature, signal, liveness.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use sysinfo::{
    Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System, UpdateKind,
};

use crate::config::ReaperConfig;
use crate::{GovernorError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<u32>,
    pub name: String,
    pub command_line: String,
}

/// Parent links followed before giving up on a (possibly cyclic) racy table.
const MAX_ANCESTRY_DEPTH: usize = 64;

/// Whether `pid` is one of `roots` or runs somewhere below one of them.
pub fn descends_from(
    pid: u32,
    roots: &HashSet<u32>,
    parent_of: impl Fn(u32) -> Option<u32>,
) -> bool {
    let mut current = Some(pid);
    for _ in 0..MAX_ANCESTRY_DEPTH {
        match current {
            Some(p) if roots.contains(&p) => return true,
            Some(p) => current = parent_of(p),
            None => return false,
        }
    }
    false
}

/// Command-line fingerprint of a rendering-engine subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSignature {
    /// Case-insensitive substrings of the executable name; empty matches any.
    pub executables: Vec<String>,
    /// At least one must appear on the command line.
    pub flags: Vec<String>,
    /// Must appear on the command line when set.
    pub profile_marker: Option<String>,
}

impl ProcessSignature {
    pub fn from_config(config: &ReaperConfig) -> Self {
        Self {
            executables: config
                .executables
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
            flags: config.flags.clone(),
            profile_marker: config.profile_marker.clone(),
        }
    }

    pub fn matches(&self, name: &str, command_line: &str) -> bool {
        let name = name.to_ascii_lowercase();
        let executable_ok = self.executables.is_empty()
            || self
                .executables
                .iter()
                .any(|exe| name.contains(exe.as_str()));
        let flags_ok = self.flags.iter().any(|flag| command_line.contains(flag.as_str()));
        let marker_ok = self
            .profile_marker
            .as_deref()
            .map_or(true, |marker| command_line.contains(marker));
        executable_ok && flags_ok && marker_ok
    }
}

impl Default for ProcessSignature {
    fn default() -> Self {
        Self::from_config(&ReaperConfig::default())
    }
}

/// Platform process operations used by the lifecycle manager and the reaper.
pub trait ProcessInspector: Send + Sync {
    /// Every process (other than this one) matching `signature`.
    fn list_by_signature(&self, signature: &ProcessSignature) -> Result<Vec<ProcessInfo>>;

    /// Ask the process to exit (SIGTERM where available).
    fn terminate(&self, pid: u32) -> Result<()>;

    /// Forcefully kill the process. Killing a process that is already gone succeeds.
    fn kill(&self, pid: u32) -> Result<()>;

    /// Zombies count as dead.
    fn is_alive(&self, pid: u32) -> bool;

    /// Parent of `pid` as of the most recent listing; `None` when unknown.
    fn parent_of(&self, pid: u32) -> Option<u32>;
}

/// [`ProcessInspector`] over the `sysinfo` process table.
pub struct SysinfoInspector {
    system: Mutex<System>,
}

impl SysinfoInspector {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing(),
        );
        let Some(process) = system.process(pid) else {
            return Ok(());
        };
        // `kill_with` is None when the platform lacks the signal; fall back to a plain kill.
        let delivered = process.kill_with(signal).unwrap_or_else(|| process.kill());
        if delivered {
            Ok(())
        } else {
            Err(GovernorError::Process(format!(
                "failed to send {:?} to pid {}",
                signal, pid
            )))
        }
    }
}

impl Default for SysinfoInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInspector for SysinfoInspector {
    fn list_by_signature(&self, signature: &ProcessSignature) -> Result<Vec<ProcessInfo>> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        let own_pid = std::process::id();
        let mut found: Vec<ProcessInfo> = system
            .processes()
            .iter()
            .filter(|(pid, process)| {
                pid.as_u32() != own_pid
                    && process.thread_kind().is_none()
                    && process.status() != ProcessStatus::Zombie
            })
            .filter_map(|(pid, process)| {
                let name = process.name().to_string_lossy().into_owned();
                let command_line = process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" ");
                signature.matches(&name, &command_line).then(|| ProcessInfo {
                    pid: pid.as_u32(),
                    parent: process.parent().map(|p| p.as_u32()),
                    name,
                    command_line,
                })
            })
            .collect();
        found.sort_by_key(|p| p.pid);
        Ok(found)
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        self.signal(pid, Signal::Term)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        self.signal(pid, Signal::Kill)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing(),
        );
        system
            .process(pid)
            .is_some_and(|p| p.status() != ProcessStatus::Zombie)
    }

    fn parent_of(&self, pid: u32) -> Option<u32> {
        let system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system
            .process(Pid::from_u32(pid))
            .and_then(|p| p.parent())
            .map(|p| p.as_u32())
    }
}
