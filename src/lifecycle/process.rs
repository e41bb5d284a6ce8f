//! Subprocess-backed worker handles.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;

use super::worker::{Worker, WorkerFactory};
use crate::reaper::ProcessInspector;
use crate::{GovernorError, Result};

/// Prefix of per-worker profile directories; matched by the default cleanup patterns.
pub const PROFILE_DIR_PREFIX: &str = "pagegov-profile-";

#[derive(Debug, Clone)]
pub struct CommandWorkerOptions {
    pub program: String,
    pub args: Vec<String>,
    /// When set, each worker gets a fresh profile directory under this root,
    /// passed as `--user-data-dir=`.
    pub profile_root: Option<PathBuf>,
    /// A process that exits within this window counts as a failed spawn.
    pub startup_grace: Duration,
}

impl CommandWorkerOptions {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            profile_root: None,
            startup_grace: Duration::ZERO,
        }
    }

    /// Headless Chromium with a throwaway profile in the temp directory.
    pub fn chromium() -> Self {
        Self {
            program: "chromium".to_string(),
            args: vec![
                "--headless=new".to_string(),
                "--remote-debugging-port=0".to_string(),
                "--no-first-run".to_string(),
                "--no-default-browser-check".to_string(),
            ],
            profile_root: Some(std::env::temp_dir()),
            startup_grace: Duration::from_millis(200),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

pub struct CommandWorkerFactory {
    options: CommandWorkerOptions,
    inspector: Arc<dyn ProcessInspector>,
    seq: AtomicU64,
}

impl CommandWorkerFactory {
    pub fn new(options: CommandWorkerOptions, inspector: Arc<dyn ProcessInspector>) -> Self {
        Self {
            options,
            inspector,
            seq: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &CommandWorkerOptions {
        &self.options
    }
}

#[async_trait]
impl WorkerFactory for CommandWorkerFactory {
    async fn spawn(&self) -> Result<Arc<dyn Worker>> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let profile_dir = match &self.options.profile_root {
            Some(root) => {
                let dir = root.join(format!(
                    "{}{}-{}",
                    PROFILE_DIR_PREFIX,
                    std::process::id(),
                    seq
                ));
                tokio::fs::create_dir_all(&dir).await?;
                Some(dir)
            }
            None => None,
        };

        let mut cmd = Command::new(&self.options.program);
        cmd.args(&self.options.args);
        if let Some(dir) = &profile_dir {
            cmd.arg(format!("--user-data-dir={}", dir.display()));
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                remove_profile(profile_dir.as_ref()).await;
                return Err(map_spawn_error(err, &self.options.program));
            }
        };
        let pid = child.id();

        let (exited_tx, exited_rx) = watch::channel(false);
        tokio::spawn(async move {
            let status = child.wait().await;
            debug!(?pid, ?status, "worker process exited");
            let _ = exited_tx.send(true);
        });

        if !self.options.startup_grace.is_zero() {
            let mut rx = exited_rx.clone();
            let exited_early = timeout(self.options.startup_grace, rx.wait_for(|e| *e))
                .await
                .is_ok();
            if exited_early {
                remove_profile(profile_dir.as_ref()).await;
                return Err(GovernorError::Spawn(format!(
                    "'{}' exited during startup",
                    self.options.program
                )));
            }
        }

        debug!(?pid, program = %self.options.program, "worker process spawned");
        Ok(Arc::new(CommandWorker {
            pid,
            exited: exited_rx,
            profile_dir,
            inspector: self.inspector.clone(),
        }))
    }
}

/// A spawned subprocess. Connected means "not yet exited".
pub struct CommandWorker {
    pid: Option<u32>,
    exited: watch::Receiver<bool>,
    profile_dir: Option<PathBuf>,
    inspector: Arc<dyn ProcessInspector>,
}

impl CommandWorker {
    pub fn profile_dir(&self) -> Option<&PathBuf> {
        self.profile_dir.as_ref()
    }
}

#[async_trait]
impl Worker for CommandWorker {
    fn is_connected(&self) -> bool {
        !*self.exited.borrow()
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }

    async fn close(&self) -> Result<()> {
        if let (true, Some(pid)) = (self.is_connected(), self.pid) {
            self.inspector.terminate(pid)?;
            self.disconnected().await;
        }
        remove_profile(self.profile_dir.as_ref()).await;
        Ok(())
    }

    async fn disconnected(&self) {
        let mut rx = self.exited.clone();
        // A dropped sender means the waiter finished too.
        let _ = rx.wait_for(|exited| *exited).await;
    }
}

async fn remove_profile(dir: Option<&PathBuf>) {
    let Some(dir) = dir else { return };
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => debug!(dir = %dir.display(), error = %err, "failed to remove profile dir"),
    }
}

fn map_spawn_error(err: io::Error, program: &str) -> GovernorError {
    if err.kind() == io::ErrorKind::NotFound {
        GovernorError::Spawn(format!(
            "Unable to spawn worker; '{}' was not found on PATH",
            program
        ))
    } else {
        GovernorError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reaper::SysinfoInspector;

    fn factory(options: CommandWorkerOptions) -> CommandWorkerFactory {
        CommandWorkerFactory::new(options, Arc::new(SysinfoInspector::new()))
    }

    #[test]
    fn missing_program_maps_to_spawn_error() {
        let err = map_spawn_error(io::Error::from(io::ErrorKind::NotFound), "chromium");
        assert!(matches!(err, GovernorError::Spawn(ref m) if m.contains("not found")));
        let err = map_spawn_error(io::Error::from(io::ErrorKind::PermissionDenied), "chromium");
        assert!(matches!(err, GovernorError::Io(_)));
    }

    #[tokio::test]
    async fn spawning_a_missing_binary_fails() {
        let result = factory(CommandWorkerOptions::new("definitely-not-a-binary"))
            .spawn()
            .await;
        assert!(matches!(result, Err(GovernorError::Spawn(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn close_terminates_and_removes_profile() {
        let root = tempfile::tempdir().unwrap();
        // `sh -c` ignores the trailing `--user-data-dir=` operand.
        let options = CommandWorkerOptions {
            profile_root: Some(root.path().to_path_buf()),
            ..CommandWorkerOptions::new("sh").args(["-c", "exec sleep 30"])
        };
        let worker = factory(options).spawn().await.unwrap();
        assert!(worker.is_connected());
        assert!(worker.process_id().is_some());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 1);

        tokio::time::timeout(Duration::from_secs(5), worker.close())
            .await
            .unwrap()
            .unwrap();
        assert!(!worker.is_connected());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn early_exit_is_a_spawn_failure() {
        let options = CommandWorkerOptions {
            startup_grace: Duration::from_millis(500),
            ..CommandWorkerOptions::new("true")
        };
        let result = factory(options).spawn().await;
        assert!(matches!(result, Err(GovernorError::Spawn(ref m)) if m.contains("startup")));
    }
}
