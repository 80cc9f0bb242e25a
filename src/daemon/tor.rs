use super::{DaemonProcess, Launcher};
use crate::config::ConfigDescriptor;
use crate::error::{validate_pid, validate_pid_for_check, Error, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, killpg, Signal};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

/// Line tor prints once it can carry traffic.
const READY_MARKER: &str = "Bootstrapped 100%";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Launches the `tor` binary with `-f <descriptor>`.
pub struct TorLauncher {
    tor_binary: PathBuf,
    stop_grace: Duration,
}

impl TorLauncher {
    pub fn new(tor_binary: impl Into<PathBuf>, stop_grace: Duration) -> Self {
        Self {
            tor_binary: tor_binary.into(),
            stop_grace,
        }
    }
}

/// Kills the child if the launch is abandoned before readiness.
struct LaunchGuard {
    child: Option<Child>,
}

impl LaunchGuard {
    fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    fn disarm(mut self) -> Option<Child> {
        self.child.take()
    }
}

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            debug!("Abandoned launch, killing child {:?}", child.id());
            let _ = child.start_kill();
        }
    }
}

#[async_trait]
impl Launcher for TorLauncher {
    #[tracing::instrument(skip(self, descriptor), fields(client.port = descriptor.socks_port))]
    async fn launch(&self, descriptor: &ConfigDescriptor) -> Result<Box<dyn DaemonProcess>> {
        let port = descriptor.socks_port;
        let failed = |reason: String| Error::LaunchFailed { port, reason };

        let mut cmd = Command::new(&self.tor_binary);
        cmd.arg("-f")
            .arg(&descriptor.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            // The daemon outlives this manager once bootstrapped
            .kill_on_drop(false)
            .process_group(0);

        let child = cmd.spawn().map_err(|e| {
            failed(format!(
                "failed to spawn '{}': {}",
                self.tor_binary.display(),
                e
            ))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| failed("process exited before reporting a pid".to_string()))?;
        let mut guard = LaunchGuard { child: Some(child) };

        let stdout = guard
            .child_mut()
            .and_then(|c| c.stdout.take())
            .ok_or_else(|| failed("stdout was not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut last_error: Option<String> = None;

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(target: "tor", "{}", line);
                    if line.contains(READY_MARKER) {
                        break;
                    }
                    if line.contains("[err]") || line.contains("[warn]") {
                        last_error = Some(line);
                    }
                }
                Ok(None) => {
                    let status = match guard.child_mut() {
                        Some(child) => child
                            .wait()
                            .await
                            .map(|s| s.to_string())
                            .unwrap_or_else(|e| e.to_string()),
                        None => "unknown status".to_string(),
                    };
                    return Err(failed(match last_error {
                        Some(line) => format!("tor exited ({}) before bootstrapping: {}", status, line),
                        None => format!("tor exited ({}) before bootstrapping", status),
                    }));
                }
                Err(e) => return Err(failed(format!("failed to read tor output: {}", e))),
            }
        }

        let child = guard
            .disarm()
            .ok_or_else(|| failed("child handle lost during launch".to_string()))?;
        tokio::spawn(drain_output(port, lines));
        debug!("Client {} bootstrapped as pid {}", port, pid);

        Ok(Box::new(TorProcess {
            port,
            pid,
            child,
            grace: self.stop_grace,
        }))
    }

    fn is_alive(&self, pid: u32) -> bool {
        pid_is_alive(pid)
    }

    async fn kill_pid(&self, port: u16, pid: u32) -> Result<()> {
        terminate_pid(port, pid, self.stop_grace).await
    }
}

async fn drain_output(port: u16, mut lines: Lines<BufReader<ChildStdout>>) {
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "tor", port = port, "{}", line);
    }
}

/// A tor process spawned by this manager.
pub struct TorProcess {
    port: u16,
    pid: u32,
    child: Child,
    grace: Duration,
}

#[async_trait]
impl DaemonProcess for TorProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn terminate(&mut self) -> Result<()> {
        if let Ok(Some(_)) = self.child.try_wait() {
            return Ok(());
        }
        let pid = validate_pid(self.pid, self.port).map_err(|e| Error::StopFailed {
            port: self.port,
            reason: e.to_string(),
        })?;

        killpg(pid, Signal::SIGTERM)
            .or_else(|_| signal::kill(pid, Signal::SIGTERM))
            .map_err(|e| Error::StopFailed {
                port: self.port,
                reason: format!("SIGTERM to pid {} failed: {}", self.pid, e),
            })?;

        match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(Ok(_)) => {
                debug!("Client {} exited gracefully", self.port);
                return Ok(());
            }
            Ok(Err(e)) => warn!("Error waiting for client {}: {}", self.port, e),
            Err(_) => warn!(
                "Client {} did not exit after SIGTERM (grace period: {:?}), sending SIGKILL",
                self.port, self.grace
            ),
        }

        let _ = killpg(pid, Signal::SIGKILL).or_else(|_| signal::kill(pid, Signal::SIGKILL));
        match tokio::time::timeout(Duration::from_secs(2), self.child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(Error::StopFailed {
                port: self.port,
                reason: format!("pid {} survived SIGKILL", self.pid),
            }),
        }
    }
}

/// Whether `pid` names a live, non-zombie process.
pub fn pid_is_alive(pid: u32) -> bool {
    let Some(nix_pid) = validate_pid_for_check(pid) else {
        return false;
    };
    match signal::kill(nix_pid, None) {
        Ok(()) | Err(Errno::EPERM) => {}
        Err(_) => return false,
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            if let Some(line) = status.lines().find(|l| l.starts_with("State:")) {
                if let Some(state) = line.chars().skip("State:".len()).find(|c| c.is_alphabetic())
                {
                    return !matches!(state, 'Z' | 'X' | 'x');
                }
            }
        }
    }
    true
}

/// Terminate a process known only by pid: SIGTERM, poll for `grace`, then
/// SIGKILL. A pid that is already gone counts as success.
pub async fn terminate_pid(port: u16, pid: u32, grace: Duration) -> Result<()> {
    let stop_failed = |reason: String| Error::StopFailed { port, reason };
    let nix_pid = validate_pid(pid, port).map_err(|e| stop_failed(e.to_string()))?;

    match signal::kill(nix_pid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            debug!("Client {} pid {} already gone", port, pid);
            return Ok(());
        }
        Err(e) => return Err(stop_failed(format!("SIGTERM to pid {} failed: {}", pid, e))),
    }

    let polls = (grace.as_millis() / POLL_INTERVAL.as_millis()).max(1);
    for _ in 0..polls {
        tokio::time::sleep(POLL_INTERVAL).await;
        if !pid_is_alive(pid) {
            return Ok(());
        }
    }

    warn!(
        "Client {} pid {} did not exit after SIGTERM (grace period: {:?}), sending SIGKILL",
        port, pid, grace
    );
    let _ = signal::kill(nix_pid, Signal::SIGKILL);
    for _ in 0..5 {
        tokio::time::sleep(POLL_INTERVAL).await;
        if !pid_is_alive(pid) {
            return Ok(());
        }
    }
    Err(stop_failed(format!("pid {} survived SIGKILL", pid)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn descriptor(path: &Path) -> ConfigDescriptor {
        ConfigDescriptor::parse(
            path,
            crate::config::DescriptorKind::Custom(1),
            "SocksPort 9160\n",
        )
        .unwrap()
    }

    #[test]
    fn own_process_is_alive_and_bogus_pids_are_not() {
        assert!(pid_is_alive(std::process::id()));
        assert!(!pid_is_alive(0));
        assert!(!pid_is_alive(u32::MAX));
    }

    #[tokio::test]
    async fn terminate_pid_refuses_init() {
        let err = terminate_pid(9050, 1, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StopFailed { port: 9050, .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = TorLauncher::new(
            dir.path().join("no-such-tor"),
            Duration::from_millis(100),
        );
        let err = match launcher.launch(&descriptor(&dir.path().join("torrc.1"))).await {
            Err(e) => e,
            Ok(_) => panic!("launch should fail"),
        };
        assert!(matches!(err, Error::LaunchFailed { port: 9160, .. }));
    }

    #[tokio::test]
    async fn output_is_drained_until_the_daemon_closes_stdout() {
        let mut child = Command::new("printf")
            .arg("one\\ntwo\\n")
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            drain_output(9160, BufReader::new(stdout).lines()),
        )
        .await
        .unwrap();
        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn early_exit_is_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        // `false -f <path>` exits immediately without output
        let launcher = TorLauncher::new("false", Duration::from_millis(100));
        let err = match launcher.launch(&descriptor(&dir.path().join("torrc.1"))).await {
            Err(e) => e,
            Ok(_) => panic!("launch should fail"),
        };
        assert!(err.to_string().contains("before bootstrapping"));
    }
}
