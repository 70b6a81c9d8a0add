use crate::error::ActionError;
use crate::executor::{CommandOutput, Shell};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// `bash -c` inside the sandbox container, or on the host when no container
/// is configured. Every command runs in a fresh process, so there is no
/// shell state to carry between calls.
pub struct ContainerShell {
    container: Option<String>,
}

impl ContainerShell {
    pub fn new(container: Option<String>) -> Self {
        Self { container }
    }

    fn command(&self, script: &str) -> Command {
        let mut cmd = match &self.container {
            Some(container) => {
                let mut c = Command::new("docker");
                c.arg("exec").arg(container).arg("bash");
                c
            }
            None => Command::new("bash"),
        };
        cmd.arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Shell for ContainerShell {
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ActionError> {
        debug!(command, "shell command");
        let child = self
            .command(command)
            .spawn()
            .map_err(|e| ActionError::Sandbox(format!("failed to spawn shell: {e}")))?;
        // dropping the wait future kills the child
        let out = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(r) => r.map_err(|e| ActionError::Sandbox(format!("shell: {e}")))?,
            Err(_) => {
                warn!(command, timeout_ms = timeout.as_millis() as u64, "shell command timed out");
                return Err(ActionError::timeout("shell command", timeout));
            }
        };
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            status: out.status.code(),
        })
    }

    async fn restart(&self) -> Result<String, ActionError> {
        Ok("Shell restarted (stateless mode)".to_string())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_host_command_and_captures_streams() {
        let sh = ContainerShell::new(None);
        let out = sh.run("echo hi; echo oops >&2; exit 3", Duration::from_secs(10)).await.unwrap();
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.status, Some(3));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn long_command_times_out_instead_of_hanging() {
        let sh = ContainerShell::new(None);
        let err = sh.run("sleep 5", Duration::from_millis(100)).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn container_command_uses_docker_exec() {
        let sh = ContainerShell::new(Some("box".into()));
        let cmd = sh.command("ls");
        let args: Vec<_> = cmd.as_std().get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["exec", "box", "bash", "-c", "ls"]);
    }
}
