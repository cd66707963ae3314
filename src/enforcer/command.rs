//! Kernel command invocation for the enforcer.
//!
//! Every `iptables`/`tc` interaction goes through the [`CommandRunner`]
//! trait so tests can substitute a scripted fake. The system runner never
//! errors: failures are normalized into a nonzero-status output, mirroring
//! the "transient I/O is handled locally" policy.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

/// Hard ceiling on a single kernel command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Normalized outcome of one command invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(&self) -> bool {
        self.status == 0
    }

    /// "Replace" semantics: an existing identical object is not a failure.
    pub fn already_exists(&self) -> bool {
        self.stderr.contains("File exists")
    }

    /// Delete semantics: a missing object is not a failure.
    pub fn no_such_object(&self) -> bool {
        let err = self.stderr.to_ascii_lowercase();
        err.contains("no such") || err.contains("does not exist") || err.contains("bad rule")
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self { status: 1, stdout: String::new(), stderr: message.into() }
    }

    pub fn success(stdout: impl Into<String>) -> Self {
        Self { status: 0, stdout: stdout.into(), stderr: String::new() }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run one command to completion and capture its output.
    async fn run(&self, program: &str, args: &[String]) -> CommandOutput;
}

/// Runner executing real kernel commands via `tokio::process`.
#[derive(Debug, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> CommandOutput {
        debug!("exec: {} {}", program, args.join(" "));

        let child = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(COMMAND_TIMEOUT, child).await {
            Ok(Ok(output)) => CommandOutput {
                status: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Ok(Err(e)) => CommandOutput::failure(format!("spawn failed: {e}")),
            Err(_) => CommandOutput::failure(format!("{program} timed out")),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_classification() {
        let exists = CommandOutput::failure("RTNETLINK answers: File exists");
        assert!(!exists.ok());
        assert!(exists.already_exists());

        let missing = CommandOutput::failure("iptables: Bad rule (does a matching rule exist?)");
        assert!(missing.no_such_object());

        let gone = CommandOutput::failure("Cannot delete qdisc with handle: No such file or directory");
        assert!(gone.no_such_object());

        assert!(CommandOutput::success("htb 1: root").ok());
    }

    #[tokio::test]
    async fn test_fake_runner_scripting() {
        let runner = fake::FakeRunner::default();
        runner.respond_containing("-C INPUT", CommandOutput::failure("Bad rule"));

        let check = runner
            .run("iptables", &["-t".into(), "filter".into(), "-C".into(), "INPUT".into()])
            .await;
        assert!(!check.ok());

        let other = runner.run("tc", &["qdisc".into(), "show".into()]).await;
        assert!(other.ok());

        assert_eq!(runner.calls_containing("iptables"), 1);
        assert_eq!(runner.calls_containing("tc qdisc"), 1);
    }
}
