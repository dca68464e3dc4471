//! Small helpers for shelling out to subprocesses (in practice, just `git`).
//!
//! Kept deliberately thin: callers build a [`tokio::process::Command`] or
//! [`std::process::Command`] themselves and reach for [`CommandExt`] /
//! [`SyncCommandExt`] to run it and get a sensible error on non-zero exit,
//! and [`OutputExt`] to interpret the result afterwards.

use std::os::unix::process::{CommandExt as _, ExitStatusExt as _};
use std::process::{Command as SyncCommand, Output};

use anyhow::{anyhow, bail, Context};
use tokio::process::Command;

fn describe(output: &Output) -> String {
    format!(
        "exit status: {}\nstdout:\n{}\nstderr:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    )
}

pub trait OutputExt {
    /// `Ok(())` on exit code 0, an error describing stdout/stderr otherwise.
    fn ok(&self) -> anyhow::Result<()>;

    /// The exit code, assuming the process was not killed by a signal.
    fn code_not_killed(&self) -> anyhow::Result<i32>;
}

impl OutputExt for Output {
    fn ok(&self) -> anyhow::Result<()> {
        if self.status.success() {
            Ok(())
        } else {
            Err(anyhow!(describe(self)))
        }
    }

    fn code_not_killed(&self) -> anyhow::Result<i32> {
        self.status
            .code()
            .ok_or_else(|| anyhow!("process killed by signal {:?}", self.status.signal()))
    }
}

pub trait CommandExt {
    /// Put the child in its own process group, so it doesn't receive signals
    /// sent to our own group (e.g. a Ctrl-C forwarded by the shell).
    fn process_group(&mut self, pgroup: i32) -> &mut Self;

    /// Run to completion and return an error (with stdout/stderr attached)
    /// unless the exit code was 0.
    async fn execute(&mut self) -> anyhow::Result<Output>;
}

impl CommandExt for Command {
    fn process_group(&mut self, pgroup: i32) -> &mut Self {
        std::os::unix::process::CommandExt::process_group(
            AsMutStdCommand::as_mut_std(self),
            pgroup,
        );
        self
    }

    async fn execute(&mut self) -> anyhow::Result<Output> {
        let output = self
            .output()
            .await
            .with_context(|| format!("spawning {self:?}"))?;
        output
            .ok()
            .with_context(|| format!("running {self:?}:\n{}", describe(&output)))?;
        Ok(output)
    }
}

pub trait SyncCommandExt {
    fn execute(&mut self) -> anyhow::Result<Output>;
}

impl SyncCommandExt for SyncCommand {
    fn execute(&mut self) -> anyhow::Result<Output> {
        let output = self.output().with_context(|| format!("spawning {self:?}"))?;
        if !output.status.success() {
            bail!("running {self:?}:\n{}", describe(&output));
        }
        Ok(output)
    }
}

/// `tokio::process::Command` doesn't expose `process_group` directly; it
/// forwards to the inner `std::process::Command` via `as_std_mut` since
/// tokio 1.29 but we pin to the stable pre-1.29 API used elsewhere in this
/// codebase by reimplementing the narrow bit we need.
trait AsMutStdCommand {
    fn as_mut_std(&mut self) -> &mut SyncCommand;
}

impl AsMutStdCommand for Command {
    fn as_mut_std(&mut self) -> &mut SyncCommand {
        self.as_std_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_success() {
        let mut cmd = Command::new("true");
        cmd.execute().await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_failure_includes_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo boom 1>&2; exit 3"]);
        let err = cmd.execute().await.unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
    }

    #[tokio::test]
    async fn test_code_not_killed() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 7"]);
        let output = cmd.output().await.unwrap();
        assert_eq!(output.code_not_killed().unwrap(), 7);
    }
}
