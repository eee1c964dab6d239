//! Process-invocation seam for the shell tools the node agent drives
//! (pipework, sriov, xfs_quota, ip, ls, lxcfs scripts). Production code
//! runs real commands; tests inject [`FakeExecutor`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;

/// Outcome of one external command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} exited with status {code}: {stderr}")]
    NonZero {
        program: String,
        code: i32,
        stderr: String,
    },
}

#[async_trait]
pub trait SystemExecutor: Send + Sync {
    /// Runs `program` with `args`, optionally in `dir`, and returns its
    /// output regardless of exit status.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        dir: Option<&Path>,
    ) -> Result<ExecOutput, ExecError>;

    /// Runs a full command line through `/bin/sh -c`.
    async fn shell(&self, cmdline: &str) -> Result<ExecOutput, ExecError> {
        self.run("/bin/sh", &["-c".to_string(), cmdline.to_string()], None)
            .await
    }
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone)]
pub struct CommandExecutor;

#[async_trait]
impl SystemExecutor for CommandExecutor {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        dir: Option<&Path>,
    ) -> Result<ExecOutput, ExecError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        let out = cmd.output().await.map_err(|source| ExecError::Spawn {
            program: program.to_string(),
            source,
        })?;
        Ok(ExecOutput {
            code: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

/// One recorded invocation on a [`FakeExecutor`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub dir: Option<PathBuf>,
}

impl RecordedCall {
    pub fn cmdline(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Records every invocation and replays canned outputs. When the queue of
/// canned outputs is exhausted, further calls succeed with empty output.
#[derive(Debug, Default)]
pub struct FakeExecutor {
    calls: Mutex<Vec<RecordedCall>>,
    outputs: Mutex<Vec<ExecOutput>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        FakeExecutor::default()
    }

    /// Queues an output to hand back, FIFO.
    pub fn push_output(&self, out: ExecOutput) {
        self.outputs.lock().unwrap().push(out);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn cmdlines(&self) -> Vec<String> {
        self.calls().iter().map(RecordedCall::cmdline).collect()
    }
}

#[async_trait]
impl SystemExecutor for FakeExecutor {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        dir: Option<&Path>,
    ) -> Result<ExecOutput, ExecError> {
        self.calls.lock().unwrap().push(RecordedCall {
            program: program.to_string(),
            args: args.to_vec(),
            dir: dir.map(Path::to_path_buf),
        });
        let mut outputs = self.outputs.lock().unwrap();
        if outputs.is_empty() {
            Ok(ExecOutput::default())
        } else {
            Ok(outputs.remove(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_executor_records_and_replays() {
        let exec = FakeExecutor::new();
        exec.push_output(ExecOutput {
            code: 1,
            stderr: "boom".to_string(),
            ..Default::default()
        });

        let first = exec
            .run("pipework", &["br7".to_string(), "abc".to_string()], None)
            .await
            .unwrap();
        assert_eq!(first.code, 1);
        assert_eq!(first.stderr, "boom");

        let second = exec.run("ip", &[], None).await.unwrap();
        assert!(second.success());

        let calls = exec.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].cmdline(), "pipework br7 abc");
        assert_eq!(calls[1].program, "ip");
    }
}
