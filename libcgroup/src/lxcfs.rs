//! Per-pod lxcfs instances, driven through the host's wrapper scripts.

use std::sync::Arc;

use anyhow::bail;
use common::exec::SystemExecutor;
use tracing::debug;

const START_SCRIPT: &str = "/usr/local/lxcfs/start_lxcfs.sh";
const STOP_SCRIPT: &str = "/usr/local/lxcfs/stop_lxcfs.sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LxcfsOp {
    Start,
    Stop,
}

/// Starts or stops the lxcfs instance backing `pod_id`. The scripts exit
/// with status 1 when the instance is already in the requested state;
/// that is not an error.
pub async fn op_lxcfs(
    executor: &Arc<dyn SystemExecutor>,
    pod_id: &str,
    op: LxcfsOp,
) -> anyhow::Result<()> {
    let script = match op {
        LxcfsOp::Start => START_SCRIPT,
        LxcfsOp::Stop => STOP_SCRIPT,
    };
    let out = executor.run(script, &[pod_id.to_string()], None).await?;
    debug!(pod_id, ?op, out = %out.stdout, "lxcfs");
    if !out.success() && out.code != 1 {
        bail!(
            "lxcfs {op:?} for {pod_id} exited with {}: {}",
            out.code,
            out.stderr
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::exec::{ExecOutput, FakeExecutor};

    #[tokio::test]
    async fn runs_the_right_script() {
        let exec: Arc<dyn SystemExecutor> = Arc::new(FakeExecutor::new());
        op_lxcfs(&exec, "pod-1", LxcfsOp::Start).await.unwrap();
        op_lxcfs(&exec, "pod-1", LxcfsOp::Stop).await.unwrap();
    }

    #[tokio::test]
    async fn exit_status_one_is_tolerated() {
        let fake = Arc::new(FakeExecutor::new());
        fake.push_output(ExecOutput {
            code: 1,
            ..Default::default()
        });
        fake.push_output(ExecOutput {
            code: 2,
            stderr: "script blew up".to_string(),
            ..Default::default()
        });
        let exec: Arc<dyn SystemExecutor> = fake;
        op_lxcfs(&exec, "pod-1", LxcfsOp::Start).await.unwrap();
        assert!(op_lxcfs(&exec, "pod-1", LxcfsOp::Start).await.is_err());
    }
}
