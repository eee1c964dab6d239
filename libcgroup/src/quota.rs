//! xfs project quotas for container disk limits. Project bookkeeping
//! lives in `/etc/projects` (`pid:path` lines) and `/etc/projid`
//! (`name:pid` lines); both files are rewritten read-filter-append under
//! one mutex.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use common::exec::SystemExecutor;
use tokio::sync::Mutex;
use tracing::debug;

const PROJECTS_FILE: &str = "/etc/projects";
const PROJID_FILE: &str = "/etc/projid";
const VOLUME_ROOT: &str = "/data/docker-volumes/";
const FS_ROOT: &str = "/data";

pub struct DiskQuota {
    executor: Arc<dyn SystemExecutor>,
    projects_path: PathBuf,
    projid_path: PathBuf,
    volume_root: String,
    fs_root: String,
    refresh_lock: Mutex<()>,
}

/// Drops lines containing `filter` from `content` and appends `data` when
/// non-empty. Blank lines are dropped as well.
fn filter_lines(content: &str, filter: &str, data: &str) -> String {
    let mut lines: Vec<String> = content
        .lines()
        .map(|l| l.trim_end_matches('\r').to_string())
        .filter(|l| !l.is_empty() && !l.contains(filter))
        .collect();
    if !data.is_empty() {
        lines.push(data.to_string());
    }
    lines.join("\n")
}

impl DiskQuota {
    pub fn new(executor: Arc<dyn SystemExecutor>) -> Self {
        DiskQuota {
            executor,
            projects_path: PathBuf::from(PROJECTS_FILE),
            projid_path: PathBuf::from(PROJID_FILE),
            volume_root: VOLUME_ROOT.to_string(),
            fs_root: FS_ROOT.to_string(),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn with_paths(
        mut self,
        projects: impl Into<PathBuf>,
        projid: impl Into<PathBuf>,
    ) -> Self {
        self.projects_path = projects.into();
        self.projid_path = projid.into();
        self
    }

    async fn refresh_projfile(
        &self,
        path: &PathBuf,
        data: &str,
        filter: &str,
    ) -> anyhow::Result<()> {
        let _guard = self.refresh_lock.lock().await;
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        let rewritten = filter_lines(&content, filter, data);
        tokio::fs::write(path, rewritten)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }

    async fn xfs_quota(&self, command: String) -> anyhow::Result<common::exec::ExecOutput> {
        let out = self
            .executor
            .run(
                "xfs_quota",
                &[
                    "-x".to_string(),
                    "-c".to_string(),
                    command.clone(),
                    self.fs_root.clone(),
                ],
                None,
            )
            .await?;
        debug!(command = %command, out = %out.stdout, "xfs_quota");
        Ok(out)
    }

    /// Registers project `name` for a container whose init pid is `pid`
    /// and caps it at `disk` GB. A non-positive `disk` is a no-op.
    pub async fn add(&self, pid: i32, name: &str, disk: i64) -> anyhow::Result<()> {
        if disk <= 0 {
            debug!(name, disk, "disk quota unset, skipping");
            return Ok(());
        }
        let project_id = pid % 0xFFFF;
        debug!(pid, project_id, name, disk, "adding disk quota");

        self.refresh_projfile(
            &self.projects_path,
            &format!("{project_id}:{}{name}", self.volume_root),
            name,
        )
        .await?;
        self.refresh_projfile(&self.projid_path, &format!("{name}:{project_id}"), name)
            .await?;

        let out = self.xfs_quota(format!("project -s {name}")).await?;
        if !out.success() {
            bail!("xfs_quota project -s {name} failed: {}", out.stderr);
        }
        let out = self
            .xfs_quota(format!("limit -p bhard={disk}g {name}"))
            .await?;
        if !out.success() {
            bail!("xfs_quota limit for {name} failed: {}", out.stderr);
        }
        Ok(())
    }

    /// Clears project `name` and drops its bookkeeping lines. A project
    /// the filesystem has already forgotten counts as removed.
    pub async fn remove(&self, pid: i32, name: &str) -> anyhow::Result<()> {
        debug!(pid, name, "removing disk quota");
        let out = self.xfs_quota(format!("project -C {name}")).await?;
        if !out.success() {
            if out.stderr.contains("doesn't exist") || out.stderr.contains("no such project") {
                return Ok(());
            }
            bail!("xfs_quota project -C {name} failed: {}", out.stderr);
        }

        self.refresh_projfile(&self.projects_path, "", name).await?;
        self.refresh_projfile(&self.projid_path, "", name).await?;
        Ok(())
    }

    /// Re-caps an existing project at `disk` GB (online resize path).
    pub async fn update_limit(&self, name: &str, disk: i64) -> anyhow::Result<()> {
        if disk <= 0 {
            debug!(name, disk, "disk quota unset, skipping update");
            return Ok(());
        }
        let out = self
            .xfs_quota(format!("limit -p bhard={disk}g {name}"))
            .await?;
        if !out.success() {
            bail!("xfs_quota limit for {name} failed: {}", out.stderr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::exec::{ExecOutput, FakeExecutor};

    #[test]
    fn filter_drops_matching_and_blank_lines() {
        let content = "100:/data/docker-volumes/web\n\n200:/data/docker-volumes/db\n";
        assert_eq!(
            filter_lines(content, "web", "300:/data/docker-volumes/web"),
            "200:/data/docker-volumes/db\n300:/data/docker-volumes/web"
        );
        assert_eq!(filter_lines(content, "web", ""), "200:/data/docker-volumes/db");
    }

    fn quota_with_tempfiles(exec: Arc<FakeExecutor>) -> (DiskQuota, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let quota = DiskQuota::new(exec)
            .with_paths(dir.path().join("projects"), dir.path().join("projid"));
        (quota, dir)
    }

    #[tokio::test]
    async fn add_rewrites_files_and_invokes_xfs_quota() {
        let exec = Arc::new(FakeExecutor::new());
        let (quota, dir) = quota_with_tempfiles(exec.clone());
        std::fs::write(
            dir.path().join("projects"),
            "7:/data/docker-volumes/app\n9:/data/docker-volumes/other\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("projid"), "app:7\nother:9\n").unwrap();

        quota.add(0x2_0005, "app", 20).await.unwrap();

        let project_id = 0x2_0005 % 0xFFFF;
        let projects = std::fs::read_to_string(dir.path().join("projects")).unwrap();
        assert_eq!(
            projects,
            format!("9:/data/docker-volumes/other\n{project_id}:/data/docker-volumes/app")
        );
        let projid = std::fs::read_to_string(dir.path().join("projid")).unwrap();
        assert_eq!(projid, format!("other:9\napp:{project_id}"));

        assert_eq!(
            exec.cmdlines(),
            vec![
                "xfs_quota -x -c project -s app /data".to_string(),
                "xfs_quota -x -c limit -p bhard=20g app /data".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn add_skips_when_disk_unset() {
        let exec = Arc::new(FakeExecutor::new());
        let (quota, _dir) = quota_with_tempfiles(exec.clone());
        quota.add(1234, "app", 0).await.unwrap();
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn remove_tolerates_missing_project() {
        let exec = Arc::new(FakeExecutor::new());
        exec.push_output(ExecOutput {
            code: 1,
            stderr: "xfs_quota: no such project app".to_string(),
            ..Default::default()
        });
        let (quota, dir) = quota_with_tempfiles(exec);
        std::fs::write(dir.path().join("projects"), "1:/data/docker-volumes/app\n").unwrap();

        quota.remove(1234, "app").await.unwrap();
        // project files untouched when xfs_quota never cleared the project
        let projects = std::fs::read_to_string(dir.path().join("projects")).unwrap();
        assert!(projects.contains("app"));
    }

    #[tokio::test]
    async fn remove_clears_bookkeeping() {
        let exec = Arc::new(FakeExecutor::new());
        let (quota, dir) = quota_with_tempfiles(exec);
        std::fs::write(
            dir.path().join("projects"),
            "1:/data/docker-volumes/app\n2:/data/docker-volumes/db\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("projid"), "app:1\ndb:2\n").unwrap();

        quota.remove(1234, "app").await.unwrap();

        let projects = std::fs::read_to_string(dir.path().join("projects")).unwrap();
        assert_eq!(projects, "2:/data/docker-volumes/db");
        let projid = std::fs::read_to_string(dir.path().join("projid")).unwrap();
        assert_eq!(projid, "db:2");
    }
}
