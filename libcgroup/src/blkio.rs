//! blkio throttle and weight files for one container's cgroup. Limits are
//! written twice: once against the container's device-mapper rootfs and
//! once against the pinned `8:0` device.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use common::Blkio;
use common::exec::SystemExecutor;
use tracing::debug;

const DEFAULT_CGROUP_ROOT: &str = "/cgroup/blkio/docker";
const PINNED_DEVICE: &str = "8:0";

pub struct BlkioGroup {
    executor: Arc<dyn SystemExecutor>,
    cgroup_root: PathBuf,
}

impl BlkioGroup {
    pub fn new(executor: Arc<dyn SystemExecutor>) -> Self {
        BlkioGroup {
            executor,
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
        }
    }

    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = root.into();
        self
    }

    /// Discovers the `major:minor` of the container's rootfs by walking
    /// `ls -lh /dev/mapper` for the device-mapper entry carrying the
    /// container id, then statting the target device.
    async fn rootfs_device(&self, container_id: &str) -> anyhow::Result<String> {
        let out = self
            .executor
            .run("ls", &["-lh".to_string(), "/dev/mapper".to_string()], None)
            .await?;
        if !out.success() {
            bail!("listing /dev/mapper failed: {}", out.stderr);
        }
        let mut rootfs = String::new();
        for line in out.stdout.lines() {
            if !line.contains(container_id) {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 11 {
                bail!("failed to get /dev/mapper info");
            }
            rootfs = Path::new(fields[10])
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default();
            break;
        }

        let out = self
            .executor
            .run("ls", &["-lh".to_string(), format!("/dev/{rootfs}")], None)
            .await?;
        if !out.success() {
            bail!("listing /dev/{rootfs} failed: {}", out.stderr);
        }
        let fields: Vec<&str> = out.stdout.split_whitespace().collect();
        if fields.len() < 6 {
            bail!("failed to get /dev/{rootfs} info");
        }
        let major = fields[4].replace(',', "");
        let minor = fields[5];
        Ok(format!("{major}:{minor}"))
    }

    async fn write(&self, container_id: &str, file: &str, data: String) -> anyhow::Result<()> {
        let path = self.cgroup_root.join(container_id).join(file);
        debug!(path = %path.display(), data = %data, "writing blkio file");
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }

    /// Applies every configured blkio limit to the container's cgroup.
    pub async fn set_up(&self, container_id: &str, blkio: &Blkio) -> anyhow::Result<()> {
        let rootfs = self.rootfs_device(container_id).await?;

        let files = [
            ("blkio.throttle.read_bps_device", blkio.read_bps_device),
            ("blkio.throttle.write_bps_device", blkio.write_bps_device),
            ("blkio.throttle.read_iops_device", blkio.read_iops_device),
            ("blkio.throttle.write_iops_device", blkio.write_iops_device),
            ("blkio.weight_device", blkio.weight_device),
        ];
        for (file, value) in files {
            self.write(container_id, file, format!("{rootfs} {value}"))
                .await?;
            self.write(container_id, file, format!("{PINNED_DEVICE} {value}"))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::exec::{ExecOutput, FakeExecutor};

    fn mapper_listing(container_id: &str) -> String {
        format!(
            "total 0\n\
             lrwxrwxrwx 1 root root 7 May  1 12:00 docker-8:3-{container_id} -> ../dm-3\n"
        )
    }

    const DEVICE_LISTING: &str = "brw-rw---- 1 root disk 253, 3 May  1 12:00 /dev/dm-3\n";

    #[tokio::test]
    async fn writes_limits_for_rootfs_and_pinned_device() {
        let exec = Arc::new(FakeExecutor::new());
        exec.push_output(ExecOutput {
            code: 0,
            stdout: mapper_listing("cafebabe"),
            ..Default::default()
        });
        exec.push_output(ExecOutput {
            code: 0,
            stdout: DEVICE_LISTING.to_string(),
            ..Default::default()
        });

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("cafebabe")).unwrap();
        let group = BlkioGroup::new(exec.clone()).with_cgroup_root(dir.path());

        let blkio = Blkio {
            read_bps_device: 1048576,
            write_bps_device: 2097152,
            read_iops_device: 100,
            write_iops_device: 200,
            weight_device: 500,
        };
        group.set_up("cafebabe", &blkio).await.unwrap();

        let read_bps = std::fs::read_to_string(
            dir.path().join("cafebabe").join("blkio.throttle.read_bps_device"),
        )
        .unwrap();
        // last write wins in the file, covering the pinned device
        assert_eq!(read_bps, "8:0 1048576");

        let weight =
            std::fs::read_to_string(dir.path().join("cafebabe").join("blkio.weight_device"))
                .unwrap();
        assert_eq!(weight, "8:0 500");

        let cmdlines = exec.cmdlines();
        assert_eq!(cmdlines[0], "ls -lh /dev/mapper");
        assert_eq!(cmdlines[1], "ls -lh /dev/dm-3");
    }

    #[tokio::test]
    async fn malformed_mapper_listing_is_an_error() {
        let exec = Arc::new(FakeExecutor::new());
        exec.push_output(ExecOutput {
            code: 0,
            stdout: "short line with cafebabe\n".to_string(),
            ..Default::default()
        });
        let group = BlkioGroup::new(exec);
        let err = group
            .set_up("cafebabe", &Blkio::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("/dev/mapper"));
    }
}
