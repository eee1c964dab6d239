//! Host-side network wiring for pod sandboxes: pipework invocation for
//! bridge/sriov attachment, IRQ/RPS affinity for sriov containers and VF
//! MAC randomization on teardown. Everything shells out through
//! [`common::exec::SystemExecutor`] so tests can observe the exact
//! command lines.

use std::sync::Arc;

use common::exec::SystemExecutor;
use common::{Network, NetworkMode};
use rand::Rng;
use tracing::{debug, error};

/// Host device the virtual functions hang off.
pub const DEFAULT_DEVICE: &str = "eth1";

const PIPEWORK_DIR: &str = "/usr/local/bin";

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("network mode {0:?} does not support pipework setup")]
    UnsupportedMode(NetworkMode),
    #[error("could not find virtual function device for vf index {0}")]
    NoVfDevice(String),
    #[error("{context}: {stderr}")]
    CommandFailed { context: String, stderr: String },
    #[error(transparent)]
    Exec(#[from] common::exec::ExecError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct NetworkBinder {
    executor: Arc<dyn SystemExecutor>,
}

impl NetworkBinder {
    pub fn new(executor: Arc<dyn SystemExecutor>) -> Self {
        NetworkBinder { executor }
    }

    /// Attaches the running net container `net_id` to the pod's allocated
    /// network. Must run after the net container is up, since pipework
    /// enters its namespace by id.
    ///
    /// sriov: `pipework eth1 --vf <vfid> <id> <ip@gw> <mac@vlan>`
    /// bridge: `pipework <bridge> <id> <ip@gw> <mac>`
    pub async fn setup_network(
        &self,
        net_id: &str,
        network: &Network,
    ) -> Result<(), NetworkError> {
        let ip_and_gw = format!("{}@{}", network.address, network.gateway);
        let args: Vec<String> = match network.mode {
            NetworkMode::Sriov => {
                let vlan_id = network.vlan_id.max(0);
                vec![
                    DEFAULT_DEVICE.to_string(),
                    "--vf".to_string(),
                    network.vf_id.clone(),
                    net_id.to_string(),
                    ip_and_gw,
                    format!("{}@{}", network.mac_address, vlan_id),
                ]
            }
            NetworkMode::Bridge => vec![
                network.bridge.clone(),
                net_id.to_string(),
                ip_and_gw,
                network.mac_address.clone(),
            ],
            mode => return Err(NetworkError::UnsupportedMode(mode)),
        };

        debug!(net_id, args = %args.join(" "), "setup network");
        let out = self
            .executor
            .run("pipework", &args, Some(std::path::Path::new(PIPEWORK_DIR)))
            .await?;
        if !out.success() {
            error!(net_id, stderr = %out.stderr, "pipework failed");
            return Err(NetworkError::CommandFailed {
                context: format!("pipework for container {net_id}"),
                stderr: out.stderr,
            });
        }
        Ok(())
    }

    /// Applies IRQ and RPS affinity for a sriov container pinned to
    /// `cpu_set`: one hex mask per core plus the aggregate mask.
    ///
    /// `sriov <containerID> <vfID> <mask,mask,...> <rps-mask>`
    pub async fn setup_sriov(
        &self,
        container_id: &str,
        vf_id: &str,
        cpu_set: &str,
    ) -> Result<(), NetworkError> {
        let mut irq_masks = Vec::new();
        for core in cpu_set.split(',') {
            irq_masks.push(common::util::hex_cpu_set(core)?);
        }
        let rps_mask = common::util::hex_cpu_set(cpu_set)?;

        let args = vec![
            container_id.to_string(),
            vf_id.to_string(),
            irq_masks.join(","),
            rps_mask,
        ];
        debug!(container_id, args = %args.join(" "), "setup sriov");
        let out = self
            .executor
            .run("sriov", &args, Some(std::path::Path::new(PIPEWORK_DIR)))
            .await?;
        if !out.success() {
            error!(container_id, stderr = %out.stderr, "sriov failed");
            return Err(NetworkError::CommandFailed {
                context: format!("sriov for container {container_id}"),
                stderr: out.stderr,
            });
        }
        Ok(())
    }

    /// Randomizes the MAC of the VF a departed sriov pod was using. The
    /// first two octets are preserved when the recorded MAC is
    /// well-formed.
    pub async fn reset_vf_mac(&self, network: &Network) -> Result<(), NetworkError> {
        let list = self
            .executor
            .run(
                "ls",
                &[format!(
                    "/sys/class/net/{}/device/virtfn{}/net",
                    DEFAULT_DEVICE, network.vf_id
                )],
                None,
            )
            .await?;
        if !list.success() {
            return Err(NetworkError::CommandFailed {
                context: format!("list vf device for vf {}", network.vf_id),
                stderr: list.stderr,
            });
        }
        let vf_device = list.stdout.trim().replace('\n', "");
        if vf_device.is_empty() {
            return Err(NetworkError::NoVfDevice(network.vf_id.clone()));
        }

        let mut address = [
            "14".to_string(),
            "05".to_string(),
            "00".to_string(),
            "00".to_string(),
            "00".to_string(),
            "00".to_string(),
        ];
        let parts: Vec<&str> = network.mac_address.split(':').collect();
        if parts.len() == 6 {
            address[0] = parts[0].to_string();
            address[1] = parts[1].to_string();
        }
        let mut rng = rand::thread_rng();
        for octet in address.iter_mut().skip(3) {
            *octet = format!("{:02x}", rng.gen_range(0..255));
        }

        let cmdline = format!(
            "ip link set dev {} address {}",
            vf_device,
            address.join(":")
        );
        debug!(vf_id = %network.vf_id, cmdline = %cmdline, "reset vf mac");
        let out = self.executor.shell(&cmdline).await?;
        if !out.success() {
            return Err(NetworkError::CommandFailed {
                context: format!("reset mac of {vf_device}"),
                stderr: out.stderr,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::exec::{ExecOutput, FakeExecutor};

    fn binder() -> (Arc<FakeExecutor>, NetworkBinder) {
        let exec = Arc::new(FakeExecutor::new());
        (exec.clone(), NetworkBinder::new(exec))
    }

    fn bridge_network() -> Network {
        Network {
            address: "172.16.213.190/16".to_string(),
            gateway: "172.16.213.2".to_string(),
            bridge: "br7".to_string(),
            mode: NetworkMode::Bridge,
            mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn bridge_pipework_argument_schema() {
        let (exec, binder) = binder();
        binder
            .setup_network("cid123", &bridge_network())
            .await
            .unwrap();
        assert_eq!(
            exec.cmdlines(),
            vec![
                "pipework br7 cid123 172.16.213.190/16@172.16.213.2 aa:bb:cc:dd:ee:ff"
                    .to_string()
            ]
        );
        assert_eq!(
            exec.calls()[0].dir.as_deref(),
            Some(std::path::Path::new("/usr/local/bin"))
        );
    }

    #[tokio::test]
    async fn sriov_pipework_argument_schema() {
        let (exec, binder) = binder();
        let network = Network {
            address: "10.1.2.3/24".to_string(),
            gateway: "10.1.2.1".to_string(),
            mode: NetworkMode::Sriov,
            mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
            vf_id: "3".to_string(),
            vlan_id: 9,
            ..Default::default()
        };
        binder.setup_network("cid9", &network).await.unwrap();
        assert_eq!(
            exec.cmdlines(),
            vec![
                "pipework eth1 --vf 3 cid9 10.1.2.3/24@10.1.2.1 aa:bb:cc:dd:ee:ff@9"
                    .to_string()
            ]
        );
    }

    #[tokio::test]
    async fn host_mode_is_rejected() {
        let (_, binder) = binder();
        let network = Network {
            mode: NetworkMode::Host,
            ..Default::default()
        };
        let err = binder.setup_network("cid", &network).await.unwrap_err();
        assert!(matches!(err, NetworkError::UnsupportedMode(NetworkMode::Host)));
    }

    #[tokio::test]
    async fn sriov_affinity_masks() {
        let (exec, binder) = binder();
        binder.setup_sriov("cid1", "2", "0,1,3").await.unwrap();
        // per-core masks 1, 2, 8; aggregate 0b1011 = b
        assert_eq!(exec.cmdlines(), vec!["sriov cid1 2 1,2,8 b".to_string()]);
    }

    #[tokio::test]
    async fn pipework_failure_surfaces_stderr() {
        let (exec, binder) = binder();
        exec.push_output(ExecOutput {
            code: 1,
            stderr: "no such bridge".to_string(),
            ..Default::default()
        });
        let err = binder
            .setup_network("cid", &bridge_network())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no such bridge"));
    }

    #[tokio::test]
    async fn vf_mac_reset_preserves_leading_octets() {
        let (exec, binder) = binder();
        exec.push_output(ExecOutput {
            code: 0,
            stdout: "eth7\n".to_string(),
            ..Default::default()
        });
        let network = Network {
            mode: NetworkMode::Sriov,
            mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
            vf_id: "2".to_string(),
            ..Default::default()
        };
        binder.reset_vf_mac(&network).await.unwrap();

        let calls = exec.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0].args,
            vec!["/sys/class/net/eth1/device/virtfn2/net".to_string()]
        );
        let cmdline = &calls[1].args[1];
        assert!(cmdline.starts_with("ip link set dev eth7 address aa:bb:"));
    }

    #[tokio::test]
    async fn vf_mac_reset_requires_a_device() {
        let (exec, binder) = binder();
        exec.push_output(ExecOutput {
            code: 0,
            stdout: "\n".to_string(),
            ..Default::default()
        });
        let network = Network {
            vf_id: "5".to_string(),
            ..Default::default()
        };
        let err = binder.reset_vf_mac(&network).await.unwrap_err();
        assert!(matches!(err, NetworkError::NoVfDevice(_)));
    }
}
