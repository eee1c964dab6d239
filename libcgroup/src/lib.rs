//! Per-container resource plumbing outside the runtime's own cgroup
//! handling: blkio throttles, xfs project disk quotas and the per-pod
//! lxcfs instances.

pub mod blkio;
pub mod lxcfs;
pub mod quota;

pub use blkio::BlkioGroup;
pub use quota::DiskQuota;
