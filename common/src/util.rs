//! Small helpers shared by the scheduler and the node agent.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;

/// Converts a comma-separated cpuset string into the hex affinity mask the
/// sriov tool expects: the XOR of `1 << core` over all listed cores.
///
/// ```
/// assert_eq!(common::util::hex_cpu_set("0").unwrap(), "1");
/// assert_eq!(common::util::hex_cpu_set("0,1,2,3").unwrap(), "f");
/// ```
pub fn hex_cpu_set(cpu_set: &str) -> anyhow::Result<String> {
    if cpu_set.is_empty() {
        anyhow::bail!("cpu set must not be empty");
    }
    let mut value: u64 = 0;
    for core in cpu_set.split(',') {
        let core: u32 = core
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("bad core index {core:?}: {e}"))?;
        value ^= 1u64 << core;
    }
    Ok(format!("{value:x}"))
}

/// Runs `f` forever with `period` between iterations, logging and
/// swallowing panics so one bad iteration never kills the loop.
pub async fn forever<F, Fut>(mut f: F, period: Duration)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        if let Err(panic) = AssertUnwindSafe(f()).catch_unwind().await {
            let msg = panic_message(panic.as_ref());
            tracing::error!("recovered from panic: {msg}");
        }
        if !period.is_zero() {
            tokio::time::sleep(period).await;
        }
    }
}

pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_cpu_set_single_core() {
        assert_eq!(hex_cpu_set("4").unwrap(), "10");
    }

    #[test]
    fn hex_cpu_set_aggregate() {
        // cores 1 and 3: 0b1010
        assert_eq!(hex_cpu_set("1,3").unwrap(), "a");
    }

    #[test]
    fn hex_cpu_set_rejects_empty() {
        assert!(hex_cpu_set("").is_err());
        assert!(hex_cpu_set("a,b").is_err());
    }

    #[tokio::test]
    async fn forever_survives_panics() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let handle = tokio::spawn(forever(
            move || {
                let count = seen.clone();
                async move {
                    let n = count.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        panic!("first iteration blows up");
                    }
                }
            },
            Duration::from_millis(10),
        ));

        while count.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
    }
}
