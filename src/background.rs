//! 空闲传输回收的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::IDLE_SWEEP_INTERVAL_SECS;
use crate::registry::TransmissionRegistry;

/// 启动空闲传输回收任务；`idle_ttl` 为 0 时不启动。
pub fn spawn_background_tasks(
    registry: Arc<TransmissionRegistry>,
    idle_ttl: Duration,
) -> Option<JoinHandle<()>> {
    if idle_ttl.is_zero() {
        return None;
    }

    let period = Duration::from_secs(IDLE_SWEEP_INTERVAL_SECS).min(idle_ttl);
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let reaped = registry.sweep_idle(idle_ttl).await;
            if reaped > 0 {
                let clients = registry.client_count().await;
                let transmissions = registry.transmission_count().await;
                debug!(reaped, clients, transmissions, "idle sweep finished");
            }
        }
    }))
}
