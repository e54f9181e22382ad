//! Periodic heartbeat task for an embedded worker agent.
//!
//! An agent announces itself once, then re-announces on a fixed period
//! (default 30 s), refreshing status and current load. When the registry
//! has evicted the record — e.g. after a long pause — the loop
//! re-registers instead of failing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::AgentRegistry;
use crate::types::{AgentRecord, AgentStatus, RegistryError};

/// Heartbeat loop for one agent record.
pub struct HeartbeatLoop {
    registry: Arc<AgentRegistry>,
    record: AgentRecord,
    interval: Duration,
    load: Arc<AtomicU32>,
}

impl HeartbeatLoop {
    pub fn new(registry: Arc<AgentRegistry>, record: AgentRecord, interval: Duration) -> Self {
        Self {
            registry,
            record,
            interval,
            load: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Gauge the agent updates as it takes and finishes work; each beat
    /// reports its current value.
    pub fn load_gauge(&self) -> Arc<AtomicU32> {
        self.load.clone()
    }

    /// Register the agent and start beating in the background.
    pub async fn spawn(self) -> Result<HeartbeatHandle, RegistryError> {
        let mut record = self.record.clone();
        record.status = AgentStatus::Healthy;
        self.registry.register(record).await?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let registry = self.registry;
        let record = self.record;
        let interval = self.interval;
        let load = self.load;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let current_load = load.load(Ordering::Relaxed);
                match registry
                    .heartbeat(&record.agent_id, AgentStatus::Healthy, Some(current_load))
                    .await
                {
                    Ok(()) => {
                        debug!(agent_id = %record.agent_id, current_load, "heartbeat sent");
                    }
                    Err(RegistryError::NotFound { .. }) => {
                        // Evicted while we were away; announce again.
                        let mut fresh = record.clone();
                        fresh.status = AgentStatus::Healthy;
                        fresh.current_load = current_load.min(fresh.max_concurrent);
                        if let Err(err) = registry.register(fresh).await {
                            warn!(agent_id = %record.agent_id, error = %err,
                                  "re-registration after eviction failed");
                        }
                    }
                    Err(err) => {
                        warn!(agent_id = %record.agent_id, error = %err, "heartbeat failed");
                    }
                }
            }

            // Best-effort clean exit from the fleet.
            if let Err(err) = registry.deregister(&record.agent_id).await {
                warn!(agent_id = %record.agent_id, error = %err, "deregistration failed");
            }
        });

        Ok(HeartbeatHandle {
            shutdown: shutdown_tx,
            handle,
        })
    }
}

/// Handle to a running heartbeat loop.
pub struct HeartbeatHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stop beating and deregister the agent.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::ControlPlaneMetrics;
    use crate::registry::RegistryConfig;
    use crate::store::MemoryStore;
    use crate::types::AgentCapability;

    fn test_registry() -> Arc<AgentRegistry> {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        Arc::new(AgentRegistry::new(
            store,
            clock,
            RegistryConfig::default(),
            Arc::new(ControlPlaneMetrics::default()),
        ))
    }

    fn record(id: &str) -> AgentRecord {
        AgentRecord::new(id, id, format!("http://{id}:9000"))
            .with_capability(AgentCapability::new("echo", "echoes"))
    }

    #[tokio::test]
    async fn spawn_registers_and_stop_deregisters() {
        let registry = test_registry();
        let heartbeat =
            HeartbeatLoop::new(registry.clone(), record("hb1"), Duration::from_secs(30));

        let handle = heartbeat.spawn().await.unwrap();
        let live = registry.get("hb1").await.unwrap().unwrap();
        assert_eq!(live.status, AgentStatus::Healthy);

        handle.stop().await;
        assert!(registry.get("hb1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn beats_report_the_load_gauge() {
        let registry = test_registry();
        let heartbeat =
            HeartbeatLoop::new(registry.clone(), record("hb2"), Duration::from_millis(20));
        let gauge = heartbeat.load_gauge();
        let handle = heartbeat.spawn().await.unwrap();

        gauge.store(3, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(80)).await;

        let live = registry.get("hb2").await.unwrap().unwrap();
        assert_eq!(live.current_load, 3);
        handle.stop().await;
    }
}
