use std::{collections::BTreeMap, sync::RwLock, time::Duration};

use cobble_process::{ServerId, ServerState};

use crate::{error::AgentError, supervisor::Supervisor};

/// Supervisors owned by the boundary layer, keyed by server id.
#[derive(Default)]
pub struct ServerRegistry {
    servers: RwLock<BTreeMap<ServerId, Supervisor>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a supervisor, replacing an idle one with the same id.
    pub fn insert(&self, supervisor: Supervisor) -> Result<(), AgentError> {
        let mut map = self.servers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = map.get(supervisor.id()) {
            let state = existing.status();
            if state != ServerState::Offline {
                return Err(AgentError::AlreadyRunning(state));
            }
        }
        map.insert(supervisor.id().clone(), supervisor);
        Ok(())
    }

    pub fn get(&self, id: &ServerId) -> Option<Supervisor> {
        self.servers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Only Offline servers can be removed.
    pub fn remove(&self, id: &ServerId) -> Result<Option<Supervisor>, AgentError> {
        let mut map = self.servers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = map.get(id) {
            let state = existing.status();
            if state != ServerState::Offline {
                return Err(AgentError::AlreadyRunning(state));
            }
        }
        Ok(map.remove(id))
    }

    pub fn list(&self) -> Vec<(ServerId, ServerState)> {
        self.servers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, s)| (id.clone(), s.status()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.servers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Supervisor> {
        self.servers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Stops every running server. Returns how many were asked to stop.
    pub async fn stop_all(&self, force: bool) -> usize {
        let running: Vec<Supervisor> = self
            .snapshot()
            .into_iter()
            .filter(|s| s.status() != ServerState::Offline)
            .collect();
        let stops = running.iter().map(|s| async move {
            if let Err(err) = s.stop(force).await {
                tracing::warn!(server_id = %s.id(), error = %err, "stop failed");
            }
        });
        futures_util::future::join_all(stops).await;
        running.len()
    }

    /// Graceful stop of everything, force-killing whatever outlives `timeout`.
    pub async fn shutdown_all(&self, timeout: Duration) {
        self.stop_all(false).await;
        let waits = self.snapshot().into_iter().map(|s| async move {
            if let Err(err) = s.wait_for_stop(timeout).await {
                tracing::warn!(server_id = %s.id(), error = %err, "server was killed during shutdown");
            }
        });
        futures_util::future::join_all(waits).await;
    }
}
