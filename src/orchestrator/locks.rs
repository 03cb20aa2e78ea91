//! Per-agent serialization of in-process operations.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of one async mutex per agent id.
///
/// Operations on different agents never contend; operations on the same
/// agent run one at a time. Cross-process ordering is left to the store's
/// compare-and-set updates.
#[derive(Debug, Clone, Default)]
pub struct AgentLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl AgentLocks {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `agent_id`.
    pub async fn lock(&self, agent_id: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().await;
            Arc::clone(
                map.entry(agent_id.to_owned())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        slot.lock_owned().await
    }

    /// Drop the slot for `agent_id` if nobody holds or awaits it.
    pub async fn forget(&self, agent_id: &str) {
        let mut map = self.inner.lock().await;
        if map
            .get(agent_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            map.remove(agent_id);
        }
    }
}
