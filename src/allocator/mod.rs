//! Storage node allocator: assigns each service to the least-loaded online
//! storage node and tracks assignments so repeat lookups are stable.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::core::error::{MonitorError, Result};

/// A candidate storage node as reported by the service registry.
#[derive(Debug, Clone)]
pub struct RegisteredNode {
    pub node_id: String,
    pub address: String,
    pub online: bool,
    pub service_count: u32,
}

/// Capability for discovering candidate nodes. Backed by the coordination
/// store in production, by a fixed list in tests.
#[async_trait::async_trait]
pub trait NodeRegistry: Send + Sync {
    async fn list_nodes(&self, service_name: &str) -> Result<Vec<RegisteredNode>>;

    /// Record a node's liveness for `service_name`, returning when that
    /// record expires absent a further heartbeat.
    async fn heartbeat(
        &self,
        service_name: &str,
        node_id: &str,
        address: &str,
        service_count: u32,
    ) -> Result<DateTime<Utc>>;
}

/// Heartbeat record a node periodically writes to the coordination store
/// under `<prefix>/<service_name>/<node_id>`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeHeartbeat {
    pub address: String,
    pub service_count: u32,
    pub last_seen: DateTime<Utc>,
}

/// `NodeRegistry` backed by the coordination store: a node is considered
/// online if its heartbeat was written within `heartbeat_ttl`.
pub struct CoordinationNodeRegistry {
    coordination: Arc<dyn crate::coordination::CoordinationStore>,
    prefix: String,
    heartbeat_ttl: chrono::Duration,
}

impl CoordinationNodeRegistry {
    pub fn new(
        coordination: Arc<dyn crate::coordination::CoordinationStore>,
        prefix: impl Into<String>,
        heartbeat_ttl: chrono::Duration,
    ) -> Self {
        Self {
            coordination,
            prefix: prefix.into(),
            heartbeat_ttl,
        }
    }

}

#[async_trait::async_trait]
impl NodeRegistry for CoordinationNodeRegistry {
    async fn heartbeat(
        &self,
        service_name: &str,
        node_id: &str,
        address: &str,
        service_count: u32,
    ) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        let key = format!("{}/{}/{}", self.prefix, service_name, node_id);
        let heartbeat = NodeHeartbeat {
            address: address.to_string(),
            service_count,
            last_seen: now,
        };
        let value = serde_json::to_vec(&heartbeat).map_err(|e| MonitorError::internal("allocator", e.to_string()))?;
        self.coordination.put(&key, value).await?;
        Ok(now + self.heartbeat_ttl)
    }

    async fn list_nodes(&self, service_name: &str) -> Result<Vec<RegisteredNode>> {
        let prefix = format!("{}/{}/", self.prefix, service_name);
        let entries = self.coordination.get_prefix(&prefix).await?;
        let now = Utc::now();

        let mut nodes = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let node_id = key.rsplit('/').next().unwrap_or(&key).to_string();
            let heartbeat: NodeHeartbeat = match serde_json::from_slice(&value) {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(key, error = %e, "failed to decode node heartbeat, skipping");
                    continue;
                }
            };
            let online = now - heartbeat.last_seen < self.heartbeat_ttl;
            nodes.push(RegisteredNode {
                node_id,
                address: heartbeat.address,
                online,
                service_count: heartbeat.service_count,
            });
        }
        Ok(nodes)
    }
}

/// Current assignment of a service to a storage node.
#[derive(Debug, Clone)]
pub struct NodeAllocation {
    pub service_name: String,
    pub node_id: String,
    pub node_address: String,
    pub assigned_at: DateTime<Utc>,
    pub last_checked_at: DateTime<Utc>,
}

/// Assigns services to storage nodes and keeps the assignment table honest
/// as nodes go offline.
///
/// `counts` is this allocator's own view of how many services it has put on
/// each node: in-memory only, incremented on assignment and decremented on
/// eviction, never persisted or read from a node's self-reported heartbeat.
/// It is advisory and may drift across restarts; that's fine, it only needs
/// to be good enough to prefer the least-loaded node.
pub struct NodeAllocator {
    registry: Arc<dyn NodeRegistry>,
    allocations: Mutex<HashMap<String, NodeAllocation>>,
    counts: Mutex<HashMap<String, u32>>,
}

impl NodeAllocator {
    pub fn new(registry: Arc<dyn NodeRegistry>) -> Self {
        Self {
            registry,
            allocations: Mutex::new(HashMap::new()),
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Return the storage node assigned to `service_name`, assigning one if
    /// there isn't a valid assignment yet, or `force_reassign` is set.
    ///
    /// Node selection picks the lowest in-memory `counts` entry among online
    /// candidates (defaulting to 0 for a node this allocator has never
    /// assigned to), breaking ties lexicographically by `node_id` so repeated
    /// calls with an identical candidate set are deterministic.
    pub async fn get_storage_node(&self, service_name: &str, force_reassign: bool) -> Result<NodeAllocation> {
        let mut allocations = self.allocations.lock().await;

        if !force_reassign {
            if let Some(existing) = allocations.get(service_name) {
                let nodes = self.registry.list_nodes(service_name).await?;
                if nodes.iter().any(|n| n.node_id == existing.node_id && n.online) {
                    return Ok(existing.clone());
                }
            }
        }

        let nodes = self.registry.list_nodes(service_name).await?;
        let candidates: Vec<&RegisteredNode> = nodes.iter().filter(|n| n.online).collect();

        let mut counts = self.counts.lock().await;
        let mut sorted = candidates;
        sorted.sort_by(|a, b| {
            let count_a = counts.get(&a.node_id).copied().unwrap_or(0);
            let count_b = counts.get(&b.node_id).copied().unwrap_or(0);
            count_a.cmp(&count_b).then_with(|| a.node_id.cmp(&b.node_id))
        });

        let chosen = sorted
            .first()
            .ok_or_else(|| MonitorError::NoCandidateNode {
                service: service_name.to_string(),
            })?;

        let now = Utc::now();
        let allocation = NodeAllocation {
            service_name: service_name.to_string(),
            node_id: chosen.node_id.clone(),
            node_address: chosen.address.clone(),
            assigned_at: now,
            last_checked_at: now,
        };

        if let Some(previous) = allocations.insert(service_name.to_string(), allocation.clone()) {
            if previous.node_id != allocation.node_id {
                decrement(&mut counts, &previous.node_id);
                *counts.entry(allocation.node_id.clone()).or_insert(0) += 1;
            }
        } else {
            *counts.entry(allocation.node_id.clone()).or_insert(0) += 1;
        }

        Ok(allocation)
    }

    /// Forward a node's heartbeat to the underlying registry.
    pub async fn heartbeat(
        &self,
        service_name: &str,
        node_id: &str,
        address: &str,
        service_count: u32,
    ) -> Result<DateTime<Utc>> {
        self.registry.heartbeat(service_name, node_id, address, service_count).await
    }

    /// Drop every assignment whose node is no longer reported online.
    /// Idempotent: running it repeatedly with no state change is a no-op.
    pub async fn cleanup_offline_allocations(&self) -> Result<u64> {
        let mut allocations = self.allocations.lock().await;
        let mut counts = self.counts.lock().await;
        let mut removed = 0u64;
        let service_names: Vec<String> = allocations.keys().cloned().collect();

        for service_name in service_names {
            let nodes = self.registry.list_nodes(&service_name).await?;
            let still_online = allocations
                .get(&service_name)
                .map(|a| nodes.iter().any(|n| n.node_id == a.node_id && n.online))
                .unwrap_or(false);

            if !still_online {
                if let Some(evicted) = allocations.remove(&service_name) {
                    decrement(&mut counts, &evicted.node_id);
                }
                removed += 1;
            }
        }

        Ok(removed)
    }
}

fn decrement(counts: &mut HashMap<String, u32>, node_id: &str) {
    if let Some(count) = counts.get_mut(node_id) {
        *count = count.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::RwLock as StdRwLock;

    struct FixedRegistry {
        nodes: StdRwLock<Vec<RegisteredNode>>,
    }

    #[async_trait::async_trait]
    impl NodeRegistry for FixedRegistry {
        async fn list_nodes(&self, _service_name: &str) -> Result<Vec<RegisteredNode>> {
            Ok(self.nodes.read().unwrap().clone())
        }

        async fn heartbeat(
            &self,
            _service_name: &str,
            _node_id: &str,
            _address: &str,
            _service_count: u32,
        ) -> Result<DateTime<Utc>> {
            Ok(Utc::now())
        }
    }

    fn node(id: &str, online: bool) -> RegisteredNode {
        RegisteredNode {
            node_id: id.to_string(),
            address: format!("{id}:9000"),
            online,
            // Heartbeat-reported count is display-only; selection uses the
            // allocator's own in-memory counter, never this field.
            service_count: 0,
        }
    }

    #[tokio::test]
    async fn picks_lowest_service_count() {
        let registry = Arc::new(FixedRegistry {
            nodes: StdRwLock::new(vec![node("a", true), node("b", true)]),
        });
        let allocator = NodeAllocator::new(registry);

        // Load "a" up with two prior assignments so its in-memory count is
        // higher than "b"'s before the tie-breaking assignment under test.
        allocator.get_storage_node("svc-1", false).await.unwrap();
        allocator.get_storage_node("svc-2", false).await.unwrap();
        assert_eq!(
            allocator.get_storage_node("svc-1", false).await.unwrap().node_id,
            "a"
        );

        let allocation = allocator.get_storage_node("aio", false).await.unwrap();
        assert_eq!(allocation.node_id, "b");
    }

    #[tokio::test]
    async fn increments_on_assign_and_decrements_on_eviction() {
        let registry = Arc::new(FixedRegistry {
            nodes: StdRwLock::new(vec![node("a", true), node("b", true)]),
        });
        let allocator = NodeAllocator::new(registry.clone());

        // Both services land on "a" first (lexicographic tie-break), raising
        // its count to 2 so the third assignment prefers "b".
        let first = allocator.get_storage_node("svc-1", false).await.unwrap();
        let second = allocator.get_storage_node("svc-2", false).await.unwrap();
        assert_eq!(first.node_id, "a");
        assert_eq!(second.node_id, "a");

        let third = allocator.get_storage_node("svc-3", false).await.unwrap();
        assert_eq!(third.node_id, "b");

        // Evicting svc-1's allocation frees up a slot on "a".
        registry.nodes.write().unwrap()[0].online = false;
        allocator.cleanup_offline_allocations().await.unwrap();
        registry.nodes.write().unwrap()[0].online = true;

        let fourth = allocator.get_storage_node("svc-4", false).await.unwrap();
        assert_eq!(fourth.node_id, "a");
    }

    #[tokio::test]
    async fn ties_break_lexicographically() {
        let registry = Arc::new(FixedRegistry {
            nodes: StdRwLock::new(vec![node("zzz", true), node("aaa", true)]),
        });
        let allocator = NodeAllocator::new(registry);

        let allocation = allocator.get_storage_node("aio", false).await.unwrap();
        assert_eq!(allocation.node_id, "aaa");
    }

    #[tokio::test]
    async fn no_online_candidates_errors() {
        let registry = Arc::new(FixedRegistry {
            nodes: StdRwLock::new(vec![node("a", false)]),
        });
        let allocator = NodeAllocator::new(registry);

        let err = allocator.get_storage_node("aio", false).await.unwrap_err();
        assert!(matches!(err, MonitorError::NoCandidateNode { .. }));
    }

    #[tokio::test]
    async fn reassigns_when_node_goes_offline() {
        let registry = Arc::new(FixedRegistry {
            nodes: StdRwLock::new(vec![node("a", true)]),
        });
        let allocator = NodeAllocator::new(registry.clone());

        let first = allocator.get_storage_node("aio", false).await.unwrap();
        assert_eq!(first.node_id, "a");

        registry.nodes.write().unwrap()[0].online = false;
        registry.nodes.write().unwrap().push(node("b", true));

        let second = allocator.get_storage_node("aio", false).await.unwrap();
        assert_eq!(second.node_id, "b");
    }

    #[tokio::test]
    async fn cleanup_removes_offline_allocations() {
        let registry = Arc::new(FixedRegistry {
            nodes: StdRwLock::new(vec![node("a", true)]),
        });
        let allocator = NodeAllocator::new(registry.clone());
        allocator.get_storage_node("aio", false).await.unwrap();

        registry.nodes.write().unwrap()[0].online = false;
        let removed = allocator.cleanup_offline_allocations().await.unwrap();
        assert_eq!(removed, 1);
    }
}
