//! Watchable coordination store for alert rules and notifier configs.
//!
//! A thin capability trait over `etcd-client` so alert and notifier
//! managers can react to out-of-process config changes (another node
//! editing a rule through the admin API) without polling.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::core::error::Result;

/// One change observed on a watched key prefix.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Capability implemented by the coordination backend: key/value storage
/// plus prefix watches, used for alert rules and notifier configs.
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Subscribe to every Put/Delete under `prefix`. The returned receiver
    /// stays open for the coordination store's lifetime; callers reconcile
    /// their in-memory cache on each event.
    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>>;
}

/// `etcd-client`-backed coordination store.
pub struct EtcdCoordinationStore {
    client: Mutex<etcd_client::Client>,
}

impl EtcdCoordinationStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = etcd_client::Client::connect(endpoints, None).await?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }
}

#[async_trait::async_trait]
impl CoordinationStore for EtcdCoordinationStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.client.lock().await.put(key, value, None).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client.lock().await.delete(key, None).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let resp = self.client.lock().await.get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let opts = etcd_client::GetOptions::new().with_prefix();
        let resp = self.client.lock().await.get(prefix, Some(opts)).await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| (kv.key_str().unwrap_or_default().to_string(), kv.value().to_vec()))
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>> {
        let opts = etcd_client::WatchOptions::new().with_prefix();
        let (_watcher, mut stream) = self.client.lock().await.watch(prefix, Some(opts)).await?;
        let (tx, rx) = mpsc::channel(128);

        tokio::spawn(async move {
            while let Ok(Some(resp)) = stream.message().await {
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let key = kv.key_str().unwrap_or_default().to_string();
                    let sent = match event.event_type() {
                        etcd_client::EventType::Put => {
                            tx.send(WatchEvent::Put {
                                key,
                                value: kv.value().to_vec(),
                            })
                            .await
                        }
                        etcd_client::EventType::Delete => tx.send(WatchEvent::Delete { key }).await,
                    };
                    if sent.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// In-memory double used by alert/notifier manager unit tests.
#[derive(Default)]
pub struct InMemoryCoordinationStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    watchers: Mutex<Vec<(String, mpsc::Sender<WatchEvent>)>>,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn notify(&self, prefix_matches: impl Fn(&str) -> bool, event: WatchEvent) {
        let key = match &event {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => key.clone(),
        };
        if !prefix_matches(&key) {
            return;
        }
        let watchers = self.watchers.lock().await;
        for (prefix, tx) in watchers.iter() {
            if key.starts_with(prefix.as_str()) {
                let _ = tx.send(event.clone()).await;
            }
        }
    }
}

#[async_trait::async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.lock().await.insert(key.to_string(), value.clone());
        self.notify(
            |_| true,
            WatchEvent::Put {
                key: key.to_string(),
                value,
            },
        )
        .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        self.notify(|_| true, WatchEvent::Delete { key: key.to_string() }).await;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>> {
        let (tx, rx) = mpsc::channel(128);
        self.watchers.lock().await.push((prefix.to_string(), tx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_prefix_round_trips() {
        let store = InMemoryCoordinationStore::new();
        store.put("/monitor/alerts/rules/r1", b"rule-a".to_vec()).await.unwrap();
        store.put("/monitor/alerts/rules/r2", b"rule-b".to_vec()).await.unwrap();
        store.put("/monitor/notifiers/n1", b"notifier-a".to_vec()).await.unwrap();

        let rules = store.get_prefix("/monitor/alerts/rules").await.unwrap();
        assert_eq!(rules.len(), 2);
    }

    #[tokio::test]
    async fn watch_prefix_receives_put_and_delete() {
        let store = InMemoryCoordinationStore::new();
        let mut rx = store.watch_prefix("/monitor/alerts/rules").await.unwrap();

        store.put("/monitor/alerts/rules/r1", b"v1".to_vec()).await.unwrap();
        match rx.recv().await.unwrap() {
            WatchEvent::Put { key, .. } => assert_eq!(key, "/monitor/alerts/rules/r1"),
            _ => panic!("expected put"),
        }

        store.delete("/monitor/alerts/rules/r1").await.unwrap();
        match rx.recv().await.unwrap() {
            WatchEvent::Delete { key } => assert_eq!(key, "/monitor/alerts/rules/r1"),
            _ => panic!("expected delete"),
        }
    }
}
