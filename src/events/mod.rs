//! Engine event fan-out.
//!
//! Notifications are a broadcast stream of [`AssetEvent`] values. The
//! question "should this asset be kept and refreshed" is a separate,
//! explicit hook: registered keep policies are consulted before an asset
//! is considered for update or garbage collection.

use std::sync::RwLock;

use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum AssetEvent {
    /// The source dictionary was reingested.
    SourcesUpdated,
    /// A new built-in source appeared in the dictionary.
    BuiltinSourceAdded { key: String },
    /// Cached content for `key` was written or removed.
    AssetUpdated { key: String },
    /// A refresh attempt for `key` failed on every candidate URL.
    UpdateFailed { key: String, error: String },
    /// An update cycle finished; `updated` lists the keys that changed.
    CycleCompleted { updated: Vec<String> },
}

type KeepPolicy = Box<dyn Fn(&str) -> bool + Send + Sync>;

pub struct EventBus {
    tx: broadcast::Sender<AssetEvent>,
    keep_policies: RwLock<Vec<KeepPolicy>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            tx,
            keep_policies: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AssetEvent> {
        self.tx.subscribe()
    }

    /// Send without receivers is not an error.
    pub fn emit(&self, event: AssetEvent) {
        let _ = self.tx.send(event);
    }

    /// Register a policy deciding whether an asset stays in rotation.
    pub fn add_keep_policy<F>(&self, policy: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        let mut policies = match self.keep_policies.write() {
            Ok(policies) => policies,
            Err(poisoned) => poisoned.into_inner(),
        };
        policies.push(Box::new(policy));
    }

    /// True when any registered policy claims the asset.
    pub fn should_keep(&self, key: &str) -> bool {
        let policies = match self.keep_policies.read() {
            Ok(policies) => policies,
            Err(poisoned) => poisoned.into_inner(),
        };
        policies.iter().any(|policy| policy(key))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(AssetEvent::SourcesUpdated);
        bus.emit(AssetEvent::AssetUpdated { key: "easylist".into() });

        assert!(matches!(rx.recv().await.unwrap(), AssetEvent::SourcesUpdated));
        match rx.recv().await.unwrap() {
            AssetEvent::AssetUpdated { key } => assert_eq!(key, "easylist"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(AssetEvent::SourcesUpdated);
    }

    #[test]
    fn no_policies_means_nothing_kept() {
        let bus = EventBus::new();
        assert!(!bus.should_keep("easylist"));
    }

    #[test]
    fn any_policy_claims_the_asset() {
        let bus = EventBus::new();
        bus.add_keep_policy(|_| false);
        bus.add_keep_policy(|key| key == "easylist");
        assert!(bus.should_keep("easylist"));
        assert!(!bus.should_keep("other"));
    }
}
