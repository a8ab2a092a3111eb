pub mod broadcast;

use std::collections::BTreeSet;
use std::sync::Mutex;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

pub use broadcast::EventBroadcaster;

/// An event source a node can register for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Subscription {
    /// Changes of one device variable.
    Peer { peer_id: u64, channel: i32, variable: String },
    /// Variable changes of one flow.
    Flow { flow_id: String },
    Global,
    HomegearEvents,
    StatusEvents,
    #[serde(rename_all = "camelCase")]
    ErrorEvents {
        catch_config_errors: bool,
        has_scope: bool,
        ignore_caught: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey {
    pub peer_id: u64,
    pub channel: i32,
    pub variable: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorSubscriber {
    pub node_id: String,
    pub flow_id: String,
    pub catch_config_errors: bool,
    pub has_scope: bool,
    pub ignore_caught: bool,
}

/// Which nodes listen to which event sources. Safe under concurrent
/// subscribe/unsubscribe and broadcast; listings are snapshots.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    peers: DashMap<PeerKey, BTreeSet<String>>,
    flows: DashMap<String, BTreeSet<String>>,
    global: Mutex<BTreeSet<String>>,
    homegear: Mutex<BTreeSet<String>>,
    status: Mutex<BTreeSet<String>>,
    // scoped subscribers first, then in subscription order
    errors: Mutex<Vec<ErrorSubscriber>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `flow_id` is the subscribing node's own flow; error subscribers need it
    /// to match errors from their flow.
    pub fn subscribe(&self, node_id: &str, flow_id: &str, subscription: &Subscription) {
        match subscription {
            Subscription::Peer { peer_id, channel, variable } => {
                let key = PeerKey { peer_id: *peer_id, channel: *channel, variable: variable.clone() };
                self.peers.entry(key).or_default().insert(node_id.to_string());
            }
            Subscription::Flow { flow_id } => {
                self.flows.entry(flow_id.clone()).or_default().insert(node_id.to_string());
            }
            Subscription::Global => {
                lock(&self.global).insert(node_id.to_string());
            }
            Subscription::HomegearEvents => {
                lock(&self.homegear).insert(node_id.to_string());
            }
            Subscription::StatusEvents => {
                lock(&self.status).insert(node_id.to_string());
            }
            Subscription::ErrorEvents { catch_config_errors, has_scope, ignore_caught } => {
                let mut errors = lock(&self.errors);
                errors.retain(|s| s.node_id != node_id);
                errors.push(ErrorSubscriber {
                    node_id: node_id.to_string(),
                    flow_id: flow_id.to_string(),
                    catch_config_errors: *catch_config_errors,
                    has_scope: *has_scope,
                    ignore_caught: *ignore_caught,
                });
                // stable: keeps subscription order within each group
                errors.sort_by_key(|s| !s.has_scope);
            }
        }
    }

    pub fn unsubscribe(&self, node_id: &str, subscription: &Subscription) {
        match subscription {
            Subscription::Peer { peer_id, channel, variable } => {
                let key = PeerKey { peer_id: *peer_id, channel: *channel, variable: variable.clone() };
                if let Some(mut set) = self.peers.get_mut(&key) {
                    set.remove(node_id);
                }
                self.peers.remove_if(&key, |_, set| set.is_empty());
            }
            Subscription::Flow { flow_id } => {
                if let Some(mut set) = self.flows.get_mut(flow_id) {
                    set.remove(node_id);
                }
                self.flows.remove_if(flow_id, |_, set| set.is_empty());
            }
            Subscription::Global => {
                lock(&self.global).remove(node_id);
            }
            Subscription::HomegearEvents => {
                lock(&self.homegear).remove(node_id);
            }
            Subscription::StatusEvents => {
                lock(&self.status).remove(node_id);
            }
            Subscription::ErrorEvents { .. } => {
                lock(&self.errors).retain(|s| s.node_id != node_id);
            }
        }
    }

    pub fn is_subscribed(&self, node_id: &str, subscription: &Subscription) -> bool {
        match subscription {
            Subscription::Peer { peer_id, channel, variable } => {
                self.peer_subscribers(*peer_id, *channel, variable).iter().any(|n| n == node_id)
            }
            Subscription::Flow { flow_id } => self.flows.get(flow_id).is_some_and(|set| set.contains(node_id)),
            Subscription::Global => lock(&self.global).contains(node_id),
            Subscription::HomegearEvents => lock(&self.homegear).contains(node_id),
            Subscription::StatusEvents => lock(&self.status).contains(node_id),
            Subscription::ErrorEvents { .. } => lock(&self.errors).iter().any(|s| s.node_id == node_id),
        }
    }

    /// Drop every subscription a node holds.
    pub fn unsubscribe_all(&self, node_id: &str) {
        self.peers.retain(|_, set| {
            set.remove(node_id);
            !set.is_empty()
        });
        self.flows.retain(|_, set| {
            set.remove(node_id);
            !set.is_empty()
        });
        lock(&self.global).remove(node_id);
        lock(&self.homegear).remove(node_id);
        lock(&self.status).remove(node_id);
        lock(&self.errors).retain(|s| s.node_id != node_id);
    }

    pub fn clear(&self) {
        self.peers.clear();
        self.flows.clear();
        lock(&self.global).clear();
        lock(&self.homegear).clear();
        lock(&self.status).clear();
        lock(&self.errors).clear();
    }

    pub fn peer_subscribers(&self, peer_id: u64, channel: i32, variable: &str) -> Vec<String> {
        let key = PeerKey { peer_id, channel, variable: variable.to_string() };
        self.peers.get(&key).map(|set| set.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn flow_subscribers(&self, flow_id: &str) -> Vec<String> {
        self.flows.get(flow_id).map(|set| set.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn global_subscribers(&self) -> Vec<String> {
        lock(&self.global).iter().cloned().collect()
    }

    pub fn homegear_subscribers(&self) -> Vec<String> {
        lock(&self.homegear).iter().cloned().collect()
    }

    pub fn status_subscribers(&self) -> Vec<String> {
        lock(&self.status).iter().cloned().collect()
    }

    pub fn error_subscribers(&self) -> Vec<ErrorSubscriber> {
        lock(&self.errors).clone()
    }
}
