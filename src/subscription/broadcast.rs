use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use node_rpc::dispatch::panic_message;
use serde_json::Value;
use tracing::{error, trace};

use crate::logger::LogLevel;
use crate::module::NodeManager;
use crate::node::{ErrorSource, Node};

use super::SubscriptionRegistry;

/// Fans events out to subscribed nodes. Listings are snapshotted first and
/// handlers run without any registry lock held.
pub struct EventBroadcaster {
    subscriptions: Arc<SubscriptionRegistry>,
    nodes: Arc<NodeManager>,
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroadcaster").finish_non_exhaustive()
    }
}

impl EventBroadcaster {
    pub fn new(subscriptions: Arc<SubscriptionRegistry>, nodes: Arc<NodeManager>) -> Self {
        Self { subscriptions, nodes }
    }

    /// Calls `deliver` for every loaded node in `node_ids`, returning how many
    /// were reached. A panicking handler is logged and skipped.
    fn fan_out<R>(&self, event: &str, node_ids: &[String], deliver: impl Fn(&dyn Node) -> R) -> Vec<(String, R)> {
        let mut results = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            if let Some(result) = self.deliver_one(event, node_id, &deliver) {
                results.push((node_id.clone(), result));
            }
        }
        results
    }

    fn deliver_one<R>(&self, event: &str, node_id: &str, deliver: &impl Fn(&dyn Node) -> R) -> Option<R> {
        let Some(node) = self.nodes.get_node(node_id) else {
            trace!(%node_id, event, "subscriber not loaded, skipping");
            return None;
        };
        match catch_unwind(AssertUnwindSafe(|| deliver(&*node))) {
            Ok(result) => Some(result),
            Err(panic) => {
                error!(%node_id, event, reason = %panic_message(&panic), "event handler panicked");
                None
            }
        }
    }

    pub fn variable_event(&self, source: &str, peer_id: u64, channel: i32, variable: &str, value: &Value) -> usize {
        let ids = self.subscriptions.peer_subscribers(peer_id, channel, variable);
        self.fan_out("variableEvent", &ids, |node| {
            node.variable_event(source, peer_id, channel, variable, value)
        })
        .len()
    }

    pub fn flow_variable_event(&self, flow_id: &str, variable: &str, value: &Value) -> usize {
        let ids = self.subscriptions.flow_subscribers(flow_id);
        self.fan_out("flowVariableEvent", &ids, |node| node.flow_variable_event(flow_id, variable, value))
            .len()
    }

    pub fn global_variable_event(&self, variable: &str, value: &Value) -> usize {
        let ids = self.subscriptions.global_subscribers();
        self.fan_out("globalVariableEvent", &ids, |node| node.global_variable_event(variable, value))
            .len()
    }

    pub fn homegear_event(&self, event_type: &str, data: &Value) -> usize {
        let ids = self.subscriptions.homegear_subscribers();
        self.fan_out("homegearEvent", &ids, |node| node.homegear_event(event_type, data))
            .len()
    }

    pub fn status(&self, node_id: &str, status: &Value) -> usize {
        let ids = self.subscriptions.status_subscribers();
        self.fan_out("statusEvent", &ids, |node| node.status_event(node_id, status))
            .len()
    }

    /// Offer an error to eligible subscribers in order. Returns whether any
    /// handler reported it handled.
    pub fn error(&self, source: &ErrorSource, level: LogLevel, message: &str) -> bool {
        let config_error = source.is_config_node();
        let mut handled = false;
        for subscriber in self.subscriptions.error_subscribers() {
            if subscriber.node_id == source.node_id {
                continue;
            }
            let eligible = if config_error {
                subscriber.catch_config_errors
            } else {
                subscriber.flow_id == source.flow_id
            };
            if !eligible {
                continue;
            }
            if handled && !subscriber.has_scope && subscriber.ignore_caught {
                trace!(node_id = %subscriber.node_id, "error already caught, skipping");
                continue;
            }
            let result = self.deliver_one("errorEvent", &subscriber.node_id, &|node: &dyn Node| {
                node.error_event(source, level, message)
            });
            if result == Some(true) {
                handled = true;
            }
        }
        handled
    }
}
