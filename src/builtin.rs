//! Node types compiled into the worker.

use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::flow::NodeInfo;
use crate::logger::LogLevel;
use crate::message::Message;
use crate::module::ModuleCatalog;
use crate::node::{ErrorSource, Node, NodeContext, NodeError};
use crate::subscription::Subscription;

pub const PASSTHROUGH: &str = "passthrough";
pub const CATCH: &str = "catch";

pub fn register_builtin(catalog: &ModuleCatalog) {
    catalog.register_native(PASSTHROUGH, |ctx| Ok(Arc::new(Passthrough { ctx }) as Arc<dyn Node>));
    catalog.register_native(CATCH, |ctx| Ok(Arc::new(Catch::new(ctx)) as Arc<dyn Node>));
}

/// Forwards whatever arrives on input 0 to output 0.
#[derive(Debug)]
pub struct Passthrough {
    ctx: NodeContext,
}

impl Node for Passthrough {
    fn input(&self, _info: &NodeInfo, port: u32, message: Message) {
        if port != 0 {
            debug!(node_id = %self.ctx.node_id(), port, "ignoring input on unused port");
            return;
        }
        self.ctx.output(0, message);
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CatchSettings {
    /// Only errors from these nodes are caught.
    scope: Option<Vec<String>>,
    /// Only errors nobody else handled are caught.
    uncaught: bool,
    catch_config_errors: bool,
}

impl CatchSettings {
    fn subscription(&self) -> Subscription {
        Subscription::ErrorEvents {
            catch_config_errors: self.catch_config_errors,
            has_scope: self.scope.is_some(),
            ignore_caught: self.uncaught,
        }
    }

    fn covers(&self, node_id: &str) -> bool {
        self.scope.as_ref().is_none_or(|scope| scope.iter().any(|id| id == node_id))
    }
}

/// Subscribes to error events and emits each caught error on output 0.
#[derive(Debug)]
pub struct Catch {
    ctx: NodeContext,
    settings: Mutex<Option<CatchSettings>>,
}

impl Catch {
    pub fn new(ctx: NodeContext) -> Self {
        Self { ctx, settings: Mutex::new(None) }
    }

    fn settings(&self) -> Option<CatchSettings> {
        self.settings.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn parse(info: &NodeInfo) -> Result<CatchSettings, NodeError> {
        serde_json::from_value(info.declaration.clone()).map_err(|e| NodeError::Config(e.to_string()))
    }
}

impl Node for Catch {
    fn init(&self, info: &NodeInfo) -> bool {
        let settings = match Self::parse(info) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(node_id = %info.id, error = %e, "catch node rejected its declaration");
                return false;
            }
        };
        self.ctx.subscribe(&settings.subscription());
        *self.settings.lock().unwrap_or_else(|p| p.into_inner()) = Some(settings);
        true
    }

    fn stop(&self) {
        if let Some(settings) = self.settings() {
            self.ctx.unsubscribe(&settings.subscription());
        }
    }

    fn input(&self, _info: &NodeInfo, _port: u32, _message: Message) {}

    fn error_event(&self, source: &ErrorSource, level: LogLevel, message: &str) -> bool {
        let Some(settings) = self.settings() else {
            return false;
        };
        if !settings.covers(&source.node_id) {
            return false;
        }
        let mut out = Message::new(json!(message));
        out.set(
            "error",
            json!({
                "message": message,
                "source": { "id": source.node_id, "flow": source.flow_id },
            }),
        );
        out.set("level", json!(level.level_number()));
        self.ctx.output(0, out);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn info(declaration: serde_json::Value) -> NodeInfo {
        NodeInfo::from_declaration("f1", &declaration).unwrap()
    }

    #[test]
    fn builtins_are_registered_as_native() {
        let catalog = ModuleCatalog::new();
        register_builtin(&catalog);
        assert!(catalog.native_factory(PASSTHROUGH).is_some());
        assert!(catalog.native_factory(CATCH).is_some());
        assert_eq!(catalog.resolve(CATCH).unwrap().package, "builtin");
    }

    #[test]
    fn catch_settings_follow_declaration() {
        let settings = Catch::parse(&info(json!({
            "id": "c1",
            "type": "catch",
            "scope": ["n1", "n2"],
            "uncaught": true,
        })))
        .unwrap();
        assert!(settings.covers("n2"));
        assert!(!settings.covers("n3"));
        assert_eq!(
            settings.subscription(),
            Subscription::ErrorEvents { catch_config_errors: false, has_scope: true, ignore_caught: true }
        );

        let unscoped = Catch::parse(&info(json!({"id": "c2", "type": "catch"}))).unwrap();
        assert!(unscoped.covers("anything"));
    }

    #[test]
    fn catch_rejects_malformed_scope() {
        let node = Catch::new(NodeContext::detached("c1", CATCH, "f1"));
        assert!(!node.init(&info(json!({"id": "c1", "type": "catch", "scope": 5}))));
        assert!(!node.error_event(&ErrorSource::new("n1", "f1"), LogLevel::Error, "boom"));
    }

    #[test]
    fn catch_handles_only_scoped_sources() {
        let node = Catch::new(NodeContext::detached("c1", CATCH, "f1"));
        assert!(node.init(&info(json!({"id": "c1", "type": "catch", "scope": ["n1"]}))));
        assert!(node.error_event(&ErrorSource::new("n1", "f1"), LogLevel::Error, "boom"));
        assert!(!node.error_event(&ErrorSource::new("n2", "f1"), LogLevel::Error, "boom"));
    }
}
