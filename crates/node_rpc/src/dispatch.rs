use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{error, trace};

use crate::rpc::{Fault, RpcResult};

pub type MethodHandler = Arc<dyn Fn(&[Value]) -> RpcResult + Send + Sync>;

/// Process-local map from method name to handler.
///
/// Handlers run on whatever thread delivers the request. Panics are caught at
/// this boundary and turned into an internal-error fault.
#[derive(Default)]
pub struct DispatchTable {
    methods: DashMap<String, MethodHandler>,
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("methods", &self.method_names())
            .finish()
    }
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(&[Value]) -> RpcResult + Send + Sync + 'static,
    {
        self.methods.insert(method.into(), Arc::new(handler));
    }

    pub fn unregister(&self, method: &str) -> bool {
        self.methods.remove(method).is_some()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn call(&self, method: &str, args: &[Value]) -> RpcResult {
        // clone out so the shard lock is not held while the handler runs
        let Some(handler) = self.methods.get(method).map(|h| h.value().clone()) else {
            trace!(%method, "unknown method");
            return Err(Fault::method_not_found());
        };
        match catch_unwind(AssertUnwindSafe(|| handler(args))) {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic_message(&panic);
                error!(%method, %reason, "rpc handler panicked");
                Err(Fault::internal(format!("{method} failed: {reason}")))
            }
        }
    }
}

pub fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// -----------------------------------------------------------------------------
// Positional parameter access
// -----------------------------------------------------------------------------

/// Typed view over a handler's positional arguments; every accessor fails
/// with an invalid-params fault naming the method and position.
#[derive(Debug, Clone, Copy)]
pub struct Params<'a> {
    method: &'a str,
    args: &'a [Value],
}

impl<'a> Params<'a> {
    pub fn new(method: &'a str, args: &'a [Value]) -> Self {
        Self { method, args }
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn expect_at_least(&self, count: usize) -> Result<(), Fault> {
        if self.args.len() < count {
            return Err(Fault::invalid_params(format!(
                "{}: expected {count} arguments, got {}",
                self.method,
                self.args.len()
            )));
        }
        Ok(())
    }

    pub fn value(&self, index: usize) -> Result<&'a Value, Fault> {
        self.args
            .get(index)
            .ok_or_else(|| Fault::invalid_params(format!("{}: missing argument {index}", self.method)))
    }

    pub fn str(&self, index: usize) -> Result<&'a str, Fault> {
        self.value(index)?.as_str().ok_or_else(|| self.wrong_type(index, "string"))
    }

    pub fn u64(&self, index: usize) -> Result<u64, Fault> {
        self.value(index)?.as_u64().ok_or_else(|| self.wrong_type(index, "unsigned integer"))
    }

    pub fn i64(&self, index: usize) -> Result<i64, Fault> {
        self.value(index)?.as_i64().ok_or_else(|| self.wrong_type(index, "integer"))
    }

    pub fn bool(&self, index: usize) -> Result<bool, Fault> {
        self.value(index)?.as_bool().ok_or_else(|| self.wrong_type(index, "boolean"))
    }

    pub fn array(&self, index: usize) -> Result<&'a Vec<Value>, Fault> {
        self.value(index)?.as_array().ok_or_else(|| self.wrong_type(index, "array"))
    }

    pub fn opt_bool(&self, index: usize) -> Option<bool> {
        self.args.get(index).and_then(Value::as_bool)
    }

    fn wrong_type(&self, index: usize, expected: &str) -> Fault {
        Fault::invalid_params(format!("{}: argument {index} must be a {expected}", self.method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::codes;
    use serde_json::json;

    #[test]
    fn unknown_method_is_a_fault() {
        let table = DispatchTable::new();
        let err = table.call("nope", &[]).unwrap_err();
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "method not found");
    }

    #[test]
    fn registered_handler_receives_arguments() {
        let table = DispatchTable::new();
        table.register("add", |args| {
            let p = Params::new("add", args);
            Ok(json!(p.i64(0)? + p.i64(1)?))
        });
        assert_eq!(table.call("add", &[json!(2), json!(40)]), Ok(json!(42)));
        assert_eq!(table.call("add", &[json!(2)]).unwrap_err().code, codes::INVALID_PARAMS);
        assert_eq!(table.call("add", &[json!("x"), json!(1)]).unwrap_err().code, codes::INVALID_PARAMS);
    }

    #[test]
    fn handler_panic_becomes_internal_fault() {
        let table = DispatchTable::new();
        table.register("explode", |_| panic!("kaboom"));
        let err = table.call("explode", &[]).unwrap_err();
        assert_eq!(err.code, codes::INTERNAL_ERROR);
        assert!(err.message.contains("kaboom"));
    }

    #[test]
    fn unregister_and_names() {
        let table = DispatchTable::new();
        table.register("b", |_| Ok(Value::Null));
        table.register("a", |_| Ok(Value::Null));
        assert_eq!(table.method_names(), vec!["a".to_string(), "b".to_string()]);
        assert!(table.unregister("a"));
        assert!(!table.contains("a"));
    }
}
