pub mod builtin;
pub mod config;
pub mod flow;
pub mod logger;
pub mod message;
pub mod module;
pub mod node;
pub mod queue;
pub mod runtime;
pub mod subscription;
pub mod telemetry;
pub mod watchdog;

pub use runtime::FlowsRuntime;
