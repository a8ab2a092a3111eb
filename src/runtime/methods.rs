use std::sync::Weak;

use node_rpc::{DispatchTable, Fault, Method, Params, RpcResult};
use serde_json::{Value, json};
use tracing::info;

use crate::logger::LogLevel;
use crate::message::Message;

use super::FlowsRuntime;

/// Register every coordinator-facing method on `table`.
pub(super) fn register(table: &DispatchTable, runtime: &Weak<FlowsRuntime>) {
    bind(table, runtime, Method::StartFlow, |rt, p| {
        p.expect_at_least(2)?;
        let declaration = p.value(0)?;
        let nodes = p.array(1)?;
        rt.flows().start_flow(declaration, nodes).map(|n| json!(n)).map_err(|e| e.to_fault())
    });
    bind(table, runtime, Method::StartNodes, |rt, _| Ok(json!(rt.flows().start_nodes())));
    bind(table, runtime, Method::ConfigNodesStarted, |rt, _| Ok(json!(rt.flows().config_nodes_started())));
    bind(table, runtime, Method::StartUpComplete, |rt, _| {
        let flows = rt.flows().start_up_complete();
        rt.finish_startup();
        Ok(json!(flows))
    });
    bind(table, runtime, Method::StopNodes, |rt, _| Ok(json!(rt.flows().stop_nodes())));
    bind(table, runtime, Method::WaitForNodesStopped, |rt, _| Ok(json!(rt.flows().wait_for_nodes_stopped())));
    bind(table, runtime, Method::StopFlow, |rt, p| {
        let flow_id = p.str(0)?;
        rt.flows().stop_flow(flow_id).map(|()| json!(true)).map_err(|e| e.to_fault())
    });
    bind(table, runtime, Method::FlowCount, |rt, _| Ok(json!(rt.flows().flow_count())));
    bind(table, runtime, Method::Lifetick, |_, _| Ok(json!(true)));
    bind(table, runtime, Method::Shutdown, |rt, _| {
        info!("shutdown requested by coordinator");
        rt.request_shutdown();
        Ok(json!(true))
    });

    bind(table, runtime, Method::NodeInput, |rt, p| {
        p.expect_at_least(3)?;
        let node_id = p.str(0)?;
        let port = port(&p, 1)?;
        let message = Message::from_value(p.value(2)?.clone());
        let synchronous = p.opt_bool(3).unwrap_or(false);
        if rt.flows().node_input(node_id, port, message, synchronous) {
            Ok(json!(true))
        } else {
            Err(Fault::unknown_node(node_id))
        }
    });
    bind(table, runtime, Method::InvokeNodeMethod, |rt, p| {
        p.expect_at_least(3)?;
        let node_id = p.str(0)?;
        let method = p.str(1)?;
        let args = p.array(2)?;
        let node = rt.nodes().get_node(node_id).ok_or_else(|| Fault::unknown_node(node_id))?;
        node.invoke_local(method, args)
    });
    bind(table, runtime, Method::SetFixedInputValue, |rt, p| {
        p.expect_at_least(3)?;
        rt.flows().set_fixed_input(p.str(0)?, port(&p, 1)?, p.value(2)?.clone());
        Ok(json!(true))
    });
    bind(table, runtime, Method::RemoveFixedInputValue, |rt, p| {
        p.expect_at_least(2)?;
        Ok(json!(rt.flows().remove_fixed_input(p.str(0)?, port(&p, 1)?)))
    });

    bind(table, runtime, Method::BroadcastEvent, |rt, p| {
        p.expect_at_least(5)?;
        let source = p.str(0)?;
        let peer_id = p.u64(1)?;
        let channel = channel(&p, 2)?;
        let variables = p.array(3)?;
        let values = p.array(4)?;
        if variables.len() != values.len() {
            return Err(Fault::invalid_params("variables and values differ in length"));
        }
        let mut delivered = 0;
        for (variable, value) in variables.iter().zip(values) {
            let Some(variable) = variable.as_str() else {
                return Err(Fault::invalid_params("variable names must be strings"));
            };
            delivered += rt.broadcaster().variable_event(source, peer_id, channel, variable, value);
        }
        Ok(json!(delivered))
    });
    bind(table, runtime, Method::BroadcastFlowVariableEvent, |rt, p| {
        p.expect_at_least(3)?;
        Ok(json!(rt.broadcaster().flow_variable_event(p.str(0)?, p.str(1)?, p.value(2)?)))
    });
    bind(table, runtime, Method::BroadcastGlobalVariableEvent, |rt, p| {
        p.expect_at_least(2)?;
        Ok(json!(rt.broadcaster().global_variable_event(p.str(0)?, p.value(1)?)))
    });
    bind(table, runtime, Method::BroadcastHomegearEvent, |rt, p| {
        p.expect_at_least(2)?;
        Ok(json!(rt.broadcaster().homegear_event(p.str(0)?, p.value(1)?)))
    });
    bind(table, runtime, Method::BroadcastNewDevices, |rt, p| {
        let ids = p.value(0)?;
        Ok(json!(rt.broadcaster().homegear_event("newDevices", &json!({"peerIds": ids}))))
    });
    bind(table, runtime, Method::BroadcastDeleteDevices, |rt, p| {
        let ids = p.value(0)?;
        Ok(json!(rt.broadcaster().homegear_event("deleteDevices", &json!({"peerIds": ids}))))
    });
    bind(table, runtime, Method::BroadcastUpdateDevice, |rt, p| {
        p.expect_at_least(3)?;
        let data = json!({"peerId": p.u64(0)?, "channel": channel(&p, 1)?, "hint": p.value(2)?});
        Ok(json!(rt.broadcaster().homegear_event("updateDevice", &data)))
    });
    bind(table, runtime, Method::BroadcastStatus, |rt, p| {
        p.expect_at_least(2)?;
        Ok(json!(rt.broadcaster().status(p.str(0)?, p.value(1)?)))
    });
    bind(table, runtime, Method::BroadcastError, |rt, p| {
        p.expect_at_least(3)?;
        let source = rt.flows().error_source(p.str(0)?);
        let level = LogLevel::from_level_number(p.i64(1)?);
        Ok(json!(rt.broadcaster().error(&source, level, p.str(2)?)))
    });

    bind(table, runtime, Method::EnableNodeEvents, |rt, _| {
        rt.set_node_events(true);
        Ok(json!(true))
    });
    bind(table, runtime, Method::DisableNodeEvents, |rt, _| {
        rt.set_node_events(false);
        Ok(json!(true))
    });
    bind(table, runtime, Method::GetNodeProcessingTimes, |rt, _| Ok(rt.flows().processing_times()));
    bind(table, runtime, Method::GetNodeInputHistory, |rt, p| {
        Ok(rt.flows().input_history().to_value(p.str(0)?))
    });
}

fn bind<F>(table: &DispatchTable, runtime: &Weak<FlowsRuntime>, method: Method, handler: F)
where
    F: Fn(&FlowsRuntime, Params<'_>) -> RpcResult + Send + Sync + 'static,
{
    let runtime = runtime.clone();
    let name = method.to_string();
    table.register(method, move |args: &[Value]| {
        let Some(rt) = runtime.upgrade() else {
            return Err(Fault::disposing());
        };
        handler(&rt, Params::new(&name, args))
    });
}

fn port(p: &Params<'_>, index: usize) -> Result<u32, Fault> {
    u32::try_from(p.u64(index)?).map_err(|_| Fault::invalid_params(format!("port out of range at {index}")))
}

fn channel(p: &Params<'_>, index: usize) -> Result<i32, Fault> {
    i32::try_from(p.i64(index)?).map_err(|_| Fault::invalid_params(format!("channel out of range at {index}")))
}
