use futures::FutureExt;
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;

use crate::agent::Agent;
use crate::cancellation::RequestContext;
use crate::models::content::{ToolCallContent, ToolResultContent};
use crate::providers::utils::sanitize_function_name;
use crate::tool::{Tool, ToolOutput};
use crate::trace::{TraceEvent, TraceKind, TraceStatus};

pub const NO_RESULT: &str = "No result returned";

/// Find the tool a call refers to. Providers only see sanitized names, so either form matches.
fn resolve<'t>(
    tools: &'t [Tool],
    call: &ToolCallContent,
    allowlist: &[String],
    agent: &Agent,
) -> Option<&'t Tool> {
    tools.iter().find(|tool| {
        let name_matches =
            tool.name == call.fn_name || sanitize_function_name(&tool.name) == call.fn_name;
        name_matches
            && (tool.is_enabled(agent) || (tool.allowlist && allowlist.contains(&tool.name)))
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "tool panicked".to_string()
    }
}

/// Execute tool calls one at a time, in order. Every call yields exactly one result;
/// failures become error results. Returns `None` if the request is cancelled.
pub async fn execute_tool_calls(
    agent: &Agent,
    tools: &[Tool],
    calls: &[&ToolCallContent],
    allowlist: &[String],
    ctx: &RequestContext,
) -> Option<Vec<ToolResultContent>> {
    let mut results = Vec::with_capacity(calls.len());

    for call in calls {
        if ctx.is_cancelled() {
            return None;
        }

        if let Some(error) = &call.error {
            results.push(ToolResultContent::failure(call, error.clone()));
            continue;
        }

        let Some(tool) = resolve(tools, call, allowlist, agent) else {
            tracing::warn!(tool = %call.fn_name, "tool not found");
            results.push(ToolResultContent::failure(
                call,
                format!("Tool not found: {}", call.fn_name),
            ));
            continue;
        };

        agent.tracer().emit(TraceEvent::start(
            TraceKind::ToolExecution,
            ctx.request_id,
            json!({"tool": tool.name, "call_id": call.id, "args": call.fn_args}),
        ));

        let outcome = tokio::select! {
            biased;
            _ = ctx.token().cancelled() => {
                agent.tracer().emit(TraceEvent::end(
                    TraceKind::ToolExecution,
                    ctx.request_id,
                    TraceStatus::Aborted,
                    json!({"tool": tool.name, "call_id": call.id}),
                ));
                return None;
            }
            outcome = AssertUnwindSafe(tool.handler.call(call, agent)).catch_unwind() => outcome,
        };

        let result = match outcome {
            Ok(Ok(ToolOutput { content, error: true })) => ToolResultContent::failure(call, content),
            Ok(Ok(ToolOutput { content, .. })) if content.is_empty() => {
                tracing::warn!(tool = %tool.name, call_id = %call.id, "tool returned no result");
                ToolResultContent::success(call, NO_RESULT)
            }
            Ok(Ok(ToolOutput { content, .. })) => ToolResultContent::success(call, content),
            Ok(Err(e)) => {
                tracing::error!(tool = %tool.name, call_id = %call.id, error = %e, "tool failed");
                ToolResultContent::failure(call, format!("Tool execution failed: {}", e))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(tool = %tool.name, call_id = %call.id, %message, "tool panicked");
                ToolResultContent::failure(call, format!("Tool execution failed: {}", message))
            }
        };

        let status = if result.error {
            TraceStatus::Error
        } else {
            TraceStatus::Success
        };
        agent.tracer().emit(TraceEvent::end(
            TraceKind::ToolExecution,
            ctx.request_id,
            status,
            json!({"tool": tool.name, "call_id": call.id, "result": result.result}),
        ));
        results.push(result);
    }

    Some(results)
}
