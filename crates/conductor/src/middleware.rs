//! Hooks that inspect or rewrite content at fixed points of a turn.
//!
//! Each [`Trigger`] sees one kind of content block. Middleware for a trigger run in
//! ascending `order` (unordered last, registration order otherwise) and are chained, so
//! the last replacement wins. A failing middleware makes the stage retryable until it has
//! failed `max_retries` times in a row; after that a critical middleware aborts the turn
//! and a non-critical one is skipped with its error folded into tool blocks.

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::agent::Agent;
use crate::cancellation::RequestContext;
use crate::errors::AgentError;
use crate::models::content::{ContentBlock, TextContent, ToolCallContent, ToolResultContent};
use crate::models::message::Message;
use crate::trace::{TraceEvent, TraceKind, TraceStatus};

pub const DEFAULT_MAX_MIDDLEWARE_RETRIES: u32 = 5;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum Trigger {
    PreCompletion,
    OnCompletion,
    PreToolExecution,
    OnToolExecution,
    OnMainFinish,
    PostProcess,
}

/// The block a middleware receives and may replace
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(TextContent),
    ToolCall(ToolCallContent),
    ToolResult(ToolResultContent),
}

impl Payload {
    /// Split off the part of `block` that `trigger` handles, or hand the block back
    fn take(trigger: Trigger, block: ContentBlock) -> Result<Payload, ContentBlock> {
        match (trigger, block) {
            (
                Trigger::PreCompletion
                | Trigger::OnCompletion
                | Trigger::OnMainFinish
                | Trigger::PostProcess,
                ContentBlock::Text(text),
            ) => Ok(Payload::Text(text)),
            (Trigger::PreToolExecution, ContentBlock::ToolCall(call)) => Ok(Payload::ToolCall(call)),
            (Trigger::OnToolExecution, ContentBlock::ToolResult(result)) => {
                Ok(Payload::ToolResult(result))
            }
            (_, block) => Err(block),
        }
    }

    fn into_block(self) -> ContentBlock {
        match self {
            Payload::Text(text) => ContentBlock::Text(text),
            Payload::ToolCall(call) => ContentBlock::ToolCall(call),
            Payload::ToolResult(result) => ContentBlock::ToolResult(result),
        }
    }

    fn same_kind(&self, other: &Payload) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Record an absorbed middleware error on the payload itself
    fn fold_error(self, message: &str) -> Payload {
        match self {
            Payload::ToolCall(call) => Payload::ToolCall(call.with_error(message)),
            Payload::ToolResult(mut result) => {
                result.error = true;
                result.result = message.to_string();
                Payload::ToolResult(result)
            }
            text => text,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(&text.text),
            _ => None,
        }
    }
}

pub type MiddlewareAction = Arc<
    dyn for<'a> Fn(Payload, &'a Agent) -> BoxFuture<'a, Result<Option<Payload>>> + Send + Sync,
>;

#[derive(Clone)]
pub struct Middleware {
    pub name: String,
    pub trigger: Trigger,
    pub critical: bool,
    pub order: Option<i32>,
    action: MiddlewareAction,
}

impl Middleware {
    pub fn new<N, F>(name: N, trigger: Trigger, action: F) -> Self
    where
        N: Into<String>,
        F: for<'a> Fn(Payload, &'a Agent) -> BoxFuture<'a, Result<Option<Payload>>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            trigger,
            critical: false,
            order: None,
            action: Arc::new(action),
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = Some(order);
        self
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware")
            .field("name", &self.name)
            .field("trigger", &self.trigger)
            .field("critical", &self.critical)
            .field("order", &self.order)
            .finish()
    }
}

/// Assigned at registration, stable for the life of the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MiddlewareId(usize);

#[derive(Debug, Clone, PartialEq)]
pub struct MiddlewareFailure {
    pub trigger: Trigger,
    pub middleware: String,
    pub message: String,
}

impl fmt::Display for MiddlewareFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Middleware '{}' failed at {}: {}",
            self.middleware, self.trigger, self.message
        )
    }
}

impl From<MiddlewareFailure> for AgentError {
    fn from(failure: MiddlewareFailure) -> Self {
        AgentError::CatastrophicMiddlewareFailure {
            trigger: failure.trigger.to_string(),
            middleware: failure.middleware,
            message: failure.message,
        }
    }
}

/// Why a pipeline stage did not produce a message
#[derive(Debug, Clone, PartialEq)]
pub enum StageFailure {
    /// The stage may be attempted again
    Retry(MiddlewareFailure),
    /// A critical middleware exhausted its retries
    Catastrophic(MiddlewareFailure),
    Aborted,
}

pub struct MiddlewarePipeline {
    entries: Vec<(MiddlewareId, Middleware)>,
    retries: Mutex<HashMap<MiddlewareId, u32>>,
    max_retries: u32,
}

impl MiddlewarePipeline {
    pub fn new(middleware: Vec<Middleware>, max_retries: u32) -> Self {
        let mut entries: Vec<(MiddlewareId, Middleware)> = middleware
            .into_iter()
            .enumerate()
            .map(|(index, middleware)| (MiddlewareId(index), middleware))
            .collect();
        // Stable, so equal orders keep registration order
        entries.sort_by_key(|(_, middleware)| match middleware.order {
            Some(order) => (0, order),
            None => (1, 0),
        });

        Self {
            entries,
            retries: Mutex::new(HashMap::new()),
            max_retries: max_retries.max(1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Middleware for `trigger` in execution order
    pub fn for_trigger(&self, trigger: Trigger) -> impl Iterator<Item = &(MiddlewareId, Middleware)> {
        self.entries
            .iter()
            .filter(move |(_, middleware)| middleware.trigger == trigger)
    }

    fn retries(&self) -> MutexGuard<'_, HashMap<MiddlewareId, u32>> {
        self.retries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consecutive failures recorded for a middleware
    pub fn retry_count(&self, id: MiddlewareId) -> u32 {
        self.retries().get(&id).copied().unwrap_or(0)
    }

    fn record_failure(&self, id: MiddlewareId) -> u32 {
        let mut retries = self.retries();
        let count = retries.entry(id).or_insert(0);
        *count += 1;
        *count
    }

    fn reset(&self, id: MiddlewareId) {
        self.retries().remove(&id);
    }

    /// Run every middleware registered for `trigger` over the matching blocks of `message`.
    /// The returned message keeps the role, id and block order of the input.
    pub async fn run(
        &self,
        trigger: Trigger,
        message: Message,
        agent: &Agent,
        ctx: &RequestContext,
    ) -> Result<Message, StageFailure> {
        if self.for_trigger(trigger).next().is_none() {
            return Ok(message);
        }

        let Message {
            id,
            role,
            created,
            content: blocks,
        } = message;
        let mut content = Vec::with_capacity(blocks.len());

        for block in blocks {
            let mut payload = match Payload::take(trigger, block) {
                Ok(payload) => payload,
                Err(block) => {
                    content.push(block);
                    continue;
                }
            };

            for (middleware_id, middleware) in self.for_trigger(trigger) {
                payload = self
                    .apply(*middleware_id, middleware, payload, agent, ctx)
                    .await?;
            }
            content.push(payload.into_block());
        }

        Ok(Message {
            id,
            role,
            created,
            content,
        })
    }

    async fn apply(
        &self,
        id: MiddlewareId,
        middleware: &Middleware,
        payload: Payload,
        agent: &Agent,
        ctx: &RequestContext,
    ) -> Result<Payload, StageFailure> {
        if ctx.is_cancelled() {
            return Err(StageFailure::Aborted);
        }

        let trace_data = json!({"middleware": middleware.name, "trigger": middleware.trigger});
        agent.tracer().emit(TraceEvent::start(
            TraceKind::Middleware,
            ctx.request_id,
            trace_data.clone(),
        ));

        let outcome = tokio::select! {
            biased;
            _ = ctx.token().cancelled() => {
                agent.tracer().emit(TraceEvent::end(
                    TraceKind::Middleware,
                    ctx.request_id,
                    TraceStatus::Aborted,
                    trace_data,
                ));
                return Err(StageFailure::Aborted);
            }
            outcome = AssertUnwindSafe((middleware.action)(payload.clone(), agent)).catch_unwind() => outcome,
        };

        let error = match outcome {
            Ok(Ok(replacement)) => {
                self.reset(id);
                agent.tracer().emit(TraceEvent::end(
                    TraceKind::Middleware,
                    ctx.request_id,
                    TraceStatus::Success,
                    trace_data,
                ));
                return Ok(match replacement {
                    Some(replacement) if replacement.same_kind(&payload) => replacement,
                    Some(_) => {
                        tracing::warn!(
                            middleware = %middleware.name,
                            trigger = %middleware.trigger,
                            "ignoring replacement of a different content kind"
                        );
                        payload
                    }
                    None => payload,
                });
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "middleware panicked".to_string(),
        };

        let failures = self.record_failure(id);
        let failure = MiddlewareFailure {
            trigger: middleware.trigger,
            middleware: middleware.name.clone(),
            message: error,
        };
        agent.tracer().emit(TraceEvent::end(
            TraceKind::Middleware,
            ctx.request_id,
            TraceStatus::Error,
            json!({
                "middleware": middleware.name,
                "trigger": middleware.trigger,
                "error": failure.message,
                "failures": failures,
            }),
        ));

        if failures < self.max_retries {
            tracing::warn!(
                request_id = %ctx.request_id,
                middleware = %middleware.name,
                trigger = %middleware.trigger,
                attempt = failures,
                error = %failure.message,
                "middleware failed, stage will be retried"
            );
            return Err(StageFailure::Retry(failure));
        }

        self.reset(id);
        if middleware.critical {
            tracing::error!(
                request_id = %ctx.request_id,
                middleware = %middleware.name,
                trigger = %middleware.trigger,
                error = %failure.message,
                "critical middleware exhausted its retries"
            );
            return Err(StageFailure::Catastrophic(failure));
        }

        tracing::warn!(
            request_id = %ctx.request_id,
            middleware = %middleware.name,
            trigger = %middleware.trigger,
            error = %failure.message,
            "non-critical middleware exhausted its retries, continuing"
        );
        Ok(payload.fold_error(&failure.message))
    }
}
