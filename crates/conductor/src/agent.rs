//! The agent and its turn state machine.
//!
//! A turn walks `PreCompletion -> Request -> OnCompletion -> (ToolLoop -> Request)* ->
//! OnMainFinish -> PostProcess`. Middleware failures below the retry bound roll the
//! history back to where the failing stage started, record the error as a system message
//! and restart at `Request` under a continuation request id. A newer top level turn
//! supersedes this one, which then resolves to `None`.

use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::broadcast;

use crate::cancellation::{CancellationManager, RequestContext, RequestId};
use crate::configuration::{AgentSettings, Settings};
use crate::errors::{AgentError, AgentResult};
use crate::executor::execute_tool_calls;
use crate::jobs::{Job, JobScheduler};
use crate::middleware::{Middleware, MiddlewarePipeline, StageFailure, Trigger};
use crate::models::history::trim_history;
use crate::models::message::Message;
use crate::models::role::Role;
use crate::models::tool::ToolSpec;
use crate::plugin::Plugin;
use crate::prompt_template::{load_prompt, load_prompt_file};
use crate::providers::base::{
    Completion, CompletionConfig, Provider, StreamCallback, ToolChoice, Usage,
};
use crate::providers::errors::ProviderError;
use crate::providers::factory::get_provider;
use crate::providers::retry::make_completion_request;
use crate::providers::utils::sanitize_function_name;
use crate::realtime::RealtimeEnvelope;
use crate::tool::Tool;
use crate::trace::{TraceEvent, TraceKind, TraceStatus, Tracer};

pub type ErrorHandler =
    Arc<dyn Fn(AgentError) -> AgentResult<Option<Completion>> + Send + Sync>;

/// Per call overrides for a turn
#[derive(Clone, Default)]
pub struct TurnOptions {
    /// Used for this turn only; the agent's provider is untouched
    pub provider: Option<Arc<dyn Provider>>,
    pub on_chunk: Option<StreamCallback>,
    /// Requests this turn continues. They are not aborted when it starts.
    pub parent_request_ids: Vec<RequestId>,
}

impl TurnOptions {
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_stream_callback(mut self, on_chunk: StreamCallback) -> Self {
        self.on_chunk = Some(on_chunk);
        self
    }

    pub fn with_parents(mut self, parent_request_ids: Vec<RequestId>) -> Self {
        self.parent_request_ids = parent_request_ids;
        self
    }
}

enum Stage {
    Request,
    OnCompletion(Completion),
    /// `checkpoint` is the history length before `message` was appended
    ToolLoop { message: Message, checkpoint: usize },
    Finish { message: Message, checkpoint: usize },
}

/// State carried across the stages of one turn
struct Turn {
    root: RequestId,
    ctx: RequestContext,
    provider: Arc<dyn Provider>,
    on_chunk: Option<StreamCallback>,
    allowlist: Vec<String>,
    usage: Usage,
    stop_reason: Option<String>,
    tool_rounds: u32,
}

impl Turn {
    fn record(&mut self, completion: &Completion) {
        self.usage += completion.usage;
        self.stop_reason = completion.stop_reason.clone();
    }

    fn completion(&self, message: Message) -> Completion {
        Completion {
            message,
            usage: self.usage,
            stop_reason: self.stop_reason.clone(),
        }
    }
}

pub struct Agent {
    provider: RwLock<Arc<dyn Provider>>,
    system_prompts: Vec<String>,
    tools: Vec<Tool>,
    jobs: Vec<Job>,
    pipeline: MiddlewarePipeline,
    history: Mutex<Vec<Message>>,
    cancellation: CancellationManager,
    on_error: ErrorHandler,
    tracer: Tracer,
    settings: AgentSettings,
}

impl Agent {
    pub fn builder(provider: Arc<dyn Provider>) -> AgentBuilder {
        AgentBuilder::new(provider)
    }

    pub fn provider(&self) -> Arc<dyn Provider> {
        self.provider
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the provider for every later turn
    pub fn set_provider(&self, provider: Arc<dyn Provider>) {
        *self.provider.write().unwrap_or_else(PoisonError::into_inner) = provider;
    }

    pub fn system_prompts(&self) -> &[String] {
        &self.system_prompts
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn cancellation(&self) -> &CancellationManager {
        &self.cancellation
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TraceEvent> {
        self.tracer.subscribe()
    }

    fn history_guard(&self) -> MutexGuard<'_, Vec<Message>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A snapshot of the conversation
    pub fn history(&self) -> Vec<Message> {
        self.history_guard().clone()
    }

    pub fn add_message(&self, message: Message) {
        self.history_guard().push(message.ensure_id());
    }

    pub fn clear_history(&self) {
        self.history_guard().clear();
    }

    /// Abort every in flight turn
    pub fn kill(&self) {
        tracing::info!("killing all in flight requests");
        self.cancellation.kill();
    }

    fn history_len(&self) -> usize {
        self.history_guard().len()
    }

    fn truncate_history(&self, len: usize) {
        self.history_guard().truncate(len);
    }

    fn replace_message(&self, index: usize, message: Message) {
        if let Some(slot) = self.history_guard().get_mut(index) {
            *slot = message;
        }
    }

    fn remove_message(&self, index: usize) {
        let mut history = self.history_guard();
        if index < history.len() {
            history.remove(index);
        }
    }

    fn last_user_message(&self) -> Option<(usize, Message)> {
        self.history_guard()
            .iter()
            .enumerate()
            .rev()
            .find(|(_, message)| message.role == Role::User)
            .map(|(index, message)| (index, message.clone()))
    }

    /// Enabled tools plus any allowlisted for this turn
    fn tool_specs(&self, allowlist: &[String]) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .filter(|tool| {
                tool.is_enabled(self) || (tool.allowlist && allowlist.contains(&tool.name))
            })
            .map(Tool::spec)
            .collect()
    }

    fn start_turn(&self, options: &TurnOptions, allowlist: Vec<String>) -> Turn {
        let ctx = self.cancellation.begin(&options.parent_request_ids);
        Turn {
            root: ctx.request_id,
            ctx,
            provider: options.provider.clone().unwrap_or_else(|| self.provider()),
            on_chunk: options.on_chunk.clone(),
            allowlist,
            usage: Usage::default(),
            stop_reason: None,
            tool_rounds: 0,
        }
    }

    /// Release the turn's requests, report it and route errors through `on_error`
    fn settle(
        &self,
        kind: TraceKind,
        turn: &Turn,
        result: AgentResult<Option<Completion>>,
    ) -> AgentResult<Option<Completion>> {
        self.cancellation.release(&turn.ctx);

        let (status, data) = match &result {
            Ok(Some(completion)) => (TraceStatus::Success, json!({"usage": completion.usage})),
            Ok(None) => (TraceStatus::Aborted, json!({})),
            Err(e) => (TraceStatus::Error, json!({"error": e.to_string()})),
        };
        self.tracer
            .emit(TraceEvent::end(kind, turn.root, status, data));

        match result {
            Err(e) => {
                tracing::error!(request_id = %turn.root, error = %e, "turn failed");
                (self.on_error)(e)
            }
            Ok(None) => {
                tracing::info!(request_id = %turn.root, "turn aborted");
                Ok(None)
            }
            ok => ok,
        }
    }

    /// Run a turn over the current history
    pub async fn main(&self) -> AgentResult<Option<Completion>> {
        self.main_with(TurnOptions::default()).await
    }

    pub async fn main_with(&self, options: TurnOptions) -> AgentResult<Option<Completion>> {
        let mut turn = self.start_turn(&options, Vec::new());
        tracing::info!(
            request_id = %turn.root,
            provider = %turn.provider.provider_type(),
            model = turn.provider.model(),
            "starting turn"
        );
        self.tracer.emit(TraceEvent::start(
            TraceKind::Main,
            turn.root,
            json!({
                "provider": turn.provider.provider_type(),
                "model": turn.provider.model(),
                "parent_request_ids": options.parent_request_ids,
            }),
        ));

        let result = match self.pre_completion(&turn).await {
            Ok(ControlFlow::Break(early)) => Ok(early),
            Ok(ControlFlow::Continue(())) => self.run_stages(&mut turn, Stage::Request).await,
            Err(e) => Err(e),
        };
        self.settle(TraceKind::Main, &turn, result)
    }

    /// Force a call to `tool_name`.
    ///
    /// With `add_to_conversation` false the returned message holds only the tool results and
    /// the history is left alone. Otherwise the call and its results are appended and the
    /// turn continues from a fresh request.
    pub async fn trigger(
        &self,
        tool_name: &str,
        add_to_conversation: bool,
    ) -> AgentResult<Option<Completion>> {
        self.trigger_with(tool_name, add_to_conversation, TurnOptions::default())
            .await
    }

    pub async fn trigger_with(
        &self,
        tool_name: &str,
        add_to_conversation: bool,
        options: TurnOptions,
    ) -> AgentResult<Option<Completion>> {
        let mut turn = self.start_turn(&options, vec![tool_name.to_string()]);
        tracing::info!(request_id = %turn.root, tool = tool_name, "triggering tool");
        self.tracer.emit(TraceEvent::start(
            TraceKind::Trigger,
            turn.root,
            json!({"tool": tool_name, "add_to_conversation": add_to_conversation}),
        ));

        let result = self
            .run_trigger(&mut turn, tool_name, add_to_conversation)
            .await;
        self.settle(TraceKind::Trigger, &turn, result)
    }

    async fn run_trigger(
        &self,
        turn: &mut Turn,
        tool_name: &str,
        add_to_conversation: bool,
    ) -> AgentResult<Option<Completion>> {
        let tool = self
            .tools
            .iter()
            .find(|tool| tool.name == tool_name && (tool.allowlist || tool.is_enabled(self)))
            .ok_or_else(|| AgentError::ToolNotFound(tool_name.to_string()))?;

        let Some((calls, results)) = self.forced_call(turn, tool).await? else {
            return Ok(None);
        };

        if !add_to_conversation {
            return Ok(Some(turn.completion(results)));
        }

        self.add_message(calls);
        self.add_message(results);
        turn.tool_rounds = 1;
        turn.ctx = self.cancellation.continue_from(&turn.ctx);
        self.run_stages(turn, Stage::Request).await
    }

    /// Request a call pinned to `tool`, pass the response through `onCompletion` and run
    /// it, retrying the attempt on retryable middleware failures. The history is not touched.
    async fn forced_call(
        &self,
        turn: &mut Turn,
        tool: &Tool,
    ) -> AgentResult<Option<(Message, Message)>> {
        let sanitized = sanitize_function_name(&tool.name);
        loop {
            let Some(completion) = self
                .request(turn, ToolChoice::Tool(tool.name.clone()))
                .await?
            else {
                return Ok(None);
            };
            turn.record(&completion);

            let called = completion
                .message
                .tool_calls()
                .iter()
                .any(|call| call.fn_name == tool.name || call.fn_name == sanitized);
            if !called {
                return Err(AgentError::ExecutionError(format!(
                    "model did not call the forced tool '{}'",
                    tool.name
                )));
            }

            let outcome = match self
                .pipeline
                .run(Trigger::OnCompletion, completion.message, self, &turn.ctx)
                .await
            {
                Ok(message) => self.run_tools(turn, message).await,
                Err(failure) => Err(failure),
            };
            match outcome {
                Ok(pair) => return Ok(Some(pair)),
                Err(StageFailure::Retry(failure)) => {
                    tracing::warn!(request_id = %turn.ctx.request_id, %failure, "retrying forced tool call");
                    turn.ctx = self.cancellation.continue_from(&turn.ctx);
                }
                Err(StageFailure::Catastrophic(failure)) => return Err(failure.into()),
                Err(StageFailure::Aborted) => return Ok(None),
            }
        }
    }

    async fn pre_completion(&self, turn: &Turn) -> AgentResult<ControlFlow<Option<Completion>>> {
        let Some((index, message)) = self.last_user_message() else {
            return Ok(ControlFlow::Continue(()));
        };

        match self
            .pipeline
            .run(Trigger::PreCompletion, message, self, &turn.ctx)
            .await
        {
            Ok(message) => {
                self.replace_message(index, message);
                Ok(ControlFlow::Continue(()))
            }
            Err(StageFailure::Retry(failure)) => {
                // The rejected input never reaches the provider
                self.remove_message(index);
                Ok(ControlFlow::Break(Some(Completion::new(
                    Message::assistant().with_text(failure.message),
                    Usage::default(),
                ))))
            }
            Err(StageFailure::Catastrophic(failure)) => {
                self.remove_message(index);
                Err(failure.into())
            }
            Err(StageFailure::Aborted) => Ok(ControlFlow::Break(None)),
        }
    }

    async fn request(
        &self,
        turn: &Turn,
        tool_choice: ToolChoice,
    ) -> AgentResult<Option<Completion>> {
        let history = trim_history(&self.history(), self.settings.history_limit);
        let config = CompletionConfig::new(self.system_prompts.clone(), history)
            .with_tools(self.tool_specs(&turn.allowlist))
            .with_tool_choice(tool_choice)
            .streaming(self.settings.stream || turn.on_chunk.is_some());

        tracing::debug!(
            request_id = %turn.ctx.request_id,
            provider = %turn.provider.provider_type(),
            messages = config.messages.len(),
            tools = config.tools.len(),
            "requesting completion"
        );

        let result = make_completion_request(
            turn.provider.as_ref(),
            &config,
            turn.on_chunk.as_ref(),
            turn.ctx.token(),
        )
        .await;

        match result {
            // Settled after the turn was superseded
            Ok(_) if turn.ctx.is_cancelled() => Ok(None),
            Ok(completion) => Ok(Some(completion)),
            Err(ProviderError::RequestAborted) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Pre-execution middleware, the tools themselves, then result middleware.
    /// Returns the possibly rewritten call message and the message of results.
    async fn run_tools(
        &self,
        turn: &Turn,
        message: Message,
    ) -> Result<(Message, Message), StageFailure> {
        let message = self
            .pipeline
            .run(Trigger::PreToolExecution, message, self, &turn.ctx)
            .await?;

        let results = {
            let calls = message.tool_calls();
            execute_tool_calls(self, &self.tools, &calls, &turn.allowlist, &turn.ctx).await
        }
        .ok_or(StageFailure::Aborted)?;

        let results = results
            .into_iter()
            .fold(Message::user(), Message::with_tool_result)
            .ensure_id();
        let results = self
            .pipeline
            .run(Trigger::OnToolExecution, results, self, &turn.ctx)
            .await?;

        Ok((message, results))
    }

    /// Undo the failed stage. Retryable failures restart at `Request`.
    fn recover(
        &self,
        failure: StageFailure,
        checkpoint: usize,
        turn: &mut Turn,
    ) -> AgentResult<Option<Stage>> {
        self.truncate_history(checkpoint);
        match failure {
            StageFailure::Retry(failure) => {
                tracing::info!(request_id = %turn.ctx.request_id, %failure, "restarting turn");
                self.add_message(Message::system().with_text(failure.to_string()));
                turn.ctx = self.cancellation.continue_from(&turn.ctx);
                Ok(Some(Stage::Request))
            }
            StageFailure::Catastrophic(failure) => Err(failure.into()),
            StageFailure::Aborted => Ok(None),
        }
    }

    async fn run_stages(&self, turn: &mut Turn, mut stage: Stage) -> AgentResult<Option<Completion>> {
        loop {
            if turn.ctx.is_cancelled() {
                return Ok(None);
            }

            stage = match stage {
                Stage::Request => match self.request(turn, ToolChoice::Auto).await? {
                    Some(completion) => {
                        turn.record(&completion);
                        Stage::OnCompletion(completion)
                    }
                    None => return Ok(None),
                },

                Stage::OnCompletion(completion) => {
                    let checkpoint = self.history_len();
                    match self
                        .pipeline
                        .run(Trigger::OnCompletion, completion.message, self, &turn.ctx)
                        .await
                    {
                        Ok(message) => {
                            let message = message.ensure_id();
                            self.add_message(message.clone());
                            if message.has_tool_calls() {
                                Stage::ToolLoop {
                                    message,
                                    checkpoint,
                                }
                            } else {
                                Stage::Finish {
                                    message,
                                    checkpoint,
                                }
                            }
                        }
                        Err(failure) => match self.recover(failure, checkpoint, turn)? {
                            Some(stage) => stage,
                            None => return Ok(None),
                        },
                    }
                }

                Stage::ToolLoop {
                    message,
                    checkpoint,
                } => {
                    turn.tool_rounds += 1;
                    if turn.tool_rounds > self.settings.max_tool_rounds {
                        self.truncate_history(checkpoint);
                        return Err(AgentError::MaxToolRounds(self.settings.max_tool_rounds));
                    }

                    match self.run_tools(turn, message).await {
                        Ok((calls, results)) => {
                            self.replace_message(checkpoint, calls);
                            self.add_message(results);
                            turn.ctx = self.cancellation.continue_from(&turn.ctx);
                            Stage::Request
                        }
                        Err(failure) => match self.recover(failure, checkpoint, turn)? {
                            Some(stage) => stage,
                            None => return Ok(None),
                        },
                    }
                }

                Stage::Finish {
                    message,
                    checkpoint,
                } => {
                    // Transforms the returned copy only
                    let finished = match self
                        .pipeline
                        .run(Trigger::OnMainFinish, message, self, &turn.ctx)
                        .await
                    {
                        Ok(message) => {
                            self.pipeline
                                .run(Trigger::PostProcess, message, self, &turn.ctx)
                                .await
                        }
                        Err(failure) => Err(failure),
                    };

                    match finished {
                        Ok(message) => return Ok(Some(turn.completion(message))),
                        Err(failure) => match self.recover(failure, checkpoint, turn)? {
                            Some(stage) => stage,
                            None => return Ok(None),
                        },
                    }
                }
            };
        }
    }

    /// Answer one envelope from a realtime bridge
    pub async fn handle_envelope(&self, envelope: RealtimeEnvelope) -> Vec<RealtimeEnvelope> {
        match envelope {
            RealtimeEnvelope::Message(message) => {
                self.add_message(message);
                match self.main().await {
                    Ok(Some(completion)) => vec![
                        RealtimeEnvelope::Message(completion.message),
                        RealtimeEnvelope::Usage(completion.usage),
                    ],
                    Ok(None) => Vec::new(),
                    Err(e) => vec![RealtimeEnvelope::error(e.to_string())],
                }
            }
            RealtimeEnvelope::Abort => {
                self.kill();
                Vec::new()
            }
            other => {
                tracing::debug!(kind = other.kind(), "envelope left to the bridge");
                vec![RealtimeEnvelope::error(format!(
                    "unsupported envelope type: {}",
                    other.kind()
                ))]
            }
        }
    }

    /// Hand every job to `scheduler`
    pub async fn schedule_jobs(&self, scheduler: &dyn JobScheduler) -> AgentResult<usize> {
        for job in &self.jobs {
            scheduler.schedule(job.clone()).await.map_err(|e| {
                AgentError::Internal(format!("failed to schedule job '{}': {}", job.name, e))
            })?;
            tracing::info!(job = %job.name, schedule = %job.schedule, "scheduled job");
        }
        Ok(self.jobs.len())
    }

    pub async fn cancel_jobs(&self, scheduler: &dyn JobScheduler) -> AgentResult<usize> {
        for job in &self.jobs {
            scheduler.cancel(&job.name).await.map_err(|e| {
                AgentError::Internal(format!("failed to cancel job '{}': {}", job.name, e))
            })?;
        }
        Ok(self.jobs.len())
    }
}

fn rethrow(err: AgentError) -> AgentResult<Option<Completion>> {
    Err(err)
}

/// Collects everything an agent is made of
pub struct AgentBuilder {
    provider: Arc<dyn Provider>,
    system_prompts: Vec<String>,
    tools: Vec<Tool>,
    middleware: Vec<Middleware>,
    jobs: Vec<Job>,
    plugins: Vec<Box<dyn Plugin>>,
    history: Vec<Message>,
    on_error: Option<ErrorHandler>,
    settings: AgentSettings,
}

impl AgentBuilder {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            system_prompts: Vec::new(),
            tools: Vec::new(),
            middleware: Vec::new(),
            jobs: Vec::new(),
            plugins: Vec::new(),
            history: Vec::new(),
            on_error: None,
            settings: AgentSettings::default(),
        }
    }

    /// A builder with the configured provider and agent settings
    pub fn from_settings(settings: Settings) -> AgentResult<Self> {
        let provider = get_provider(settings.provider.into_config())
            .map_err(|e| AgentError::Internal(format!("failed to create provider: {}", e)))?;
        Ok(Self::new(provider).settings(settings.agent))
    }

    pub fn system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.system_prompts.push(prompt.into());
        self
    }

    pub fn system_prompt_template<T: Serialize>(
        self,
        template: &str,
        context: &T,
    ) -> AgentResult<Self> {
        let prompt = load_prompt(template, context)?;
        Ok(self.system_prompt(prompt))
    }

    pub fn system_prompt_file<T: Serialize>(
        self,
        path: impl Into<PathBuf>,
        context: &T,
    ) -> AgentResult<Self> {
        let prompt = load_prompt_file(path, context)?;
        Ok(self.system_prompt(prompt))
    }

    pub fn tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn middleware(mut self, middleware: Middleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn job(mut self, job: Job) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn plugin<P: Plugin + 'static>(mut self, plugin: P) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    pub fn history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(AgentError) -> AgentResult<Option<Completion>> + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    pub fn settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> AgentResult<Agent> {
        let mut system_prompts = self.system_prompts;
        let mut tools = self.tools;
        let mut middleware = self.middleware;
        let mut jobs = self.jobs;

        for plugin in &self.plugins {
            tracing::debug!(plugin = plugin.name(), "registering plugin");
            if let Some(instructions) = plugin.instructions().filter(|i| !i.trim().is_empty()) {
                system_prompts.push(instructions);
            }
            tools.extend(plugin.tools());
            middleware.extend(plugin.middleware());
            jobs.extend(plugin.jobs());
        }

        let mut names = HashSet::new();
        for tool in &tools {
            if !names.insert(tool.name.as_str()) {
                return Err(AgentError::Internal(format!(
                    "duplicate tool name: {}",
                    tool.name
                )));
            }
            tool.spec().input_schema()?;
        }

        let on_error: ErrorHandler = match self.on_error {
            Some(on_error) => on_error,
            None => Arc::new(rethrow),
        };

        Ok(Agent {
            provider: RwLock::new(self.provider),
            system_prompts,
            tools,
            jobs,
            pipeline: MiddlewarePipeline::new(middleware, self.settings.max_middleware_retries),
            history: Mutex::new(self.history.into_iter().map(Message::ensure_id).collect()),
            cancellation: CancellationManager::new(),
            on_error,
            tracer: Tracer::default(),
            settings: self.settings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Payload;
    use crate::models::content::TextContent;
    use crate::models::tool::Param;
    use crate::providers::base::StreamChunk;
    use crate::providers::mock::MockProvider;
    use crate::tool::ToolOutput;
    use crate::trace::TracePhase;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn echo() -> Tool {
        Tool::new(
            "echo",
            "Echo back",
            vec![Param::string("text")],
            |_call, _agent| Box::pin(async move { Ok(ToolOutput::from("ok")) }),
        )
    }

    fn call_message(name: &str) -> Message {
        Message::assistant().with_tool_call("call_1", name, json!({"text": "hi"}))
    }

    fn failing(trigger: Trigger) -> Middleware {
        Middleware::new("guard", trigger, |_payload, _agent| {
            Box::pin(async move { Err(anyhow!("blocked by guard")) })
        })
    }

    /// Fails on its first invocation only
    fn flaky(trigger: Trigger) -> Middleware {
        let calls = Arc::new(AtomicU32::new(0));
        Middleware::new("flaky", trigger, move |_payload, _agent| {
            let calls = calls.clone();
            Box::pin(async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(anyhow!("try again"))
                } else {
                    Ok(None)
                }
            })
        })
    }

    #[tokio::test]
    async fn test_simple_reply() {
        let provider = Arc::new(MockProvider::new(vec![Message::assistant().with_text("Hello!")]));
        let agent = Agent::builder(provider.clone())
            .system_prompt("Be brief")
            .build()
            .unwrap();
        agent.add_message(Message::user().with_text("hi"));

        let completion = agent.main().await.unwrap().unwrap();

        assert_eq!(completion.message.text(), "Hello!");
        assert_eq!(completion.message.content.len(), 1);
        assert_eq!(completion.usage, Usage::new(10, 5));
        assert_eq!(agent.history().len(), 2);
        assert_eq!(provider.requests()[0].system, vec!["Be brief".to_string()]);
        assert!(agent.cancellation().in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_tool_loop() {
        let provider = Arc::new(MockProvider::new(vec![
            call_message("echo"),
            Message::assistant().with_text("done"),
        ]));
        let agent = Agent::builder(provider.clone()).tool(echo()).build().unwrap();
        agent.add_message(Message::user().with_text("say hi"));

        let completion = agent.main().await.unwrap().unwrap();

        assert_eq!(completion.message.text(), "done");
        assert_eq!(completion.usage, Usage::new(20, 10));

        let history = agent.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[2].role, Role::User);
        let result = history[2].tool_results()[0];
        assert_eq!(result.id, "call_1");
        assert_eq!(result.result, "ok");
        assert!(!result.error);

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools[0].name, "echo");
        assert_eq!(requests[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_reported_to_model() {
        let provider = Arc::new(MockProvider::new(vec![
            call_message("missing"),
            Message::assistant().with_text("sorry"),
        ]));
        let agent = Agent::builder(provider).build().unwrap();
        agent.add_message(Message::user().with_text("go"));

        let completion = agent.main().await.unwrap().unwrap();

        assert_eq!(completion.message.text(), "sorry");
        let result = agent.history()[2].tool_results()[0].clone();
        assert!(result.error);
        assert_eq!(result.result, "Tool not found: missing");
    }

    #[tokio::test]
    async fn test_pre_completion_failure_returns_error_text() {
        let provider = Arc::new(MockProvider::new(vec![Message::assistant().with_text("never")]));
        let agent = Agent::builder(provider.clone())
            .middleware(failing(Trigger::PreCompletion).critical())
            .build()
            .unwrap();
        agent.add_message(Message::user().with_text("something forbidden"));

        let completion = agent.main().await.unwrap().unwrap();

        assert_eq!(completion.message.role, Role::Assistant);
        assert_eq!(completion.message.text(), "blocked by guard");
        assert!(agent.history().is_empty());
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_pre_completion_rewrites_user_message() {
        let provider = Arc::new(MockProvider::new(vec![Message::assistant().with_text("ok")]));
        let agent = Agent::builder(provider.clone())
            .middleware(Middleware::new(
                "redact",
                Trigger::PreCompletion,
                |payload, _agent| {
                    Box::pin(async move {
                        let text = payload.as_text().unwrap_or_default().replace("secret", "***");
                        Ok(Some(Payload::Text(TextContent { text })))
                    })
                },
            ))
            .build()
            .unwrap();
        agent.add_message(Message::user().with_text("my secret"));

        agent.main().await.unwrap();

        assert_eq!(agent.history()[0].text(), "my ***");
        assert_eq!(provider.requests()[0].messages[0].text(), "my ***");
    }

    #[tokio::test]
    async fn test_retryable_on_completion_failure_restarts_request() {
        let provider = Arc::new(MockProvider::new(vec![
            Message::assistant().with_text("first"),
            Message::assistant().with_text("second"),
        ]));
        let agent = Agent::builder(provider.clone())
            .middleware(flaky(Trigger::OnCompletion))
            .build()
            .unwrap();
        agent.add_message(Message::user().with_text("hi"));

        let completion = agent.main().await.unwrap().unwrap();

        assert_eq!(completion.message.text(), "second");
        assert_eq!(completion.usage, Usage::new(20, 10));
        let history = agent.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].role, Role::System);
        assert!(history[1].text().contains("try again"));
        assert_eq!(history[2].text(), "second");
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_retryable_tool_failure_rolls_back_call() {
        let provider = Arc::new(MockProvider::new(vec![
            call_message("echo"),
            Message::assistant().with_text("no tools then"),
        ]));
        let agent = Agent::builder(provider.clone())
            .tool(echo())
            .middleware(flaky(Trigger::PreToolExecution))
            .build()
            .unwrap();
        agent.add_message(Message::user().with_text("hi"));

        let completion = agent.main().await.unwrap().unwrap();

        assert_eq!(completion.message.text(), "no tools then");
        let history = agent.history();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|m| !m.has_tool_calls()));
        assert_eq!(history[1].role, Role::System);
    }

    #[tokio::test]
    async fn test_catastrophic_failure_goes_to_on_error() {
        let settings = AgentSettings {
            max_middleware_retries: 1,
            ..Default::default()
        };
        let provider = Arc::new(MockProvider::new(vec![Message::assistant().with_text("x")]));
        let agent = Agent::builder(provider)
            .middleware(failing(Trigger::OnCompletion).critical())
            .settings(settings.clone())
            .build()
            .unwrap();
        agent.add_message(Message::user().with_text("hi"));

        let err = agent.main().await.unwrap_err();
        assert!(matches!(err, AgentError::CatastrophicMiddlewareFailure { .. }));
        assert_eq!(agent.history().len(), 1);

        let provider = Arc::new(MockProvider::new(vec![Message::assistant().with_text("x")]));
        let handled = Arc::new(AtomicU32::new(0));
        let seen = handled.clone();
        let agent = Agent::builder(provider)
            .middleware(failing(Trigger::OnCompletion).critical())
            .settings(settings)
            .on_error(move |_err| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .build()
            .unwrap();
        agent.add_message(Message::user().with_text("hi"));

        assert!(agent.main().await.unwrap().is_none());
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_critical_tool_middleware_failure_is_folded() {
        let settings = AgentSettings {
            max_middleware_retries: 1,
            ..Default::default()
        };
        let provider = Arc::new(MockProvider::new(vec![
            call_message("echo"),
            Message::assistant().with_text("handled"),
        ]));
        let agent = Agent::builder(provider)
            .tool(echo())
            .middleware(failing(Trigger::PreToolExecution))
            .settings(settings)
            .build()
            .unwrap();
        agent.add_message(Message::user().with_text("hi"));

        agent.main().await.unwrap();

        let history = agent.history();
        assert_eq!(
            history[1].tool_calls()[0].error.as_deref(),
            Some("blocked by guard")
        );
        let result = history[2].tool_results()[0];
        assert!(result.error);
        assert_eq!(result.result, "blocked by guard");
    }

    #[tokio::test]
    async fn test_provider_errors_are_rethrown() {
        let provider = Arc::new(MockProvider::new(vec![]).push_error(ProviderError::Api {
            status: 500,
            message: "boom".to_string(),
        }));
        let agent = Agent::builder(provider).build().unwrap();
        agent.add_message(Message::user().with_text("hi"));

        let err = agent.main().await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Provider(ProviderError::Api { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn test_max_tool_rounds() {
        let provider = Arc::new(MockProvider::new(vec![
            call_message("echo"),
            call_message("echo"),
            call_message("echo"),
        ]));
        let agent = Agent::builder(provider)
            .tool(echo())
            .settings(AgentSettings {
                max_tool_rounds: 2,
                ..Default::default()
            })
            .build()
            .unwrap();
        agent.add_message(Message::user().with_text("loop forever"));

        let err = agent.main().await.unwrap_err();
        assert!(matches!(err, AgentError::MaxToolRounds(2)));
        assert!(!agent.history().last().unwrap().has_tool_calls());
    }

    #[tokio::test]
    async fn test_finish_middleware_transform_returned_value_only() {
        let shout = |trigger| {
            Middleware::new("shout", trigger, |payload, _agent| {
                Box::pin(async move {
                    let text = payload.as_text().unwrap_or_default().to_uppercase();
                    Ok(Some(Payload::Text(TextContent { text })))
                })
            })
        };
        let provider = Arc::new(MockProvider::new(vec![Message::assistant().with_text("quiet")]));
        let agent = Agent::builder(provider)
            .middleware(shout(Trigger::PostProcess))
            .middleware(Middleware::new("exclaim", Trigger::OnMainFinish, |payload, _agent| {
                Box::pin(async move {
                    let text = format!("{}!", payload.as_text().unwrap_or_default());
                    Ok(Some(Payload::Text(TextContent { text })))
                })
            }))
            .build()
            .unwrap();
        agent.add_message(Message::user().with_text("hi"));

        let completion = agent.main().await.unwrap().unwrap();

        assert_eq!(completion.message.text(), "QUIET!");
        assert_eq!(agent.history()[1].text(), "quiet");
    }

    #[tokio::test]
    async fn test_newer_turn_supersedes_older() {
        let provider = Arc::new(
            MockProvider::new(vec![Message::assistant().with_text("answer")])
                .with_delay(Duration::from_millis(200)),
        );
        let agent = Agent::builder(provider.clone()).build().unwrap();
        agent.add_message(Message::user().with_text("hi"));

        let (first, second) = tokio::join!(agent.main(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            agent.main().await
        });

        assert!(first.unwrap().is_none());
        assert_eq!(second.unwrap().unwrap().message.text(), "answer");
        assert_eq!(provider.call_count(), 2);
        assert_eq!(agent.history().len(), 2);
        assert!(agent.cancellation().in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_continuation_with_parent_ids_is_not_aborted() {
        let provider = Arc::new(
            MockProvider::new(vec![
                Message::assistant().with_text("outer"),
                Message::assistant().with_text("inner"),
            ]),
        );
        let agent = Agent::builder(provider).build().unwrap();
        agent.add_message(Message::user().with_text("hi"));

        let outer = agent.cancellation().begin(&[]);
        let parents = outer.chain();
        let inner = agent
            .main_with(TurnOptions::default().with_parents(parents))
            .await
            .unwrap();

        assert!(inner.is_some());
        assert!(!outer.is_cancelled());
        assert_eq!(agent.cancellation().in_flight(), vec![outer.request_id]);

        // A finished continuation leaves the outer turn open to supersession
        agent.add_message(Message::user().with_text("again"));
        let newer = agent.main().await.unwrap();
        assert!(newer.is_some());
        assert!(outer.is_cancelled());
        assert!(agent.cancellation().in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_kill_aborts_turn() {
        let provider = Arc::new(
            MockProvider::new(vec![Message::assistant().with_text("late")])
                .with_delay(Duration::from_secs(30)),
        );
        let agent = Agent::builder(provider).build().unwrap();
        agent.add_message(Message::user().with_text("hi"));

        let (result, _) = tokio::join!(agent.main(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            agent.kill();
        });

        assert!(result.unwrap().is_none());
        assert_eq!(agent.history().len(), 1);
    }

    #[tokio::test]
    async fn test_trigger_without_adding_to_conversation() {
        let provider = Arc::new(MockProvider::new(vec![call_message("lookup")]));
        let lookup = Tool::new("lookup", "Look something up", vec![], |call, _agent| {
            Box::pin(async move { Ok(ToolOutput::from(format!("found {}", call.fn_args["text"]))) })
        })
        .enabled_when(|_| false)
        .allowlisted();
        let agent = Agent::builder(provider.clone()).tool(lookup).build().unwrap();
        agent.add_message(Message::user().with_text("hi"));

        let completion = agent.trigger("lookup", false).await.unwrap().unwrap();

        assert_eq!(completion.message.role, Role::User);
        assert_eq!(completion.message.tool_results()[0].result, "found \"hi\"");
        assert_eq!(agent.history().len(), 1);

        let request = &provider.requests()[0];
        assert_eq!(request.tool_choice, ToolChoice::Tool("lookup".to_string()));
        assert_eq!(request.tools.len(), 1);
    }

    #[tokio::test]
    async fn test_trigger_added_to_conversation_continues_turn() {
        let provider = Arc::new(MockProvider::new(vec![
            call_message("echo"),
            Message::assistant().with_text("after trigger"),
        ]));
        let agent = Agent::builder(provider.clone()).tool(echo()).build().unwrap();
        agent.add_message(Message::user().with_text("hi"));

        let completion = agent.trigger("echo", true).await.unwrap().unwrap();

        assert_eq!(completion.message.text(), "after trigger");
        assert_eq!(agent.history().len(), 4);
        assert_eq!(provider.requests()[1].tool_choice, ToolChoice::Auto);
    }

    #[tokio::test]
    async fn test_trigger_runs_on_completion_middleware() {
        let forced = || {
            Message::assistant()
                .with_text("calling echo")
                .with_tool_call("call_1", "echo", json!({"text": "hi"}))
        };
        let provider = Arc::new(MockProvider::new(vec![
            forced(),
            forced(),
            Message::assistant().with_text("done"),
        ]));
        let shout = Middleware::new("shout", Trigger::OnCompletion, |payload, _agent| {
            Box::pin(async move {
                let text = payload.as_text().unwrap_or_default().to_uppercase();
                Ok(Some(Payload::Text(TextContent { text })))
            })
        });
        let agent = Agent::builder(provider.clone())
            .tool(echo())
            .middleware(flaky(Trigger::OnCompletion).with_order(0))
            .middleware(shout.with_order(1))
            .build()
            .unwrap();
        agent.add_message(Message::user().with_text("hi"));

        let completion = agent.trigger("echo", true).await.unwrap().unwrap();

        assert_eq!(provider.call_count(), 3);
        assert_eq!(completion.message.text(), "DONE");
        let history = agent.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[1].text(), "CALLING ECHO");
        assert_eq!(history[1].tool_calls().len(), 1);
        assert!(history.iter().all(|message| message.role != Role::System));
    }

    #[tokio::test]
    async fn test_trigger_unknown_or_hidden_tool() {
        let hidden = echo().enabled_when(|_| false);
        let agent = Agent::builder(Arc::new(MockProvider::new(vec![])))
            .tool(hidden)
            .build()
            .unwrap();

        assert!(matches!(
            agent.trigger("echo", false).await,
            Err(AgentError::ToolNotFound(_))
        ));
        assert!(matches!(
            agent.trigger("nope", false).await,
            Err(AgentError::ToolNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_streaming_and_provider_override() {
        let default_provider = Arc::new(MockProvider::new(vec![]));
        let override_provider =
            Arc::new(MockProvider::new(vec![Message::assistant().with_text("streamed")]));
        let agent = Agent::builder(default_provider.clone()).build().unwrap();
        agent.add_message(Message::user().with_text("hi"));

        let buffers = Arc::new(Mutex::new(Vec::new()));
        let sink = buffers.clone();
        let options = TurnOptions::default()
            .with_provider(override_provider.clone())
            .with_stream_callback(Arc::new(move |chunk: &StreamChunk| {
                sink.lock().unwrap().push(chunk.buffer.clone());
            }));

        let completion = agent.main_with(options).await.unwrap().unwrap();

        assert_eq!(completion.message.text(), "streamed");
        assert_eq!(*buffers.lock().unwrap(), vec!["streamed".to_string()]);
        assert!(override_provider.requests()[0].stream);
        assert_eq!(default_provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_history_limit_trims_requests() {
        let provider = Arc::new(MockProvider::new(vec![Message::assistant().with_text("ok")]));
        let agent = Agent::builder(provider.clone())
            .history(vec![
                Message::user().with_text("one"),
                Message::assistant().with_text("two"),
                Message::user().with_text("three"),
            ])
            .settings(AgentSettings {
                history_limit: Some(1),
                ..Default::default()
            })
            .build()
            .unwrap();

        agent.main().await.unwrap();

        let request = &provider.requests()[0];
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].text(), "three");
    }

    #[tokio::test]
    async fn test_trace_events_for_turn() {
        let provider = Arc::new(MockProvider::new(vec![
            call_message("echo"),
            Message::assistant().with_text("done"),
        ]));
        let agent = Agent::builder(provider).tool(echo()).build().unwrap();
        let mut events = agent.subscribe();
        agent.add_message(Message::user().with_text("hi"));

        agent.main().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push((event.kind, event.phase, event.status));
        }
        assert_eq!(seen.first(), Some(&(TraceKind::Main, TracePhase::Start, None)));
        assert_eq!(
            seen.last(),
            Some(&(TraceKind::Main, TracePhase::End, Some(TraceStatus::Success)))
        );
        assert!(seen.contains(&(
            TraceKind::ToolExecution,
            TracePhase::End,
            Some(TraceStatus::Success)
        )));
    }

    struct Research;

    impl Plugin for Research {
        fn name(&self) -> &str {
            "research"
        }

        fn instructions(&self) -> Option<String> {
            Some("Cite your sources.".to_string())
        }

        fn tools(&self) -> Vec<Tool> {
            vec![Tool::new("search", "Search the web", vec![], |_call, _agent| {
                Box::pin(async move { Ok(ToolOutput::from("results")) })
            })]
        }
    }

    #[tokio::test]
    async fn test_plugins_compose_after_own_registrations() {
        let provider = Arc::new(MockProvider::new(vec![Message::assistant().with_text("ok")]));
        let agent = Agent::builder(provider.clone())
            .plugin(Research)
            .system_prompt("You are helpful.")
            .tool(echo())
            .build()
            .unwrap();
        agent.add_message(Message::user().with_text("hi"));

        agent.main().await.unwrap();

        let request = &provider.requests()[0];
        assert_eq!(request.system, vec!["You are helpful.", "Cite your sources."]);
        let names: Vec<&str> = request.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "search"]);
    }

    #[test]
    fn test_build_rejects_duplicate_tools_and_bad_schemas() {
        let result = Agent::builder(Arc::new(MockProvider::new(vec![])))
            .tool(echo())
            .tool(echo())
            .build();
        assert!(matches!(result, Err(AgentError::Internal(_))));

        let bad = Tool::new(
            "bad",
            "Array without items",
            vec![Param {
                kind: crate::models::tool::ParamType::Array,
                ..Param::string("list")
            }],
            |_call, _agent| Box::pin(async move { Ok(ToolOutput::default()) }),
        );
        let result = Agent::builder(Arc::new(MockProvider::new(vec![])))
            .tool(bad)
            .build();
        assert!(matches!(result, Err(AgentError::Schema(_))));
    }

    #[test]
    fn test_system_prompt_template() {
        let agent = Agent::builder(Arc::new(MockProvider::new(vec![])))
            .system_prompt_template("You speak {{ language }}.", &json!({"language": "Dutch"}))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(agent.system_prompts(), &["You speak Dutch.".to_string()]);

        let result = Agent::builder(Arc::new(MockProvider::new(vec![])))
            .system_prompt_template("{{ missing }}", &json!({}));
        assert!(matches!(result, Err(AgentError::Template(_))));
    }

    #[tokio::test]
    async fn test_handle_envelope() {
        let provider = Arc::new(MockProvider::new(vec![Message::assistant().with_text("hey")]));
        let agent = Agent::builder(provider).build().unwrap();

        let replies = agent
            .handle_envelope(RealtimeEnvelope::Message(Message::user().with_text("hi")))
            .await;
        assert_eq!(replies.len(), 2);
        assert!(matches!(&replies[0], RealtimeEnvelope::Message(m) if m.text() == "hey"));
        assert!(matches!(replies[1], RealtimeEnvelope::Usage(_)));

        assert!(agent.handle_envelope(RealtimeEnvelope::Abort).await.is_empty());

        let replies = agent.handle_envelope(RealtimeEnvelope::AudioCommit).await;
        assert!(matches!(&replies[0], RealtimeEnvelope::Error(e) if e.message.contains("audio.commit")));
    }

    #[derive(Default)]
    struct RecordingScheduler {
        scheduled: Mutex<Vec<String>>,
        cancelled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobScheduler for RecordingScheduler {
        async fn schedule(&self, job: Job) -> anyhow::Result<()> {
            self.scheduled.lock().unwrap().push(job.name.clone());
            Ok(())
        }

        async fn cancel(&self, name: &str) -> anyhow::Result<()> {
            self.cancelled.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    fn summarize(agent: &Agent) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            agent.add_message(Message::user().with_text("summarize the day"));
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_jobs_are_handed_to_scheduler() {
        let agent = Agent::builder(Arc::new(MockProvider::new(vec![])))
            .job(Job::new("daily", "0 18 * * *", summarize).unwrap())
            .build()
            .unwrap();
        let scheduler = RecordingScheduler::default();

        assert_eq!(agent.schedule_jobs(&scheduler).await.unwrap(), 1);
        assert_eq!(agent.cancel_jobs(&scheduler).await.unwrap(), 1);
        assert_eq!(*scheduler.scheduled.lock().unwrap(), vec!["daily".to_string()]);
        assert_eq!(*scheduler.cancelled.lock().unwrap(), vec!["daily".to_string()]);

        agent.jobs()[0].run(&agent).await.unwrap();
        assert_eq!(agent.history().len(), 1);
    }
}
