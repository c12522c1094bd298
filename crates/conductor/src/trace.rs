use chrono::Utc;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::cancellation::RequestId;

pub const DEFAULT_TRACE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TraceKind {
    Trigger,
    Main,
    Middleware,
    ToolExecution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TracePhase {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Success,
    Error,
    Aborted,
}

/// A start or end marker for one unit of agent work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    #[serde(rename = "type")]
    pub kind: TraceKind,
    pub phase: TracePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TraceStatus>,
    pub request_id: RequestId,
    /// Milliseconds since the unix epoch
    pub timestamp: i64,
    pub data: Value,
}

impl TraceEvent {
    pub fn start(kind: TraceKind, request_id: RequestId, data: Value) -> Self {
        Self {
            kind,
            phase: TracePhase::Start,
            status: None,
            request_id,
            timestamp: Utc::now().timestamp_millis(),
            data,
        }
    }

    pub fn end(kind: TraceKind, request_id: RequestId, status: TraceStatus, data: Value) -> Self {
        Self {
            phase: TracePhase::End,
            status: Some(status),
            ..Self::start(kind, request_id, data)
        }
    }
}

/// Fan out of trace events to any number of subscribers. Emitting with nobody listening
/// is not an error.
#[derive(Debug, Clone)]
pub struct Tracer {
    sender: broadcast::Sender<TraceEvent>,
}

impl Tracer {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TraceEvent> {
        self.sender.subscribe()
    }

    /// Events emitted from now on. A subscriber that falls behind skips what it missed.
    pub fn stream(&self) -> impl Stream<Item = TraceEvent> {
        let mut receiver = self.subscribe();
        async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "trace subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    pub fn emit(&self, event: TraceEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new(DEFAULT_TRACE_CAPACITY)
    }
}
