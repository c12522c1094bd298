//! Request tracking for agent turns.
//!
//! Every `main` or `trigger` call registers a [`RequestContext`]. Starting a new top level
//! request aborts every in flight request that is not one of its ancestors, so the latest
//! turn wins while continuations of a turn keep their own chain alive.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        RequestId(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub parent_request_ids: Vec<RequestId>,
    token: CancellationToken,
    /// Leading ancestors that were handed to `begin` and belong to someone else
    inherited: usize,
}

impl RequestContext {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Ancestors followed by this request
    pub fn chain(&self) -> Vec<RequestId> {
        let mut chain = self.parent_request_ids.clone();
        chain.push(self.request_id);
        chain
    }
}

#[derive(Debug, Default)]
pub struct CancellationManager {
    handles: Mutex<HashMap<RequestId, CancellationToken>>,
}

impl CancellationManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<RequestId, CancellationToken>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new request whose ancestors are `parent_request_ids`, aborting every
    /// outstanding request outside that chain.
    pub fn begin(&self, parent_request_ids: &[RequestId]) -> RequestContext {
        let mut handles = self.handles();
        handles.retain(|id, token| {
            if parent_request_ids.contains(id) {
                true
            } else {
                tracing::debug!(request_id = %id, "aborting superseded request");
                token.cancel();
                false
            }
        });

        // Children of the nearest live ancestor die with it
        let token = parent_request_ids
            .iter()
            .rev()
            .find_map(|id| handles.get(id))
            .map(CancellationToken::child_token)
            .unwrap_or_default();

        let request_id = RequestId::new();
        handles.insert(request_id, token.clone());

        RequestContext {
            request_id,
            parent_request_ids: parent_request_ids.to_vec(),
            token,
            inherited: parent_request_ids.len(),
        }
    }

    /// Register a continuation of `ctx`, such as a loop back after tool execution or a
    /// middleware retry. The continuation is cancelled whenever `ctx` is.
    pub fn continue_from(&self, ctx: &RequestContext) -> RequestContext {
        let chain = ctx.chain();
        let token = ctx.token.child_token();
        let request_id = RequestId::new();

        // A superseded chain stays dead and must not disturb whatever replaced it
        if !token.is_cancelled() {
            self.handles().insert(request_id, token.clone());
        }

        RequestContext {
            request_id,
            parent_request_ids: chain,
            token,
            inherited: ctx.inherited,
        }
    }

    /// Forget a finished request and the continuations it grew from. Ancestors passed to
    /// `begin` are left registered, since their owner is still running.
    pub fn release(&self, ctx: &RequestContext) {
        let mut handles = self.handles();
        for id in ctx.chain().iter().skip(ctx.inherited) {
            handles.remove(id);
        }
    }

    /// Abort and forget every in flight request
    pub fn kill(&self) {
        let mut handles = self.handles();
        for (id, token) in handles.drain() {
            tracing::debug!(request_id = %id, "killing request");
            token.cancel();
        }
    }

    pub fn in_flight(&self) -> Vec<RequestId> {
        self.handles().keys().copied().collect()
    }
}
