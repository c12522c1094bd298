use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

use crate::agent::Agent;
use crate::models::content::ToolCallContent;
use crate::models::tool::{Param, ToolSpec};

/// What a tool hands back to the model
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    pub error: bool,
}

impl ToolOutput {
    pub fn error<S: Into<String>>(content: S) -> Self {
        Self {
            content: content.into(),
            error: true,
        }
    }
}

impl From<String> for ToolOutput {
    fn from(content: String) -> Self {
        Self {
            content,
            error: false,
        }
    }
}

impl From<&str> for ToolOutput {
    fn from(content: &str) -> Self {
        content.to_string().into()
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, call: &ToolCallContent, agent: &Agent) -> Result<ToolOutput>;
}

#[async_trait]
impl<F> ToolHandler for F
where
    F: for<'a> Fn(&'a ToolCallContent, &'a Agent) -> BoxFuture<'a, Result<ToolOutput>>
        + Send
        + Sync,
{
    async fn call(&self, call: &ToolCallContent, agent: &Agent) -> Result<ToolOutput> {
        (self)(call, agent).await
    }
}

pub type EnabledFn = Arc<dyn Fn(&Agent) -> bool + Send + Sync>;

/// A callable tool registered with an agent
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub params: Vec<Param>,
    pub handler: Arc<dyn ToolHandler>,
    pub enabled: EnabledFn,
    /// May run through a manual trigger even when `enabled` says no
    pub allowlist: bool,
}

impl Tool {
    /// Create a tool from an async closure
    pub fn new<N, D, F>(name: N, description: D, params: Vec<Param>, handler: F) -> Self
    where
        N: Into<String>,
        D: Into<String>,
        F: for<'a> Fn(&'a ToolCallContent, &'a Agent) -> BoxFuture<'a, Result<ToolOutput>>
            + Send
            + Sync
            + 'static,
    {
        Self::with_handler(name, description, params, Arc::new(handler))
    }

    pub fn with_handler<N, D>(
        name: N,
        description: D,
        params: Vec<Param>,
        handler: Arc<dyn ToolHandler>,
    ) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        Self {
            name: name.into(),
            description: description.into(),
            params,
            handler,
            enabled: Arc::new(|_| true),
            allowlist: false,
        }
    }

    pub fn enabled_when<F>(mut self, enabled: F) -> Self
    where
        F: Fn(&Agent) -> bool + Send + Sync + 'static,
    {
        self.enabled = Arc::new(enabled);
        self
    }

    pub fn allowlisted(mut self) -> Self {
        self.allowlist = true;
        self
    }

    pub fn is_enabled(&self, agent: &Agent) -> bool {
        (self.enabled)(agent)
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec::new(&self.name, &self.description, self.params.clone())
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("params", &self.params)
            .field("allowlist", &self.allowlist)
            .finish()
    }
}
