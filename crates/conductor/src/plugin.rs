use crate::jobs::Job;
use crate::middleware::Middleware;
use crate::tool::Tool;

/// A bundle of capabilities registered with an agent in one call.
///
/// Collections compose by concatenation: the agent's own tools, middleware and jobs come
/// first, then each plugin's in the order the plugins were added.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Appended to the agent's system prompts when non-empty
    fn instructions(&self) -> Option<String> {
        None
    }

    fn tools(&self) -> Vec<Tool> {
        Vec::new()
    }

    fn middleware(&self) -> Vec<Middleware> {
        Vec::new()
    }

    fn jobs(&self) -> Vec<Job> {
        Vec::new()
    }
}
