pub mod agent;
pub mod cancellation;
pub mod configuration;
pub mod errors;
pub mod executor;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod plugin;
pub mod prompt_template;
pub mod providers;
pub mod realtime;
pub mod tool;
pub mod trace;
