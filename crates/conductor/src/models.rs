//! These models represent the objects passed around by the agent
//!
//! There are several different related formats we need to interact with:
//! - openai (and groq) chat completion messages/tools, sent from the agent to the LLM
//! - anthropic messages/tools, sent from the agent to the LLM
//! - google gemini contents/function declarations, sent from the agent to the LLM
//! - realtime envelopes, exchanged with a bridge that owns a socket
//!
//! These all overlap to varying degrees. We always immediately convert those data models
//! into the internal structs using to/from helpers. Because of the need for compatibility,
//! the internal models are not an exact match to any of these formats.
pub mod content;
pub mod history;
pub mod message;
pub mod role;
pub mod tool;
