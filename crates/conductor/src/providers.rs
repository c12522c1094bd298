pub mod anthropic;
pub mod base;
pub mod configs;
pub mod errors;
pub mod factory;
pub mod google;
pub mod groq;
pub mod openai;
pub mod retry;
pub mod utils;

#[cfg(test)]
pub mod mock;
