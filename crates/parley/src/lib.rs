pub mod backends;
pub mod config;
pub mod errors;
pub mod framing;
pub mod models;
pub mod normalizer;
pub mod orchestrator;
pub mod prompt;
pub mod protocol;
pub mod retry;
pub mod sink;
