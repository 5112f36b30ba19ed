//! These models represent the objects passed through an invocation
//!
//! There are a few related formats we need to interact with:
//! - chat messages and request hints, sent from the interface to the orchestrator
//! - canonical events, sent from the orchestrator back to the interface
//! - provider specific payloads, produced and consumed only inside `backends`
//!
//! Interface formats are converted into these structs at the edge; backend
//! formats never leak past the normalizer.
pub mod event;
pub mod message;
pub mod request;
pub mod role;
pub mod usage;
