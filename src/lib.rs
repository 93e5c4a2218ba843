//! Tandem is a terminal chat client that can ride two kinds of inference at
//! once: hosted LLM APIs when the network cooperates, and an on-device model
//! when it does not. A send that fails online is retried once against the
//! local engine without losing the conversation.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns conversation state, backend descriptors, mode selection,
//!   setup/readiness, and the session orchestrator that drives a send from
//!   first token to finalized turn.
//! - [`adapters`] translate the conversation into each provider's wire
//!   protocol and normalize the reply streams into one token-event shape.
//! - [`local`] defines the seam to an opaque on-device inference engine.
//! - [`provision`] acquires model files over HTTP with progress and
//!   cancellation.
//! - [`api`] defines the serde payloads spoken on each wire.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`cli::run`], which wires a [`core::session::ChatSession`] to a
//! line-oriented prompt loop.

pub mod adapters;
pub mod api;
pub mod cli;
pub mod core;
pub mod local;
pub mod provision;
pub mod utils;
