//! Model adapters and the agent runtime.
//!
//! `client` defines the uniform `call(system, user) → reply` surface over
//! local and cloud model endpoints; `repair` is the deterministic JSON
//! recovery stage; `runtime` drives the full agent lifecycle including the
//! LLM recovery stages; `classifier` is the tier-1 micro router agent.

pub mod adapters;
pub mod classifier;
pub mod client;
pub mod repair;
pub mod runtime;
