//! Agent dispatch: capacity-matched task assignment and a four-phase
//! plan / research / execute / review pipeline over a local LLM.

pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod research;
pub mod store;
pub mod tasks;
pub mod worker;
pub mod workspace;
