//! Stateless shape conversions between the three protocols, plus the
//! stateful per-stream adapters that map upstream deltas onto Anthropic
//! events.

pub mod cloud;
pub mod openai;
