//! Wire types for the three protocols the proxy speaks.

pub mod anthropic;
pub mod cloud_code;
pub mod openai;
