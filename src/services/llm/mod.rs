//! Thin HTTP layer over OpenAI-compatible chat-completion APIs, shared by
//! unit normalization (C5), analyte mapping (C6), and the agentic SQL loop
//! (C8). No persisted provider/session/cache state -- provider config comes
//! straight from `Config::llm`.

mod client;

pub use client::{
    ChatMessage, LlmClient, LlmEndpoint, LlmError, ResponseMessage, ToolCall, ToolCallFunction,
    ToolFunctionSpec, ToolSpec,
};
