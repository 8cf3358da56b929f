pub mod gateway;
pub mod provider;

pub use gateway::{CompletionParams, Gateway};
pub use provider::{
    ChatMessage, ChatProvider, ChatRequest, HttpProvider, RawCompletion, ResolvedLlmConfig,
};
