//! Wire types for the OpenAI-compatible client surface.

pub mod chat_completion;
pub mod completions;
pub mod embeddings;

pub use chat_completion::{
    AssistantMessage, ChatChoice, ChatCompletion, ChatCompletionChunk, ChunkChoice, ChunkDelta,
    CreateChatCompletionPayload, FinishReason, Message, MessageContent, Usage,
};
pub use completions::{Completion, CompletionPrompt, CreateCompletionPayload};
pub use embeddings::{CreateEmbeddingPayload, CreateEmbeddingResponse, EmbeddingInput};
