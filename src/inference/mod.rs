//! The inference control plane: lifecycle, execution, and the engine façade
//! that composes them for the HTTP layer.

pub mod engine;
pub mod generate;
pub mod lifecycle;
pub mod speculative;
pub mod tool_calls;
pub mod types;

pub use engine::InferenceEngine;
pub use generate::{DeltaStream, GenerationExecutor, StreamHandle};
pub use lifecycle::{LoadRequest, LoadedModels, ModelLifecycleManager, ProbeResult};
pub use types::{
    ChatMessage, CompletionResult, GenerateParams, LoadedModel, ModelInfo, RequestTelemetry,
    ResponseMessage, SpeculativeTelemetry, ToolCallOut, Usage,
};
