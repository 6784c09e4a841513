mod context;
mod conversation;
mod orchestrator;
mod prompts;
mod tools;

pub use context::{
    ContextError, ContextSearch, EditContext, KeywordSearch, ProjectManifest, SearchResult,
    build_edit_context, infer_edit_type,
};
pub use conversation::ConversationStore;
pub use orchestrator::{
    GenerationContext, GenerationError, GenerationOrchestrator, GenerationOutcome,
    GenerationRequest, GenerationState,
};
pub use prompts::{GENERATION_SYSTEM_PROMPT, build_system_prompt};
pub use tools::SearchProjectTool;
