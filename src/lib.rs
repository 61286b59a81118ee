pub mod config;
pub mod pipulate;
pub mod queue;
pub mod state;
pub mod steps;
pub mod store;
pub mod stream;
pub mod tools;

pub use pipulate::Pipulate;
pub use queue::{MessageKind, MessageQueue, MessageSink, UiMessage};
pub use state::{JsonMap, StateAccessor, StateError};
pub use steps::{StepDef, StepSequence};
pub use store::{PipelineRecord, Store, StoreError};
pub use stream::{ChunkSink, StreamInterceptor, StreamOutcome};
pub use tools::{Tool, ToolCall, ToolRegistry, ToolResult};
