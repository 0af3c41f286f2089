/// Graph Model Layer
///
/// Static description of a workflow as consumed by the engine:
/// - Type definitions (SerializedWorkflow, Block, Connection, Loop)
/// - File-backed storage for serialized workflows

// Core graph type definitions
pub mod types;

// JSON file persistence for serialized workflows
pub mod storage;

// Re-export commonly used types
pub use storage::WorkflowStorage;
pub use types::{Block, BlockKind, Connection, EdgeKind, Loop, LoopType, SerializedWorkflow};
