/// Loopway: loop-aware workflow execution engine
///
/// This library runs serialized block graphs that contain loop regions. Loops
/// are scheduled as repeatable subgraphs on top of a petgraph DAG ordering,
/// with fixed-count (`for`) and collection (`forEach`) semantics.

// Core configuration and setup
pub mod config;

// Graph model layer - blocks, connections, loops and their storage
pub mod workflow;

// Runtime execution engine - context, path tracking, loop manager, scheduling driver
pub mod runtime;

// Re-export commonly used types for external consumers
pub use config::{Config, EngineConfig};
pub use runtime::{
    BlockExecutor, BlockScope, ExecutionContext, ExecutionEngine, ExecutionResult, LoopManager,
    LuaBlockExecutor, PathTracker,
};
pub use workflow::{Block, BlockKind, Connection, EdgeKind, Loop, LoopType, SerializedWorkflow};
