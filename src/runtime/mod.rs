/// Runtime Execution Engine
///
/// This module runs serialized workflows that contain loop regions:
/// - Per-run execution context (executed blocks, active path, loop counters)
/// - Active-path propagation and edge liveness
/// - Loop iteration bookkeeping, resets and exits
/// - Pass-based scheduling driver over a petgraph ordering

// Mutable per-run state
pub mod context;

// Active execution path propagation
pub mod path;

// Loop completion, reset and exit handling
pub mod loops;

// forEach collection resolution
pub mod for_each;

// Sandboxed Lua evaluation
pub mod sandbox;

// Block executor interface and the built-in Lua executor
pub mod executor;

// Scheduling driver
pub mod engine;

// Re-export main types
pub use context::{BlockState, Decisions, ExecutionContext};
pub use engine::{ExecutionEngine, ExecutionPlan};
pub use executor::{BlockExecutor, BlockScope, ExecutionResult, LuaBlockExecutor};
pub use loops::LoopManager;
pub use path::{is_connection_live, PathTracker};
pub use sandbox::LuaSandbox;
