/// Per-run execution state
///
/// Everything the scheduler mutates during one workflow run lives here. The
/// context is owned by the driver and passed by reference to the path tracker
/// and the loop manager; nothing is kept in globals.

use crate::workflow::types::SerializedWorkflow;
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

/// Last output recorded for a block
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockState {
    pub output: Value,
}

impl BlockState {
    pub fn new(output: Value) -> Self {
        Self { output }
    }

    /// Whether the output carries an error marker (`error` or `response.error`)
    pub fn has_error(&self) -> bool {
        let marked = |v: Option<&Value>| v.is_some_and(|e| !e.is_null());
        marked(self.output.get("error"))
            || marked(self.output.get("response").and_then(|r| r.get("error")))
    }
}

/// Branch choices recorded by condition and router blocks
#[derive(Debug, Clone, Default)]
pub struct Decisions {
    /// Condition block id -> selected condition id
    pub condition: HashMap<String, String>,
    /// Router block id -> selected target block id
    pub router: HashMap<String, String>,
}

/// Mutable state of one workflow run
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Unique id of this run
    pub execution_id: String,
    /// Read-only graph being executed
    pub workflow: Arc<SerializedWorkflow>,
    /// Blocks that produced output in the current pass/iteration
    pub executed_blocks: HashSet<String>,
    /// Blocks eligible to run next
    pub active_execution_path: HashSet<String>,
    /// Completed iterations per loop; absent means 0
    pub loop_iterations: HashMap<String, usize>,
    /// Current for-each item per loop
    pub loop_items: HashMap<String, Value>,
    /// Loops whose bound has been reached; never reset again
    pub completed_loops: HashSet<String>,
    /// Per-iteration snapshots of loop node outputs
    pub loop_results: HashMap<String, Vec<IndexMap<String, Value>>>,
    /// Last output per block, in first-recorded order
    pub block_states: IndexMap<String, BlockState>,
    /// Condition/router decisions
    pub decisions: Decisions,
    /// Execution metadata (workflow_id, execution_id, started_at)
    pub metadata: HashMap<String, Value>,
}

impl ExecutionContext {
    /// Create a fresh context for one run of `workflow`
    pub fn new(workflow: Arc<SerializedWorkflow>) -> Self {
        let execution_id = uuid::Uuid::new_v4().to_string();

        let mut metadata = HashMap::new();
        metadata.insert("workflow_id".to_string(), Value::String(workflow.id.clone()));
        metadata.insert("execution_id".to_string(), Value::String(execution_id.clone()));
        metadata.insert(
            "started_at".to_string(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );

        Self {
            execution_id,
            workflow,
            executed_blocks: HashSet::new(),
            active_execution_path: HashSet::new(),
            loop_iterations: HashMap::new(),
            loop_items: HashMap::new(),
            completed_loops: HashSet::new(),
            loop_results: HashMap::new(),
            block_states: IndexMap::new(),
            decisions: Decisions::default(),
            metadata,
        }
    }

    /// Record a block's output and mark it executed
    pub fn record_output(&mut self, block_id: &str, output: Value) {
        self.block_states
            .insert(block_id.to_string(), BlockState::new(output));
        self.executed_blocks.insert(block_id.to_string());
    }

    /// Last recorded output of a block
    pub fn output(&self, block_id: &str) -> Option<&Value> {
        self.block_states.get(block_id).map(|s| &s.output)
    }

    /// Whether the block's last output signals an error
    pub fn has_error(&self, block_id: &str) -> bool {
        self.block_states
            .get(block_id)
            .is_some_and(BlockState::has_error)
    }

    /// Put a block back on the active path
    pub fn activate(&mut self, block_id: &str) {
        self.active_execution_path.insert(block_id.to_string());
    }

    /// Completed iterations of a loop
    pub fn iteration(&self, loop_id: &str) -> usize {
        self.loop_iterations.get(loop_id).copied().unwrap_or(0)
    }

    /// All recorded outputs as a JSON object, in recorded order
    pub fn outputs(&self) -> serde_json::Map<String, Value> {
        self.block_states
            .iter()
            .map(|(id, state)| (id.clone(), state.output.clone()))
            .collect()
    }

    /// JSON view of the context bound as `context` in sandboxed expressions
    pub fn to_expression_scope(&self) -> Value {
        let block_states: serde_json::Map<String, Value> = self
            .block_states
            .iter()
            .map(|(id, state)| (id.clone(), json!({ "output": state.output })))
            .collect();

        let mut executed: Vec<&String> = self.executed_blocks.iter().collect();
        executed.sort();
        let mut active: Vec<&String> = self.active_execution_path.iter().collect();
        active.sort();

        json!({
            "workflowId": self.workflow.id,
            "executionId": self.execution_id,
            "blockStates": block_states,
            "loopIterations": self.loop_iterations,
            "loopItems": self.loop_items,
            "executedBlocks": executed,
            "activeExecutionPath": active,
            "metadata": self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_context() -> ExecutionContext {
        ExecutionContext::new(Arc::new(SerializedWorkflow {
            id: "wf".to_string(),
            name: String::new(),
            blocks: vec![],
            connections: vec![],
            loops: IndexMap::new(),
        }))
    }

    #[test]
    fn error_marker_detection() {
        assert!(BlockState::new(json!({ "error": "boom" })).has_error());
        assert!(BlockState::new(json!({ "response": { "error": { "code": 1 } } })).has_error());
        assert!(!BlockState::new(json!({ "error": null })).has_error());
        assert!(!BlockState::new(json!([1, 2])).has_error());
    }

    #[test]
    fn record_output_marks_executed() {
        let mut ctx = empty_context();
        ctx.record_output("a", json!({ "n": 1 }));
        ctx.record_output("b", json!(2));
        ctx.record_output("a", json!({ "n": 3 }));

        assert!(ctx.executed_blocks.contains("a"));
        assert_eq!(ctx.output("a"), Some(&json!({ "n": 3 })));
        // re-recording keeps first-recorded position
        let order: Vec<_> = ctx.block_states.keys().cloned().collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn expression_scope_exposes_block_outputs() {
        let mut ctx = empty_context();
        ctx.record_output("fetch", json!({ "items": [1, 2] }));
        ctx.loop_iterations.insert("l".to_string(), 2);

        let scope = ctx.to_expression_scope();
        assert_eq!(scope["blockStates"]["fetch"]["output"]["items"], json!([1, 2]));
        assert_eq!(scope["loopIterations"]["l"], json!(2));
        assert_eq!(scope["executedBlocks"], json!(["fetch"]));
        assert_eq!(scope["workflowId"], json!("wf"));
    }
}
