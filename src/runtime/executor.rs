/// Block execution handlers
///
/// The scheduler does not know what a block does; it hands each ready block
/// to a `BlockExecutor` together with a `BlockScope` describing the loop state
/// the block runs in. `LuaBlockExecutor` is the built-in executor that runs a
/// block's Lua script in the sandbox.

use crate::runtime::sandbox::{json_to_lua_literal, LuaSandbox};
use crate::workflow::types::{Block, BlockKind};
use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;

static LOOP_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<loop\.(index|currentItem|items)>").expect("valid loop reference pattern")
});

/// What a block sees of the run when it executes
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockScope {
    /// Block being executed
    pub block_id: String,
    /// Loop the block belongs to, if any
    pub loop_id: Option<String>,
    /// Completed iterations of that loop
    pub loop_index: Option<usize>,
    /// Current for-each item of that loop
    pub current_item: Option<Value>,
    /// Resolved for-each collection of that loop
    pub items: Option<Value>,
    /// Snapshot of every recorded block output
    pub outputs: serde_json::Map<String, Value>,
}

impl BlockScope {
    /// `loop` table exposed to scripts: `{ index, item, items }`
    pub fn loop_value(&self) -> Value {
        match &self.loop_id {
            Some(loop_id) => json!({
                "id": loop_id,
                "index": self.loop_index.unwrap_or(0),
                "item": self.current_item.clone().unwrap_or(Value::Null),
                "items": self.items.clone().unwrap_or(Value::Null),
            }),
            None => Value::Null,
        }
    }
}

/// Executes a single block
///
/// Implementations return the block's output; an `Err` is recorded as an
/// error output when the block has an error path and fails the run otherwise.
#[async_trait]
pub trait BlockExecutor: Send + Sync {
    async fn execute(&self, block: &Block, scope: &BlockScope) -> Result<Value>;
}

/// Result of executing a whole workflow
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Last output of every executed block, in first-recorded order
    pub outputs: serde_json::Map<String, Value>,
    /// Completed iterations per loop
    pub loop_iterations: HashMap<String, usize>,
    /// Per-iteration outputs of loop nodes
    pub loop_results: HashMap<String, Vec<IndexMap<String, Value>>>,
    /// Scheduling passes used
    pub passes: usize,
    /// Execution metadata (workflow_id, execution_id, timestamps)
    pub metadata: HashMap<String, Value>,
}

/// Runs `config.script` (Lua) for each block
///
/// Scripts see `input` (all recorded outputs by block id) and `loop`
/// (`index`, `item`, `items`, `id`). `<loop.index>`, `<loop.currentItem>` and
/// `<loop.items>` references are replaced by Lua literals before evaluation.
/// Blocks without a script pass `config.value` through.
#[derive(Debug, Clone, Default)]
pub struct LuaBlockExecutor {
    sandbox: LuaSandbox,
}

impl LuaBlockExecutor {
    pub fn new(sandbox: LuaSandbox) -> Self {
        Self { sandbox }
    }

    fn run_script(&self, block: &Block, script: &str, scope: &BlockScope) -> Result<Value> {
        let source = resolve_loop_references(script, scope);
        tracing::debug!("📝 Lua script for '{}': {}", block.id, source);

        let input = Value::Object(scope.outputs.clone());
        let loop_value = scope.loop_value();
        let result = self
            .sandbox
            .eval(&source, &[("input", &input), ("loop", &loop_value)])
            .map_err(|e| anyhow::anyhow!("Lua script failed in block '{}': {}", block.id, e))?;

        Ok(shape_output(block.kind, result))
    }
}

#[async_trait]
impl BlockExecutor for LuaBlockExecutor {
    async fn execute(&self, block: &Block, scope: &BlockScope) -> Result<Value> {
        tracing::debug!("🧠 Executing block '{}' ({:?})", block.id, block.kind);

        match block.config.get("script").and_then(Value::as_str) {
            Some(script) => self.run_script(block, script, scope),
            None => Ok(shape_output(
                block.kind,
                block.config.get("value").cloned().unwrap_or(Value::Null),
            )),
        }
    }
}

/// Replace `<loop.*>` references with Lua literals
pub fn resolve_loop_references(script: &str, scope: &BlockScope) -> String {
    LOOP_REFERENCE
        .replace_all(script, |caps: &regex::Captures| {
            let value = match &caps[1] {
                "index" => json!(scope.loop_index.unwrap_or(0)),
                "currentItem" => scope.current_item.clone().unwrap_or(Value::Null),
                _ => scope.items.clone().unwrap_or(Value::Null),
            };
            json_to_lua_literal(&value)
        })
        .into_owned()
}

/// Wrap string results of decision blocks into the shape the path tracker reads
fn shape_output(kind: BlockKind, result: Value) -> Value {
    match (kind, result) {
        (BlockKind::Condition, Value::String(id)) => json!({ "selectedConditionId": id }),
        (BlockKind::Router, Value::String(target)) => json!({ "selectedPath": { "blockId": target } }),
        (_, other) => other,
    }
}
