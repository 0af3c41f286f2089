use anyhow::anyhow;
use async_trait::async_trait;
use loopway::{
    Block, BlockExecutor, BlockScope, EngineConfig, ExecutionEngine, LuaBlockExecutor,
    SerializedWorkflow,
};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

type Behavior = Box<dyn Fn(&BlockScope) -> anyhow::Result<Value> + Send + Sync>;

/// Executor that records every call and runs per-block behaviors
#[derive(Default)]
struct ScriptedExecutor {
    behaviors: HashMap<String, Behavior>,
    calls: Mutex<Vec<(String, Option<usize>, Option<Value>)>>,
}

impl ScriptedExecutor {
    fn on(
        mut self,
        block_id: &str,
        behavior: impl Fn(&BlockScope) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.behaviors.insert(block_id.to_string(), Box::new(behavior));
        self
    }

    fn calls(&self) -> Vec<(String, Option<usize>, Option<Value>)> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn call_order(&self) -> Vec<String> {
        self.calls().into_iter().map(|(id, _, _)| id).collect()
    }
}

#[async_trait]
impl BlockExecutor for ScriptedExecutor {
    async fn execute(&self, block: &Block, scope: &BlockScope) -> anyhow::Result<Value> {
        self.calls.lock().expect("calls lock").push((
            block.id.clone(),
            scope.loop_index,
            scope.current_item.clone(),
        ));
        match self.behaviors.get(&block.id) {
            Some(behavior) => behavior(scope),
            None => Ok(json!({ "ran": block.id })),
        }
    }
}

fn workflow(value: Value) -> SerializedWorkflow {
    serde_json::from_value(value).expect("valid workflow fixture")
}

fn engine(executor: Arc<ScriptedExecutor>) -> ExecutionEngine {
    ExecutionEngine::new(executor, EngineConfig::default())
}

#[tokio::test]
async fn fixed_loop_runs_body_three_times_then_exits() {
    let executor = Arc::new(ScriptedExecutor::default());
    let wf = workflow(json!({
        "id": "wf-for",
        "blocks": [{ "id": "start", "kind": "starter" }, { "id": "A" }, { "id": "after" }],
        "connections": [
            { "source": "start", "target": "A" },
            { "source": "A", "target": "A" },
            { "source": "A", "target": "after" }
        ],
        "loops": { "loop-1": { "nodes": ["A"], "iterations": 3, "loopType": "for" } }
    }));

    let result = engine(executor.clone()).execute_workflow(wf).await.expect("runs");

    assert_eq!(executor.call_order(), vec!["start", "A", "A", "A", "after"]);
    let indexes: Vec<_> = executor
        .calls()
        .into_iter()
        .filter(|(id, _, _)| id == "A")
        .map(|(_, idx, _)| idx)
        .collect();
    assert_eq!(indexes, vec![Some(0), Some(1), Some(2)]);
    assert_eq!(result.loop_iterations["loop-1"], 3);
    assert_eq!(result.loop_results["loop-1"].len(), 3);
    assert_eq!(result.outputs["after"], json!({ "ran": "after" }));
    assert_eq!(result.passes, 5);
}

#[tokio::test]
async fn for_each_stops_at_collection_length() {
    let executor = Arc::new(ScriptedExecutor::default());
    let wf = workflow(json!({
        "id": "wf-each",
        "blocks": [
            { "id": "start", "kind": "starter" },
            { "id": "B" }, { "id": "C" }, { "id": "done" }
        ],
        "connections": [
            { "source": "start", "target": "B" },
            { "source": "B", "target": "C" },
            { "source": "C", "target": "B" },
            { "source": "C", "target": "done" }
        ],
        "loops": {
            "each": { "nodes": ["B", "C"], "iterations": 5, "loopType": "forEach", "forEachItems": "[10,20]" }
        }
    }));

    let result = engine(executor.clone()).execute_workflow(wf).await.expect("runs");

    assert_eq!(executor.call_order(), vec!["start", "B", "C", "B", "C", "done"]);
    let seen: Vec<_> = executor
        .calls()
        .into_iter()
        .filter(|(id, _, _)| id == "B")
        .map(|(_, idx, item)| (idx, item))
        .collect();
    assert_eq!(
        seen,
        vec![(Some(0), Some(json!(10))), (Some(1), Some(json!(20)))]
    );
    assert_eq!(result.loop_iterations["each"], 2);
    assert_eq!(result.loop_results["each"].len(), 2);
}

#[tokio::test]
async fn malformed_for_each_skips_body_and_continues() {
    let executor = Arc::new(ScriptedExecutor::default());
    let wf = workflow(json!({
        "blocks": [{ "id": "start", "kind": "starter" }, { "id": "B" }, { "id": "next" }],
        "connections": [
            { "source": "start", "target": "B" },
            { "source": "B", "target": "next" }
        ],
        "loops": { "bad": { "nodes": ["B"], "loopType": "forEach", "forEachItems": "{invalid" } }
    }));

    let result = engine(executor.clone()).execute_workflow(wf).await.expect("runs");

    assert_eq!(executor.call_order(), vec!["start", "next"]);
    assert!(!result.outputs.contains_key("B"));
    assert!(!result.loop_iterations.contains_key("bad"));
}

#[tokio::test]
async fn condition_feedback_loop_exits_through_selected_branch() {
    let executor = Arc::new(ScriptedExecutor::default().on("cond", |scope| {
        let selected = if scope.loop_index == Some(2) { "cond-done" } else { "cond-again" };
        Ok(json!({ "selectedConditionId": selected }))
    }));
    let wf = workflow(json!({
        "blocks": [
            { "id": "start", "kind": "starter" },
            { "id": "A" },
            { "id": "cond", "kind": "condition" },
            { "id": "exit" },
            { "id": "never" }
        ],
        "connections": [
            { "source": "start", "target": "A" },
            { "source": "A", "target": "cond" },
            { "source": "cond", "target": "A", "sourceHandle": "condition-cond-again" },
            { "source": "cond", "target": "exit", "sourceHandle": "condition-cond-done" },
            { "source": "cond", "target": "never", "sourceHandle": "condition-cond-other" }
        ],
        "loops": { "l": { "nodes": ["A", "cond"], "iterations": 3 } }
    }));

    let result = engine(executor.clone()).execute_workflow(wf).await.expect("runs");

    assert_eq!(
        executor.call_order(),
        vec!["start", "A", "cond", "A", "cond", "A", "cond", "exit"]
    );
    assert!(!result.outputs.contains_key("never"));
}

#[tokio::test]
async fn failing_block_follows_error_edge() {
    let executor = Arc::new(ScriptedExecutor::default().on("api", |_| Err(anyhow!("upstream timeout"))));
    let wf = workflow(json!({
        "blocks": [
            { "id": "start", "kind": "starter" },
            { "id": "api" }, { "id": "ok" }, { "id": "handler" }
        ],
        "connections": [
            { "source": "start", "target": "api" },
            { "source": "api", "target": "ok" },
            { "source": "api", "target": "handler", "sourceHandle": "error" }
        ]
    }));

    let result = engine(executor.clone()).execute_workflow(wf).await.expect("runs");

    assert_eq!(executor.call_order(), vec!["start", "api", "handler"]);
    let message = result.outputs["api"]["error"].as_str().expect("error message");
    assert!(message.contains("upstream timeout"));
}

#[tokio::test]
async fn failing_block_without_error_edge_fails_the_run() {
    let executor = Arc::new(ScriptedExecutor::default().on("api", |_| Err(anyhow!("boom"))));
    let wf = workflow(json!({
        "blocks": [{ "id": "start", "kind": "starter" }, { "id": "api" }],
        "connections": [{ "source": "start", "target": "api" }]
    }));

    let err = engine(executor).execute_workflow(wf).await.expect_err("fails");
    assert!(err.to_string().contains("'api'"));
}

#[tokio::test]
async fn router_activates_only_the_selected_target() {
    let executor = Arc::new(
        ScriptedExecutor::default().on("r", |_| Ok(json!({ "selectedPath": { "blockId": "y" } }))),
    );
    let wf = workflow(json!({
        "blocks": [
            { "id": "start", "kind": "starter" },
            { "id": "r", "kind": "router" }, { "id": "x" }, { "id": "y" }
        ],
        "connections": [
            { "source": "start", "target": "r" },
            { "source": "r", "target": "x" },
            { "source": "r", "target": "y" }
        ]
    }));

    engine(executor.clone()).execute_workflow(wf).await.expect("runs");
    assert_eq!(executor.call_order(), vec!["start", "r", "y"]);
}

#[tokio::test]
async fn cycles_outside_loops_are_rejected() {
    let executor = Arc::new(ScriptedExecutor::default());
    let wf = workflow(json!({
        "blocks": [{ "id": "a", "kind": "starter" }, { "id": "b" }, { "id": "c" }],
        "connections": [
            { "source": "a", "target": "b" },
            { "source": "b", "target": "c" },
            { "source": "c", "target": "b" }
        ]
    }));

    let err = engine(executor).execute_workflow(wf).await.expect_err("fails");
    assert!(err.to_string().contains("cycle"));
}

#[tokio::test]
async fn unknown_blocks_are_rejected() {
    let executor = Arc::new(ScriptedExecutor::default());
    let wf = workflow(json!({
        "blocks": [{ "id": "a", "kind": "starter" }],
        "connections": [{ "source": "a", "target": "ghost" }]
    }));

    let err = engine(executor).execute_workflow(wf).await.expect_err("fails");
    assert!(err.to_string().contains("ghost"));
}

#[tokio::test]
async fn pass_limit_is_enforced() {
    let executor = Arc::new(ScriptedExecutor::default());
    let wf = workflow(json!({
        "blocks": [{ "id": "start", "kind": "starter" }, { "id": "A" }],
        "connections": [{ "source": "start", "target": "A" }],
        "loops": { "long": { "nodes": ["A"], "iterations": 1000 } }
    }));
    let config = EngineConfig {
        max_passes: 10,
        ..EngineConfig::default()
    };

    let err = ExecutionEngine::new(executor, config)
        .execute_workflow(wf)
        .await
        .expect_err("fails");
    assert!(err.to_string().contains("exceeded 10 scheduling passes"));
}

#[tokio::test]
async fn lua_blocks_iterate_over_expression_items() {
    let wf = workflow(json!({
        "id": "wf-lua",
        "blocks": [
            { "id": "start", "kind": "starter", "config": { "value": { "greeting": "hi" } } },
            { "id": "fetch", "config": { "script": "return { suffix = '!' }" } },
            { "id": "body", "config": {
                "script": "return input.start.greeting .. ' ' .. loop.item .. ' #' .. <loop.index> .. input.fetch.suffix"
            } },
            { "id": "summary", "config": { "script": "return { last = input.body }" } }
        ],
        "connections": [
            { "source": "start", "target": "fetch" },
            { "source": "fetch", "target": "body" },
            { "source": "body", "target": "summary" }
        ],
        "loops": {
            "each": {
                "nodes": ["body"],
                "loopType": "forEach",
                "forEachItems": "{ 'a', 'b', 'c' }"
            }
        }
    }));

    let result = ExecutionEngine::new(Arc::new(LuaBlockExecutor::default()), EngineConfig::default())
        .execute_workflow(wf)
        .await
        .expect("runs");

    assert_eq!(result.loop_iterations["each"], 3);
    assert_eq!(result.loop_results["each"][1]["body"], json!("hi b #1!"));
    assert_eq!(result.outputs["summary"], json!({ "last": "hi c #2!" }));
    assert_eq!(result.metadata["workflow_id"], json!("wf-lua"));
}

#[tokio::test]
async fn unreached_empty_loop_completes_before_first_block() {
    let executor = Arc::new(ScriptedExecutor::default());
    let wf = workflow(json!({
        "blocks": [
            { "id": "start", "kind": "starter" },
            { "id": "mid" }, { "id": "B" }, { "id": "after" }
        ],
        "connections": [
            { "source": "start", "target": "mid" },
            { "source": "mid", "target": "B" },
            { "source": "B", "target": "after" }
        ],
        "loops": { "none": { "nodes": ["B"], "loopType": "forEach", "forEachItems": "[]" } }
    }));

    let result = engine(executor.clone()).execute_workflow(wf).await.expect("runs");

    assert!(!executor.call_order().contains(&"B".to_string()));
    assert!(result.outputs.contains_key("after"));
    assert!(result.outputs.contains_key("mid"));
}

#[tokio::test]
async fn workflow_files_load_and_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("wf.json");
    let document = json!({
        "id": "from-disk",
        "blocks": [{ "id": "only", "config": { "value": 1 } }],
        "loops": { "twice": { "nodes": ["only"], "iterations": 2 } }
    });
    tokio::fs::write(&path, document.to_string()).await.expect("write");

    let wf = loopway::workflow::WorkflowStorage::read_file(&path).await.expect("reads");
    let result = ExecutionEngine::new(Arc::new(LuaBlockExecutor::default()), EngineConfig::default())
        .execute_workflow(wf)
        .await
        .expect("runs");

    assert_eq!(result.loop_iterations["twice"], 2);
    assert_eq!(result.outputs["only"], json!(1));
}
