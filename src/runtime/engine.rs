/// Pass-based execution engine
///
/// Treats a workflow with loop regions as a DAG for scheduling: feedback paths
/// and in-loop backward edges are left out of the petgraph used for ordering,
/// and repetition is realized by the loop manager resetting loop blocks between
/// passes. Each pass runs every ready block once, propagates paths, then lets
/// the loop manager reconcile loop state, until nothing is runnable.

use crate::config::EngineConfig;
use crate::runtime::{
    context::ExecutionContext,
    executor::{BlockExecutor, BlockScope, ExecutionResult},
    loops::LoopManager,
    path::{is_connection_live, PathTracker},
    sandbox::LuaSandbox,
};
use crate::workflow::types::{BlockKind, Connection, SerializedWorkflow};
use anyhow::Result;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::json;
use std::{collections::HashMap, sync::Arc};

/// Workflow execution driver
pub struct ExecutionEngine {
    /// Executor invoked for every ready block
    executor: Arc<dyn BlockExecutor>,
    /// Loop defaults and pass limit
    config: EngineConfig,
}

/// Scheduling view of a workflow
#[derive(Debug)]
pub struct ExecutionPlan {
    /// Block ids in topological order (feedback and backward edges ignored)
    pub order: Vec<String>,
    /// Blocks active before the first pass
    pub entry_blocks: Vec<String>,
}

impl ExecutionEngine {
    /// Create new engine around a block executor
    pub fn new(executor: Arc<dyn BlockExecutor>, config: EngineConfig) -> Self {
        Self { executor, config }
    }

    /// Fresh loop manager for one run of `workflow`
    pub fn loop_manager_for(&self, workflow: &SerializedWorkflow) -> LoopManager {
        LoopManager::new(workflow.loops.clone(), self.config.default_iterations)
            .with_sandbox(LuaSandbox::new(self.config.lua_memory_limit))
    }

    /// Execute a workflow to completion
    ///
    /// Returns once no block is runnable. Fails on malformed graphs, on a block
    /// error without an error path, or when `max_passes` is exceeded.
    pub async fn execute_workflow(&self, workflow: SerializedWorkflow) -> Result<ExecutionResult> {
        let workflow_start_time = std::time::Instant::now();
        let workflow = Arc::new(workflow);

        tracing::info!(
            "🚀 Starting workflow execution: '{}' ({} blocks, {} loops)",
            workflow.id,
            workflow.blocks.len(),
            workflow.loops.len()
        );

        let mut loop_manager = self.loop_manager_for(&workflow);
        let plan = self.build_plan(&workflow, &loop_manager)?;
        tracing::debug!("📋 Execution order: {:?}", plan.order);

        let mut context = ExecutionContext::new(Arc::clone(&workflow));
        for entry in &plan.entry_blocks {
            context.activate(entry);
        }

        let path_tracker = PathTracker::new();
        loop_manager.process_loop_iterations(&mut context).await;

        let mut passes = 0usize;
        loop {
            let layer = self.next_layer(&plan, &context, &loop_manager);

            if layer.is_empty() {
                // give loops one more chance to re-arm blocks before stopping
                loop_manager.process_loop_iterations(&mut context).await;
                if self.next_layer(&plan, &context, &loop_manager).is_empty() {
                    break;
                }
                continue;
            }

            passes += 1;
            if passes > self.config.max_passes {
                return Err(anyhow::anyhow!(
                    "Workflow '{}' exceeded {} scheduling passes",
                    workflow.id,
                    self.config.max_passes
                ));
            }
            tracing::debug!("📍 Pass {}: executing {:?}", passes, layer);

            for block_id in &layer {
                self.execute_block(block_id, &mut context, &loop_manager).await?;
            }

            path_tracker.update_execution_paths(&layer, &mut context, &loop_manager);
            if loop_manager.process_loop_iterations(&mut context).await {
                tracing::debug!("🔚 At least one loop has reached its bound");
            }
        }

        tracing::info!(
            "🎉 Workflow '{}' finished in {:?} after {} passes ({} blocks produced output)",
            workflow.id,
            workflow_start_time.elapsed(),
            passes,
            context.block_states.len()
        );

        let mut metadata = context.metadata.clone();
        metadata.insert("finished_at".to_string(), json!(chrono::Utc::now().to_rfc3339()));

        Ok(ExecutionResult {
            outputs: context.outputs(),
            loop_iterations: context.loop_iterations.clone(),
            loop_results: context.loop_results.clone(),
            passes,
            metadata,
        })
    }

    /// Validate the graph and compute scheduling order and entry blocks
    pub fn build_plan(&self, workflow: &SerializedWorkflow, loop_manager: &LoopManager) -> Result<ExecutionPlan> {
        tracing::debug!("🏗️ Building execution plan for '{}'", workflow.id);

        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut node_id_to_index: HashMap<&str, NodeIndex> = HashMap::new();

        for block in &workflow.blocks {
            if node_id_to_index.contains_key(block.id.as_str()) {
                return Err(anyhow::anyhow!("Duplicate block id: {}", block.id));
            }
            let index = graph.add_node(block.id.clone());
            node_id_to_index.insert(block.id.as_str(), index);
        }

        for (loop_id, lp) in loop_manager.loops() {
            if lp.nodes.is_empty() {
                return Err(anyhow::anyhow!("Loop '{}' has no nodes", loop_id));
            }
            if let Some(unknown) = lp.nodes.iter().find(|n| !node_id_to_index.contains_key(n.as_str())) {
                return Err(anyhow::anyhow!("Loop '{}' references unknown block: {}", loop_id, unknown));
            }
        }

        for conn in &workflow.connections {
            let from_index = node_id_to_index
                .get(conn.source.as_str())
                .ok_or_else(|| anyhow::anyhow!("Connection references unknown block: {}", conn.source))?;
            let to_index = node_id_to_index
                .get(conn.target.as_str())
                .ok_or_else(|| anyhow::anyhow!("Connection references unknown block: {}", conn.target))?;

            if self.is_ignored_dependency(conn, workflow, loop_manager) {
                tracing::debug!("↩️ Ignoring loop-back edge {} → {}", conn.source, conn.target);
                continue;
            }
            graph.add_edge(*from_index, *to_index, ());
        }

        let topo_order = toposort(&graph, None).map_err(|cycle| {
            anyhow::anyhow!(
                "Workflow contains a cycle outside loop regions (at block '{}')",
                graph[cycle.node_id()]
            )
        })?;
        let order: Vec<String> = topo_order.iter().map(|&idx| graph[idx].clone()).collect();

        let starters: Vec<String> = workflow
            .blocks
            .iter()
            .filter(|b| b.kind == BlockKind::Starter)
            .map(|b| b.id.clone())
            .collect();
        let entry_blocks = if starters.is_empty() {
            order
                .iter()
                .filter(|id| {
                    graph
                        .neighbors_directed(node_id_to_index[id.as_str()], petgraph::Direction::Incoming)
                        .next()
                        .is_none()
                })
                .cloned()
                .collect()
        } else {
            starters
        };

        if entry_blocks.is_empty() && !workflow.blocks.is_empty() {
            return Err(anyhow::anyhow!("Workflow '{}' has no entry block", workflow.id));
        }

        Ok(ExecutionPlan { order, entry_blocks })
    }

    /// Feedback paths and in-loop backward edges are not forward dependencies
    fn is_ignored_dependency(
        &self,
        conn: &Connection,
        workflow: &SerializedWorkflow,
        loop_manager: &LoopManager,
    ) -> bool {
        loop_manager.is_feedback_path(conn, &workflow.blocks) || loop_manager.is_backward_edge(conn)
    }

    /// Ready blocks in plan order
    fn next_layer(&self, plan: &ExecutionPlan, context: &ExecutionContext, loop_manager: &LoopManager) -> Vec<String> {
        plan.order
            .iter()
            .filter(|id| context.active_execution_path.contains(*id))
            .filter(|id| !context.executed_blocks.contains(*id))
            .filter(|id| {
                loop_manager
                    .loop_id_for_block(id)
                    .map_or(true, |loop_id| !context.completed_loops.contains(loop_id))
            })
            .filter(|id| self.dependencies_met(id, context, loop_manager))
            .cloned()
            .collect()
    }

    /// Whether every forward dependency of `block_id` is satisfied
    fn dependencies_met(&self, block_id: &str, context: &ExecutionContext, loop_manager: &LoopManager) -> bool {
        let workflow = &context.workflow;
        let target_loop = loop_manager.loop_id_for_block(block_id);

        workflow.incoming(block_id).all(|conn| {
            if self.is_ignored_dependency(conn, workflow, loop_manager) {
                return true;
            }
            if let Some(source_loop) = loop_manager.loop_id_for_block(&conn.source) {
                if Some(source_loop) != target_loop {
                    // leaving a loop: only once the loop is done
                    return context.completed_loops.contains(source_loop);
                }
            }
            context.executed_blocks.contains(&conn.source) && is_connection_live(conn, context)
        })
    }

    /// Run one block and record its output
    async fn execute_block(
        &self,
        block_id: &str,
        context: &mut ExecutionContext,
        loop_manager: &LoopManager,
    ) -> Result<()> {
        let workflow = Arc::clone(&context.workflow);
        let block = workflow
            .block(block_id)
            .ok_or_else(|| anyhow::anyhow!("Unknown block: {}", block_id))?;

        let loop_id = loop_manager.loop_id_for_block(block_id);
        let snapshot: &ExecutionContext = context;
        let scope = BlockScope {
            block_id: block_id.to_string(),
            loop_id: loop_id.map(str::to_string),
            loop_index: loop_id.map(|id| loop_manager.get_loop_index(id, block_id, snapshot)),
            current_item: loop_id.and_then(|id| loop_manager.get_current_item(id, snapshot).cloned()),
            items: loop_id.and_then(|id| loop_manager.get_items(id).cloned()),
            outputs: snapshot.outputs(),
        };

        let node_start_time = std::time::Instant::now();
        match self.executor.execute(block, &scope).await {
            Ok(output) => {
                tracing::info!("✅ Block '{}' completed in {:?}", block_id, node_start_time.elapsed());
                context.record_output(block_id, output);
                Ok(())
            }
            Err(e) if workflow.has_error_path(block_id) => {
                tracing::warn!("⚠️ Block '{}' failed, following error path: {}", block_id, e);
                context.record_output(block_id, json!({ "error": e.to_string() }));
                Ok(())
            }
            Err(e) => {
                tracing::error!("❌ Block '{}' failed: {}", block_id, e);
                Err(e.context(format!("Block execution failed for '{}'", block_id)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::executor::LuaBlockExecutor;
    use serde_json::json;

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(Arc::new(LuaBlockExecutor::default()), EngineConfig::default())
    }

    fn workflow(value: serde_json::Value) -> SerializedWorkflow {
        serde_json::from_value(value).expect("valid workflow")
    }

    #[test]
    fn plan_ignores_loop_back_edges() {
        let wf = workflow(json!({
            "blocks": [
                { "id": "start", "kind": "starter" },
                { "id": "A" }, { "id": "cond", "kind": "condition" }, { "id": "end" }
            ],
            "connections": [
                { "source": "start", "target": "A" },
                { "source": "A", "target": "cond" },
                { "source": "cond", "target": "A", "sourceHandle": "condition-again" },
                { "source": "cond", "target": "end", "sourceHandle": "condition-done" }
            ],
            "loops": { "l": { "nodes": ["A", "cond"], "iterations": 2 } }
        }));
        let engine = engine();
        let manager = engine.loop_manager_for(&wf);

        let plan = engine.build_plan(&wf, &manager).expect("plan");
        assert_eq!(plan.order, vec!["start", "A", "cond", "end"]);
        assert_eq!(plan.entry_blocks, vec!["start"]);
    }

    #[test]
    fn entry_blocks_default_to_roots() {
        let wf = workflow(json!({
            "blocks": [{ "id": "a" }, { "id": "b" }, { "id": "c" }],
            "connections": [{ "source": "a", "target": "c" }, { "source": "b", "target": "c" }]
        }));
        let engine = engine();
        let manager = engine.loop_manager_for(&wf);

        let mut entries = engine.build_plan(&wf, &manager).expect("plan").entry_blocks;
        entries.sort();
        assert_eq!(entries, vec!["a", "b"]);
    }

    #[test]
    fn malformed_graphs_are_rejected() {
        let engine = engine();

        let duplicate = workflow(json!({ "blocks": [{ "id": "a" }, { "id": "a" }] }));
        let manager = engine.loop_manager_for(&duplicate);
        assert!(engine.build_plan(&duplicate, &manager).is_err());

        let empty_loop = workflow(json!({
            "blocks": [{ "id": "a" }],
            "loops": { "l": { "nodes": [] } }
        }));
        let manager = engine.loop_manager_for(&empty_loop);
        assert!(engine.build_plan(&empty_loop, &manager).is_err());

        let unknown_node = workflow(json!({
            "blocks": [{ "id": "a" }],
            "loops": { "l": { "nodes": ["ghost"] } }
        }));
        let manager = engine.loop_manager_for(&unknown_node);
        let err = engine.build_plan(&unknown_node, &manager).expect_err("fails");
        assert!(err.to_string().contains("ghost"));
    }
}
