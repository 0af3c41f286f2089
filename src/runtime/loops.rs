/// Loop manager
///
/// Owns every loop-related scheduling decision: when an iteration is complete,
/// when a loop is done, how loop-internal blocks are reset for the next
/// iteration, and how control leaves a finished loop. It is the only component
/// allowed to take blocks back out of `executed_blocks`.
///
/// Every loop is reconciled on every pass, reached or not. Per pass and per
/// loop the state moves
/// `NotStarted -> Running -> ReadyToAdvance -> {Advancing | Completed}`;
/// `Completed` is sticky.

use crate::runtime::{
    context::ExecutionContext,
    for_each::{collection_len, item_at, resolve_items},
    path::is_connection_live,
    sandbox::LuaSandbox,
};
use crate::workflow::types::{Block, BlockKind, Connection, EdgeKind, Loop, LoopType};
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;

/// Loop scheduling for one workflow run
///
/// Holds its own copy of the loop definitions because resolved for-each
/// collections are cached on them; build one manager per run.
#[derive(Debug, Clone)]
pub struct LoopManager {
    loops: IndexMap<String, Loop>,
    default_iterations: usize,
    sandbox: LuaSandbox,
}

impl LoopManager {
    /// Create a manager for `loops`; `default_iterations` applies to loops without a bound
    pub fn new(loops: IndexMap<String, Loop>, default_iterations: usize) -> Self {
        Self {
            loops,
            default_iterations,
            sandbox: LuaSandbox::default(),
        }
    }

    /// Use a specific sandbox for for-each expressions
    pub fn with_sandbox(mut self, sandbox: LuaSandbox) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Loop definitions, in processing order
    pub fn loops(&self) -> &IndexMap<String, Loop> {
        &self.loops
    }

    /// The loop a block belongs to (first match in declaration order)
    pub fn loop_id_for_block(&self, block_id: &str) -> Option<&str> {
        self.loops
            .iter()
            .find(|(_, lp)| lp.contains(block_id))
            .map(|(id, _)| id.as_str())
    }

    /// Reconcile every loop once; returns whether any loop is at its bound
    pub async fn process_loop_iterations(&mut self, context: &mut ExecutionContext) -> bool {
        if self.loops.is_empty() {
            return false;
        }

        let mut has_any_loop_reached_max = false;
        let loop_ids: Vec<String> = self.loops.keys().cloned().collect();

        for loop_id in loop_ids {
            self.ensure_items_resolved(&loop_id, context).await;

            let Some(lp) = self.loops.get(&loop_id) else {
                continue;
            };
            let current_iteration = context.iteration(&loop_id);

            if self.is_complete(lp, current_iteration) {
                has_any_loop_reached_max = true;
                self.mark_completed(&loop_id, lp, context);
                continue;
            }

            if lp.loop_type == LoopType::ForEach && !context.loop_items.contains_key(&loop_id) {
                self.expose_item(&loop_id, lp, current_iteration, context);
            }

            let all_blocks_executed = lp
                .nodes
                .iter()
                .all(|node| context.executed_blocks.contains(node));

            if !all_blocks_executed {
                self.activate_next_blocks_in_loop(&loop_id, lp, context);
                continue;
            }

            // Ready to advance: expose the finished iteration's item, then count it
            if lp.loop_type == LoopType::ForEach {
                self.expose_item(&loop_id, lp, current_iteration, context);
            }
            self.snapshot_iteration(&loop_id, lp, context);

            let next_iteration = current_iteration + 1;
            context.loop_iterations.insert(loop_id.clone(), next_iteration);
            tracing::info!(
                "🔁 Loop '{}' finished iteration {}/{}",
                loop_id,
                next_iteration,
                self.bound(lp)
            );

            if self.is_complete(lp, next_iteration) {
                has_any_loop_reached_max = true;
                self.mark_completed(&loop_id, lp, context);
                continue;
            }

            self.reset_for_next_iteration(&loop_id, lp, context);
            if lp.loop_type == LoopType::ForEach {
                self.expose_item(&loop_id, lp, next_iteration, context);
            }
        }

        has_any_loop_reached_max
    }

    /// Index exposed to blocks running inside `loop_id`
    ///
    /// Equals the number of completed iterations; `_block_id` is reserved for
    /// per-block overrides.
    pub fn get_loop_index(&self, loop_id: &str, _block_id: &str, context: &ExecutionContext) -> usize {
        context.iteration(loop_id)
    }

    /// Configured bound of a loop, or the default when unset/unknown
    pub fn get_iterations(&self, loop_id: &str) -> usize {
        self.loops
            .get(loop_id)
            .and_then(|lp| lp.iterations)
            .unwrap_or(self.default_iterations)
    }

    /// Current for-each item of a loop
    pub fn get_current_item<'a>(&self, loop_id: &str, context: &'a ExecutionContext) -> Option<&'a Value> {
        context.loop_items.get(loop_id)
    }

    /// Resolved for-each collection of a loop, if any
    pub fn get_items(&self, loop_id: &str) -> Option<&Value> {
        self.loops
            .get(loop_id)
            .filter(|lp| lp.has_resolved_items())
            .and_then(|lp| lp.for_each_items.as_ref())
    }

    /// Whether `connection` loops control back to an earlier block of the same loop
    ///
    /// Self-connections always are. Otherwise only a backward edge (target listed
    /// before source in `nodes`) leaving a condition block through a
    /// `condition-*` handle counts; an unconditional backward edge does not.
    pub fn is_feedback_path(&self, connection: &Connection, blocks: &[Block]) -> bool {
        if connection.is_self_loop() {
            return true;
        }

        for lp in self.loops.values() {
            let (Some(source_index), Some(target_index)) =
                (lp.position(&connection.source), lp.position(&connection.target))
            else {
                continue;
            };

            if target_index < source_index {
                let source_is_condition = blocks
                    .iter()
                    .find(|b| b.id == connection.source)
                    .is_some_and(|b| b.kind == BlockKind::Condition);
                return source_is_condition && matches!(connection.kind, EdgeKind::Condition(_));
            }
        }

        false
    }

    /// Whether `connection` points backward inside one loop (target listed before source)
    pub fn is_backward_edge(&self, connection: &Connection) -> bool {
        self.loops.values().any(|lp| {
            matches!(
                (lp.position(&connection.source), lp.position(&connection.target)),
                (Some(s), Some(t)) if t < s
            )
        })
    }

    /// Evaluate a for-each collection (see `for_each::resolve_items`)
    ///
    /// Kept async so an asynchronous expression evaluator can slot in later.
    pub async fn eval_for_each_items(&self, items: &Value, context: &ExecutionContext) -> Value {
        resolve_items(items, context, &self.sandbox)
    }

    /// Block that (re)starts a loop
    ///
    /// Single-node loops start at their node. Otherwise the first node with an
    /// incoming connection from outside the loop; failing that, the node with
    /// the fewest loop-internal predecessors (first in `nodes` on ties).
    pub fn find_entry_block<'a>(&self, lp: &'a Loop, connections: &[Connection]) -> Option<&'a str> {
        if lp.nodes.len() == 1 {
            return lp.nodes.first().map(String::as_str);
        }

        let external_entry = lp.nodes.iter().find(|node| {
            connections
                .iter()
                .any(|c| c.target == **node && !lp.contains(&c.source))
        });
        if let Some(entry) = external_entry {
            return Some(entry.as_str());
        }

        tracing::warn!("⚠️ Loop without external entry, picking node with fewest internal predecessors");
        lp.nodes
            .iter()
            .min_by_key(|node| {
                connections
                    .iter()
                    .filter(|c| c.target == **node && lp.contains(&c.source) && c.source != **node)
                    .count()
            })
            .map(String::as_str)
    }

    fn bound(&self, lp: &Loop) -> usize {
        lp.iterations.unwrap_or(self.default_iterations)
    }

    fn is_complete(&self, lp: &Loop, iteration: usize) -> bool {
        let max_iterations = self.bound(lp);
        match lp.loop_type {
            LoopType::For => iteration >= max_iterations,
            LoopType::ForEach => {
                iteration >= collection_len(lp.for_each_items.as_ref()) || iteration >= max_iterations
            }
        }
    }

    async fn ensure_items_resolved(&mut self, loop_id: &str, context: &ExecutionContext) {
        let pending = match self.loops.get(loop_id) {
            Some(lp) if lp.loop_type == LoopType::ForEach && !lp.has_resolved_items() => {
                lp.for_each_items.clone().unwrap_or(Value::Null)
            }
            _ => return,
        };

        let resolved = self.eval_for_each_items(&pending, context).await;
        tracing::debug!(
            "📦 Loop '{}' resolved {} forEach items",
            loop_id,
            collection_len(Some(&resolved))
        );
        if let Some(lp) = self.loops.get_mut(loop_id) {
            lp.for_each_items = Some(resolved);
        }
    }

    fn expose_item(&self, loop_id: &str, lp: &Loop, index: usize, context: &mut ExecutionContext) {
        if let Some(item) = item_at(lp.for_each_items.as_ref(), index) {
            context.loop_items.insert(loop_id.to_string(), item);
        }
    }

    fn snapshot_iteration(&self, loop_id: &str, lp: &Loop, context: &mut ExecutionContext) {
        let snapshot: IndexMap<String, Value> = lp
            .nodes
            .iter()
            .filter_map(|node| context.output(node).map(|out| (node.clone(), out.clone())))
            .collect();
        context
            .loop_results
            .entry(loop_id.to_string())
            .or_default()
            .push(snapshot);
    }

    fn mark_completed(&self, loop_id: &str, lp: &Loop, context: &mut ExecutionContext) {
        if !context.completed_loops.insert(loop_id.to_string()) {
            return;
        }
        tracing::info!(
            "🏁 Loop '{}' completed after {} iterations",
            loop_id,
            context.iteration(loop_id)
        );
        self.activate_external_paths(loop_id, lp, context);
    }

    /// Take every loop node out of `executed_blocks` and put it back on the active path
    fn reset_for_next_iteration(&self, loop_id: &str, lp: &Loop, context: &mut ExecutionContext) {
        for node in &lp.nodes {
            context.executed_blocks.remove(node);
            context.activate(node);
        }

        let workflow = Arc::clone(&context.workflow);
        if let Some(entry) = self.find_entry_block(lp, &workflow.connections) {
            context.executed_blocks.remove(entry);
            context.activate(entry);
        }
        tracing::debug!(
            "♻️ Reset {} blocks of loop '{}' for iteration {}",
            lp.nodes.len(),
            loop_id,
            context.iteration(loop_id)
        );
    }

    /// Activate live edges leaving the loop, as if each source had just finished
    fn activate_external_paths(&self, loop_id: &str, lp: &Loop, context: &mut ExecutionContext) {
        let workflow = Arc::clone(&context.workflow);

        for node in &lp.nodes {
            for conn in workflow.outgoing(node) {
                if lp.contains(&conn.target) {
                    continue;
                }
                if is_connection_live(conn, context) {
                    tracing::debug!(
                        "🚪 Loop '{}' exits through {} → {}",
                        loop_id,
                        conn.source,
                        conn.target
                    );
                    context.activate(&conn.target);
                }
            }
        }
    }

    /// Keep a partially executed iteration moving
    fn activate_next_blocks_in_loop(&self, loop_id: &str, lp: &Loop, context: &mut ExecutionContext) {
        let workflow = Arc::clone(&context.workflow);

        let any_executed = lp.nodes.iter().any(|n| context.executed_blocks.contains(n));
        if !any_executed {
            if let Some(entry) = self.find_entry_block(lp, &workflow.connections) {
                tracing::debug!("▶️ Arming entry block '{}' of loop '{}'", entry, loop_id);
                context.activate(entry);
            }
            return;
        }

        for node in &lp.nodes {
            if !context.executed_blocks.contains(node) {
                continue;
            }
            for conn in workflow.outgoing(node) {
                if !lp.contains(&conn.target) || context.executed_blocks.contains(&conn.target) {
                    continue;
                }
                if conn.kind == EdgeKind::Error && !context.has_error(node) {
                    continue;
                }
                context.activate(&conn.target);
            }
        }
    }
}
