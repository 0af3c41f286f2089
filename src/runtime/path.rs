/// Active-path propagation
///
/// Decides which outgoing connections of a finished block become part of the
/// active execution path, and records the branch decisions of condition and
/// router blocks so later liveness checks can consult them.

use crate::runtime::{context::ExecutionContext, loops::LoopManager};
use crate::workflow::types::{BlockKind, Connection, EdgeKind};
use serde_json::Value;

/// Whether `connection` is live given its source's recorded output and decisions
///
/// - default edges are always live
/// - error edges need an error marker on the source output
/// - `condition-<id>` edges need the source's condition decision to be `<id>`
/// - edges leaving a router need the router decision to name their target
pub fn is_connection_live(connection: &Connection, context: &ExecutionContext) -> bool {
    match &connection.kind {
        EdgeKind::Error => context.has_error(&connection.source),
        EdgeKind::Condition(condition_id) => context
            .decisions
            .condition
            .get(&connection.source)
            .is_some_and(|selected| selected == condition_id),
        EdgeKind::Default => {
            let is_router = context.workflow.block_kind(&connection.source) == BlockKind::Router
                || context.decisions.router.contains_key(&connection.source);
            if is_router {
                context
                    .decisions
                    .router
                    .get(&connection.source)
                    .is_some_and(|selected| *selected == connection.target)
            } else {
                true
            }
        }
    }
}

/// Propagates the active execution path after blocks finish
#[derive(Debug, Default, Clone)]
pub struct PathTracker;

impl PathTracker {
    pub fn new() -> Self {
        Self
    }

    /// Record decisions and activate live successors of `executed` blocks
    ///
    /// Feedback paths are skipped, and so are edges leaving a loop: those are
    /// activated by the loop manager once the loop completes.
    pub fn update_execution_paths(
        &self,
        executed: &[String],
        context: &mut ExecutionContext,
        loop_manager: &LoopManager,
    ) {
        let workflow = std::sync::Arc::clone(&context.workflow);

        for block_id in executed {
            self.record_decision(block_id, context);
            let errored = context.has_error(block_id);
            let source_loop = loop_manager.loop_id_for_block(block_id);

            for conn in workflow.outgoing(block_id) {
                if loop_manager.is_feedback_path(conn, &workflow.blocks) {
                    continue;
                }
                if let Some(loop_id) = source_loop {
                    if loop_manager.loop_id_for_block(&conn.target) != Some(loop_id) {
                        tracing::debug!(
                            "⏸️ Deferring exit edge {} → {} until loop '{}' completes",
                            conn.source,
                            conn.target,
                            loop_id
                        );
                        continue;
                    }
                }
                // a failed block only routes through its error edges
                if errored && conn.kind != EdgeKind::Error {
                    continue;
                }
                if is_connection_live(conn, context) {
                    tracing::debug!("➡️ Activating {} → {}", conn.source, conn.target);
                    context.activate(&conn.target);
                }
            }
        }
    }

    /// Copy a condition/router block's selection into `context.decisions`
    fn record_decision(&self, block_id: &str, context: &mut ExecutionContext) {
        let kind = context.workflow.block_kind(block_id);
        let Some(output) = context.output(block_id) else {
            return;
        };

        match kind {
            BlockKind::Condition => {
                if let Some(selected) = lookup(output, &["selectedConditionId"]) {
                    tracing::debug!("🔀 Condition '{}' selected '{}'", block_id, selected);
                    context
                        .decisions
                        .condition
                        .insert(block_id.to_string(), selected);
                }
            }
            BlockKind::Router => {
                if let Some(selected) = lookup(output, &["selectedPath", "blockId"]) {
                    tracing::debug!("🧭 Router '{}' selected '{}'", block_id, selected);
                    context.decisions.router.insert(block_id.to_string(), selected);
                }
            }
            _ => {}
        }
    }
}

/// String at `path` in `output`, or in `output.response`
fn lookup(output: &Value, path: &[&str]) -> Option<String> {
    let walk = |root: &Value| {
        path.iter()
            .try_fold(root, |current, key| current.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    walk(output).or_else(|| output.get("response").and_then(walk))
}
