/// Core graph model definitions
///
/// Defines the serialized workflow consumed by the engine: blocks, directed connections
/// and loop regions. These types are deserialized from the JSON produced by the
/// workflow compiler and are treated as read-only during execution, with the single
/// exception of a loop's lazily resolved `forEachItems`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix used by condition branch handles (`condition-<id>`)
pub const CONDITION_HANDLE_PREFIX: &str = "condition-";

/// A complete serialized workflow: blocks, connections and loop regions
///
/// Loops are kept in declaration order, which is the order every scheduling
/// pass visits them in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedWorkflow {
    /// Unique workflow identifier (e.g., "wf-ingest")
    #[serde(default)]
    pub id: String,
    /// Human-readable workflow name
    #[serde(default)]
    pub name: String,
    /// All blocks in the graph
    pub blocks: Vec<Block>,
    /// Directed connections between blocks
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Loop regions keyed by loop id
    #[serde(default)]
    pub loops: IndexMap<String, Loop>,
}

impl SerializedWorkflow {
    /// Look up a block by id
    pub fn block(&self, block_id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == block_id)
    }

    /// Kind of the given block, `Standard` when the block is unknown
    pub fn block_kind(&self, block_id: &str) -> BlockKind {
        self.block(block_id).map(|b| b.kind).unwrap_or_default()
    }

    /// Connections leaving `block_id`, in declaration order
    pub fn outgoing<'a>(&'a self, block_id: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| c.source == block_id)
    }

    /// Connections entering `block_id`, in declaration order
    pub fn incoming<'a>(&'a self, block_id: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| c.target == block_id)
    }

    /// Whether the block has at least one error edge leaving it
    pub fn has_error_path(&self, block_id: &str) -> bool {
        self.outgoing(block_id).any(|c| c.kind == EdgeKind::Error)
    }
}

/// A single block (node) in the workflow graph
///
/// Opaque to the scheduler beyond its id and kind; `config` is handed to the
/// block executor untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    /// Unique block identifier within the workflow
    pub id: String,
    /// Discriminator used for decision and feedback-path handling
    #[serde(default)]
    pub kind: BlockKind,
    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Executor-specific configuration
    #[serde(default)]
    pub config: Value,
}

/// Block kinds the scheduler cares about
///
/// Everything else deserializes to `Standard`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    /// Workflow entry point
    Starter,
    /// Records a `condition` decision; its `condition-<id>` edges are gated on it
    Condition,
    /// Records a `router` decision naming the selected target block
    Router,
    /// Any other block
    #[default]
    #[serde(other)]
    Standard,
}

/// Edge kind, decoded once from the connection's `sourceHandle`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Unlabeled or `"source"` handle
    Default,
    /// `"error"` handle: live only when the source output signals an error
    Error,
    /// `"condition-<id>"` handle: live only when the source selected `<id>`
    Condition(String),
}

impl EdgeKind {
    /// Decode a raw source handle
    pub fn from_handle(handle: Option<&str>) -> Self {
        match handle {
            Some("error") => EdgeKind::Error,
            Some(h) if h.starts_with(CONDITION_HANDLE_PREFIX) => {
                EdgeKind::Condition(h[CONDITION_HANDLE_PREFIX.len()..].to_string())
            }
            _ => EdgeKind::Default,
        }
    }

    /// Encode back into the serialized handle form
    pub fn to_handle(&self) -> Option<String> {
        match self {
            EdgeKind::Default => None,
            EdgeKind::Error => Some("error".to_string()),
            EdgeKind::Condition(id) => Some(format!("{}{}", CONDITION_HANDLE_PREFIX, id)),
        }
    }
}

/// Directed connection between two blocks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawConnection", into = "RawConnection")]
pub struct Connection {
    /// Source block id
    pub source: String,
    /// Target block id
    pub target: String,
    /// Edge kind decoded from `sourceHandle`
    pub kind: EdgeKind,
    /// Target handle, carried through for round-tripping
    pub target_handle: Option<String>,
}

impl Connection {
    /// Unconditional connection
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_kind(source, target, EdgeKind::Default)
    }

    /// Connection with an explicit edge kind
    pub fn with_kind(source: impl Into<String>, target: impl Into<String>, kind: EdgeKind) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind,
            target_handle: None,
        }
    }

    /// `source == target`
    pub fn is_self_loop(&self) -> bool {
        self.source == self.target
    }
}

/// Wire form of a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConnection {
    source: String,
    target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_handle: Option<String>,
}

impl From<RawConnection> for Connection {
    fn from(raw: RawConnection) -> Self {
        Self {
            kind: EdgeKind::from_handle(raw.source_handle.as_deref()),
            source: raw.source,
            target: raw.target,
            target_handle: raw.target_handle,
        }
    }
}

impl From<Connection> for RawConnection {
    fn from(conn: Connection) -> Self {
        Self {
            source_handle: conn.kind.to_handle(),
            source: conn.source,
            target: conn.target,
            target_handle: conn.target_handle,
        }
    }
}

/// Loop semantics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoopType {
    /// Fixed iteration count
    #[default]
    For,
    /// One iteration per item of a collection
    ForEach,
}

/// A loop region: a flat set of blocks re-executed up to a bound
///
/// `for_each_items` may start out as an expression string; the loop manager
/// replaces it with the concrete collection the first time it is resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Loop {
    /// Member blocks; order matters for entry-block and feedback decisions
    pub nodes: Vec<String>,
    /// Iteration bound, falls back to the manager's default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<usize>,
    /// `for` or `forEach`
    #[serde(default)]
    pub loop_type: LoopType,
    /// Collection or expression for forEach loops
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each_items: Option<Value>,
}

impl Loop {
    /// Fixed-count loop over `nodes`
    pub fn fixed<S: Into<String>>(nodes: impl IntoIterator<Item = S>, iterations: usize) -> Self {
        Self {
            nodes: nodes.into_iter().map(Into::into).collect(),
            iterations: Some(iterations),
            loop_type: LoopType::For,
            for_each_items: None,
        }
    }

    /// For-each loop over `nodes` with a collection or expression
    pub fn for_each<S: Into<String>>(nodes: impl IntoIterator<Item = S>, items: Value) -> Self {
        Self {
            nodes: nodes.into_iter().map(Into::into).collect(),
            iterations: None,
            loop_type: LoopType::ForEach,
            for_each_items: Some(items),
        }
    }

    /// Whether `block_id` is a member of this loop
    pub fn contains(&self, block_id: &str) -> bool {
        self.nodes.iter().any(|n| n == block_id)
    }

    /// Position of `block_id` in `nodes`
    pub fn position(&self, block_id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n == block_id)
    }

    /// Whether the for-each collection has already been resolved to an array/object
    pub fn has_resolved_items(&self) -> bool {
        matches!(self.for_each_items, Some(Value::Array(_)) | Some(Value::Object(_)))
    }
}
