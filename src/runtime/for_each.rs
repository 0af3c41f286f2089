/// For-each collection resolution
///
/// A loop's `forEachItems` is either already a collection or a string that is
/// interpreted in this order: comment-only/empty, JSON literal, lenient JSON
/// literal, sandboxed Lua expression with `context` bound. Nothing here fails the
/// run; unresolvable input degrades to the block-output scan and then to `[]`.

use crate::runtime::{context::ExecutionContext, sandbox::LuaSandbox};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static SINGLE_QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'((?:[^'\\]|\\.)*)'").expect("valid single-quote pattern"));
static BARE_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([{,]\s*)([A-Za-z_$][A-Za-z0-9_$]*)\s*:").expect("valid bare-key pattern")
});
static TRAILING_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",\s*([}\]])").expect("valid trailing-comma pattern"));

/// Resolve `items` into an array or object
pub(crate) fn resolve_items(
    items: &Value,
    context: &ExecutionContext,
    sandbox: &LuaSandbox,
) -> Value {
    match items {
        Value::Array(_) | Value::Object(_) => return items.clone(),
        Value::String(source) => {
            if is_comment_only(source) {
                tracing::debug!("💬 forEach expression is empty or comment-only");
                return Value::Array(vec![]);
            }
            if let Some(parsed) = parse_collection_literal(source) {
                return parsed;
            }
            match sandbox.eval(source, &[("context", &context.to_expression_scope())]) {
                Ok(Value::Null) => return Value::Array(vec![]),
                Ok(value @ (Value::Array(_) | Value::Object(_))) => return value,
                Ok(scalar) => return Value::Array(vec![scalar]),
                Err(e) => {
                    tracing::error!("❌ Failed to evaluate forEach expression '{}': {}", source, e);
                }
            }
        }
        other => {
            tracing::warn!("⚠️ Unsupported forEach items value: {}", other);
        }
    }

    scan_block_outputs(context).unwrap_or_else(|| Value::Array(vec![]))
}

/// Strict then lenient JSON parse of `[`/`{` literals
pub(crate) fn parse_collection_literal(source: &str) -> Option<Value> {
    let trimmed = source.trim();
    if !(trimmed.starts_with('[') || trimmed.starts_with('{')) {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let normalized = normalize_lenient_json(trimmed);
    match serde_json::from_str::<Value>(&normalized) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!("🔧 forEach literal is not JSON after normalization: {}", e);
            None
        }
    }
}

/// Rewrite single-quoted strings and bare keys as JSON, drop trailing commas
///
/// The rewrites are plain regex passes over the whole source and do not skip
/// text inside double-quoted strings: an apostrophe or `word:` inside one can
/// corrupt the literal, which then fails to parse and is handed to Lua.
pub(crate) fn normalize_lenient_json(source: &str) -> String {
    let double_quoted = SINGLE_QUOTED.replace_all(source, |caps: &regex::Captures| {
        let inner = caps[1].replace("\\'", "'").replace('"', "\\\"");
        format!("\"{}\"", inner)
    });
    let keyed = BARE_KEY.replace_all(&double_quoted, "$1\"$2\":");
    TRAILING_COMMA.replace_all(&keyed, "$1").into_owned()
}

fn is_comment_only(source: &str) -> bool {
    source.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with("//") || line.starts_with("--")
    })
}

/// First non-empty array or object among the top-level fields of any recorded output
///
/// Legacy recovery path: selection is purely first-encountered in block-state order.
fn scan_block_outputs(context: &ExecutionContext) -> Option<Value> {
    for (block_id, state) in &context.block_states {
        let Value::Object(fields) = &state.output else {
            continue;
        };
        for (key, value) in fields {
            let found = match value {
                Value::Array(a) => !a.is_empty(),
                Value::Object(o) => !o.is_empty(),
                _ => false,
            };
            if found {
                tracing::warn!(
                    "🩹 Falling back to '{}.{}' as forEach collection",
                    block_id,
                    key
                );
                return Some(value.clone());
            }
        }
    }
    None
}

/// Number of iterations a resolved collection provides
pub(crate) fn collection_len(items: Option<&Value>) -> usize {
    match items {
        Some(Value::Array(a)) => a.len(),
        Some(Value::Object(o)) => o.len(),
        _ => 0,
    }
}

/// Item at `index`: array element, or `[key, value]` pair for objects
pub(crate) fn item_at(items: Option<&Value>, index: usize) -> Option<Value> {
    match items {
        Some(Value::Array(a)) => a.get(index).cloned(),
        Some(Value::Object(o)) => o
            .iter()
            .nth(index)
            .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), v.clone()])),
        _ => None,
    }
}
