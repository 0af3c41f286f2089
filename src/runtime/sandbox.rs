/// Sandboxed Lua evaluation
///
/// Every evaluation gets a fresh Lua state and a private environment table that
/// only holds the caller's bindings plus a whitelist of pure libraries. Nothing
/// in `os`, `io`, `debug` or `package` is reachable, and loading code is not allowed.

use anyhow::Result;
use mlua::{Lua, LuaSerdeExt};
use serde_json::Value;

/// Globals copied into every sandbox environment
const SAFE_GLOBALS: &[&str] = &[
    "math", "string", "table", "utf8", "pairs", "ipairs", "next", "select", "tostring",
    "tonumber", "type", "assert", "error", "pcall",
];

/// Default heap cap for a single evaluation (16 MiB)
pub const DEFAULT_MEMORY_LIMIT: usize = 16 * 1024 * 1024;

/// Lua sandbox shared by for-each evaluation and the Lua block executor
#[derive(Debug, Clone)]
pub struct LuaSandbox {
    memory_limit: usize,
}

impl Default for LuaSandbox {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_LIMIT)
    }
}

impl LuaSandbox {
    pub fn new(memory_limit: usize) -> Self {
        Self { memory_limit }
    }

    /// Evaluate `source` with `bindings` as the only free variables
    ///
    /// `source` may be a single expression or a block ending in `return`.
    pub fn eval(&self, source: &str, bindings: &[(&str, &Value)]) -> Result<Value> {
        let lua = Lua::new();
        if self.memory_limit > 0 {
            lua.set_memory_limit(self.memory_limit)
                .map_err(|e| anyhow::anyhow!("Failed to set Lua memory limit: {}", e))?;
        }

        let globals = lua.globals();
        let env = lua
            .create_table()
            .map_err(|e| anyhow::anyhow!("Failed to create sandbox environment: {}", e))?;
        for name in SAFE_GLOBALS {
            let value: mlua::Value = globals
                .get(*name)
                .map_err(|e| anyhow::anyhow!("Failed to read Lua global '{}': {}", name, e))?;
            env.set(*name, value)
                .map_err(|e| anyhow::anyhow!("Failed to expose '{}': {}", name, e))?;
        }
        env.set("null", lua.null())
            .map_err(|e| anyhow::anyhow!("Failed to expose 'null': {}", e))?;
        for (name, value) in bindings {
            let lua_value = json_to_lua(&lua, value)
                .map_err(|e| anyhow::anyhow!("Failed to bind '{}': {}", name, e))?;
            env.set(*name, lua_value)
                .map_err(|e| anyhow::anyhow!("Failed to bind '{}': {}", name, e))?;
        }

        let result = lua
            .load(source)
            .set_name("sandbox")
            .set_environment(env)
            .eval::<mlua::Value>()
            .map_err(|e| anyhow::anyhow!("Sandboxed Lua evaluation failed: {}", e))?;

        lua_to_json(&lua, result)
    }
}

/// Convert a JSON value into a Lua value
///
/// Arrays carry mlua's array metatable and JSON `null` becomes the `null`
/// sentinel, so `[1, null, 3]` keeps its length and `[]` stays an array.
pub fn json_to_lua(lua: &Lua, value: &Value) -> mlua::Result<mlua::Value> {
    lua.to_value(value)
}

/// Convert a Lua value back to JSON
///
/// Tables with a sequence part (or the array metatable) become arrays, other
/// tables become objects, `nil` and the `null` sentinel become null.
pub fn lua_to_json(lua: &Lua, lua_value: mlua::Value) -> Result<Value> {
    lua.from_value(lua_value)
        .map_err(|e| anyhow::anyhow!("Lua result is not representable as JSON: {}", e))
}

/// Render a JSON value as a Lua literal
///
/// Used to splice `<loop.*>` references into block scripts. `null` renders as
/// the sandbox's `null` sentinel so arrays keep their length.
pub fn json_to_lua_literal(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("{:?}", s),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(json_to_lua_literal).collect();
            format!("{{{}}}", items.join(", "))
        }
        Value::Object(obj) => {
            let pairs: Vec<String> = obj
                .iter()
                .map(|(k, v)| format!("[{:?}] = {}", k, json_to_lua_literal(v)))
                .collect();
            format!("{{{}}}", pairs.join(", "))
        }
    }
}
