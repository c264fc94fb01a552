//! Lua evaluation.
//!
//! One fresh, single-threaded interpreter per evaluation; nothing is shared
//! across rules or messages. The script sees a global `message` table and
//! its return value is marshalled to JSON for the outputs. A VM hook
//! enforces the wall-clock ceiling.

use super::script::{ScriptError, ScriptOutcome, message_value};
use crate::message::Message;
use mlua::{HookTriggers, Lua, LuaSerdeExt, Value, VmState};
use std::time::{Duration, Instant};

/// Instructions between deadline checks; coarse enough to stay cheap.
const HOOK_GRANULARITY: u32 = 4096;

const DEADLINE_MARKER: &str = "evaluation deadline exceeded";

/// Runs Lua rule scripts.
#[derive(Debug, Clone)]
pub struct LuaRunner {
    timeout: Duration,
}

impl LuaRunner {
    /// Creates a runner with the given wall-clock ceiling per evaluation.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Evaluates a script against a message on the blocking pool.
    pub async fn evaluate(
        &self,
        script: &[u8],
        message: &Message,
    ) -> Result<ScriptOutcome, ScriptError> {
        let source = String::from_utf8(script.to_vec()).map_err(|e| ScriptError::Load {
            reason: e.to_string(),
        })?;
        let message = message.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || evaluate_blocking(&source, &message, timeout))
            .await
            .map_err(|e| ScriptError::Failed {
                reason: format!("evaluation task failed: {e}"),
            })?
    }
}

fn evaluate_blocking(
    source: &str,
    message: &Message,
    timeout: Duration,
) -> Result<ScriptOutcome, ScriptError> {
    let lua = Lua::new();

    let bindings = lua
        .to_value(&message_value(message))
        .map_err(|e| ScriptError::Load {
            reason: e.to_string(),
        })?;
    lua.globals()
        .set("message", bindings)
        .map_err(|e| ScriptError::Load {
            reason: e.to_string(),
        })?;

    let deadline = Instant::now() + timeout;
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_GRANULARITY),
        move |_lua, _debug| {
            if Instant::now() >= deadline {
                Err(mlua::Error::RuntimeError(DEADLINE_MARKER.to_string()))
            } else {
                Ok(VmState::Continue)
            }
        },
    );

    let value = lua
        .load(source)
        .eval::<Value>()
        .map_err(|e| map_lua_error(&e))?;

    if let Value::Boolean(false) = value {
        return Ok(ScriptOutcome::Skip);
    }

    let result: serde_json::Value =
        lua.from_value(value).map_err(|e| ScriptError::BadResult {
            reason: e.to_string(),
        })?;
    Ok(ScriptOutcome::Value(result))
}

fn map_lua_error(e: &mlua::Error) -> ScriptError {
    let rendered = e.to_string();
    if rendered.contains(DEADLINE_MARKER) {
        ScriptError::Timeout
    } else {
        ScriptError::Failed { reason: rendered }
    }
}
