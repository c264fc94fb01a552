//! Compiled-logic evaluation in a WebAssembly sandbox.
//!
//! The second script kind is a WASM module with a tiny JSON ABI: the module
//! exports `memory`, `alloc(len) -> ptr` and `logic(ptr, len) -> packed`,
//! where `packed` is `(ptr << 32) | len` of a JSON result in the module's
//! memory and `0` means no result. The message reaches the module as the
//! same JSON value the Lua binding sees. Each evaluation gets a fresh store;
//! nothing survives between messages. Epoch interruption enforces the
//! wall-clock ceiling.

use super::script::{ScriptError, ScriptOutcome, message_value};
use crate::message::Message;
use std::time::Duration;
use wasmtime::{Config, Engine, Linker, Module, Store, Trap};

/// Epoch tick used to convert the wall-clock ceiling into deadlines.
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Runs compiled rule modules.
#[derive(Clone)]
pub struct WasmRunner {
    engine: Engine,
    deadline_ticks: u64,
}

impl WasmRunner {
    /// Creates a runner; spawns the engine's epoch ticker thread.
    pub fn new(timeout: Duration) -> Result<Self, ScriptError> {
        let mut config = Config::new();
        config.epoch_interruption(true);
        let engine = Engine::new(&config).map_err(|e| ScriptError::Load {
            reason: e.to_string(),
        })?;

        let weak = engine.weak();
        std::thread::spawn(move || {
            loop {
                std::thread::sleep(EPOCH_TICK);
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                engine.increment_epoch();
            }
        });

        let deadline_ticks = timeout.as_millis().div_ceil(EPOCH_TICK.as_millis()) as u64 + 1;
        Ok(Self {
            engine,
            deadline_ticks,
        })
    }

    /// Evaluates a module against a message on the blocking pool.
    pub async fn evaluate(
        &self,
        module_bytes: &[u8],
        message: &Message,
    ) -> Result<ScriptOutcome, ScriptError> {
        let runner = self.clone();
        let module_bytes = module_bytes.to_vec();
        let input = serde_json::to_vec(&message_value(message)).map_err(|e| {
            ScriptError::BadResult {
                reason: e.to_string(),
            }
        })?;
        tokio::task::spawn_blocking(move || runner.evaluate_blocking(&module_bytes, &input))
            .await
            .map_err(|e| ScriptError::Failed {
                reason: format!("evaluation task failed: {e}"),
            })?
    }

    fn evaluate_blocking(
        &self,
        module_bytes: &[u8],
        input: &[u8],
    ) -> Result<ScriptOutcome, ScriptError> {
        let module = Module::new(&self.engine, module_bytes).map_err(|e| ScriptError::Load {
            reason: e.to_string(),
        })?;

        let mut store = Store::new(&self.engine, ());
        store.set_epoch_deadline(self.deadline_ticks);

        let linker = Linker::new(&self.engine);
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| ScriptError::Load {
                reason: e.to_string(),
            })?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| ScriptError::Load {
                reason: "module exports no memory".to_string(),
            })?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, "alloc")
            .map_err(|e| ScriptError::Load {
                reason: e.to_string(),
            })?;
        let logic = instance
            .get_typed_func::<(i32, i32), i64>(&mut store, "logic")
            .map_err(|e| ScriptError::Load {
                reason: e.to_string(),
            })?;

        let len = i32::try_from(input.len()).map_err(|_| ScriptError::BadResult {
            reason: "message too large for module".to_string(),
        })?;
        let ptr = alloc.call(&mut store, len).map_err(map_trap)?;
        memory
            .write(&mut store, ptr as usize, input)
            .map_err(|e| ScriptError::Failed {
                reason: e.to_string(),
            })?;

        let packed = logic.call(&mut store, (ptr, len)).map_err(map_trap)?;
        if packed == 0 {
            return Ok(ScriptOutcome::Skip);
        }

        let out_ptr = (packed >> 32) as u32 as usize;
        let out_len = packed as u32 as usize;
        let data = memory.data(&store);
        let end = out_ptr
            .checked_add(out_len)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| ScriptError::BadResult {
                reason: "result outside module memory".to_string(),
            })?;

        let result: serde_json::Value =
            serde_json::from_slice(&data[out_ptr..end]).map_err(|e| ScriptError::BadResult {
                reason: e.to_string(),
            })?;
        if result == serde_json::Value::Bool(false) {
            return Ok(ScriptOutcome::Skip);
        }
        Ok(ScriptOutcome::Value(result))
    }
}

fn map_trap(e: wasmtime::Error) -> ScriptError {
    if let Some(Trap::Interrupt) = e.downcast_ref::<Trap>() {
        ScriptError::Timeout
    } else {
        ScriptError::Failed {
            reason: e.to_string(),
        }
    }
}
