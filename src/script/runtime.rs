//! Script Config and Worker Runtime

use mlua::{Function, Lua, Thread, Value};

use crate::{error::ScriptError, option::ScriptFilterOption, ScriptResult};

use super::{REQUEST_ENTRY_POINT, RESPONSE_ENTRY_POINT};

const CHUNK_NAME: &str = "inline_code";

// A native method cannot suspend a Lua coroutine, so the blocking handle
// methods go through this glue: each one polls the native handle and yields
// from Lua when the native side reports not-ready. The arguments of the
// resume become the method's return value.
const HANDLE_GLUE: &str = r#"
return function(native)
  local handle = {}

  function handle:headers()
    return native:headers()
  end

  function handle:body()
    local ready, body = native:body()
    if ready then
      return body
    end
    return coroutine.yield()
  end

  function handle:bodyChunks()
    return function()
      local ready, chunk = native:bodyChunk()
      if ready then
        return chunk
      end
      return coroutine.yield()
    end
  end

  function handle:trailers()
    local ready, trailers = native:trailers()
    if ready then
      return trailers
    end
    return coroutine.yield()
  end

  function handle:log(level, message)
    return native:log(level, message)
  end

  function handle:httpCall(...)
    return native:httpCall(...)
  end

  return handle
end
"#;

/// Validated script source, shared by every worker. Immutable once built;
/// a compile failure here is fatal to configuration.
#[derive(Debug, Clone)]
pub struct ScriptConfig {
    source: String,
}

impl ScriptConfig {
    pub fn init(opt: ScriptFilterOption) -> ScriptResult<Self> {
        let lua = Lua::new();
        lua.load(&opt.inline_code)
            .set_name(CHUNK_NAME)
            .into_function()
            .map_err(|e| ScriptError::Load(e.to_string()))?;

        Ok(Self {
            source: opt.inline_code,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// One script runtime per worker thread. Each worker holds its own
/// independent execution of the same source, so script globals never leak
/// between workers. The runtime is `!Send`; it stays on the thread that
/// created it, together with every filter built on it.
#[derive(Debug)]
pub struct WorkerRuntime {
    lua: Lua,
    wrap_handle: Function,
    request_entry: Option<Function>,
    response_entry: Option<Function>,
}

impl WorkerRuntime {
    pub fn init(config: &ScriptConfig) -> ScriptResult<Self> {
        let lua = Lua::new();
        lua.load(config.source())
            .set_name(CHUNK_NAME)
            .exec()
            .map_err(|e| ScriptError::Load(e.to_string()))?;

        let wrap_handle = lua
            .load(HANDLE_GLUE)
            .set_name("handle_glue")
            .eval::<Function>()
            .map_err(|e| ScriptError::Load(e.to_string()))?;

        let request_entry = Self::entry_point(&lua, REQUEST_ENTRY_POINT)?;
        let response_entry = Self::entry_point(&lua, RESPONSE_ENTRY_POINT)?;

        Ok(Self {
            lua,
            wrap_handle,
            request_entry,
            response_entry,
        })
    }

    fn entry_point(lua: &Lua, name: &str) -> ScriptResult<Option<Function>> {
        match lua.globals().get::<Value>(name)? {
            Value::Function(function) => Ok(Some(function)),
            _ => Ok(None),
        }
    }

    pub fn request_entry(&self) -> Option<&Function> {
        self.request_entry.as_ref()
    }

    pub fn response_entry(&self) -> Option<&Function> {
        self.response_entry.as_ref()
    }

    pub(crate) fn lua(&self) -> &Lua {
        &self.lua
    }

    pub(crate) fn wrap_handle(&self) -> &Function {
        &self.wrap_handle
    }

    pub(crate) fn spawn_coroutine(&self, entry: &Function) -> mlua::Result<Thread> {
        self.lua.create_thread(entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(code: &str) -> ScriptResult<ScriptConfig> {
        ScriptConfig::init(ScriptFilterOption {
            inline_code: code.to_string(),
        })
    }

    #[test]
    fn test_bad_code() {
        let err = config("function envoy_on_request(handle)\n  bad bad\nend").unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("script load error:"), "{}", msg);
        assert!(msg.contains(":2:"), "{}", msg);
    }

    #[test]
    fn test_entry_point_detection() {
        let config = config("function envoy_on_request(handle) end\nenvoy_on_response = 5").unwrap();
        let runtime = WorkerRuntime::init(&config).unwrap();
        assert!(runtime.request_entry().is_some());
        assert!(runtime.response_entry().is_none());
    }

    #[test]
    fn test_load_error_at_execution() {
        let config = config("error(\"boom\")").unwrap();
        let err = WorkerRuntime::init(&config).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_workers_do_not_share_globals() {
        let config = config("counter = 0\nfunction envoy_on_request(handle) end").unwrap();
        let first = WorkerRuntime::init(&config).unwrap();
        let second = WorkerRuntime::init(&config).unwrap();

        first.lua().load("counter = counter + 1").exec().unwrap();

        let first_counter: i64 = first.lua().globals().get("counter").unwrap();
        let second_counter: i64 = second.lua().globals().get("counter").unwrap();
        assert_eq!(first_counter, 1);
        assert_eq!(second_counter, 0);
    }
}
