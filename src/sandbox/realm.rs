//! Construction of the isolated Lua realm.
//!
//! The interpreter only opens the string, table, math, utf8 and coroutine
//! libraries; coroutine is needed by async host functions and stays out of
//! the script environment. Scripts never see the interpreter globals: their
//! chunk runs with a fresh environment table holding an allow-listed copy
//! of the base functions plus the context bindings.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use mlua::{Function, Lua, LuaOptions, StdLib, Table, Value};

use super::bindings::{runtime, ExitRequest};
use super::rewrite::{is_identifier, CONTEXT_TABLE};
use crate::capabilities::CapabilityName;

const BASE_FUNCTIONS: [&str; 17] = [
    "assert",
    "error",
    "getmetatable",
    "ipairs",
    "next",
    "pairs",
    "pcall",
    "rawequal",
    "rawget",
    "rawlen",
    "rawset",
    "select",
    "setmetatable",
    "tonumber",
    "tostring",
    "type",
    "xpcall",
];

const LIBRARIES: [&str; 4] = ["string", "table", "math", "utf8"];

/// Runs inside the realm before the script. Protected calls must not
/// swallow a timeout or an exit request.
const PRELUDE: &str = r#"
local raw_pcall, raw_xpcall, must_unwind, spawn = ...
local pack, unpack = table.pack, table.unpack

local function pass(ok, ...)
  if not ok and must_unwind() then
    error((...), 0)
  end
  return ok, ...
end

pcall = function(f, ...)
  return pass(raw_pcall(f, ...))
end

xpcall = function(f, handler, ...)
  return pass(raw_xpcall(f, handler, ...))
end

defer = function(f, ...)
  local args = pack(...)
  return spawn(function()
    return f(unpack(args, 1, args.n))
  end)
end
"#;

pub fn new_lua(memory_limit_mb: usize) -> mlua::Result<Lua> {
    let lua = Lua::new_with(
        StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE,
        LuaOptions::new(),
    )?;
    if memory_limit_mb > 0 {
        lua.set_memory_limit(memory_limit_mb * 1024 * 1024)?;
    }
    Ok(lua)
}

pub struct Realm<'lua> {
    pub env: Table<'lua>,
    /// Names reachable through `__context`, in binding order
    pub names: Vec<String>,
}

impl<'lua> Realm<'lua> {
    /// `expired` is raised by the deadline hook.
    pub fn build(
        lua: &'lua Lua,
        bindings: Vec<(&'static str, Value<'lua>)>,
        expired: Arc<AtomicBool>,
    ) -> mlua::Result<Self> {
        let globals = lua.globals();
        let env = lua.create_table()?;

        for name in BASE_FUNCTIONS {
            env.raw_set(name, globals.get::<_, Value>(name)?)?;
        }
        for name in LIBRARIES {
            env.raw_set(name, globals.get::<_, Value>(name)?)?;
        }
        let table_lib: Table = globals.get("table")?;
        env.raw_set("unpack", table_lib.get::<_, Value>("unpack")?)?;
        env.raw_set("time", time(lua)?)?;
        env.raw_set("Buffer", buffer(lua)?)?;

        let exposed = lua.create_table()?;
        let mut names = Vec::new();
        for (name, value) in bindings {
            exposed.raw_set(name, value.clone())?;
            env.raw_set(name, value)?;
            if is_identifier(name) {
                names.push(name.to_string());
            }
        }
        if let Some(console) = exposed.raw_get::<_, Option<Table>>("console")? {
            env.raw_set("print", console.get::<_, Value>("log")?)?;
        }

        let proxy = read_only(lua, exposed.clone())?;
        exposed.raw_set("context", proxy.clone())?;
        env.raw_set(CONTEXT_TABLE, proxy.clone())?;
        env.raw_set("context", proxy)?;
        env.raw_set("require", require(lua, exposed)?)?;

        let module = lua.create_table()?;
        let exports = lua.create_table()?;
        module.raw_set("exports", exports.clone())?;
        env.raw_set("module", module)?;
        env.raw_set("exports", exports)?;
        env.raw_set("global", env.clone())?;
        env.raw_set("_G", env.clone())?;

        let must_unwind = lua.create_function(move |lua, ()| {
            Ok(expired.load(Ordering::SeqCst) || lua.app_data_ref::<ExitRequest>().is_some())
        })?;
        let spawn = lua.create_function(|lua, f: Function| lua.create_thread(f))?;
        lua.load(PRELUDE)
            .set_name("=prelude")
            .set_environment(env.clone())
            .call::<_, ()>((
                globals.get::<_, Function>("pcall")?,
                globals.get::<_, Function>("xpcall")?,
                must_unwind,
                spawn,
            ))?;

        Ok(Self { env, names })
    }
}

/// Empty table that reads through to `inner` and refuses writes.
fn read_only<'lua>(lua: &'lua Lua, inner: Table<'lua>) -> mlua::Result<Table<'lua>> {
    let proxy = lua.create_table()?;
    let meta = lua.create_table()?;
    meta.raw_set("__index", inner)?;
    meta.raw_set(
        "__newindex",
        lua.create_function(|_, (_, key): (Value, Value)| -> mlua::Result<()> {
            let key = match key {
                Value::String(s) => s.to_string_lossy().into_owned(),
                other => other.type_name().to_string(),
            };
            Err(runtime(format!("{CONTEXT_TABLE} is read-only (cannot set '{key}')")))
        })?,
    )?;
    meta.raw_set("__metatable", "locked")?;
    proxy.set_metatable(Some(meta));
    Ok(proxy)
}

fn require<'lua>(lua: &'lua Lua, exposed: Table<'lua>) -> mlua::Result<Function<'lua>> {
    let exposed = lua.create_registry_value(exposed)?;
    lua.create_function(move |lua, name: String| {
        if CapabilityName::from_binding(&name).is_none() {
            return Err(runtime(format!("module '{name}' is not available in the sandbox")));
        }
        let table: Table = lua.registry_value(&exposed)?;
        match table.raw_get::<_, Value>(name.as_str())? {
            Value::Nil => Err(runtime(format!("module '{name}' failed to load"))),
            value => Ok(value),
        }
    })
}

fn time(lua: &Lua) -> mlua::Result<Table<'_>> {
    let t = lua.create_table()?;
    t.raw_set(
        "now_ms",
        lua.create_function(|_, ()| Ok(Utc::now().timestamp_millis()))?,
    )?;
    t.raw_set(
        "iso",
        lua.create_function(|_, ()| Ok(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)))?,
    )?;
    t.raw_set(
        "sleep",
        lua.create_async_function(|_, ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(())
        })?,
    )?;
    Ok(t)
}

fn buffer(lua: &Lua) -> mlua::Result<Table<'_>> {
    let t = lua.create_table()?;
    t.raw_set(
        "from",
        lua.create_function(|lua, (data, encoding): (mlua::String, Option<String>)| {
            let bytes = decode(data.as_bytes(), encoding.as_deref().unwrap_or("utf8"))?;
            lua.create_string(bytes)
        })?,
    )?;
    t.raw_set(
        "encode",
        lua.create_function(|_, (data, encoding): (mlua::String, Option<String>)| {
            encode(data.as_bytes(), encoding.as_deref().unwrap_or("utf8"))
        })?,
    )?;
    Ok(t)
}

fn decode(data: &[u8], encoding: &str) -> mlua::Result<Vec<u8>> {
    match encoding.to_ascii_lowercase().as_str() {
        "utf8" | "utf-8" | "binary" => Ok(data.to_vec()),
        "base64" => STANDARD.decode(data).map_err(runtime),
        "hex" => hex::decode(data).map_err(runtime),
        other => Err(runtime(format!("unknown encoding '{other}'"))),
    }
}

fn encode(data: &[u8], encoding: &str) -> mlua::Result<String> {
    match encoding.to_ascii_lowercase().as_str() {
        "utf8" | "utf-8" | "binary" => Ok(String::from_utf8_lossy(data).into_owned()),
        "base64" => Ok(STANDARD.encode(data)),
        "hex" => Ok(hex::encode(data)),
        other => Err(runtime(format!("unknown encoding '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn realm_eval<'lua>(lua: &'lua Lua, realm: &Realm<'lua>, src: &str) -> mlua::Result<Value<'lua>> {
        lua.load(src)
            .set_name("=test")
            .set_environment(realm.env.clone())
            .eval()
    }

    fn empty_realm(lua: &Lua) -> Realm<'_> {
        Realm::build(lua, Vec::new(), Arc::new(AtomicBool::new(false))).unwrap()
    }

    #[test]
    fn test_dangerous_globals_are_absent() {
        let lua = new_lua(0).unwrap();
        let realm = empty_realm(&lua);
        let v = realm_eval(
            &lua,
            &realm,
            "return os == nil and io == nil and load == nil and dofile == nil \
             and debug == nil and package == nil and coroutine == nil \
             and collectgarbage == nil and loadfile == nil",
        )
        .unwrap();
        assert_eq!(v, Value::Boolean(true));
    }

    #[test]
    fn test_allowed_libraries_work() {
        let lua = new_lua(0).unwrap();
        let realm = empty_realm(&lua);
        let v = realm_eval(
            &lua,
            &realm,
            r##"return string.upper("ok") .. math.floor(2.7) .. select("#", unpack({1, 2}))"##,
        )
        .unwrap();
        assert_eq!(v.as_str(), Some("OK22"));
    }

    #[test]
    fn test_context_table_is_read_only() {
        let lua = new_lua(0).unwrap();
        let realm = Realm::build(
            &lua,
            vec![("answer", Value::Integer(42))],
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        assert_eq!(realm.names, vec!["answer"]);
        let v = realm_eval(&lua, &realm, "return __context.answer + context.answer").unwrap();
        assert_eq!(v, Value::Integer(84));
        let err = realm_eval(&lua, &realm, "__context.answer = 1").unwrap_err();
        assert!(err.to_string().contains("read-only"));
        let v = realm_eval(&lua, &realm, "return getmetatable(__context)").unwrap();
        assert_eq!(v.as_str(), Some("locked"));
    }

    #[test]
    fn test_context_alias_reaches_table_bindings() {
        let lua = new_lua(0).unwrap();
        let argv = lua.create_table().unwrap();
        argv.raw_set("region", "west").unwrap();
        let realm = Realm::build(
            &lua,
            vec![("argv", Value::Table(argv))],
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        let v = realm_eval(&lua, &realm, "return context.argv.region").unwrap();
        assert_eq!(v.as_str(), Some("west"));
        let v = realm_eval(&lua, &realm, "return rawequal(context, __context)").unwrap();
        assert_eq!(v, Value::Boolean(true));
        assert!(realm_eval(&lua, &realm, "context.argv = nil").is_err());
    }

    #[test]
    fn test_require_only_knows_capabilities() {
        let lua = new_lua(0).unwrap();
        let realm = empty_realm(&lua);
        let err = realm_eval(&lua, &realm, r#"return require("os")"#).unwrap_err();
        assert!(err.to_string().contains("not available"));
        // Known but not loaded
        let err = realm_eval(&lua, &realm, r#"return require("pdf")"#).unwrap_err();
        assert!(err.to_string().contains("failed to load"));
    }

    #[test]
    fn test_global_points_at_environment() {
        let lua = new_lua(0).unwrap();
        let realm = empty_realm(&lua);
        let v = realm_eval(&lua, &realm, "x = 5; return global.x + _G.x").unwrap();
        assert_eq!(v, Value::Integer(10));
        assert_eq!(lua.globals().get::<_, Value>("x").unwrap(), Value::Nil);
    }

    #[test]
    fn test_pcall_rethrows_after_expiry() {
        let lua = new_lua(0).unwrap();
        let expired = Arc::new(AtomicBool::new(false));
        let realm = Realm::build(&lua, Vec::new(), expired.clone()).unwrap();

        let v = realm_eval(&lua, &realm, r#"return (pcall(error, "x"))"#).unwrap();
        assert_eq!(v, Value::Boolean(false));

        expired.store(true, Ordering::SeqCst);
        assert!(realm_eval(&lua, &realm, r#"return pcall(error, "x")"#).is_err());
    }

    #[test]
    fn test_buffer_encodings() {
        let lua = new_lua(0).unwrap();
        let realm = empty_realm(&lua);
        let v = realm_eval(
            &lua,
            &realm,
            r#"return Buffer.encode("hi", "base64") .. "|" .. Buffer.encode(Buffer.from("6869", "hex"), "utf8")"#,
        )
        .unwrap();
        assert_eq!(v.as_str(), Some("aGk=|hi"));
        assert!(realm_eval(&lua, &realm, r#"return Buffer.from("x", "ebcdic")"#).is_err());
    }

    #[test]
    fn test_memory_limit_is_enforced() {
        let lua = new_lua(1).unwrap();
        let realm = empty_realm(&lua);
        let err = realm_eval(&lua, &realm, r#"return string.rep("x", 4 * 1024 * 1024)"#).unwrap_err();
        assert!(matches!(err, mlua::Error::MemoryError(_)));
    }
}
