//! Lua-facing wrappers around the execution context.
//!
//! Every capability becomes a plain table of functions. Values cross the
//! boundary as JSON: Lua tables in, `serde_json::Value` through the host,
//! Lua tables out. JSON `null` becomes `nil`.
use std::fmt;
use std::sync::Arc;

use mlua::{
    DeserializeOptions, Function, Lua, LuaSerdeExt, MultiValue, SerializeOptions, Table, Value,
    Variadic,
};
use serde::Serialize;
use serde_json::Map;

use crate::args::ArgParser;
use crate::capabilities::mail::MailMessage;
use crate::capabilities::spreadsheet::{json_to_sheet, parse_cell_ref, sheet_to_json, Row};
use crate::capabilities::{
    CapabilityName, CapabilitySet, Clock, FileApi, FormulaEngine, MailSender, PdfExtractor, Shell,
    Spreadsheet, SqlClient,
};
use crate::color_log::{Tone, COMBINATIONS};
use crate::context::{ConsoleLevel, DbHelpers, ExecutionContext, ScriptLogger};

/// Set by `process.exit(code)`; the runner reads it after the script unwinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRequest(pub i32);

pub const EXIT_MARKER: &str = "process.exit";

pub fn runtime(e: impl fmt::Display) -> mlua::Error {
    mlua::Error::RuntimeError(format!("{e:#}"))
}

pub fn to_lua<'lua, T: Serialize + ?Sized>(lua: &'lua Lua, value: &T) -> mlua::Result<Value<'lua>> {
    lua.to_value_with(
        value,
        SerializeOptions::new()
            .serialize_none_to_null(false)
            .serialize_unit_to_null(false),
    )
}

/// Functions, threads and userdata become `null`.
pub fn from_lua(lua: &Lua, value: Value) -> mlua::Result<serde_json::Value> {
    lua.from_value_with(value, DeserializeOptions::new().deny_unsupported_types(false))
}

fn json_object(lua: &Lua, value: Option<Value>) -> mlua::Result<Map<String, serde_json::Value>> {
    match value {
        None | Some(Value::Nil) => Ok(Map::new()),
        Some(v) => match from_lua(lua, v)? {
            serde_json::Value::Object(map) => Ok(map),
            serde_json::Value::Array(a) if a.is_empty() => Ok(Map::new()),
            other => Err(runtime(format!("expected a table of named values, got {other}"))),
        },
    }
}

fn rows(lua: &Lua, value: Value) -> mlua::Result<Vec<Row>> {
    match from_lua(lua, value)? {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|row| match row {
                serde_json::Value::Array(cells) => Ok(cells),
                other => Err(runtime(format!("expected a row list, got {other}"))),
            })
            .collect(),
        serde_json::Value::Object(map) if map.is_empty() => Ok(Vec::new()),
        other => Err(runtime(format!("expected a list of rows, got {other}"))),
    }
}

/// Renders console arguments the way `print` would, tables as JSON.
pub fn console_line(lua: &Lua, args: MultiValue) -> String {
    args.into_iter()
        .map(|v| match v {
            Value::String(s) => s.to_string_lossy().into_owned(),
            Value::Nil => "nil".to_string(),
            Value::Table(_) => match from_lua(lua, v) {
                Ok(json) => json.to_string(),
                Err(_) => "table".to_string(),
            },
            Value::Function(_) => "function".to_string(),
            Value::Thread(_) => "thread".to_string(),
            other => match from_lua(lua, other) {
                Ok(serde_json::Value::String(s)) => s,
                Ok(json) => json.to_string(),
                Err(_) => "userdata".to_string(),
            },
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn json_parts(lua: &Lua, args: MultiValue) -> mlua::Result<Vec<serde_json::Value>> {
    args.into_iter().map(|v| from_lua(lua, v)).collect()
}

// ── capabilities ────────────────────────────────────────────────────

/// Every loaded capability under its binding name and aliases. Absent
/// capabilities are skipped and read as `nil`.
pub fn capability_bindings<'lua>(
    lua: &'lua Lua,
    set: &CapabilitySet,
) -> mlua::Result<Vec<(&'static str, Value<'lua>)>> {
    let mut out = Vec::new();
    for name in CapabilityName::ALL {
        let table = match name {
            CapabilityName::Database => set.database.clone().map(|c| database(lua, c)),
            CapabilityName::Clock => set.clock.clone().map(|c| clock(lua, c)),
            CapabilityName::Args => set.args.clone().map(|c| args(lua, c)),
            CapabilityName::Files => set.files.clone().map(|c| files(lua, c)),
            CapabilityName::Spreadsheet => set.spreadsheet.clone().map(|c| spreadsheet(lua, c)),
            CapabilityName::Formula => set.formula.clone().map(|c| formula(lua, c)),
            CapabilityName::Pdf => set.pdf.clone().map(|c| pdf(lua, c)),
            CapabilityName::Mail => set.mail.clone().map(|c| mail(lua, c)),
            CapabilityName::Shell => set.shell.clone().map(|c| shell(lua, c)),
        };
        let Some(table) = table.transpose()? else {
            continue;
        };
        out.push((name.binding(), Value::Table(table.clone())));
        for alias in name.aliases() {
            out.push((*alias, Value::Table(table.clone())));
        }
    }
    Ok(out)
}

fn database(lua: &Lua, client: Arc<SqlClient>) -> mlua::Result<Table<'_>> {
    let t = lua.create_table()?;

    let c = client.clone();
    t.set(
        "query",
        lua.create_async_function(move |lua, (query, params): (String, Option<Value>)| {
            let c = c.clone();
            async move {
                let params = json_object(lua, params)?;
                let result = c.query(&query, &params).await.map_err(runtime)?;
                to_lua(lua, &result)
            }
        })?,
    )?;

    let c = client.clone();
    t.set(
        "count",
        lua.create_async_function(move |_, table: String| {
            let c = c.clone();
            async move { c.count_rows(&table).await.map_err(runtime) }
        })?,
    )?;

    let c = client.clone();
    t.set("connected", lua.create_function(move |_, ()| Ok(c.is_connected()))?)?;

    let c = client.clone();
    t.set("close", lua.create_function(move |_, ()| Ok(c.close()))?)?;

    t.set("gateway", client.gateway().as_str())?;
    Ok(t)
}

fn clock(lua: &Lua, clock: Arc<dyn Clock>) -> mlua::Result<Table<'_>> {
    let t = lua.create_table()?;

    let c = clock.clone();
    t.set("now", lua.create_function(move |_, ()| Ok(c.now()))?)?;

    let c = clock.clone();
    t.set("unix", lua.create_function(move |_, ()| Ok(c.unix()))?)?;

    // format(pattern) formats now, format(timestamp, pattern) a given instant
    let c = clock.clone();
    t.set(
        "format",
        lua.create_function(move |_, (a, b): (String, Option<String>)| match b {
            None => Ok(c.format_now(&a)),
            Some(pattern) => c.format(&a, &pattern).map_err(runtime),
        })?,
    )?;

    let c = clock.clone();
    t.set(
        "is_valid",
        lua.create_function(move |_, ts: String| Ok(c.is_valid(&ts)))?,
    )?;

    let c = clock.clone();
    t.set(
        "add",
        lua.create_function(move |_, (ts, amount, unit): (String, i64, String)| {
            c.add(&ts, amount, &unit).map_err(runtime)
        })?,
    )?;

    let c = clock.clone();
    t.set(
        "diff",
        lua.create_function(move |_, (a, b, unit): (String, String, Option<String>)| {
            c.diff(&a, &b, unit.as_deref().unwrap_or("ms")).map_err(runtime)
        })?,
    )?;

    t.set("stub", clock.is_stub())?;
    Ok(t)
}

fn args(lua: &Lua, parser: Arc<ArgParser>) -> mlua::Result<Table<'_>> {
    let t = lua.create_table()?;
    t.set(
        "parse",
        lua.create_function(move |lua, (list, options): (Vec<String>, Option<Table>)| {
            let mut p = (*parser).clone();
            if let Some(options) = options {
                for key in options.get::<_, Option<Vec<String>>>("string")?.unwrap_or_default() {
                    p = p.string(&key);
                }
                for key in options.get::<_, Option<Vec<String>>>("boolean")?.unwrap_or_default() {
                    p = p.boolean(&key);
                }
                if let Some(aliases) = options.get::<_, Option<Table>>("alias")? {
                    for pair in aliases.pairs::<String, String>() {
                        let (short, long) = pair?;
                        p = p.alias(&short, &long);
                    }
                }
            }
            to_lua(lua, &p.parse("script", list))
        })?,
    )?;
    Ok(t)
}

fn files(lua: &Lua, fs: Arc<dyn FileApi>) -> mlua::Result<Table<'_>> {
    let t = lua.create_table()?;

    let f = fs.clone();
    t.set(
        "read",
        lua.create_async_function(move |_, path: String| {
            let f = f.clone();
            async move { f.read_text(&path).await.map_err(runtime) }
        })?,
    )?;

    let f = fs.clone();
    t.set(
        "write",
        lua.create_async_function(move |_, (path, contents): (String, String)| {
            let f = f.clone();
            async move { f.write_text(&path, &contents).await.map_err(runtime) }
        })?,
    )?;

    let f = fs.clone();
    t.set(
        "append",
        lua.create_async_function(move |_, (path, contents): (String, String)| {
            let f = f.clone();
            async move { f.append_text(&path, &contents).await.map_err(runtime) }
        })?,
    )?;

    let f = fs.clone();
    t.set(
        "exists",
        lua.create_async_function(move |_, path: String| {
            let f = f.clone();
            async move { Ok(f.exists(&path).await) }
        })?,
    )?;

    let f = fs.clone();
    t.set(
        "remove",
        lua.create_async_function(move |_, path: String| {
            let f = f.clone();
            async move { f.remove(&path).await.map_err(runtime) }
        })?,
    )?;

    let f = fs.clone();
    t.set(
        "list",
        lua.create_async_function(move |_, path: Option<String>| {
            let f = f.clone();
            async move { f.list(path.as_deref().unwrap_or(".")).await.map_err(runtime) }
        })?,
    )?;

    let f = fs.clone();
    t.set(
        "mkdir",
        lua.create_async_function(move |_, path: String| {
            let f = f.clone();
            async move { f.ensure_dir(&path).await.map_err(runtime) }
        })?,
    )?;

    let f = fs.clone();
    t.set(
        "copy",
        lua.create_async_function(move |_, (from, to): (String, String)| {
            let f = f.clone();
            async move { f.copy(&from, &to).await.map_err(runtime) }
        })?,
    )?;

    let f = fs.clone();
    t.set(
        "rename",
        lua.create_async_function(move |_, (from, to): (String, String)| {
            let f = f.clone();
            async move { f.rename(&from, &to).await.map_err(runtime) }
        })?,
    )?;

    let f = fs.clone();
    t.set(
        "read_json",
        lua.create_async_function(move |lua, path: String| {
            let f = f.clone();
            async move {
                let value = f.read_json(&path).await.map_err(runtime)?;
                to_lua(lua, &value)
            }
        })?,
    )?;

    let f = fs.clone();
    t.set(
        "write_json",
        lua.create_async_function(move |lua, (path, value): (String, Value)| {
            let f = f.clone();
            async move {
                let value = from_lua(lua, value)?;
                f.write_json(&path, &value).await.map_err(runtime)
            }
        })?,
    )?;

    t.set("baseline", fs.is_baseline())?;
    Ok(t)
}

fn spreadsheet(lua: &Lua, sheet: Arc<Spreadsheet>) -> mlua::Result<Table<'_>> {
    let t = lua.create_table()?;

    let s = sheet.clone();
    t.set(
        "parse",
        lua.create_function(move |lua, text: String| to_lua(lua, &s.parse(&text)))?,
    )?;

    let s = sheet.clone();
    t.set(
        "render",
        lua.create_function(move |lua, value: Value| Ok(s.render(&rows(lua, value)?)))?,
    )?;

    let s = sheet.clone();
    t.set(
        "read",
        lua.create_async_function(move |lua, path: String| {
            let s = s.clone();
            async move {
                let rows = s.read_file(&path).await.map_err(runtime)?;
                to_lua(lua, &rows)
            }
        })?,
    )?;

    let s = sheet.clone();
    t.set(
        "write",
        lua.create_async_function(move |lua, (path, value): (String, Value)| {
            let s = s.clone();
            async move {
                let rows = rows(lua, value)?;
                s.write_file(&path, &rows).await.map_err(runtime)
            }
        })?,
    )?;

    t.set(
        "sheet_to_json",
        lua.create_function(|lua, value: Value| to_lua(lua, &sheet_to_json(&rows(lua, value)?)))?,
    )?;

    t.set(
        "json_to_sheet",
        lua.create_function(|lua, value: Value| {
            let objects = match from_lua(lua, value)? {
                serde_json::Value::Array(items) => items,
                serde_json::Value::Object(map) if map.is_empty() => Vec::new(),
                other => return Err(runtime(format!("expected a list of records, got {other}"))),
            };
            to_lua(lua, &json_to_sheet(&objects).map_err(runtime)?)
        })?,
    )?;

    // 1-based like the rest of Lua
    t.set(
        "cell",
        lua.create_function(|_, reference: String| {
            Ok(match parse_cell_ref(&reference) {
                Some((row, col)) => Variadic::from_iter([row + 1, col + 1]),
                None => Variadic::new(),
            })
        })?,
    )?;
    Ok(t)
}

fn formula(lua: &Lua, engine: Arc<FormulaEngine>) -> mlua::Result<Table<'_>> {
    let t = lua.create_table()?;

    let e = engine.clone();
    t.set(
        "recalculate",
        lua.create_function(move |lua, value: Value| {
            let result = e.recalculate(&rows(lua, value)?).map_err(runtime)?;
            to_lua(lua, &result)
        })?,
    )?;

    let e = engine.clone();
    t.set(
        "evaluate",
        lua.create_function(move |lua, (value, expr): (Value, String)| {
            let result = e.evaluate(&rows(lua, value)?, &expr).map_err(runtime)?;
            to_lua(lua, &result)
        })?,
    )?;
    Ok(t)
}

fn pdf(lua: &Lua, extractor: Arc<PdfExtractor>) -> mlua::Result<Table<'_>> {
    let t = lua.create_table()?;

    let x = extractor.clone();
    t.set(
        "text",
        lua.create_async_function(move |_, path: String| {
            let x = x.clone();
            async move { x.extract_text(&path).await.map_err(runtime) }
        })?,
    )?;

    let x = extractor.clone();
    t.set(
        "pages",
        lua.create_async_function(move |_, path: String| {
            let x = x.clone();
            async move { x.extract_pages(&path).await.map_err(runtime) }
        })?,
    )?;
    Ok(t)
}

fn mail(lua: &Lua, sender: Arc<MailSender>) -> mlua::Result<Table<'_>> {
    let t = lua.create_table()?;
    t.set(
        "send",
        lua.create_async_function(move |lua, message: Value| {
            let sender = sender.clone();
            async move {
                let message: MailMessage =
                    serde_json::from_value(from_lua(lua, message)?).map_err(runtime)?;
                sender.send(&message).await.map_err(runtime)
            }
        })?,
    )?;
    Ok(t)
}

fn shell(lua: &Lua, shell: Arc<Shell>) -> mlua::Result<Table<'_>> {
    let t = lua.create_table()?;

    let s = shell.clone();
    t.set(
        "exec",
        lua.create_async_function(move |lua, (command, cwd): (String, Option<String>)| {
            let s = s.clone();
            async move {
                let out = s.exec(&command, cwd.as_deref()).await.map_err(runtime)?;
                to_lua(lua, &out)
            }
        })?,
    )?;

    t.set("exec_sync", exec_sync(lua, shell.clone())?)?;

    let s = shell.clone();
    t.set(
        "locate_browser",
        lua.create_function(move |lua, provided: Option<String>| {
            let found = s
                .locate_browser(provided.as_deref().map(std::path::Path::new))
                .map_err(runtime)?;
            to_lua(lua, &found)
        })?,
    )?;
    Ok(t)
}

/// Shared by `shell.exec_sync` and the top-level `execSync`.
pub fn exec_sync(lua: &Lua, shell: Arc<Shell>) -> mlua::Result<Function<'_>> {
    lua.create_async_function(move |_, command: String| {
        let shell = shell.clone();
        async move { shell.exec_sync(&command).await.map_err(runtime) }
    })
}

// ── host helpers ────────────────────────────────────────────────────

/// `log.WB(...)` for every valid pair, plus `log.print(bg, fg, ...)`.
pub fn color_log<'lua>(lua: &'lua Lua, logger: &ScriptLogger) -> mlua::Result<Table<'lua>> {
    let t = lua.create_table()?;
    for (bg, fg) in COMBINATIONS {
        let l = logger.clone();
        t.set(
            format!("{bg}{fg}"),
            lua.create_function(move |lua, args: MultiValue| {
                l.color(bg, fg, &json_parts(lua, args)?);
                Ok(())
            })?,
        )?;
    }

    let l = logger.clone();
    t.set(
        "print",
        lua.create_function(move |lua, (bg, fg, rest): (String, String, MultiValue)| {
            let tone = |s: &str| {
                s.chars()
                    .next()
                    .and_then(Tone::from_letter)
                    .ok_or_else(|| runtime(format!("unknown color '{s}'")))
            };
            l.color(tone(&bg)?, tone(&fg)?, &json_parts(lua, rest)?);
            Ok(())
        })?,
    )?;
    Ok(t)
}

pub fn console<'lua>(lua: &'lua Lua, logger: &ScriptLogger) -> mlua::Result<Table<'lua>> {
    let t = lua.create_table()?;
    for (name, level) in [
        ("log", ConsoleLevel::Log),
        ("info", ConsoleLevel::Info),
        ("warn", ConsoleLevel::Warn),
        ("error", ConsoleLevel::Error),
    ] {
        let l = logger.clone();
        t.set(
            name,
            lua.create_function(move |lua, args: MultiValue| {
                l.console(level, &console_line(lua, args));
                Ok(())
            })?,
        )?;
    }
    Ok(t)
}

/// `process.cwd()`, `process.env(name)` and `process.exit(code)`.
pub fn process(lua: &Lua) -> mlua::Result<Table<'_>> {
    let t = lua.create_table()?;
    t.set(
        "cwd",
        lua.create_function(|_, ()| {
            let dir = std::env::current_dir().map_err(runtime)?;
            Ok(dir.to_string_lossy().into_owned())
        })?,
    )?;
    t.set(
        "env",
        lua.create_function(|_, name: String| Ok(std::env::var(name).ok()))?,
    )?;
    t.set(
        "exit",
        lua.create_function(|lua, code: Option<i32>| -> mlua::Result<()> {
            let code = code.unwrap_or(0);
            lua.set_app_data(ExitRequest(code));
            Err(runtime(format!("{EXIT_MARKER}({code})")))
        })?,
    )?;
    Ok(t)
}

/// `dbConnect`, `dbClose`, `executeQuery` and `processDbParameters`.
pub fn db_helpers<'lua>(
    lua: &'lua Lua,
    helpers: &DbHelpers,
) -> mlua::Result<Vec<(&'static str, Value<'lua>)>> {
    let h = helpers.clone();
    let connect = lua.create_async_function(
        move |lua, (params, readonly): (Option<Value>, Option<bool>)| {
            let h = h.clone();
            async move {
                let overrides = json_object(lua, params)?;
                h.connect(&overrides, readonly.unwrap_or(false))
                    .await
                    .map_err(runtime)?;
                Ok(true)
            }
        },
    )?;

    let h = helpers.clone();
    let close = lua.create_function(move |_, ()| Ok(h.close()))?;

    let h = helpers.clone();
    let query = lua.create_async_function(move |lua, (query, params): (String, Option<Value>)| {
        let h = h.clone();
        async move {
            let params = json_object(lua, params)?;
            let result = h.execute_query(&query, &params).await.map_err(runtime)?;
            to_lua(lua, &result)
        }
    })?;

    let h = helpers.clone();
    let process = lua.create_function(move |lua, (argv, defs): (Value, Option<Value>)| {
        let argv = json_object(lua, Some(argv))?;
        let defs = match defs {
            Some(Value::Nil) | None => None,
            some => Some(json_object(lua, some)?),
        };
        let processed = h.process_parameters(&argv, defs.as_ref()).map_err(runtime)?;
        to_lua(lua, &processed)
    })?;

    Ok(vec![
        ("dbConnect", Value::Function(connect)),
        ("dbClose", Value::Function(close)),
        ("executeQuery", Value::Function(query)),
        ("processDbParameters", Value::Function(process)),
    ])
}

/// Everything a script can name, keyed by binding. Feeds both the
/// environment and the read-only `__context` table.
pub fn context_bindings<'lua>(
    lua: &'lua Lua,
    ctx: &ExecutionContext,
) -> mlua::Result<Vec<(&'static str, Value<'lua>)>> {
    let mut out = capability_bindings(lua, &ctx.capabilities)?;
    if let Some(shell) = ctx.capabilities.shell.clone() {
        out.push(("execSync", Value::Function(exec_sync(lua, shell)?)));
    }
    if let Some(db) = &ctx.db {
        out.extend(db_helpers(lua, db)?);
    }
    out.push(("argv", to_lua(lua, &ctx.argv)?));
    out.push(("file_info", to_lua(lua, &ctx.file_info)?));
    out.push(("log", Value::Table(color_log(lua, &ctx.logger)?)));
    out.push(("console", Value::Table(console(lua, &ctx.logger)?)));
    out.push(("process", Value::Table(process(lua)?)));
    Ok(out)
}
