//! Script execution inside an isolated Lua realm.
//!
//! Each run gets a fresh interpreter, an allow-listed environment built
//! from the execution context, an instruction-count hook that enforces the
//! wall-clock deadline, and an allocator ceiling. The runner never returns
//! an error: every outcome is folded into an [`ExecutionResult`].
//!
//! Result selection, in order:
//!
//! 1. a global `main` function defined by the script, called with no
//!    arguments (its parameters are filled from the context by name);
//! 2. the value returned by the chunk itself;
//! 3. `module.exports`.
//!
//! A result produced by `defer(fn, ...)` is awaited before conversion.
pub mod bindings;
pub mod realm;
pub mod rewrite;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mlua::{Function, HookTriggers, Lua, Thread, Value};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use self::bindings::{context_bindings, from_lua, ExitRequest};
use self::realm::{new_lua, Realm};
use self::rewrite::PreparedSource;
use crate::config::SandboxConfig;
use crate::context::ExecutionContext;
use crate::error::HarnessError;

/// Deferred results may themselves defer; stop following after this many.
const MAX_DEFER_DEPTH: usize = 8;

/// The script file as read from disk.
#[derive(Debug, Clone)]
pub struct TargetScript {
    pub path: PathBuf,
    pub name: String,
    pub source: String,
}

impl TargetScript {
    pub fn from_source(path: &Path, source: impl Into<String>) -> Self {
        Self {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            path: path.to_path_buf(),
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Idle,
    Reading,
    Preparing,
    Executing,
    Completed,
    Failed,
    TimedOut,
}

/// Outcome envelope of one run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub success: bool,
    pub state: RunnerState,
    /// Script result converted to JSON; `null` on failure
    pub value: serde_json::Value,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// `process.exit` code, when the script called it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub warnings: Vec<String>,
}

impl ExecutionResult {
    /// Envelope for a dry run that compiled without executing.
    pub fn checked(elapsed_ms: u64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            success: true,
            state: RunnerState::Completed,
            value: serde_json::Value::Null,
            elapsed_ms,
            error: None,
            exit_code: None,
            warnings: Vec::new(),
        }
    }

    fn failed(state: RunnerState, error: String, elapsed_ms: u64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            success: false,
            state,
            value: serde_json::Value::Null,
            elapsed_ms,
            error: Some(error),
            exit_code: None,
            warnings: Vec::new(),
        }
    }
}

enum Failure {
    Setup(String),
    Compile(String),
    Runtime(String),
    TimedOut(Duration),
    Exit(i32),
}

impl From<mlua::Error> for Failure {
    fn from(e: mlua::Error) -> Self {
        Failure::Setup(describe(&e))
    }
}

/// Runs scripts with a deadline and memory ceiling.
pub struct SandboxRunner {
    timeout: Duration,
    memory_limit_mb: usize,
    instruction_interval: u32,
}

impl SandboxRunner {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            memory_limit_mb: config.memory_limit_mb,
            instruction_interval: config.instruction_interval.max(1),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Reads `path` and executes it. Read failures end up in the result.
    pub async fn execute_file(&self, path: &Path, ctx: &ExecutionContext) -> ExecutionResult {
        let started = Instant::now();
        debug!(state = ?RunnerState::Reading, "Reading {}", path.display());
        match tokio::fs::read_to_string(path).await {
            Ok(source) => {
                let script = TargetScript::from_source(path, source);
                let mut result = self.execute(&script, ctx).await;
                result.elapsed_ms = started.elapsed().as_millis() as u64;
                result
            }
            Err(e) => {
                let error = HarnessError::io(path, e);
                warn!("{error}");
                ExecutionResult::failed(
                    RunnerState::Failed,
                    error.to_string(),
                    started.elapsed().as_millis() as u64,
                )
            }
        }
    }

    /// Dry run of [`execute_file`](Self::execute_file).
    pub async fn check_file(&self, path: &Path, ctx: &ExecutionContext) -> Result<(), HarnessError> {
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| HarnessError::io(path, e))?;
        self.check(&TargetScript::from_source(path, source), ctx)
    }

    /// Executes `script` against `ctx`. Never fails; see [`ExecutionResult`].
    pub async fn execute(&self, script: &TargetScript, ctx: &ExecutionContext) -> ExecutionResult {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        debug!(state = ?RunnerState::Idle, "Runner ready");
        info!(%run_id, file = %script.path.display(), timeout = ?self.timeout, "Executing script");

        let mut warnings = Vec::new();
        let outcome = self.run(script, ctx, &mut warnings).await;
        warnings.extend(ctx.logger.take_captured());
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(value) => ExecutionResult {
                run_id,
                success: true,
                state: RunnerState::Completed,
                value,
                elapsed_ms,
                error: None,
                exit_code: None,
                warnings,
            },
            Err(Failure::Exit(0)) => ExecutionResult {
                run_id,
                success: true,
                state: RunnerState::Completed,
                value: serde_json::Value::Null,
                elapsed_ms,
                error: None,
                exit_code: Some(0),
                warnings,
            },
            Err(failure) => {
                let (state, message, exit_code) = match failure {
                    Failure::Setup(m) => (RunnerState::Failed, format!("sandbox setup failed: {m}"), None),
                    Failure::Compile(m) => (RunnerState::Failed, format!("syntax error: {m}"), None),
                    Failure::Runtime(m) => (RunnerState::Failed, m, None),
                    Failure::TimedOut(limit) => (
                        RunnerState::TimedOut,
                        format!("script timed out after {}ms", limit.as_millis()),
                        None,
                    ),
                    Failure::Exit(code) => (
                        RunnerState::Failed,
                        format!("script exited with code {code}"),
                        Some(code),
                    ),
                };
                ExecutionResult {
                    run_id,
                    exit_code,
                    warnings,
                    ..ExecutionResult::failed(state, format!("{}: {message}", script.name), elapsed_ms)
                }
            }
        };

        match &result.error {
            None => info!(%run_id, elapsed_ms, "Script completed"),
            Some(e) => warn!(%run_id, elapsed_ms, state = ?result.state, "Script failed: {e}"),
        }
        result
    }

    /// Dry run: builds the realm and compiles the script without running it.
    pub fn check(&self, script: &TargetScript, ctx: &ExecutionContext) -> Result<(), HarnessError> {
        let sandbox_error = |message: String| HarnessError::SandboxExecution {
            file: script.name.clone(),
            message,
        };
        let lua = new_lua(self.memory_limit_mb).map_err(|e| sandbox_error(describe(&e)))?;
        let bindings = context_bindings(&lua, ctx).map_err(|e| sandbox_error(describe(&e)))?;
        let realm = Realm::build(&lua, bindings, Arc::new(AtomicBool::new(false)))
            .map_err(|e| sandbox_error(describe(&e)))?;
        let prepared = rewrite::prepare(&script.source, &realm.names);
        compile(&lua, &realm, script, &prepared)
            .map(|_| ())
            .map_err(|e| sandbox_error(format!("syntax error: {}", describe(&e))))
    }

    async fn run(
        &self,
        script: &TargetScript,
        ctx: &ExecutionContext,
        warnings: &mut Vec<String>,
    ) -> Result<serde_json::Value, Failure> {
        let mut state = RunnerState::Preparing;
        debug!(?state, "Building realm for {}", script.name);

        let lua = new_lua(self.memory_limit_mb)?;
        let expired = Arc::new(AtomicBool::new(false));
        let realm = Realm::build(&lua, context_bindings(&lua, ctx)?, expired.clone())?;

        let prepared = rewrite::prepare(&script.source, &realm.names);
        for param in &prepared.entry_params {
            if !realm.names.contains(param) && param != "context" {
                warnings.push(format!("main parameter '{param}' matches no binding and is nil"));
            }
        }

        debug!(rewritten = prepared.rewritten, "Compiling {}", script.name);
        let chunk = compile(&lua, &realm, script, &prepared)
            .map_err(|e| Failure::Compile(describe(&e)))?;

        state = RunnerState::Executing;
        debug!(?state, "Running {}", script.name);
        let deadline = Instant::now() + self.timeout;
        let returned = self
            .drive(&lua, lua.create_thread(chunk)?, deadline, &expired)
            .await?;

        let mut value = match realm.env.raw_get::<_, Value>("main")? {
            Value::Function(main) => {
                debug!("Calling main()");
                self.drive(&lua, lua.create_thread(main)?, deadline, &expired)
                    .await?
            }
            _ if !returned.is_nil() => returned,
            _ => {
                let module: mlua::Table = realm.env.raw_get("module")?;
                module.raw_get("exports")?
            }
        };

        let mut depth = 0;
        while let Value::Thread(deferred) = value {
            depth += 1;
            if depth > MAX_DEFER_DEPTH {
                return Err(Failure::Runtime("deferred results nested too deeply".into()));
            }
            debug!(depth, "Awaiting deferred result");
            value = self.drive(&lua, deferred, deadline, &expired).await?;
        }

        Ok(match from_lua(&lua, value.clone()) {
            Ok(json) => json,
            Err(e) => {
                warnings.push(format!("result is not serializable: {}", describe(&e)));
                serde_json::Value::String(format!("<{}>", value.type_name()))
            }
        })
    }

    /// Runs `thread` to completion under the deadline.
    async fn drive<'lua>(
        &self,
        lua: &'lua Lua,
        thread: Thread<'lua>,
        deadline: Instant,
        expired: &Arc<AtomicBool>,
    ) -> Result<Value<'lua>, Failure> {
        let flag = expired.clone();
        // Hooks belong to a single thread, so each one is armed separately
        thread.set_hook(
            HookTriggers::new().every_nth_instruction(self.instruction_interval),
            move |_lua, _debug| {
                if Instant::now() >= deadline {
                    flag.store(true, Ordering::SeqCst);
                    Err(mlua::Error::RuntimeError("script timed out".into()))
                } else {
                    Ok(())
                }
            },
        );

        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, thread.into_async::<_, Value>(())).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(self.classify(lua, &e, expired)),
            Err(_) => {
                expired.store(true, Ordering::SeqCst);
                Err(Failure::TimedOut(self.timeout))
            }
        }
    }

    fn classify(&self, lua: &Lua, e: &mlua::Error, expired: &AtomicBool) -> Failure {
        if let Some(exit) = lua.app_data_ref::<ExitRequest>() {
            return Failure::Exit(exit.0);
        }
        if expired.load(Ordering::SeqCst) {
            return Failure::TimedOut(self.timeout);
        }
        match root_cause(e) {
            mlua::Error::MemoryError(m) => Failure::Runtime(format!(
                "memory limit of {}MB exceeded: {m}",
                self.memory_limit_mb
            )),
            _ => Failure::Runtime(describe(e)),
        }
    }
}

fn compile<'lua>(
    lua: &'lua Lua,
    realm: &Realm<'lua>,
    script: &TargetScript,
    prepared: &PreparedSource,
) -> mlua::Result<Function<'lua>> {
    lua.load(prepared.source.as_str())
        .set_name(format!("@{}", script.name))
        .set_environment(realm.env.clone())
        .into_function()
}

fn root_cause(e: &mlua::Error) -> &mlua::Error {
    match e {
        mlua::Error::CallbackError { cause, .. } => root_cause(cause),
        mlua::Error::WithContext { cause, .. } => root_cause(cause),
        other => other,
    }
}

/// Error text without the Lua traceback.
fn describe(e: &mlua::Error) -> String {
    match root_cause(e) {
        mlua::Error::RuntimeError(m) | mlua::Error::SyntaxError { message: m, .. } => m
            .split("\nstack traceback:")
            .next()
            .unwrap_or(m)
            .trim()
            .to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::ArgMap;
    use crate::capabilities::clock::ClockStub;
    use crate::capabilities::files::FileHelper;
    use crate::capabilities::CapabilitySet;
    use crate::context::{FileInfo, ScriptLogger};
    use serde_json::json;

    fn runner(timeout_ms: u64) -> SandboxRunner {
        SandboxRunner::new(&SandboxConfig {
            timeout_secs: 5,
            memory_limit_mb: 64,
            instruction_interval: 1000,
        })
        .with_timeout(Duration::from_millis(timeout_ms))
    }

    fn context(argv: serde_json::Value) -> ExecutionContext {
        let mut capabilities = CapabilitySet::default();
        capabilities.clock = Some(Arc::new(ClockStub));
        capabilities.files = Some(Arc::new(FileHelper::new(std::env::temp_dir())));
        let argv: ArgMap = match argv {
            serde_json::Value::Object(m) => m,
            _ => ArgMap::new(),
        };
        ExecutionContext {
            argv,
            file_info: FileInfo::for_target("job.lua"),
            capabilities,
            db: None,
            logger: ScriptLogger::new(),
        }
    }

    fn script(source: &str) -> TargetScript {
        TargetScript::from_source(Path::new("job.lua"), source)
    }

    async fn run(source: &str) -> ExecutionResult {
        runner(2000).execute(&script(source), &context(json!({}))).await
    }

    #[tokio::test]
    async fn test_chunk_return_value() {
        let result = run("return {ok = true, n = 3}").await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.state, RunnerState::Completed);
        assert_eq!(result.value, json!({"ok": true, "n": 3}));
    }

    #[tokio::test]
    async fn test_main_receives_context_by_name() {
        let result = runner(2000)
            .execute(
                &script("function main(argv, date)\n  return argv.region .. ':' .. tostring(date.stub)\nend"),
                &context(json!({"region": "north"})),
            )
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.value, json!("north:true"));
    }

    #[tokio::test]
    async fn test_local_main_wins_over_chunk_value() {
        let result = run("local function main()\n return 'from main'\nend\nreturn 'from chunk'").await;
        assert_eq!(result.value, json!("from main"));
    }

    #[tokio::test]
    async fn test_module_exports_fallback() {
        let result = run("module.exports.total = 7").await;
        assert!(result.success);
        assert_eq!(result.value, json!({"total": 7}));
    }

    #[tokio::test]
    async fn test_unknown_main_parameter_warns() {
        let result = run("function main(nothing_here)\n return nothing_here == nil\nend").await;
        assert_eq!(result.value, json!(true));
        assert!(result.warnings.iter().any(|w| w.contains("nothing_here")));
    }

    #[tokio::test]
    async fn test_syntax_error_fails_without_running() {
        let result = run("return (1 +").await;
        assert!(!result.success);
        assert_eq!(result.state, RunnerState::Failed);
        assert!(result.error.unwrap().starts_with("job.lua: syntax error"));
    }

    #[tokio::test]
    async fn test_runtime_error_keeps_line_numbers() {
        let result = run("local x = 1\nerror('boom')").await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("job.lua:2"), "{error}");
        assert!(error.contains("boom"));
    }

    #[tokio::test]
    async fn test_multiline_main_keeps_line_numbers() {
        let result = run("function main(argv,\n  date)\n  error('boom')\nend").await;
        let error = result.error.unwrap();
        assert!(error.contains("job.lua:3"), "{error}");
        assert!(error.contains("boom"));
    }

    #[tokio::test]
    async fn test_context_alias_is_global() {
        let result = runner(2000)
            .execute(&script("return context.argv.region"), &context(json!({"region": "west"})))
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.value, json!("west"));
    }

    #[tokio::test]
    async fn test_entry_point_in_long_string_is_data() {
        let result = run("local doc = [[\nfunction main(argv)\n]] return doc").await;
        assert_eq!(result.value, json!("function main(argv)\n"));
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let result = runner(200).execute(&script("while true do end"), &context(json!({}))).await;
        assert!(!result.success);
        assert_eq!(result.state, RunnerState::TimedOut);
        assert!(result.elapsed_ms < 2000);
    }

    #[tokio::test]
    async fn test_pcall_cannot_swallow_timeout() {
        let src = "while true do pcall(function() while true do end end) end";
        let result = runner(200).execute(&script(src), &context(json!({}))).await;
        assert_eq!(result.state, RunnerState::TimedOut);
    }

    #[tokio::test]
    async fn test_async_sleep_times_out() {
        let result = runner(100)
            .execute(&script("time.sleep(5000) return 1"), &context(json!({})))
            .await;
        assert_eq!(result.state, RunnerState::TimedOut);
    }

    #[tokio::test]
    async fn test_sleep_within_deadline() {
        let result = run("time.sleep(10) return 'done'").await;
        assert_eq!(result.value, json!("done"));
    }

    #[tokio::test]
    async fn test_host_globals_unreachable() {
        let result = run("return {os = os == nil, io = io == nil, load = load == nil, req = type(require)}").await;
        assert_eq!(result.value, json!({"os": true, "io": true, "load": true, "req": "function"}));
    }

    #[tokio::test]
    async fn test_deferred_result_is_awaited() {
        let result = run("return defer(function(a, b) time.sleep(5) return a + b end, 2, 3)").await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.value, json!(5));
    }

    #[tokio::test]
    async fn test_exit_zero_is_success() {
        let result = run("process.exit(0)\nreturn 'unreachable'").await;
        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.value, serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_exit_nonzero_survives_pcall() {
        let result = run("pcall(process.exit, 4)\nreturn 'unreachable'").await;
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(4));
    }

    #[tokio::test]
    async fn test_console_warnings_are_captured() {
        let result = run("console.warn('low disk', 3)\nconsole.log('fine')\nreturn true").await;
        assert!(result.success);
        assert_eq!(result.warnings, vec!["warn: low disk 3"]);
    }

    #[tokio::test]
    async fn test_absent_capability_is_nil() {
        let result = run("return sql == nil and pdfReader == nil and date ~= nil").await;
        assert_eq!(result.value, json!(true));
    }

    #[tokio::test]
    async fn test_realm_is_fresh_per_run() {
        let r = runner(2000);
        let ctx = context(json!({}));
        r.execute(&script("leaked = 1 return true"), &ctx).await;
        let result = r.execute(&script("return leaked == nil"), &ctx).await;
        assert_eq!(result.value, json!(true));
    }

    #[tokio::test]
    async fn test_execute_file_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.lua");
        std::fs::write(&path, "return 40 + 2").unwrap();
        let result = runner(2000).execute_file(&path, &context(json!({}))).await;
        assert_eq!(result.value, json!(42));

        let missing = runner(2000)
            .execute_file(&dir.path().join("absent.lua"), &context(json!({})))
            .await;
        assert!(!missing.success);
        assert!(missing.error.unwrap().contains("absent.lua"));
    }

    #[test]
    fn test_check_compiles_only() {
        let ctx = context(json!({}));
        assert!(runner(2000).check(&script("error('never runs')"), &ctx).is_ok());
        let err = runner(2000).check(&script("return )"), &ctx).unwrap_err();
        assert_eq!(err.kind(), "SandboxExecutionError");
    }
}
