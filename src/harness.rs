//! One invocation of the harness: load capabilities, admit, build the
//! context, run the target and report.
//!
//! Everything the pipeline needs is owned by [`Harness`]; nothing is kept in
//! process-wide state. The only way out that skips the report is the
//! admission [`AbortStrategy`].
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::args::{ArgMap, ArgParser, POSITIONAL_KEY};
use crate::capabilities::{CapabilityLoader, CapabilitySet, LoadSummary, Strictness};
use crate::color_log::{ColorLog, Tone};
use crate::config::Config;
use crate::context::ContextBuilder;
use crate::error::HarnessError;
use crate::gate::{self, AbortStrategy, AdmissionGate, ExitProcess};
use crate::sandbox::{ExecutionResult, SandboxRunner};
use crate::server;

/// Environment variable naming the harness TOML configuration.
pub const CONFIG_ENV: &str = "RUNCODE_CONFIG";

/// Keys that may name the JSON parameter file, in priority order.
const PARAM_FILE_KEYS: [&str; 3] = ["extraParam", "file", "config"];

// ── CLI ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CliOptions {
    pub target: Option<String>,
    pub param_file: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub verbose: bool,
    pub dry_run: bool,
    pub local_server: Option<u16>,
    /// Everything the parser produced, forwarded to the script's `argv`.
    pub raw: ArgMap,
}

impl CliOptions {
    pub fn parser() -> ArgParser {
        ArgParser::new()
            .string("f")
            .string("extraParam")
            .string("file")
            .string("config")
            .boolean("verbose")
            .alias("v", "verbose")
            .boolean("dry-run")
    }

    pub fn parse<I, S>(args: I) -> Result<Self, HarnessError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let raw = Self::parser().parse(env!("CARGO_PKG_NAME"), args);

        let target = non_empty_str(raw.get("f")).or_else(|| {
            raw.get(POSITIONAL_KEY)
                .and_then(Value::as_array)
                .and_then(|items| items.first())
                .and_then(|first| match first {
                    Value::String(s) if !s.is_empty() => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
        });

        let param_file = PARAM_FILE_KEYS
            .iter()
            .find_map(|key| non_empty_str(raw.get(*key)))
            .map(PathBuf::from);

        let timeout = match raw.get("timeout") {
            None => None,
            Some(value) => match value.as_f64() {
                Some(secs) if secs > 0.0 && secs.is_finite() => Some(Duration::from_secs_f64(secs)),
                _ => {
                    return Err(HarnessError::Config(format!(
                        "--timeout expects a positive number of seconds, got {value}"
                    )))
                }
            },
        };

        let local_server = match raw.get("localserver") {
            None => None,
            Some(value) => match value.as_u64().and_then(|p| u16::try_from(p).ok()) {
                Some(port) => Some(port),
                None => {
                    return Err(HarnessError::Config(format!(
                        "--localserver expects a port number, got {value}"
                    )))
                }
            },
        };

        Ok(Self {
            target,
            param_file,
            timeout,
            verbose: flag(&raw, "verbose"),
            dry_run: flag(&raw, "dry-run"),
            local_server,
            raw,
        })
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn flag(raw: &ArgMap, key: &str) -> bool {
    raw.get(key).and_then(Value::as_bool).unwrap_or(false)
}

// ── Pipeline ────────────────────────────────────────────

pub struct Harness {
    config: Config,
    options: CliOptions,
    abort: Box<dyn AbortStrategy>,
}

impl Harness {
    pub fn new(config: Config, options: CliOptions) -> Self {
        Self {
            config,
            options,
            abort: Box::new(ExitProcess),
        }
    }

    #[cfg(test)]
    pub fn with_abort_strategy(mut self, abort: Box<dyn AbortStrategy>) -> Self {
        self.abort = abort;
        self
    }

    /// Runs the invocation and returns the process exit code.
    pub async fn run(&self) -> i32 {
        let started = Instant::now();
        if let Some(port) = self.options.local_server {
            return match self.serve(port).await {
                Ok(()) => 0,
                Err(e) => {
                    let kind = e.downcast_ref::<HarnessError>().map_or("Error", HarnessError::kind);
                    report_error(kind, format!("{e:#}"));
                    1
                }
            };
        }

        match self.execute().await {
            Ok((result, summary)) => {
                report(&result, &summary, started.elapsed());
                if result.success {
                    0
                } else {
                    1
                }
            }
            Err(e) => {
                report_error(e.kind(), e.to_string());
                1
            }
        }
    }

    async fn serve(&self, port: u16) -> anyhow::Result<()> {
        let (_, summary) = self.load_capabilities(Strictness::LocalServer)?;
        debug!("{} capabilities available in server mode", summary.loaded.len());
        if let Some(target) = &self.options.target {
            info!("Ignoring target {target} in server mode");
        }
        server::run(&self.config.server, port).await
    }

    fn load_capabilities(
        &self,
        strictness: Strictness,
    ) -> Result<(CapabilitySet, LoadSummary), HarnessError> {
        let (registry, summary) = CapabilityLoader::standard(&self.config).load_all(strictness);
        for warning in &summary.warnings {
            ColorLog::warn(format!("Capability warning: {warning}"));
        }
        for name in registry.names().filter(|n| !registry.is_loaded(*n)) {
            debug!("{name} unavailable: {}", registry.error(name).unwrap_or("no handle"));
        }
        if !summary.is_valid {
            return Err(HarnessError::ModuleLoad {
                failed: summary
                    .missing_critical
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            });
        }
        ColorLog::success(format!(
            "Capabilities loaded: {}/{}",
            summary.loaded.len() + summary.fallbacks.len(),
            summary.total
        ));
        Ok((registry.capability_set(), summary))
    }

    /// Everything between capability loading and the result envelope.
    async fn execute(&self) -> Result<(ExecutionResult, LoadSummary), HarnessError> {
        let target = self
            .options
            .target
            .clone()
            .ok_or_else(|| HarnessError::Config("no target script given (use -f <path>)".into()))?;

        let (capabilities, summary) = self.load_capabilities(Strictness::Full)?;

        let path = Path::new(&target);
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| HarnessError::io(path, e))?;

        if self.options.dry_run {
            debug!("Dry run: admission gate skipped");
        } else {
            let gate = AdmissionGate::new(self.config.admission.clone());
            let decision = gate.evaluate(&source, capabilities.database.clone()).await;
            info!("Admission {decision}");
            gate::enforce(&decision, self.abort.as_ref());
            if decision.is_allowed() {
                ColorLog::success(format!("Admission granted: {}", decision.reason()));
            }
        }

        let ctx = ContextBuilder::new(capabilities).build(
            &self.options.raw,
            &target,
            self.options.param_file.as_deref(),
        )?;

        gate::validate_script_protection(&target, &source, &self.config.admission.markers)?;

        let mut runner = SandboxRunner::new(&self.config.sandbox);
        if let Some(timeout) = self.options.timeout {
            runner = runner.with_timeout(timeout);
        }
        debug!("Sandbox timeout {:?}", runner.timeout());
        let script_path = ctx.file_info.resolved_path.clone();

        if self.options.dry_run {
            let started = Instant::now();
            runner.check_file(&script_path, &ctx).await?;
            ColorLog::success(format!("Dry run: {target} compiled, not executed"));
            let mut result = ExecutionResult::checked(started.elapsed().as_millis() as u64);
            result.warnings.extend(ctx.logger.take_captured());
            return Ok((result, summary));
        }

        Ok((runner.execute_file(&script_path, &ctx).await, summary))
    }
}

// ── Report ──────────────────────────────────────────────

fn report(result: &ExecutionResult, summary: &LoadSummary, total: Duration) {
    ColorLog::info("Execution report");
    if result.success {
        ColorLog::success(format!("SUCCESS - completed in {}ms", result.elapsed_ms));
        if !result.value.is_null() {
            ColorLog::print(Tone::B, Tone::W, &[Value::from("Result:"), result.value.clone()]);
        }
    } else {
        ColorLog::error(format!("FAILED - after {}ms", result.elapsed_ms));
        if let Some(error) = &result.error {
            ColorLog::error(format!("Error: {error}"));
        }
    }
    if !result.warnings.is_empty() {
        ColorLog::warn(format!("{} warning(s) occurred", result.warnings.len()));
        for warning in &result.warnings {
            debug!("warning: {warning}");
        }
    }
    ColorLog::info(format!("Total runtime: {}ms", total.as_millis()));
    ColorLog::info(format!(
        "Capabilities: {} loaded, {} failed",
        summary.loaded.len(),
        summary.failed.len()
    ));
    match serde_json::to_string(result) {
        Ok(json) => debug!("result envelope: {json}"),
        Err(e) => warn!("Cannot serialize result: {e}"),
    }
}

fn report_error(kind: &str, message: String) {
    warn!("{kind}: {message}");
    ColorLog::error(format!("{kind}: {message}"));
}
