/// Assembly of the per-run execution context.
///
/// The context is the only data a script can reach: the cleaned argument
/// map, target file metadata, capability handles, database helpers and the
/// logger. It is built once per invocation and dropped after the run.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::args::ArgMap;
use crate::capabilities::database::{
    default_parameter_definitions, process_db_parameters, DbParams, QueryResult,
};
use crate::capabilities::{CapabilityName, CapabilitySet, SqlClient};
use crate::color_log::{ColorLog, Tone};
use crate::error::HarnessError;

const SENSITIVE_KEYS: [&str; 5] = ["password", "user", "username", "pass", "pwd"];

/// `ab.......yz` for values longer than four characters, unchanged otherwise.
pub fn mask_sensitive(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return value.to_string();
    }
    let start: String = chars[..2].iter().collect();
    let end: String = chars[chars.len() - 2..].iter().collect();
    format!("{start}.......{end}")
}

/// Copy of `value` with sensitive string fields masked, recursively.
pub fn mask_sensitive_data(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let masked = match v {
                        Value::String(s)
                            if SENSITIVE_KEYS.contains(&k.to_ascii_lowercase().as_str()) =>
                        {
                            Value::String(mask_sensitive(s))
                        }
                        other => mask_sensitive_data(other),
                    };
                    (k.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(mask_sensitive_data).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub original_path: String,
    pub resolved_path: PathBuf,
    pub file_name: String,
    pub directory: PathBuf,
    pub exists: bool,
}

impl FileInfo {
    pub fn for_target(target: &str) -> Self {
        let original = Path::new(target);
        let resolved = std::path::absolute(original).unwrap_or_else(|_| original.to_path_buf());
        Self {
            original_path: target.to_string(),
            file_name: original
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            directory: resolved
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
            exists: resolved.is_file(),
            resolved_path: resolved,
        }
    }
}

/// Console sink for scripts. Lines go to the colored console; warnings and
/// errors are also kept for the result envelope.
#[derive(Clone, Default)]
pub struct ScriptLogger {
    captured: Arc<Mutex<Vec<String>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
}

impl ScriptLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn color(&self, bg: Tone, fg: Tone, parts: &[Value]) {
        ColorLog::print(bg, fg, parts);
    }

    pub fn console(&self, level: ConsoleLevel, line: &str) {
        match level {
            ConsoleLevel::Log => ColorLog::text(Tone::W, Tone::B, line),
            ConsoleLevel::Info => ColorLog::info(line),
            ConsoleLevel::Warn => {
                ColorLog::warn(line);
                self.capture(format!("warn: {line}"));
            }
            ConsoleLevel::Error => {
                ColorLog::error(line);
                self.capture(format!("error: {line}"));
            }
        }
        debug!(target: "runcode::script", level = ?level, "{line}");
    }

    pub fn capture(&self, message: String) {
        self.captured
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }

    pub fn take_captured(&self) -> Vec<String> {
        std::mem::take(&mut *self.captured.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Database helpers derived from the `sql` capability.
#[derive(Clone)]
pub struct DbHelpers {
    client: Arc<SqlClient>,
}

impl DbHelpers {
    pub fn new(client: Arc<SqlClient>) -> Self {
        Self { client }
    }

    /// Connects with the configured defaults, overridden by any of
    /// `server`, `database`, `user` and `password` present in `overrides`.
    pub async fn connect(&self, overrides: &Map<String, Value>, readonly: bool) -> Result<()> {
        let mut params: DbParams = self.client.default_params().clone();
        for (key, slot) in [
            ("server", &mut params.server),
            ("database", &mut params.database),
            ("user", &mut params.user),
            ("password", &mut params.password),
        ] {
            match overrides.get(key) {
                Some(Value::String(s)) => *slot = s.clone(),
                Some(Value::Null) | None => {}
                Some(other) => *slot = other.to_string(),
            }
        }
        params.readonly = readonly;
        self.client.connect(params).await
    }

    pub fn close(&self) -> bool {
        let closed = self.client.close();
        if closed {
            info!("Database session closed");
        }
        closed
    }

    pub async fn execute_query(&self, query: &str, params: &Map<String, Value>) -> Result<QueryResult> {
        self.client.query(query, params).await
    }

    /// `definitions` default to the four connection keys from config.
    pub fn process_parameters(
        &self,
        argv: &Map<String, Value>,
        definitions: Option<&Map<String, Value>>,
    ) -> Result<Map<String, Value>> {
        match definitions {
            Some(defs) => process_db_parameters(argv, defs),
            None => process_db_parameters(
                argv,
                &default_parameter_definitions(self.client.default_params()),
            ),
        }
    }
}

pub struct ExecutionContext {
    pub argv: ArgMap,
    pub file_info: FileInfo,
    pub capabilities: CapabilitySet,
    pub db: Option<DbHelpers>,
    pub logger: ScriptLogger,
}

impl ExecutionContext {
    /// Database, date helper, argv and logger must be present and the
    /// target must exist.
    pub fn validate(&self) -> Result<(), HarnessError> {
        let mut missing = Vec::new();
        if !self.capabilities.contains(CapabilityName::Database) {
            missing.push(CapabilityName::Database.to_string());
        }
        if !self.capabilities.contains(CapabilityName::Clock) {
            missing.push(CapabilityName::Clock.to_string());
        }
        if !self.file_info.exists {
            missing.push(format!("target file {}", self.file_info.original_path));
        }
        // argv and logger are always constructed by the builder
        if missing.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::ContextValidation { missing })
        }
    }
}

pub struct ContextBuilder {
    capabilities: CapabilitySet,
}

impl ContextBuilder {
    pub fn new(capabilities: CapabilitySet) -> Self {
        Self { capabilities }
    }

    pub fn build(
        &self,
        raw_args: &ArgMap,
        target: &str,
        param_file: Option<&Path>,
    ) -> Result<ExecutionContext, HarnessError> {
        let file_info = FileInfo::for_target(target);
        if !file_info.exists {
            return Err(HarnessError::Config(format!(
                "target script not found: {}",
                file_info.resolved_path.display()
            )));
        }

        let mut argv = clean_args(raw_args);
        if let Some(path) = param_file {
            match load_param_file(path) {
                Ok(extra) => {
                    info!("Loaded extra parameters from {}", path.display());
                    ColorLog::print(
                        Tone::W,
                        Tone::B,
                        &[
                            Value::from("Extra parameters:"),
                            mask_sensitive_data(&Value::Object(extra.clone())),
                        ],
                    );
                    argv.extend(extra);
                }
                Err(e) => warn!("Skipping extra parameters: {e}"),
            }
        }

        let db = self.capabilities.database.clone().map(DbHelpers::new);
        if db.is_none() {
            warn!("Database helpers not available (sql capability missing)");
        }

        let context = ExecutionContext {
            argv,
            file_info,
            capabilities: self.capabilities.clone(),
            db,
            logger: ScriptLogger::new(),
        };
        context.validate()?;
        debug!(
            "Context ready: {} argument(s), target {}",
            context.argv.len(),
            context.file_info.file_name
        );
        Ok(context)
    }
}

/// Drops parser-internal keys (`_`, `$0` and anything else with those prefixes).
pub fn clean_args(raw: &ArgMap) -> ArgMap {
    raw.iter()
        .filter(|(k, _)| !k.starts_with('_') && !k.starts_with('$'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn load_param_file(path: &Path) -> Result<Map<String, Value>> {
    if !path.exists() {
        return Err(anyhow!("extra param file not found: {}", path.display()));
    }
    let text = std::fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&text)? {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow!(
            "extra param file {} must contain a JSON object",
            path.display()
        )),
    }
}
