/// SQL access through an HTTP gateway.
///
/// The gateway owns the real database driver; this client only speaks its
/// JSON protocol:
///
/// - `POST {base}/connect`: `{server, database, user, password, readonly}`
/// - `POST {base}/query`: the same fields plus `{query, params}`, answered
///   with `{"recordset": [...], "rowsAffected": [...]}`
///
/// The gateway is stateless, so the client remembers the parameters of the
/// last successful `connect` and sends them with every query.
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};
use url::Url;

use super::{CapabilityHandle, CapabilityName, CapabilityProvider};
use crate::config::DatabaseConfig;

#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DbParams {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub readonly: bool,
}

impl fmt::Debug for DbParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbParams")
            .field("server", &self.server)
            .field("database", &self.database)
            .field("user", &crate::context::mask_sensitive(&self.user))
            .field("password", &"***")
            .field("readonly", &self.readonly)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    #[serde(default)]
    pub recordset: Vec<Value>,
    #[serde(default, rename = "rowsAffected")]
    pub rows_affected: Vec<u64>,
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    #[serde(flatten)]
    connection: &'a DbParams,
    query: &'a str,
    params: &'a Map<String, Value>,
}

pub struct SqlClient {
    http: Client,
    base: Url,
    defaults: DbParams,
    session: Mutex<Option<DbParams>>,
}

impl SqlClient {
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        if config.gateway_url.trim().is_empty() {
            bail!("database gateway URL is not configured");
        }
        let mut base = Url::parse(config.gateway_url.trim())
            .map_err(|e| anyhow!("invalid gateway URL {:?}: {e}", config.gateway_url))?;
        if !matches!(base.scheme(), "http" | "https") {
            bail!("gateway URL must be http or https: {}", config.gateway_url);
        }
        // `join` replaces the last segment unless the base ends with a slash
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base,
            defaults: DbParams {
                server: config.server.clone(),
                database: config.database.clone(),
                user: config.user.clone(),
                password: config.password.clone(),
                readonly: false,
            },
            session: Mutex::new(None),
        })
    }

    pub fn gateway(&self) -> &Url {
        &self.base
    }

    /// Connection parameters from the harness configuration.
    pub fn default_params(&self) -> &DbParams {
        &self.defaults
    }

    pub fn is_connected(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Verifies the parameters with the gateway and makes them the active
    /// session.
    pub async fn connect(&self, params: DbParams) -> Result<()> {
        info!(
            "Connecting to database {} on {} as {}",
            params.database,
            params.server,
            crate::context::mask_sensitive(&params.user)
        );
        self.post("connect", &params).await?;
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(params);
        Ok(())
    }

    /// Forgets the active session. Returns false when nothing was open.
    pub fn close(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
    }

    pub async fn query(&self, query: &str, params: &Map<String, Value>) -> Result<QueryResult> {
        let connection = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| anyhow!("not connected: call dbConnect first"))?;

        let body = QueryRequest {
            connection: &connection,
            query,
            params,
        };
        let value = self.post("query", &body).await?;
        let result: QueryResult = serde_json::from_value(value)?;
        debug!("Query returned {} rows", result.recordset.len());
        Ok(result)
    }

    /// `SELECT COUNT(*)` on a single table.
    pub async fn count_rows(&self, table: &str) -> Result<u64> {
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            bail!("refusing to count rows of table {table:?}");
        }
        let result = self
            .query(
                &format!("SELECT COUNT(*) AS recordCount FROM {table}"),
                &Map::new(),
            )
            .await?;
        result
            .recordset
            .first()
            .and_then(|row| row.get("recordCount"))
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("gateway returned no recordCount for {table}"))
    }

    async fn post<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> Result<Value> {
        let url = self.base.join(endpoint)?;
        let resp = self.http.post(url).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("error").and_then(Value::as_str).map(String::from))
                .unwrap_or(text);
            bail!("SQL gateway returned {status}: {message}");
        }
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

/// Fills connection parameters from `argv`, falling back to each
/// definition's `default`. Definitions look like
/// `{"port": {"type": "number", "default": 1433}}`.
pub fn process_db_parameters(
    argv: &Map<String, Value>,
    definitions: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    let mut processed = Map::new();
    for (key, definition) in definitions {
        let value = argv
            .get(key)
            .filter(|v| is_present(v))
            .or_else(|| definition.get("default").filter(|v| is_present(v)))
            .cloned()
            .ok_or_else(|| anyhow!("Missing required parameter: {key}"))?;

        let value = match (definition.get("type").and_then(Value::as_str), &value) {
            (Some("number"), Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(|n| match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        Value::from(f as i64)
                    }
                    _ => Value::Number(n),
                })
                .ok_or_else(|| anyhow!("parameter {key} is not a number: {s:?}"))?,
            _ => value,
        };
        processed.insert(key.clone(), value);
    }
    Ok(processed)
}

/// The four connection keys with defaults taken from the harness config.
pub fn default_parameter_definitions(defaults: &DbParams) -> Map<String, Value> {
    let entry = |default: &str, description: &str| {
        let mut def = Map::new();
        def.insert("type".into(), Value::from("string"));
        if !default.is_empty() {
            def.insert("default".into(), Value::from(default));
        }
        def.insert("description".into(), Value::from(description));
        Value::Object(def)
    };
    let mut defs = Map::new();
    defs.insert("user".into(), entry(&defaults.user, "DB user"));
    defs.insert("password".into(), entry(&defaults.password, "DB password"));
    defs.insert("server".into(), entry(&defaults.server, "DB server"));
    defs.insert("database".into(), entry(&defaults.database, "DB database name"));
    defs
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

pub struct DatabaseProvider {
    config: DatabaseConfig,
}

impl DatabaseProvider {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }
}

impl CapabilityProvider for DatabaseProvider {
    fn name(&self) -> CapabilityName {
        CapabilityName::Database
    }

    fn acquire(&self) -> Result<CapabilityHandle> {
        Ok(CapabilityHandle::Database(Arc::new(SqlClient::new(
            &self.config,
        )?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(url: &str) -> DatabaseConfig {
        DatabaseConfig {
            gateway_url: url.to_string(),
            server: "db01".into(),
            database: "lab".into(),
            user: "reporter".into(),
            password: "s3cret-pass".into(),
            request_timeout_secs: 5,
        }
    }

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_gateway_url_gets_trailing_slash() {
        let client = SqlClient::new(&config("http://gw.local:7070/api")).unwrap();
        assert_eq!(client.gateway().as_str(), "http://gw.local:7070/api/");
        assert_eq!(
            client.gateway().join("query").unwrap().as_str(),
            "http://gw.local:7070/api/query"
        );
    }

    #[test]
    fn test_invalid_gateway_url_fails_acquisition() {
        assert!(DatabaseProvider::new(config("")).acquire().is_err());
        assert!(DatabaseProvider::new(config("not a url")).acquire().is_err());
        assert!(DatabaseProvider::new(config("ftp://gw.local")).acquire().is_err());
    }

    #[tokio::test]
    async fn test_query_requires_connection() {
        let client = SqlClient::new(&config("http://127.0.0.1:9")).unwrap();
        assert!(!client.is_connected());
        let err = client.query("SELECT 1", &Map::new()).await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
        assert!(!client.close());
    }

    #[tokio::test]
    async fn test_count_rows_rejects_injection() {
        let client = SqlClient::new(&config("http://127.0.0.1:9")).unwrap();
        let err = client.count_rows("users; DROP TABLE x").await.unwrap_err();
        assert!(err.to_string().contains("refusing"));
    }

    #[test]
    fn test_debug_masks_password() {
        let params = DbParams {
            password: "hunter2hunter2".into(),
            user: "administrator".into(),
            ..Default::default()
        };
        let printed = format!("{params:?}");
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("administrator"));
    }

    #[test]
    fn test_process_db_parameters_prefers_argv() {
        let argv = as_map(json!({"user": "cli-user", "port": "1433"}));
        let defs = as_map(json!({
            "user": {"type": "string", "default": "cfg-user"},
            "server": {"type": "string", "default": "db01"},
            "port": {"type": "number"}
        }));
        let processed = process_db_parameters(&argv, &defs).unwrap();
        assert_eq!(processed["user"], json!("cli-user"));
        assert_eq!(processed["server"], json!("db01"));
        assert_eq!(processed["port"], json!(1433));
    }

    #[test]
    fn test_process_db_parameters_missing_value() {
        let defs = as_map(json!({"database": {"type": "string"}}));
        let err = process_db_parameters(&Map::new(), &defs).unwrap_err();
        assert_eq!(err.to_string(), "Missing required parameter: database");
    }

    #[test]
    fn test_default_definitions_come_from_config() {
        let client = SqlClient::new(&config("http://127.0.0.1:9")).unwrap();
        let defs = default_parameter_definitions(client.default_params());
        let processed = process_db_parameters(&Map::new(), &defs).unwrap();
        assert_eq!(processed["server"], json!("db01"));
        assert_eq!(processed["password"], json!("s3cret-pass"));
    }

    #[test]
    fn test_query_result_wire_format() {
        let result: QueryResult = serde_json::from_value(json!({
            "recordset": [{"recordCount": 12}],
            "rowsAffected": [1]
        }))
        .unwrap();
        assert_eq!(result.rows_affected, vec![1]);
        assert_eq!(result.recordset[0]["recordCount"], json!(12));
    }
}
