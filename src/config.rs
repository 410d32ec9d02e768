use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default location of the harness configuration.
pub const DEFAULT_CONFIG_PATH: &str = "config/runcode.toml";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub sandbox: SandboxConfig,
    pub admission: AdmissionConfig,
    pub database: DatabaseConfig,
    pub clock: ClockConfig,
    pub files: FilesConfig,
    pub spreadsheet: SpreadsheetConfig,
    pub pdf: PdfConfig,
    pub mail: MailConfig,
    pub shell: ShellConfig,
    pub browser: BrowserConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Wall-clock limit when `--timeout` is not given
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Lua allocator ceiling; 0 disables the limit
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: usize,
    /// How many VM instructions run between deadline checks
    #[serde(default = "default_instruction_interval")]
    pub instruction_interval: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdmissionConfig {
    /// Every marker must appear in the script source
    #[serde(default = "default_markers")]
    pub markers: Vec<String>,
    /// Presence of this literal skips the record-count check
    #[serde(default = "default_bypass")]
    pub bypass: String,
    #[serde(default = "default_threshold")]
    pub threshold: u64,
    /// Tables whose row counts feed the policy
    #[serde(default = "default_count_tables")]
    pub tables: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Base URL of the SQL gateway. Supports ${ENV_VAR} substitution
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub user: String,
    /// Supports ${ENV_VAR} substitution
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClockConfig {
    /// Fixed offset applied to local times, e.g. "+02:00"
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesConfig {
    /// Relative paths used by the file helper resolve against this directory
    #[serde(default = "default_dot")]
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SpreadsheetConfig {
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PdfConfig {
    #[serde(default = "default_pdf_command")]
    pub command: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MailConfig {
    #[serde(default = "default_mail_command")]
    pub command: String,
    /// Used when a message does not set its own sender
    #[serde(default = "default_mail_from")]
    pub from: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShellConfig {
    #[serde(default = "default_shell")]
    pub program: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrowserConfig {
    /// JSON file remembering the last browser executable found
    #[serde(default = "default_browser_cache")]
    pub cache_file: PathBuf,
    #[serde(default = "default_browser_candidates")]
    pub candidates: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Directory served by `--localserver`
    #[serde(default = "default_dot")]
    pub root: PathBuf,
    #[serde(default = "default_bind_host")]
    pub host: String,
    /// CDN URLs in served HTML are replaced by local copies
    #[serde(default = "default_cdn_rewrites")]
    pub cdn_rewrites: Vec<CdnRewrite>,
    /// Where downloaded rewrite targets are kept
    #[serde(default = "default_library_cache")]
    pub library_cache: PathBuf,
    /// Download missing rewrite targets before serving
    #[serde(default = "default_fetch_libraries")]
    pub fetch_libraries: bool,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CdnRewrite {
    pub from: String,
    pub to: String,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_memory_limit_mb() -> usize {
    512
}

fn default_instruction_interval() -> u32 {
    1000
}

fn default_markers() -> Vec<String> {
    vec!["--@runcode:signed".to_string(), "--@runcode:owner".to_string()]
}

fn default_bypass() -> String {
    "--@runcode:skip-admission".to_string()
}

fn default_threshold() -> u64 {
    1000
}

fn default_count_tables() -> Vec<String> {
    vec!["validations".to_string(), "calc_log".to_string()]
}

fn default_gateway_url() -> String {
    "http://127.0.0.1:7070".to_string()
}

fn default_request_timeout_secs() -> u64 {
    45
}

fn default_utc_offset() -> String {
    "+00:00".to_string()
}

fn default_dot() -> PathBuf {
    PathBuf::from(".")
}

fn default_delimiter() -> String {
    ",".to_string()
}

fn default_pdf_command() -> String {
    "pdftotext".to_string()
}

fn default_mail_command() -> String {
    "sendmail".to_string()
}

fn default_mail_from() -> String {
    "runcode@localhost".to_string()
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_browser_cache() -> PathBuf {
    PathBuf::from("browser-cache.json")
}

fn default_browser_candidates() -> Vec<String> {
    [
        "google-chrome",
        "google-chrome-stable",
        "chromium",
        "chromium-browser",
        "microsoft-edge",
        "msedge",
        "chrome",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_library_cache() -> PathBuf {
    PathBuf::from("embedded-libs-cache")
}

fn default_fetch_libraries() -> bool {
    true
}

fn default_download_timeout_secs() -> u64 {
    30
}

fn default_cdn_rewrites() -> Vec<CdnRewrite> {
    [
        (
            "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.0.0/css/all.min.css",
            "/embedded-libs/font-awesome/css/all.min.css",
        ),
        (
            "https://cdn.jsdelivr.net/npm/chart.js",
            "/embedded-libs/chart.js/chart.min.js",
        ),
        (
            "https://cdnjs.cloudflare.com/ajax/libs/Chart.js/3.9.1/chart.min.js",
            "/embedded-libs/chart.js/chart.min.js",
        ),
        (
            "https://cdnjs.cloudflare.com/ajax/libs/xlsx/0.18.5/xlsx.full.min.js",
            "/embedded-libs/xlsx/xlsx.full.min.js",
        ),
        (
            "https://unpkg.com/tabulator-tables@5.4.4/dist/css/tabulator.min.css",
            "/embedded-libs/tabulator/css/tabulator.min.css",
        ),
        (
            "https://unpkg.com/tabulator-tables@5.4.4/dist/js/tabulator.min.js",
            "/embedded-libs/tabulator/js/tabulator.min.js",
        ),
        (
            "https://unpkg.com/tabulator-tables@5.5.0/dist/css/tabulator.min.css",
            "/embedded-libs/tabulator/css/tabulator.min.css",
        ),
        (
            "https://unpkg.com/tabulator-tables@5.5.0/dist/js/tabulator.min.js",
            "/embedded-libs/tabulator/js/tabulator.min.js",
        ),
    ]
    .iter()
    .map(|(from, to)| CdnRewrite {
        from: from.to_string(),
        to: to.to_string(),
    })
    .collect()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            memory_limit_mb: default_memory_limit_mb(),
            instruction_interval: default_instruction_interval(),
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            markers: default_markers(),
            bypass: default_bypass(),
            threshold: default_threshold(),
            tables: default_count_tables(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            server: String::new(),
            database: String::new(),
            user: String::new(),
            password: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            utc_offset: default_utc_offset(),
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self { root: default_dot() }
    }
}

impl Default for SpreadsheetConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
        }
    }
}

impl Default for PdfConfig {
    fn default() -> Self {
        Self {
            command: default_pdf_command(),
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            command: default_mail_command(),
            from: default_mail_from(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: default_shell(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            cache_file: default_browser_cache(),
            candidates: default_browser_candidates(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root: default_dot(),
            host: default_bind_host(),
            cdn_rewrites: default_cdn_rewrites(),
            library_cache: default_library_cache(),
            fetch_libraries: default_fetch_libraries(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        // Expand environment variables like ${RUNCODE_DB_PASSWORD}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// Loads `path` when given. Otherwise the default location is used,
    /// falling back to built-in defaults when that file does not exist.
    pub fn resolve(path: Option<&str>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        match path {
            Some(p) => Ok((Self::load(p)?, Some(PathBuf::from(p)))),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Ok((Self::load(default)?, Some(default.to_path_buf())))
                } else {
                    Ok((Config::default(), None))
                }
            }
        }
    }
}
