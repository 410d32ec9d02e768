mod args;
mod browser;
mod capabilities;
mod color_log;
mod config;
mod context;
mod error;
mod gate;
mod harness;
mod libraries;
mod sandbox;
mod server;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::color_log::ColorLog;
use crate::config::Config;
use crate::harness::{CliOptions, Harness, CONFIG_ENV};

fn print_help() {
    println!(
        "\
runcode v{}

Runs a Lua script inside an isolated sandbox with injected capabilities.

USAGE:
    runcode -f <SCRIPT> [OPTIONS] [--key value ...]
    runcode --localserver <PORT>

OPTIONS:
    -f <SCRIPT>                 Target script to execute
        --extraParam <JSON>     JSON object merged over the script's argv
        --file <JSON>           Same as --extraParam
        --config <JSON>         Same as --extraParam
        --timeout <SECONDS>     Execution timeout [default: 30]
        --dry-run               Compile and validate without executing
        --localserver <PORT>    Serve the working directory over HTTP instead
    -v, --verbose               Debug logging
        --detailed-help         List the capabilities available to scripts
    -h, --help                  Print this help message and exit
    -V, --version               Print version and exit

Any other --key value pair is passed through to the script's argv.

ENVIRONMENT VARIABLES:
    RUNCODE_CONFIG    Harness TOML configuration [default: config/runcode.toml]
                      Values in it may reference ${{VAR_NAME}}.
    RUST_LOG          Log level filter for tracing
                      (e.g. debug, runcode=debug,warn)

EXAMPLES:
    runcode -f job.lua
    runcode -f job.lua --extraParam params.json --region west
    runcode -f job.lua --dry-run
    runcode --localserver 8080",
        env!("CARGO_PKG_VERSION"),
    );
}

fn print_detailed_help() {
    ColorLog::info(format!("runcode v{} - Lua sandbox executor", env!("CARGO_PKG_VERSION")));
    ColorLog::info("Capabilities available in the sandbox:");
    ColorLog::info("  sql                 SQL gateway client (query, count, close)");
    ColorLog::info("  date                Date/time helper (now, format, add, diff)");
    ColorLog::info("  args                Argument parser (parse)");
    ColorLog::info("  fs                  File helper (read, write, read_json, copy, ...)");
    ColorLog::info("  xlsx, excel         Delimited-text workbooks");
    ColorLog::info("  xlsx_calc           Formula recalculation");
    ColorLog::info("  pdf, pdfReader      PDF text extraction");
    ColorLog::info("  mailer, emailSender Mail sending");
    ColorLog::info("  shell, execSync     Process execution and browser lookup");
    ColorLog::info("  log, console        Colored and plain logging");
    ColorLog::info("");
    ColorLog::info("Database helpers:");
    ColorLog::info("  dbConnect, dbClose, executeQuery, processDbParameters");
    ColorLog::info("");
    ColorLog::info("A script may define main(); its parameters are filled by name:");
    ColorLog::info("  function main(sql, date, argv)");
    ColorLog::info("    return sql.query('SELECT 1 AS one').recordset");
    ColorLog::info("  end");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("runcode v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--detailed-help" => {
                print_detailed_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    let options = match CliOptions::parse(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(e) => {
            ColorLog::error(format!("{}: {e}", e.kind()));
            std::process::exit(1);
        }
    };

    // RUST_LOG overrides --verbose
    let default_filter = if options.verbose { "runcode=debug" } else { "runcode=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    ColorLog::info(format!("runcode v{}", env!("CARGO_PKG_VERSION")));

    let config_path = std::env::var(CONFIG_ENV).ok();
    let (config, loaded_from) = match Config::resolve(config_path.as_deref()) {
        Ok(resolved) => resolved,
        Err(e) => {
            ColorLog::error(format!("ConfigError: {e:#}"));
            std::process::exit(1);
        }
    };
    match loaded_from {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => info!("No configuration file, using built-in defaults"),
    }

    let code = Harness::new(config, options).run().await;
    std::process::exit(code)
}
