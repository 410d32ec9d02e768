use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

use super::{find_executable, CapabilityHandle, CapabilityName, CapabilityProvider};
use crate::browser::{BrowserCache, BrowserLocator};
use crate::config::{BrowserConfig, ShellConfig};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecOutput {
    pub success: bool,
    /// `None` when the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Process spawning exposed to scripts as `shell` (and `execSync`).
pub struct Shell {
    program: PathBuf,
    browser: BrowserLocator,
}

impl Shell {
    pub fn new(program: PathBuf, browser: BrowserLocator) -> Self {
        Self { program, browser }
    }

    /// Runs `command` through `sh -c`. Children are killed if the script
    /// is torn down before they finish.
    pub async fn exec(&self, command: &str, cwd: Option<&str>) -> Result<ExecOutput> {
        debug!("exec: {command}");
        let mut cmd = Command::new(&self.program);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| anyhow!("cannot run {}: {e}", self.program.display()))?;

        Ok(ExecOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Like `exec`, but returns stdout and fails on a non-zero exit.
    pub async fn exec_sync(&self, command: &str) -> Result<String> {
        let out = self.exec(command, None).await?;
        if !out.success {
            bail!(
                "command failed ({}): {}",
                out.code.map_or("signal".to_string(), |c| format!("exit {c}")),
                out.stderr.trim()
            );
        }
        Ok(out.stdout)
    }

    pub fn locate_browser(&self, provided: Option<&Path>) -> Result<BrowserCache> {
        self.browser.locate(provided)
    }
}

pub struct ShellProvider {
    config: ShellConfig,
    browser: BrowserConfig,
}

impl ShellProvider {
    pub fn new(config: ShellConfig, browser: BrowserConfig) -> Self {
        Self { config, browser }
    }
}

impl CapabilityProvider for ShellProvider {
    fn name(&self) -> CapabilityName {
        CapabilityName::Shell
    }

    fn acquire(&self) -> Result<CapabilityHandle> {
        let program = find_executable(&self.config.program)
            .ok_or_else(|| anyhow!("{} not found on PATH", self.config.program))?;
        Ok(CapabilityHandle::Shell(Arc::new(Shell::new(
            program,
            BrowserLocator::new(&self.browser),
        ))))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell() -> Shell {
        Shell::new(
            find_executable("sh").unwrap(),
            BrowserLocator::new(&BrowserConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_exec_captures_streams() {
        let out = shell().exec("echo out; echo err >&2; exit 3", None).await.unwrap();
        assert!(!out.success);
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_exec_sync() {
        assert_eq!(shell().exec_sync("printf 'a b'").await.unwrap(), "a b");
        let err = shell().exec_sync("echo boom >&2; false").await.unwrap_err();
        assert!(err.to_string().contains("exit 1"));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_exec_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let out = shell()
            .exec("ls", Some(dir.path().to_str().unwrap()))
            .await
            .unwrap();
        assert!(out.stdout.contains("marker.txt"));
    }

    #[test]
    fn test_provider_requires_shell() {
        let provider = ShellProvider::new(
            ShellConfig {
                program: "no-such-shell-zz".into(),
            },
            BrowserConfig::default(),
        );
        assert!(provider.acquire().is_err());
    }
}
