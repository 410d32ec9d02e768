/// Locating a Chromium-family browser executable for HTML rendering jobs.
///
/// The last path found is remembered in a small JSON file so later runs
/// skip the `PATH` scan. A remembered path is trusted only while it still
/// exists on disk.
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capabilities::find_executable;
use crate::config::BrowserConfig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BrowserCache {
    pub browser_path: PathBuf,
    pub browser_name: String,
    /// RFC 3339 timestamp of the last write
    pub last_updated: String,
}

pub struct BrowserLocator {
    cache_file: PathBuf,
    candidates: Vec<String>,
}

impl BrowserLocator {
    pub fn new(config: &BrowserConfig) -> Self {
        Self {
            cache_file: config.cache_file.clone(),
            candidates: config.candidates.clone(),
        }
    }

    /// Resolution order: explicit path, cached path, first candidate on `PATH`.
    pub fn locate(&self, provided: Option<&Path>) -> Result<BrowserCache> {
        if let Some(path) = provided {
            if !path.is_file() {
                bail!("browser not found at {}", path.display());
            }
            return self.remember(path);
        }

        if let Some(cached) = self.load() {
            if cached.browser_path.is_file() {
                debug!("Using cached browser {}", cached.browser_path.display());
                return Ok(cached);
            }
            warn!(
                "Cached browser {} no longer exists, searching again",
                cached.browser_path.display()
            );
        }

        let found = self
            .candidates
            .iter()
            .find_map(|name| find_executable(name))
            .ok_or_else(|| {
                anyhow!(
                    "no browser found on PATH (tried: {})",
                    self.candidates.join(", ")
                )
            })?;
        info!("Found browser {}", found.display());
        self.remember(&found)
    }

    fn load(&self) -> Option<BrowserCache> {
        let text = std::fs::read_to_string(&self.cache_file).ok()?;
        match serde_json::from_str(&text) {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!("Ignoring unreadable browser cache {}: {e}", self.cache_file.display());
                None
            }
        }
    }

    fn remember(&self, path: &Path) -> Result<BrowserCache> {
        let entry = BrowserCache {
            browser_path: path.to_path_buf(),
            browser_name: path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            last_updated: chrono::Utc::now().to_rfc3339(),
        };
        if let Some(parent) = self.cache_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.cache_file, serde_json::to_string_pretty(&entry)?)?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator(dir: &Path, candidates: &[&str]) -> BrowserLocator {
        BrowserLocator::new(&BrowserConfig {
            cache_file: dir.join("cache").join("browser.json"),
            candidates: candidates.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn test_provided_path_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("chromium");
        std::fs::write(&exe, "").unwrap();

        let loc = locator(dir.path(), &[]);
        let found = loc.locate(Some(&exe)).unwrap();
        assert_eq!(found.browser_name, "chromium");

        // A second lookup with no candidates is served from the cache
        let again = loc.locate(None).unwrap();
        assert_eq!(again.browser_path, exe);
    }

    #[test]
    fn test_missing_provided_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let loc = locator(dir.path(), &[]);
        assert!(loc.locate(Some(Path::new("/no/such/browser"))).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_cache_triggers_search() {
        let dir = tempfile::tempdir().unwrap();
        let loc = locator(dir.path(), &["no-such-browser-q", "sh"]);
        std::fs::create_dir_all(dir.path().join("cache")).unwrap();
        std::fs::write(
            dir.path().join("cache/browser.json"),
            r#"{"browserPath": "/gone/chrome", "browserName": "chrome", "lastUpdated": "2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let found = loc.locate(None).unwrap();
        assert_eq!(found.browser_name, "sh");

        let text = std::fs::read_to_string(dir.path().join("cache/browser.json")).unwrap();
        assert!(text.contains("\"browserName\": \"sh\""));
        assert!(text.contains("lastUpdated"));
    }

    #[test]
    fn test_nothing_found() {
        let dir = tempfile::tempdir().unwrap();
        let loc = locator(dir.path(), &["no-such-browser-q"]);
        let err = loc.locate(None).unwrap_err();
        assert!(err.to_string().contains("no-such-browser-q"));
    }
}
