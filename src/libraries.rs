//! Local copies of the CDN assets that `--localserver` rewrites to.
//!
//! Every rewrite target (`/embedded-libs/chart.js/chart.min.js`) is backed
//! by a file under the cache directory, downloaded once from the first
//! source URL that answers. `index.json` records where each file came from.
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{CdnRewrite, ServerConfig};

const MAX_LIBRARY_BYTES: usize = 20 * 1024 * 1024;
const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LibraryEntry {
    pub url: String,
    pub size: u64,
    /// RFC 3339
    pub downloaded_at: String,
}

/// Outcome of one `prefetch` pass, by served path.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FetchSummary {
    pub downloaded: Vec<String>,
    pub cached: Vec<String>,
    pub failed: Vec<String>,
}

pub struct LibraryCache {
    dir: PathBuf,
    http: Client,
}

impl LibraryCache {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.download_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self {
            dir: config.library_cache.clone(),
            http,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cache file backing a served path. `None` when the path has no
    /// normal components or tries to leave the cache directory.
    pub fn file_for(&self, local: &str) -> Option<PathBuf> {
        let mut path = self.dir.clone();
        let mut depth = 0;
        for component in Path::new(local.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => {
                    path.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                _ => return None,
            }
        }
        (depth > 0).then_some(path)
    }

    /// The downloaded copy of `local`, if there is one.
    pub fn lookup(&self, local: &str) -> Option<PathBuf> {
        self.file_for(local).filter(|p| p.is_file())
    }

    /// Downloads every rewrite target that is not cached yet. Never fails:
    /// unreachable sources are logged and listed in the summary.
    pub async fn prefetch(&self, rewrites: &[CdnRewrite]) -> FetchSummary {
        let mut sources: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for rule in rewrites {
            sources.entry(rule.to.as_str()).or_default().push(rule.from.as_str());
        }

        let mut index = self.load_index().await;
        let mut summary = FetchSummary::default();
        for (local, urls) in sources {
            let Some(file) = self.file_for(local) else {
                warn!("Skipping library target {local:?}: not a relative path");
                summary.failed.push(local.to_string());
                continue;
            };
            if file.is_file() {
                debug!("Library {local} already cached");
                summary.cached.push(local.to_string());
                continue;
            }
            match self.fetch_first(&urls, &file).await {
                Ok(entry) => {
                    info!("Cached {} as {local} ({} bytes)", entry.url, entry.size);
                    index.insert(local.to_string(), entry);
                    summary.downloaded.push(local.to_string());
                }
                Err(e) => {
                    warn!("Cannot cache {local}: {e:#}");
                    summary.failed.push(local.to_string());
                }
            }
        }

        if !summary.downloaded.is_empty() {
            if let Err(e) = self.save_index(&index).await {
                warn!("Cannot write library index: {e:#}");
            }
        }
        summary
    }

    async fn fetch_first(&self, urls: &[&str], file: &Path) -> Result<LibraryEntry> {
        let mut last = anyhow!("no source URL");
        for url in urls {
            match self.download(url).await {
                Ok(bytes) => {
                    store(file, &bytes).await?;
                    return Ok(LibraryEntry {
                        url: url.to_string(),
                        size: bytes.len() as u64,
                        downloaded_at: chrono::Utc::now().to_rfc3339(),
                    });
                }
                Err(e) => {
                    debug!("{url}: {e:#}");
                    last = e;
                }
            }
        }
        Err(last)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        debug!("Downloading {url}");
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            bail!("{url} returned {status}");
        }
        if let Some(len) = resp.content_length() {
            if len as usize > MAX_LIBRARY_BYTES {
                bail!("{url} is {len} bytes (limit {MAX_LIBRARY_BYTES})");
            }
        }
        let body = resp.bytes().await?;
        if body.len() > MAX_LIBRARY_BYTES {
            bail!("{url} is {} bytes (limit {MAX_LIBRARY_BYTES})", body.len());
        }
        Ok(body.to_vec())
    }

    async fn load_index(&self) -> BTreeMap<String, LibraryEntry> {
        let path = self.dir.join(INDEX_FILE);
        let Ok(text) = tokio::fs::read_to_string(&path).await else {
            return BTreeMap::new();
        };
        serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!("Ignoring unreadable library index {}: {e}", path.display());
            BTreeMap::new()
        })
    }

    async fn save_index(&self, index: &BTreeMap<String, LibraryEntry>) -> Result<()> {
        let text = serde_json::to_string_pretty(index)?;
        store(&self.dir.join(INDEX_FILE), text.as_bytes()).await
    }
}

/// Writes through a `.part` file so an interrupted download is never
/// mistaken for a cached one.
async fn store(file: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = file.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut partial = file.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);
    tokio::fs::write(&partial, bytes)
        .await
        .with_context(|| format!("cannot write {}", partial.display()))?;
    tokio::fs::rename(&partial, file)
        .await
        .with_context(|| format!("cannot move {} into place", file.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn cache(dir: &Path) -> LibraryCache {
        LibraryCache::new(&ServerConfig {
            library_cache: dir.join("libs"),
            download_timeout_secs: 5,
            ..ServerConfig::default()
        })
        .unwrap()
    }

    /// Answers `requests` connections with the same status and body.
    fn fake_cdn(status: &'static str, body: &'static str, requests: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming().take(requests) {
                let mut stream = stream.unwrap();
                let mut head = Vec::new();
                let mut buf = [0u8; 512];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = stream.read(&mut buf).unwrap();
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                }
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(response.as_bytes()).unwrap();
            }
        });
        format!("http://{addr}")
    }

    fn dead_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{port}/chart.js")
    }

    #[test]
    fn test_file_for_stays_in_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(dir.path());
        assert_eq!(
            c.file_for("/embedded-libs/chart.js/chart.min.js"),
            Some(dir.path().join("libs/embedded-libs/chart.js/chart.min.js"))
        );
        assert_eq!(c.file_for("/embedded-libs/../../etc/passwd"), None);
        assert_eq!(c.file_for("/"), None);
        assert_eq!(c.lookup("/embedded-libs/chart.js/chart.min.js"), None);
    }

    #[tokio::test]
    async fn test_prefetch_downloads_once_from_first_live_source() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(dir.path());
        let live = format!("{}/npm/chart.js", fake_cdn("200 OK", "window.Chart = 1;", 1));
        let rewrites = vec![
            CdnRewrite {
                from: dead_url(),
                to: "/embedded-libs/chart.js/chart.min.js".into(),
            },
            CdnRewrite {
                from: live.clone(),
                to: "/embedded-libs/chart.js/chart.min.js".into(),
            },
        ];

        let summary = c.prefetch(&rewrites).await;
        assert_eq!(summary.downloaded, vec!["/embedded-libs/chart.js/chart.min.js"]);
        assert!(summary.failed.is_empty());
        let file = c.lookup("/embedded-libs/chart.js/chart.min.js").unwrap();
        assert_eq!(std::fs::read_to_string(file).unwrap(), "window.Chart = 1;");

        let index = c.load_index().await;
        let entry = &index["/embedded-libs/chart.js/chart.min.js"];
        assert_eq!(entry.url, live);
        assert_eq!(entry.size, 17);

        // The fake CDN is gone; a second pass must not need it
        let again = c.prefetch(&rewrites).await;
        assert_eq!(again.cached, vec!["/embedded-libs/chart.js/chart.min.js"]);
        assert!(again.downloaded.is_empty());
    }

    #[tokio::test]
    async fn test_failed_download_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(dir.path());
        let rewrites = vec![CdnRewrite {
            from: format!("{}/missing.css", fake_cdn("404 Not Found", "nope", 1)),
            to: "/embedded-libs/missing.css".into(),
        }];
        let summary = c.prefetch(&rewrites).await;
        assert_eq!(summary.failed, vec!["/embedded-libs/missing.css"]);
        assert!(c.lookup("/embedded-libs/missing.css").is_none());
        assert!(!dir.path().join("libs").join(INDEX_FILE).exists());
    }
}
