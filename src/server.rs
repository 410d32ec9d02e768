//! `--localserver` mode: a small static file server for report previews.
//!
//! One task per connection, one request per connection. Only `GET` and
//! `HEAD` are served, and nothing outside the configured root is reachable
//! except the downloaded CDN copies that rewrite targets point at.
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::{CdnRewrite, ServerConfig};
use crate::libraries::LibraryCache;

const MAX_HEADER_BYTES: usize = 16 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
    /// HEAD: headers describe `body` but it is not sent
    pub head_only: bool,
}

impl Response {
    fn ok(content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type,
            body,
            head_only: false,
        }
    }

    fn error(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: format!("{status} {}", reason(status)).into_bytes(),
            head_only: false,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
            self.status,
            reason(self.status),
            self.content_type,
            self.body.len()
        );
        if self.status == 405 {
            head.push_str("Allow: GET, HEAD\r\n");
        }
        head.push_str("\r\n");
        let mut out = head.into_bytes();
        if !self.head_only {
            out.extend_from_slice(&self.body);
        }
        out
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    }
}

pub fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "application/javascript; charset=utf-8",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "txt" => "text/plain; charset=utf-8",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "eot" => "application/vnd.ms-fontobject",
        _ => "application/octet-stream",
    }
}

pub struct FileServer {
    root: PathBuf,
    cdn_rewrites: Vec<CdnRewrite>,
    libraries: LibraryCache,
}

impl FileServer {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let root = config
            .root
            .canonicalize()
            .with_context(|| format!("cannot serve {}", config.root.display()))?;
        if !root.is_dir() {
            return Err(anyhow!("{} is not a directory", root.display()));
        }
        Ok(Self {
            root,
            cdn_rewrites: config.cdn_rewrites.clone(),
            libraries: LibraryCache::new(config)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn libraries(&self) -> &LibraryCache {
        &self.libraries
    }

    /// Maps a request target to a file under the root, or an HTTP status.
    fn resolve(&self, target: &str) -> Result<PathBuf, u16> {
        let path = target.split(['?', '#']).next().unwrap_or("/");
        let decoded = percent_decode_str(path).decode_utf8().map_err(|_| 400u16)?;
        if decoded.contains('\0') || decoded.contains('\\') {
            return Err(403);
        }
        if self.cdn_rewrites.iter().any(|rule| rule.to == decoded) {
            if let Some(cached) = self.libraries.lookup(&decoded) {
                return Ok(cached);
            }
        }

        let mut relative = PathBuf::new();
        for segment in decoded.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if !relative.pop() {
                        return Err(403);
                    }
                }
                s => relative.push(s),
            }
        }
        if relative.as_os_str().is_empty() {
            relative.push("index.html");
        }

        let mut full = self.root.join(&relative).canonicalize().map_err(|_| 404u16)?;
        // Symlinks may point anywhere; the canonical path decides
        if !full.starts_with(&self.root) {
            return Err(403);
        }
        if full.is_dir() {
            full.push("index.html");
            if !full.is_file() {
                return Err(404);
            }
        }
        Ok(full)
    }

    fn rewrite_cdn(&self, html: &str) -> String {
        self.cdn_rewrites
            .iter()
            .fold(html.to_string(), |body, rule| body.replace(&rule.from, &rule.to))
    }

    pub async fn respond(&self, method: &str, target: &str) -> Response {
        let head_only = match method {
            "GET" => false,
            "HEAD" => true,
            _ => return Response::error(405),
        };

        let mut response = match self.resolve(target) {
            Err(status) => Response::error(status),
            Ok(path) => match tokio::fs::read(&path).await {
                Err(e) => {
                    warn!("Cannot read {}: {e}", path.display());
                    Response::error(404)
                }
                Ok(bytes) => {
                    let mime = content_type(&path);
                    if mime.starts_with("text/html") {
                        let html = String::from_utf8_lossy(&bytes);
                        Response::ok(mime, self.rewrite_cdn(&html).into_bytes())
                    } else {
                        Response::ok(mime, bytes)
                    }
                }
            },
        };
        response.head_only = head_only;
        response
    }

    async fn handle(&self, stream: TcpStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let request = tokio::time::timeout(READ_TIMEOUT, read_request_head(&mut reader))
            .await
            .map_err(|_| anyhow!("timed out reading request"))??;

        let response = match request {
            Some((method, target)) => {
                let response = self.respond(&method, &target).await;
                info!("{method} {target} -> {}", response.status);
                response
            }
            None => Response::error(400),
        };
        writer.write_all(&response.to_bytes()).await?;
        writer.shutdown().await?;
        Ok(())
    }

    /// Accepts connections until `shutdown` resolves.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("File server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle(stream).await {
                            debug!(%peer, "Connection error: {e}");
                        }
                    });
                }
            }
        }
    }
}

/// Request line of the next request; headers are read and discarded.
/// `None` when the request line is malformed or the head exceeds
/// `MAX_HEADER_BYTES`.
async fn read_request_head<R>(reader: &mut R) -> Result<Option<(String, String)>>
where
    R: AsyncBufRead + Unpin,
{
    let mut limited = reader.take(MAX_HEADER_BYTES as u64);

    let mut line = String::new();
    limited.read_line(&mut line).await?;
    if !line.ends_with('\n') && limited.limit() == 0 {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let request = match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version)) if version.starts_with("HTTP/") => {
            Some((method.to_string(), target.to_string()))
        }
        _ => None,
    };

    loop {
        let mut header = String::new();
        let n = limited.read_line(&mut header).await?;
        if n == 0 && limited.limit() == 0 {
            return Ok(None);
        }
        if n == 0 || header == "\r\n" || header == "\n" {
            break;
        }
        if !header.ends_with('\n') && limited.limit() == 0 {
            return Ok(None);
        }
    }
    Ok(request)
}

/// Serves `config.root` on `config.host:port` until Ctrl-C.
pub async fn run(config: &ServerConfig, port: u16) -> Result<()> {
    let server = Arc::new(FileServer::new(config)?);
    if config.fetch_libraries && !config.cdn_rewrites.is_empty() {
        let summary = server.libraries().prefetch(&config.cdn_rewrites).await;
        info!(
            "Libraries in {}: {} downloaded, {} cached, {} unavailable",
            server.libraries().dir().display(),
            summary.downloaded.len(),
            summary.cached.len(),
            summary.failed.len()
        );
        if !summary.failed.is_empty() {
            crate::color_log::ColorLog::warn(format!(
                "Not cached, served from {} if present: {}",
                server.root().display(),
                summary.failed.join(", ")
            ));
        }
    }
    let listener = TcpListener::bind((config.host.as_str(), port))
        .await
        .with_context(|| format!("cannot bind {}:{port}", config.host))?;
    let addr = listener.local_addr()?;
    info!("Serving {} at http://{addr}/", server.root().display());
    crate::color_log::ColorLog::success(format!(
        "Local server running at http://{addr}/ (Ctrl-C to stop)"
    ));

    server
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use tokio::io::AsyncReadExt;

    fn server(dir: &Path) -> FileServer {
        FileServer::new(&ServerConfig {
            root: dir.to_path_buf(),
            library_cache: dir.join(".libs"),
            cdn_rewrites: vec![CdnRewrite {
                from: "https://cdn.example.com/chart.js".into(),
                to: "/vendor/chart.js".into(),
            }],
            ..ServerConfig::default()
        })
        .unwrap()
    }

    fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("index.html"),
            r#"<script src="https://cdn.example.com/chart.js"></script><script src="https://cdn.example.com/chart.js"></script>"#,
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join("assets/app.js"), "// https://cdn.example.com/chart.js").unwrap();
        std::fs::write(dir.path().join("assets/my report.txt"), "hello").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_root_serves_index_with_cdn_rewrite() {
        let dir = site();
        let res = server(dir.path()).respond("GET", "/").await;
        assert_eq!(res.status, 200);
        assert_eq!(res.content_type, "text/html; charset=utf-8");
        let body = String::from_utf8(res.body).unwrap();
        assert_eq!(body.matches("/vendor/chart.js").count(), 2);
        assert!(!body.contains("cdn.example.com"));
    }

    #[tokio::test]
    async fn test_non_html_is_untouched() {
        let dir = site();
        let res = server(dir.path()).respond("GET", "/assets/app.js?v=3").await;
        assert_eq!(res.status, 200);
        assert_eq!(res.content_type, "application/javascript; charset=utf-8");
        assert_eq!(res.body, b"// https://cdn.example.com/chart.js");
    }

    #[tokio::test]
    async fn test_percent_decoding() {
        let dir = site();
        let res = server(dir.path()).respond("GET", "/assets/my%20report.txt").await;
        assert_eq!(res.status, 200);
        assert_eq!(res.body, b"hello");
        // Not UTF-8 once decoded
        assert_eq!(server(dir.path()).respond("GET", "/bad%ff").await.status, 400);
    }

    #[tokio::test]
    async fn test_traversal_is_forbidden() {
        let dir = site();
        let s = server(dir.path());
        assert_eq!(s.respond("GET", "/../etc/passwd").await.status, 403);
        assert_eq!(s.respond("GET", "/%2e%2e/%2e%2e/etc/passwd").await.status, 403);
        assert_eq!(s.respond("GET", "/assets/..%2F..%2Fsecret").await.status, 403);
        // Staying inside the root is fine
        assert_eq!(s.respond("GET", "/assets/../index.html").await.status, 200);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_is_forbidden() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "s3cr3t").unwrap();
        let dir = site();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("link.txt"))
            .unwrap();
        assert_eq!(server(dir.path()).respond("GET", "/link.txt").await.status, 403);
    }

    #[tokio::test]
    async fn test_missing_and_method_errors() {
        let dir = site();
        let s = server(dir.path());
        assert_eq!(s.respond("GET", "/nope.css").await.status, 404);
        let res = s.respond("POST", "/").await;
        assert_eq!(res.status, 405);
        assert!(String::from_utf8(res.to_bytes()).unwrap().contains("Allow: GET, HEAD"));
    }

    #[tokio::test]
    async fn test_head_omits_body() {
        let dir = site();
        let res = server(dir.path()).respond("HEAD", "/assets/my%20report.txt").await;
        let raw = String::from_utf8(res.to_bytes()).unwrap();
        assert!(raw.contains("Content-Length: 5\r\n"));
        assert!(raw.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_request_head_is_bounded() {
        let ok = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n".to_vec();
        let head = read_request_head(&mut ok.as_slice()).await.unwrap();
        assert_eq!(head, Some(("GET".to_string(), "/a".to_string())));

        // One long line without a newline stops at the cap
        let long_line = vec![b'G'; MAX_HEADER_BYTES * 4];
        assert_eq!(read_request_head(&mut long_line.as_slice()).await.unwrap(), None);

        let mut many = b"GET / HTTP/1.1\r\n".to_vec();
        while many.len() <= MAX_HEADER_BYTES {
            many.extend_from_slice(b"X-Filler: 0123456789\r\n");
        }
        many.extend_from_slice(b"\r\n");
        assert_eq!(read_request_head(&mut many.as_slice()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rewrite_target_served_from_library_cache() {
        let dir = site();
        let s = server(dir.path());
        // Not downloaded yet and absent from the root
        assert_eq!(s.respond("GET", "/vendor/chart.js").await.status, 404);

        let cached = dir.path().join(".libs/vendor/chart.js");
        std::fs::create_dir_all(cached.parent().unwrap()).unwrap();
        std::fs::write(&cached, "window.Chart = 1;").unwrap();
        let res = s.respond("GET", "/vendor/chart.js").await;
        assert_eq!(res.status, 200);
        assert_eq!(res.content_type, "application/javascript; charset=utf-8");
        assert_eq!(res.body, b"window.Chart = 1;");

        // Other cache files are not reachable by URL
        std::fs::write(dir.path().join(".libs/vendor/other.js"), "x").unwrap();
        assert_eq!(s.respond("GET", "/vendor/other.js").await.status, 404);
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type(Path::new("a.PNG")), "image/png");
        assert_eq!(content_type(Path::new("a.svg")), "image/svg+xml");
        assert_eq!(content_type(Path::new("fa-solid-900.woff2")), "font/woff2");
        assert_eq!(content_type(Path::new("a.bin")), "application/octet-stream");
        assert_eq!(content_type(Path::new("Makefile")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_serves_over_tcp_until_shutdown() {
        let dir = site();
        let server = Arc::new(server(dir.path()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(listener, async {
            let _ = stop_rx.await;
        }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /assets/my%20report.txt HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(raw.contains("Connection: close"));
        assert!(raw.ends_with("hello"));

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
