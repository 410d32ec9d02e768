use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tokio::process::Command;
use tracing::debug;

use super::{find_executable, CapabilityHandle, CapabilityName, CapabilityProvider};
use crate::config::PdfConfig;

/// PDF text extraction through poppler's `pdftotext`.
pub struct PdfExtractor {
    program: PathBuf,
}

impl PdfExtractor {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    /// Extracts the text of `path`, preserving the physical layout.
    /// Pages are separated by form feeds.
    pub async fn extract_text(&self, path: &str) -> Result<String> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            bail!("PDF not found: {path}");
        }
        debug!("Extracting text from {path}");
        let output = Command::new(&self.program)
            .arg("-layout")
            .arg("-enc")
            .arg("UTF-8")
            .arg(path)
            .arg("-")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| anyhow!("cannot run {}: {e}", self.program.display()))?;

        if !output.status.success() {
            bail!(
                "{} failed ({}): {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Text split on form feeds, trailing empty page dropped.
    pub async fn extract_pages(&self, path: &str) -> Result<Vec<String>> {
        let text = self.extract_text(path).await?;
        let mut pages: Vec<String> = text.split('\x0c').map(str::to_string).collect();
        if pages.last().is_some_and(|p| p.trim().is_empty()) {
            pages.pop();
        }
        Ok(pages)
    }
}

pub struct PdfProvider {
    config: PdfConfig,
}

impl PdfProvider {
    pub fn new(config: PdfConfig) -> Self {
        Self { config }
    }
}

impl CapabilityProvider for PdfProvider {
    fn name(&self) -> CapabilityName {
        CapabilityName::Pdf
    }

    fn acquire(&self) -> Result<CapabilityHandle> {
        let program = find_executable(&self.config.command)
            .ok_or_else(|| anyhow!("{} not found on PATH", self.config.command))?;
        Ok(CapabilityHandle::Pdf(Arc::new(PdfExtractor::new(program))))
    }
}
