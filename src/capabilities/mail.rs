use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

use super::{find_executable, CapabilityHandle, CapabilityName, CapabilityProvider};
use crate::config::MailConfig;

/// A message as scripts describe it. `to` and `cc` accept a single
/// address, a comma-separated string or a list.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MailMessage {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default, deserialize_with = "addresses")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "addresses")]
    pub cc: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
}

fn addresses<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => s
            .split(',')
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect(),
        OneOrMany::Many(v) => v,
    })
}

/// Hands messages to the local MTA via `sendmail -t -i`.
pub struct MailSender {
    program: PathBuf,
    default_from: String,
}

impl MailSender {
    pub fn new(program: PathBuf, default_from: impl Into<String>) -> Self {
        Self {
            program,
            default_from: default_from.into(),
        }
    }

    /// Builds the RFC 5322 text handed to the MTA.
    pub fn compose(&self, message: &MailMessage, message_id: &str) -> Result<String> {
        if message.to.is_empty() {
            bail!("mail has no recipients");
        }
        for header in [&message.subject]
            .into_iter()
            .chain(message.to.iter())
            .chain(message.cc.iter())
            .chain(message.from.iter())
        {
            if header.contains('\r') || header.contains('\n') {
                bail!("line breaks are not allowed in mail headers");
            }
        }

        let from = message.from.as_deref().unwrap_or(&self.default_from);
        let (content_type, body) = match (&message.html, &message.text) {
            (Some(html), _) => ("text/html", html.as_str()),
            (None, Some(text)) => ("text/plain", text.as_str()),
            (None, None) => ("text/plain", ""),
        };

        let mut out = String::new();
        out.push_str(&format!("From: {from}\r\n"));
        out.push_str(&format!("To: {}\r\n", message.to.join(", ")));
        if !message.cc.is_empty() {
            out.push_str(&format!("Cc: {}\r\n", message.cc.join(", ")));
        }
        out.push_str(&format!("Subject: {}\r\n", message.subject));
        out.push_str(&format!("Date: {}\r\n", chrono::Utc::now().to_rfc2822()));
        out.push_str(&format!("Message-ID: <{message_id}>\r\n"));
        out.push_str("MIME-Version: 1.0\r\n");
        out.push_str(&format!("Content-Type: {content_type}; charset=utf-8\r\n"));
        out.push_str("Content-Transfer-Encoding: 8bit\r\n\r\n");
        out.push_str(&body.replace("\r\n", "\n").replace('\n', "\r\n"));
        out.push_str("\r\n");
        Ok(out)
    }

    /// Sends and returns the generated Message-ID.
    pub async fn send(&self, message: &MailMessage) -> Result<String> {
        let host = self.default_from.rsplit('@').next().unwrap_or("localhost");
        let message_id = format!("{}@{host}", uuid::Uuid::new_v4());
        let raw = self.compose(message, &message_id)?;

        let mut child = Command::new(&self.program)
            .arg("-t")
            .arg("-i")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow!("cannot run {}: {e}", self.program.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(raw.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        info!("Mail queued to {} recipient(s)", message.to.len() + message.cc.len());
        Ok(message_id)
    }
}

pub struct MailProvider {
    config: MailConfig,
}

impl MailProvider {
    pub fn new(config: MailConfig) -> Self {
        Self { config }
    }
}

impl CapabilityProvider for MailProvider {
    fn name(&self) -> CapabilityName {
        CapabilityName::Mail
    }

    fn acquire(&self) -> Result<CapabilityHandle> {
        let program = find_executable(&self.config.command)
            .ok_or_else(|| anyhow!("{} not found on PATH", self.config.command))?;
        Ok(CapabilityHandle::Mail(Arc::new(MailSender::new(
            program,
            self.config.from.clone(),
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sender() -> MailSender {
        MailSender::new(PathBuf::from("sendmail"), "reports@lab.example")
    }

    #[test]
    fn test_recipients_accept_string_or_list() {
        let m: MailMessage =
            serde_json::from_value(json!({"to": "a@x.org, b@x.org", "cc": ["c@x.org"]})).unwrap();
        assert_eq!(m.to, vec!["a@x.org", "b@x.org"]);
        assert_eq!(m.cc, vec!["c@x.org"]);
    }

    #[test]
    fn test_compose_headers_and_body() {
        let m = MailMessage {
            to: vec!["a@x.org".into()],
            subject: "Daily report".into(),
            text: Some("line1\nline2".into()),
            ..Default::default()
        };
        let raw = sender().compose(&m, "id-1@lab.example").unwrap();
        assert!(raw.starts_with("From: reports@lab.example\r\nTo: a@x.org\r\n"));
        assert!(raw.contains("Subject: Daily report\r\n"));
        assert!(raw.contains("Message-ID: <id-1@lab.example>\r\n"));
        assert!(raw.contains("Content-Type: text/plain; charset=utf-8"));
        assert!(raw.ends_with("\r\n\r\nline1\r\nline2\r\n"));
    }

    #[test]
    fn test_html_wins_over_text() {
        let m = MailMessage {
            to: vec!["a@x.org".into()],
            text: Some("plain".into()),
            html: Some("<b>rich</b>".into()),
            ..Default::default()
        };
        let raw = sender().compose(&m, "x").unwrap();
        assert!(raw.contains("text/html"));
        assert!(raw.contains("<b>rich</b>"));
        assert!(!raw.contains("plain\r\n"));
    }

    #[test]
    fn test_header_injection_rejected() {
        let m = MailMessage {
            to: vec!["a@x.org".into()],
            subject: "hi\r\nBcc: evil@x.org".into(),
            ..Default::default()
        };
        assert!(sender().compose(&m, "x").is_err());
        assert!(sender().compose(&MailMessage::default(), "x").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_send_pipes_to_command() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let captured = dir.path().join("captured.eml");
        let fake = dir.path().join("fake-sendmail");
        std::fs::write(
            &fake,
            format!("#!/bin/sh\ncat > '{}'\n", captured.display()),
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let sender = MailSender::new(fake, "me@host.example");
        let m = MailMessage {
            to: vec!["a@x.org".into()],
            subject: "ping".into(),
            ..Default::default()
        };
        let id = sender.send(&m).await.unwrap();
        assert!(id.ends_with("@host.example"));

        let raw = std::fs::read_to_string(&captured).unwrap();
        assert!(raw.contains("Subject: ping\r\n"));
        assert!(raw.contains(&format!("Message-ID: <{id}>")));
    }

    #[test]
    fn test_missing_binary_fails_acquisition() {
        let provider = MailProvider::new(MailConfig {
            command: "sendmail-missing-zz".into(),
            from: "x@y".into(),
        });
        assert!(provider.acquire().is_err());
    }
}
