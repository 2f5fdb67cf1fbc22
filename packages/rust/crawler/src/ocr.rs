//! OCR capability for scanned PDFs.
//!
//! The engine is a seam: [`CommandOcr`] pipes the PDF bytes into an external
//! program (e.g. a tesseract wrapper) on stdin and reads plain text from stdout.

use std::process::Stdio;

use async_trait::async_trait;
use regtruth_shared::{OcrConfig, RegTruthError, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Recognise the text of a scanned document.
    async fn recognize(&self, pdf: &[u8]) -> Result<String>;
}

/// Runs an external OCR command per document.
pub struct CommandOcr {
    command: String,
    args: Vec<String>,
}

impl CommandOcr {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    /// `None` when no OCR command is configured.
    pub fn from_config(config: &OcrConfig) -> Option<Self> {
        config
            .command
            .as_ref()
            .map(|cmd| Self::new(cmd.clone(), config.args.clone()))
    }
}

#[async_trait]
impl OcrEngine for CommandOcr {
    fn name(&self) -> &str {
        &self.command
    }

    async fn recognize(&self, pdf: &[u8]) -> Result<String> {
        info!(cmd = %self.command, bytes = pdf.len(), "running OCR");

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RegTruthError::config(format!(
                    "failed to spawn OCR command: {e}. Is `{}` installed?",
                    self.command
                ))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RegTruthError::Network("failed to capture OCR stdin".into()))?;
        let input = pdf.to_vec();
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&input).await;
            drop(stdin);
            result
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RegTruthError::Network(format!("OCR command failed: {e}")))?;
        // A broken pipe just means the command stopped reading early.
        let _ = writer.await;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RegTruthError::Network(format!(
                "OCR command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(chars = text.len(), "OCR finished");
        Ok(text)
    }
}
