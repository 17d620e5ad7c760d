//! OCR through an external `ocrmypdf` process.
//!
//! The input is written to a scoped temporary directory, OCR'd with full-page
//! recognition and deskewing, and the resulting PDF (with its new text
//! layer) is read back. The directory and everything in it is removed when
//! the [`tempfile::TempDir`] guard drops, on success and on every error path.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::config::ExtractionConfig;

/// What came back from an OCR attempt.
#[derive(Debug)]
pub enum OcrOutcome {
    /// PDF bytes carrying a recognised text layer.
    Pdf(Vec<u8>),
    /// OCR could not be applied (tool missing, input rejected). The caller
    /// may fall back to the original bytes.
    Unavailable(String),
}

// ocrmypdf exit codes that say "this input", not "try again later".
const EXIT_BAD_INPUT: i32 = 2;
const EXIT_MISSING_DEPENDENCY: i32 = 3;
const EXIT_ENCRYPTED_PDF: i32 = 8;

#[derive(Debug, Clone)]
pub struct OcrEngine {
    command: String,
    language: String,
    temp_dir: Option<PathBuf>,
}

impl OcrEngine {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            command: config.ocr_command.clone(),
            language: config.ocr_language.clone(),
            temp_dir: config.temp_dir.clone(),
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    fn scratch_dir(&self) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("docusearch-ocr-");
        let dir = match self.temp_dir {
            Some(ref base) => {
                std::fs::create_dir_all(base)?;
                builder.tempdir_in(base)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    /// Run OCR over `bytes`. `extension` names the input type for the
    /// tool (`pdf`, `png`, ...); images are rasterised at 300 dpi.
    pub async fn run(&self, bytes: &[u8], extension: &str, is_image: bool) -> Result<OcrOutcome> {
        let scratch = self.scratch_dir().context("failed to create OCR scratch directory")?;
        let input = scratch.path().join(format!("input.{}", extension));
        let output = scratch.path().join("output.pdf");
        tokio::fs::write(&input, bytes)
            .await
            .context("failed to write OCR input")?;

        let mut cmd = Command::new(&self.command);
        cmd.args(["--force-ocr", "--deskew", "-l", &self.language]);
        if is_image {
            cmd.args(["--image-dpi", "300"]);
        }
        cmd.arg(&input)
            .arg(&output)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let result = match cmd.output().await {
            Ok(result) => result,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(OcrOutcome::Unavailable(format!(
                    "'{}' not found on PATH",
                    self.command
                )));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to execute '{}'", self.command))
            }
        };

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let reason = format!(
                "{} exited with {}: {}",
                self.command,
                result.status,
                stderr.trim()
            );
            return match result.status.code() {
                Some(EXIT_BAD_INPUT | EXIT_MISSING_DEPENDENCY | EXIT_ENCRYPTED_PDF) => {
                    Ok(OcrOutcome::Unavailable(reason))
                }
                _ => Err(anyhow::anyhow!(reason)),
            };
        }

        let pdf = tokio::fs::read(&output)
            .await
            .context("OCR produced no output file")?;
        Ok(OcrOutcome::Pdf(pdf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_tool_is_reported_unavailable() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = OcrEngine::new(&ExtractionConfig {
            ocr_command: "definitely-not-an-ocr-binary".into(),
            temp_dir: Some(tmp.path().join("scratch")),
            ..ExtractionConfig::default()
        });

        let outcome = engine.run(b"%PDF-1.4", "pdf", false).await.unwrap();
        assert!(matches!(outcome, OcrOutcome::Unavailable(_)));

        // Scratch directory removed on the early-return path.
        let leftover = std::fs::read_dir(tmp.path().join("scratch")).unwrap().count();
        assert_eq!(leftover, 0);
    }
}
