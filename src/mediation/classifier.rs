//! The classification collaborator seam.
//!
//! Real deployments point `classify_cmd` at a model CLI; tests substitute a
//! canned implementation. The pipeline only ever sees opaque reply text.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Opaque text-in, text-out classification. Implementations must be safe to
/// call concurrently.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, prompt: &str) -> Result<String>;
}

const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Classifier that spawns a configured command, writes the prompt to its
/// stdin, and reads the reply from stdout.
pub struct CommandClassifier {
    command: String,
    timeout: Duration,
}

impl CommandClassifier {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Classifier for CommandClassifier {
    async fn classify(&self, prompt: &str) -> Result<String> {
        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .context("classify command is empty")?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn classify command '{}'", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .context("Failed to write prompt to classifier stdin")?;
            stdin
                .shutdown()
                .await
                .context("Failed to close classifier stdin")?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("classify command timed out"))?
            .context("Failed to read classifier output")?;

        if !output.status.success() {
            anyhow::bail!(
                "classify command exited with {}",
                output.status.code().unwrap_or(-1)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_classifier_reads_stdout() {
        // `cat` echoes the prompt back, which is enough to prove the
        // stdin/stdout plumbing.
        let classifier = CommandClassifier::new("cat");
        let reply = classifier.classify("hello prompt").await.unwrap();
        assert_eq!(reply, "hello prompt");
    }

    #[tokio::test]
    async fn missing_command_is_an_error() {
        let classifier = CommandClassifier::new("definitely-not-a-real-binary-xyz");
        assert!(classifier.classify("x").await.is_err());
    }

    #[tokio::test]
    async fn empty_command_is_an_error() {
        let classifier = CommandClassifier::new("   ");
        assert!(classifier.classify("x").await.is_err());
    }
}
