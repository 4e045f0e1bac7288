// =============================================================================
// LLM CLI client — non-interactive subprocess with a hard deadline
// =============================================================================
//
// Runs `<cli_path> -p <prompt> --output-format json --model <model>` and
// extracts the `result` field from the JSON envelope. On timeout the process
// is killed; timeout and nonzero exit both surface as errors, which the
// decision engine maps to HOLD.
// =============================================================================

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, error};

use crate::config::LlmConfig;

pub struct LlmClient {
    cli_path: String,
    model: String,
    timeout: Duration,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            cli_path: config.cli_path.clone(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout),
        }
    }

    /// Send one prompt and return the model's text reply.
    pub async fn decide_text(&self, prompt: &str) -> Result<String> {
        debug!(model = %self.model, timeout_s = self.timeout.as_secs(), "calling LLM CLI");

        let mut child = Command::new(&self.cli_path)
            .arg("-p")
            .arg(prompt)
            .arg("--output-format")
            .arg("json")
            .arg("--model")
            .arg(&self.model)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn LLM CLI '{}'", self.cli_path))?;

        let mut stdout = child.stdout.take().context("LLM CLI stdout unavailable")?;
        let mut stderr = child.stderr.take().context("LLM CLI stderr unavailable")?;

        let wait = async {
            let mut out = String::new();
            let mut err = String::new();
            stdout.read_to_string(&mut out).await?;
            stderr.read_to_string(&mut err).await?;
            let status = child.wait().await?;
            Ok::<_, anyhow::Error>((status, out, err))
        };

        let (status, out, err) = match tokio::time::timeout(self.timeout, wait).await {
            Ok(result) => result?,
            Err(_) => {
                error!(timeout_s = self.timeout.as_secs(), "LLM CLI timed out — killing");
                anyhow::bail!("LLM CLI timed out after {}s", self.timeout.as_secs());
            }
        };

        if !status.success() {
            let rc = status.code().unwrap_or(-1);
            error!(rc, stderr = %err.trim(), "LLM CLI failed");
            anyhow::bail!("LLM CLI failed (rc={rc}): {}", err.trim());
        }

        let text = parse_cli_output(out.trim());
        debug!(chars = text.len(), "LLM CLI returned");
        Ok(text)
    }
}

/// Extract the `result` field from the CLI's JSON envelope; anything that
/// does not parse is returned verbatim.
fn parse_cli_output(raw: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => map
            .get("result")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| raw.to_string()),
        _ => raw.to_string(),
    }
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("cli_path", &self.cli_path)
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_output_envelope_extracted() {
        let raw = r#"{"type": "result", "result": "the answer", "cost_usd": 0.01}"#;
        assert_eq!(parse_cli_output(raw), "the answer");
    }

    #[test]
    fn cli_output_plain_text_passthrough() {
        assert_eq!(parse_cli_output("plain reply"), "plain reply");
        assert_eq!(parse_cli_output(r#"["not", "object"]"#), r#"["not", "object"]"#);
    }

    #[test]
    fn cli_output_object_without_result() {
        let raw = r#"{"type": "error"}"#;
        assert_eq!(parse_cli_output(raw), raw);
    }
}
