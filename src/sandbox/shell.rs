use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Result, SandgateError};
use crate::sandbox::{ExecOptions, ExecutionResult};

/// Outcome of running a Python snippet.
#[derive(Debug, Clone, Serialize)]
pub struct CodeExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Set when the interpreter exited non-zero
    pub error: Option<String>,
    pub exit_code: i32,
}

/// Shell access to a sandbox. File and code operations are layered on top
/// of plain command execution; envd's filesystem service is not used.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Execute a shell command inside the sandbox
    async fn execute(
        &self,
        sandbox_id: &str,
        command: &str,
        options: ExecOptions,
    ) -> Result<ExecutionResult>;

    /// Write a file inside the sandbox, creating parent directories.
    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> Result<()> {
        debug!(sandbox_id = %sandbox_id, path = %path, len = content.len(), "Writing file");

        if let Some(dir) = parent_dir(path) {
            let result = self
                .execute(sandbox_id, &format!("mkdir -p {}", shell_quote(dir)), ExecOptions::default())
                .await?;
            if result.exit_code != 0 {
                return Err(SandgateError::FileWrite {
                    path: path.to_string(),
                    stderr: result.stderr,
                });
            }
        }

        let delimiter = heredoc_delimiter(content);
        let result = self
            .execute(sandbox_id, &heredoc_command(path, content, &delimiter), ExecOptions::default())
            .await?;
        if result.exit_code != 0 {
            return Err(SandgateError::FileWrite {
                path: path.to_string(),
                stderr: result.stderr,
            });
        }

        info!(sandbox_id = %sandbox_id, path = %path, "File written");
        Ok(())
    }

    /// Run Python source with `python3 -c`.
    async fn run_code(&self, sandbox_id: &str, code: &str) -> Result<CodeExecutionResult> {
        let command = format!("python3 -c \"{}\"", escape_double_quoted(code));
        let result = self.execute(sandbox_id, &command, ExecOptions::default()).await?;

        debug!(
            sandbox_id = %sandbox_id,
            exit_code = result.exit_code,
            stdout_len = result.stdout.len(),
            stderr_len = result.stderr.len(),
            "Python code executed"
        );

        let error = (result.exit_code != 0).then(|| {
            if result.stderr.is_empty() {
                "Command failed".to_string()
            } else {
                result.stderr.clone()
            }
        });

        Ok(CodeExecutionResult {
            stdout: result.stdout,
            stderr: result.stderr,
            error,
            exit_code: result.exit_code,
        })
    }

    /// Start a long-running command detached from the RPC, teeing output to `log_path`.
    async fn start_background(&self, sandbox_id: &str, command: &str, log_path: &str) -> Result<()> {
        let inner = format!("{} 2>&1 | tee {}", command, shell_quote(log_path));
        let wrapped = format!("nohup bash -c {} > /dev/null &", shell_quote(&inner));
        self.execute(sandbox_id, &wrapped, ExecOptions::default())
            .await?;
        info!(sandbox_id = %sandbox_id, log = %log_path, "Background command started");
        Ok(())
    }

    /// Poll `http://localhost:<port>` from inside the sandbox until anything answers.
    async fn wait_for_http(
        &self,
        sandbox_id: &str,
        port: u16,
        attempts: u32,
        interval: Duration,
    ) -> Result<bool> {
        let check = format!(
            "curl -s -o /dev/null -w \"%{{http_code}}\" http://localhost:{} || echo \"000\"",
            port
        );

        for attempt in 1..=attempts {
            let options = ExecOptions::with_timeout(Duration::from_secs(2));
            if let Ok(result) = self.execute(sandbox_id, &check, options).await {
                if let Ok(code) = result.stdout.trim().parse::<u16>() {
                    // Even a 404 means the server is up
                    if (200..600).contains(&code) {
                        info!(sandbox_id = %sandbox_id, port, status = code, attempt, "HTTP server ready");
                        return Ok(true);
                    }
                }
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }

        debug!(sandbox_id = %sandbox_id, port, attempts, "HTTP server did not answer");
        Ok(false)
    }
}

/// Quote a string as a single shell word.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

fn parent_dir(path: &str) -> Option<&str> {
    Path::new(path)
        .parent()
        .and_then(|p| p.to_str())
        .filter(|p| !p.is_empty() && *p != "/")
}

/// Escape for embedding inside a double-quoted shell argument.
fn escape_double_quoted(code: &str) -> String {
    code.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$")
}

/// A heredoc terminator that does not occur as a line of `content`.
fn heredoc_delimiter(content: &str) -> String {
    loop {
        let candidate = format!("SANDGATE_EOF_{}", uuid::Uuid::new_v4().simple());
        if !content.lines().any(|line| line == candidate) {
            return candidate;
        }
    }
}

fn heredoc_command(path: &str, content: &str, delimiter: &str) -> String {
    let separator = if content.is_empty() || content.ends_with('\n') {
        ""
    } else {
        "\n"
    };
    format!(
        "cat > {} << '{}'\n{}{}{}",
        shell_quote(path),
        delimiter,
        content,
        separator,
        delimiter
    )
}
