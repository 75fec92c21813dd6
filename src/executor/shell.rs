//! Shell-backed executor.
//!
//! Runs each command through `sh -c`. Session state is the variable table,
//! exported to every command as environment variables, so values set by one
//! request are visible to the next.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::{Executor, ERROR_VAR, KEYWORDS_VAR, RESULT_VAR};
use crate::error::{Error, Result};
use crate::transport::Keywords;

/// Executor that hands commands to a POSIX shell.
///
/// After each run, `result` holds stdout (without the trailing newline) and
/// `err` holds stderr when the exit status was non-zero.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    timeout: Duration,
    variables: HashMap<String, Value>,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new("/bin/sh", Duration::from_secs(300))
    }
}

impl ShellExecutor {
    pub fn new(shell: impl Into<String>, timeout: Duration) -> Self {
        Self {
            shell: shell.into(),
            timeout,
            variables: HashMap::new(),
        }
    }

    fn exported(&self) -> impl Iterator<Item = (&str, String)> {
        self.variables
            .iter()
            .filter(|(name, _)| !name.is_empty() && !name.contains('=') && !name.contains('\0'))
            .map(|(name, value)| {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (name.as_str(), text)
            })
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    #[instrument(skip(self, command), fields(shell = %self.shell))]
    async fn run(&mut self, command: &str) -> Result<()> {
        debug!(command_len = command.len(), "Running shell command");

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .envs(self.exported())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Executor(format!("Failed to spawn {}: {e}", self.shell)))?;

        let mut child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Executor("Failed to open stdout".into()))?;
        let mut child_stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Executor("Failed to open stderr".into()))?;

        // `child` stays out of this future so it can be killed on timeout.
        let read_all = async {
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            let (r1, r2) = tokio::join!(
                child_stdout.read_to_end(&mut stdout_buf),
                child_stderr.read_to_end(&mut stderr_buf),
            );
            r1?;
            r2?;
            Ok::<_, std::io::Error>((stdout_buf, stderr_buf))
        };

        let deadline = tokio::time::Instant::now() + self.timeout;
        let Ok(read) = tokio::time::timeout_at(deadline, read_all).await else {
            return Err(self.abandon(&mut child).await);
        };
        let (stdout_buf, stderr_buf) = read?;

        // A command can close its pipes and keep running.
        let Ok(status) = tokio::time::timeout_at(deadline, child.wait()).await else {
            return Err(self.abandon(&mut child).await);
        };
        let status = status?;

        let stdout = String::from_utf8_lossy(&stdout_buf);
        self.set_variable(RESULT_VAR, Value::String(trim_newline(&stdout).to_string()));

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr_buf);
            let message = match trim_newline(&stderr) {
                "" => format!("Command exited with {status}"),
                text => text.to_string(),
            };
            self.set_variable(ERROR_VAR, Value::String(message));
        }

        debug!(exit_code = status.code().unwrap_or(-1), "Command completed");
        Ok(())
    }

    fn set_variable(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables.get(name).cloned()
    }

    async fn reset_session(&mut self) -> Result<()> {
        self.variables.clear();
        Ok(())
    }

    async fn bind_keywords(&mut self, keywords: &Keywords) -> Result<()> {
        self.set_variable(KEYWORDS_VAR, Value::Object(keywords.clone()));
        Ok(())
    }

    /// Keywords become `--name=value` arguments.
    fn attach_keywords(&self, command: &str, _is_function: bool, keywords: &Keywords) -> String {
        let mut out = command.to_string();
        for (name, value) in keywords {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push(' ');
            out.push_str(&shell_quote(&format!("--{name}={text}")));
        }
        out
    }
}

impl ShellExecutor {
    /// Kill a command that ran past its timeout.
    async fn abandon(&self, child: &mut tokio::process::Child) -> Error {
        if let Err(e) = child.kill().await {
            warn!(error = %e, "Failed to kill timed out command");
        }
        Error::Executor(format!(
            "Command timed out after {}s",
            self.timeout.as_secs_f64()
        ))
    }
}

fn trim_newline(text: &str) -> &str {
    text.strip_suffix('\n')
        .map(|t| t.strip_suffix('\r').unwrap_or(t))
        .unwrap_or(text)
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}
