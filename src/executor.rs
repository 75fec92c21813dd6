//! Executor capability and the execute-request procedure.
//!
//! The executor is the long-lived, stateful interpreter the bridge drives.
//! The protocol core only runs prepared commands and reads back two
//! conventional variables, `result` and `err`.

mod shell;

pub use shell::ShellExecutor;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::transport::Keywords;

/// Variable the executor stores a command's result in.
pub const RESULT_VAR: &str = "result";
/// Variable the executor stores a command's error text in.
pub const ERROR_VAR: &str = "err";
/// Variable the keyword mapping is bound to before execution.
pub const KEYWORDS_VAR: &str = "extra_keywords";

/// Statement that turns the bound mapping into the `extra` structure.
const KEYWORD_BINDING: &str = "extra=hash2struct(extra_keywords)";
/// Argument that passes the `extra` structure on to a command.
const KEYWORD_ARGUMENT: &str = "_extra=extra";

/// Outcome of one execute request, as reported back to the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub result: String,
    /// Empty when the command succeeded.
    pub error: String,
}

/// A stateful command interpreter.
///
/// Implementations are not expected to be reentrant: the server never calls
/// into one executor from two requests at once.
#[async_trait]
pub trait Executor: Send {
    /// Run one command to completion.
    ///
    /// Return `Error::Executor` when the interpreter itself rejected the command.
    async fn run(&mut self, command: &str) -> Result<()>;

    fn set_variable(&mut self, name: &str, value: Value);

    fn get_variable(&self, name: &str) -> Option<Value>;

    /// Clear transient error and call-stack state before a request.
    async fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drop all session state. Called when the server stops.
    async fn reset_session(&mut self) -> Result<()> {
        Ok(())
    }

    /// Make `keywords` visible to the interpreter.
    async fn bind_keywords(&mut self, keywords: &Keywords) -> Result<()> {
        self.set_variable(KEYWORDS_VAR, Value::Object(keywords.clone()));
        self.run(KEYWORD_BINDING).await
    }

    /// Rewrite `command` so it receives the bound keywords.
    fn attach_keywords(&self, command: &str, is_function: bool, _keywords: &Keywords) -> String {
        attach_argument(command, is_function, KEYWORD_ARGUMENT)
    }
}

/// Add `argument` to a command: inside the last call's argument list when
/// `is_function`, otherwise as a trailing argument.
pub fn attach_argument(command: &str, is_function: bool, argument: &str) -> String {
    if is_function {
        if let Some(close) = command.rfind(')') {
            let (head, tail) = command.split_at(close);
            let sep = if head.trim_end().ends_with('(') { "" } else { "," };
            return format!("{head}{sep}{argument}{tail}");
        }
    }
    format!("{command},{argument}")
}

/// Execute one request against `executor` and collect its result.
///
/// Executor failures are folded into `ExecutionResult::error`; the executor
/// stays usable for the next request.
pub async fn execute_command<E: Executor + ?Sized>(
    executor: &mut E,
    command: &str,
    is_function: bool,
    keywords: &Keywords,
) -> ExecutionResult {
    if let Err(e) = executor.reset().await {
        warn!(error = %e, "Executor reset failed");
    }
    executor.set_variable(RESULT_VAR, Value::String(String::new()));
    executor.set_variable(ERROR_VAR, Value::String(String::new()));
    executor.set_variable(KEYWORDS_VAR, Value::String(String::new()));

    match run_with_keywords(executor, command, is_function, keywords).await {
        Ok(()) => ExecutionResult {
            result: executor
                .get_variable(RESULT_VAR)
                .map(value_text)
                .unwrap_or_default(),
            error: executor
                .get_variable(ERROR_VAR)
                .map(value_text)
                .unwrap_or_default(),
        },
        Err(e) => {
            warn!(error = %e, "Caught executor error");
            let error = match e {
                Error::Executor(message) => message,
                other => other.to_string(),
            };
            ExecutionResult {
                result: String::new(),
                error,
            }
        }
    }
}

async fn run_with_keywords<E: Executor + ?Sized>(
    executor: &mut E,
    command: &str,
    is_function: bool,
    keywords: &Keywords,
) -> Result<()> {
    let command = if keywords.is_empty() {
        command.to_string()
    } else {
        executor.bind_keywords(keywords).await?;
        executor.attach_keywords(command, is_function, keywords)
    };
    info!(command = %command, "Executing");
    executor.run(&command).await
}

/// Text form of a variable read back from the executor.
fn value_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Records commands; `fail` makes `run` reject everything.
    #[derive(Default)]
    struct Recorder {
        vars: HashMap<String, Value>,
        commands: Vec<String>,
        resets: usize,
        fail: bool,
    }

    #[async_trait]
    impl Executor for Recorder {
        async fn run(&mut self, command: &str) -> Result<()> {
            self.commands.push(command.to_string());
            if self.fail {
                return Err(Error::Executor(format!("syntax error: {command}")));
            }
            self.vars.insert(RESULT_VAR.into(), Value::from(7));
            Ok(())
        }

        fn set_variable(&mut self, name: &str, value: Value) {
            self.vars.insert(name.to_string(), value);
        }

        fn get_variable(&self, name: &str) -> Option<Value> {
            self.vars.get(name).cloned()
        }

        async fn reset(&mut self) -> Result<()> {
            self.resets += 1;
            Ok(())
        }
    }

    #[test]
    fn attach_as_statement_argument() {
        assert_eq!(
            attach_argument("plot,x", false, "_extra=extra"),
            "plot,x,_extra=extra"
        );
    }

    #[test]
    fn attach_inside_last_call() {
        assert_eq!(
            attach_argument("result=f(a,g(b))", true, "_extra=extra"),
            "result=f(a,g(b),_extra=extra)"
        );
        assert_eq!(
            attach_argument("result=session_dir()", true, "_extra=extra"),
            "result=session_dir(_extra=extra)"
        );
        assert_eq!(
            attach_argument("result=x", true, "_extra=extra"),
            "result=x,_extra=extra"
        );
    }

    #[tokio::test]
    async fn execute_without_keywords_runs_command_verbatim() {
        let mut exec = Recorder::default();
        let out = execute_command(&mut exec, "result=3+4", true, &Keywords::new()).await;
        assert_eq!(exec.commands, vec!["result=3+4"]);
        assert_eq!(exec.resets, 1);
        assert_eq!(
            out,
            ExecutionResult {
                result: "7".into(),
                error: String::new()
            }
        );
    }

    #[tokio::test]
    async fn execute_with_keywords_binds_then_attaches() {
        let mut exec = Recorder::default();
        let mut kw = Keywords::new();
        kw.insert("bins".into(), Value::from(16));
        execute_command(&mut exec, "result=rebin(x)", true, &kw).await;

        assert_eq!(
            exec.commands,
            vec![KEYWORD_BINDING, "result=rebin(x,_extra=extra)"]
        );
        assert_eq!(exec.vars[KEYWORDS_VAR], Value::Object(kw));
    }

    #[tokio::test]
    async fn executor_failure_becomes_error_text() {
        let mut exec = Recorder {
            fail: true,
            ..Recorder::default()
        };
        let out = execute_command(&mut exec, "bad(", false, &Keywords::new()).await;
        assert_eq!(out.result, "");
        assert_eq!(out.error, "syntax error: bad(");
    }

    #[tokio::test]
    async fn stale_result_is_cleared_between_requests() {
        let mut exec = Recorder {
            fail: true,
            ..Recorder::default()
        };
        exec.vars.insert(RESULT_VAR.into(), Value::from("stale"));
        exec.vars.insert(ERROR_VAR.into(), Value::from("old"));
        let out = execute_command(&mut exec, "x", false, &Keywords::new()).await;
        assert_eq!(exec.vars[RESULT_VAR], Value::from(""));
        assert_eq!(out.error, "syntax error: x");
    }
}
