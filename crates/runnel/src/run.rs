//! Run requests and their outcomes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A program to execute, with everything it needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunRequest {
    /// Source code to execute
    pub code: String,
    /// Lines handed to the program's stdin, in order
    pub input: Vec<String>,
    /// Process-style arguments for the interpreter
    pub args: Vec<String>,
    /// Code executed first, in the same namespace as `code`
    pub preamble: Option<String>,
}

impl RunRequest {
    /// Create a request for `code` with no input, arguments or preamble.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }

    /// Set the stdin lines.
    pub fn input<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Set stdin from a block of text, one line per `\n`-separated segment.
    ///
    /// Empty text means no input at all rather than a single empty line.
    pub fn input_text(self, text: &str) -> Self {
        if text.is_empty() {
            self.input(Vec::<String>::new())
        } else {
            self.input(text.split('\n'))
        }
    }

    /// Set the interpreter arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the preamble.
    pub fn preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }
}

/// What a finished run left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// Output lines joined with `\n`
    pub stdout: String,
    /// Traceback text; present only when the run failed
    pub stderr: Option<String>,
    /// Wall-clock time spent in the context
    pub elapsed: Duration,
    /// Raw output returned by the context, each line terminated
    pub transcript: Option<String>,
}

impl RunResult {
    /// Whether the run failed.
    pub fn is_failure(&self) -> bool {
        self.stderr.is_some()
    }
}

/// How a call to [`Orchestrator::run`](crate::Orchestrator::run) ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The program ran to completion
    Completed(RunResult),
    /// The program raised, or the transport failed
    Failed(RunResult),
    /// The time limit was hit; the context has been replaced
    TimedOut {
        /// The configured limit
        limit: Duration,
    },
    /// No interpreter was ready yet; the request will run once one is
    Queued,
    /// The context was interrupted or replaced while the run was in flight
    Interrupted,
}

impl RunOutcome {
    /// The result, for runs that reached the interpreter and returned.
    pub fn result(&self) -> Option<&RunResult> {
        match self {
            Self::Completed(result) | Self::Failed(result) => Some(result),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let request = RunRequest::new("print(input())")
            .input(["Pen", "Book"])
            .args(["-X", "dev"])
            .preamble("import math");

        assert_eq!(request.code, "print(input())");
        assert_eq!(request.input, vec!["Pen", "Book"]);
        assert_eq!(request.args, vec!["-X", "dev"]);
        assert_eq!(request.preamble.as_deref(), Some("import math"));
    }

    #[test]
    fn test_input_text_splits_lines() {
        assert_eq!(RunRequest::new("").input_text("a\nb").input, vec!["a", "b"]);
        assert!(RunRequest::new("").input_text("").input.is_empty());
        assert_eq!(RunRequest::new("").input_text("a\n").input, vec!["a", ""]);
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: RunRequest = serde_json::from_str(r#"{"code": "print(1)"}"#).unwrap();
        assert_eq!(request, RunRequest::new("print(1)"));
    }

    #[test]
    fn test_outcome_result() {
        let result = RunResult {
            stdout: "hi\n".to_string(),
            ..Default::default()
        };
        assert_eq!(
            RunOutcome::Completed(result.clone()).result(),
            Some(&result)
        );
        assert!(!result.is_failure());
        assert_eq!(RunOutcome::Queued.result(), None);
    }
}
