//! Error types for the TAP runner

use std::process::ExitStatus;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("{command} exited before printing a readiness line ({})", describe_status(.status))]
    ReadinessTimeout {
        command: String,
        status: Option<ExitStatus>,
    },

    #[error("{command} exited unexpectedly ({})", describe_status(.status))]
    UnexpectedExit {
        command: String,
        status: Option<ExitStatus>,
    },

    #[error("Failed to spawn {command}: {source}")]
    ProcessSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Output of {0} is no longer being captured")]
    OutputReleased(String),

    #[error("Browser automation setup failed: {0}")]
    AutomationSetup(String),

    #[error("WebDriver error: {error} - {message}")]
    WebDriver { error: String, message: String },

    #[error("Result log made no progress after {0} polls")]
    PollExhausted(u64),

    #[error("Invalid readiness pattern: {0}")]
    InvalidPattern(String),

    #[error("Tests took more than {0:?} to run")]
    GlobalTimeout(std::time::Duration),

    #[error("Interrupted")]
    Interrupted,

    #[error("Run panicked: {0}")]
    Panicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl RunnerError {
    /// Whether the failure is a momentary read problem the poller should retry.
    pub fn is_transient(&self) -> bool {
        match self {
            RunnerError::WebDriver { error, .. } => {
                matches!(error.as_str(), "stale element reference" | "no such element")
            }
            _ => false,
        }
    }
}

fn describe_status(status: &Option<ExitStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "exit status unknown".to_string(),
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;
