use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("{component} handler unavailable: {reason}")]
    HandlerUnavailable { component: String, reason: String },
    #[error("no components were available; supported are Intel CPUs with RAPL, NVIDIA GPUs and Apple Silicon")]
    AllHandlersUnavailable,
    #[error("measurement failed for {component}: {message}")]
    Measurement { component: String, message: String },
    #[error("intensity fetcher {fetcher} failed: {message}")]
    Fetch { fetcher: String, message: String },
    #[error("prediction needs at least one closed epoch")]
    InsufficientData,
    #[error("cannot {operation} while tracker is {state}")]
    InvalidState { operation: &'static str, state: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("training was not confirmed")]
    ConfirmationDeclined,
    #[error("malformed log {path:?} at line {line}: {message}")]
    LogFormat {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("DataFrame error: {0}")]
    Frame(String),
}

impl TrackerError {
    pub fn measurement(component: impl Into<String>, message: impl ToString) -> Self {
        TrackerError::Measurement {
            component: component.into(),
            message: message.to_string(),
        }
    }

    pub fn unavailable(component: impl Into<String>, reason: impl ToString) -> Self {
        TrackerError::HandlerUnavailable {
            component: component.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;
