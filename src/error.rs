use thiserror::Error;

/// Result alias used across the crate.
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Error variants surfaced by the template engine.
///
/// The enum is `Clone` so the caching loader can broadcast a single parse
/// outcome to every waiter coalesced on the same key; the `Io` variant
/// therefore carries the rendered message rather than a live
/// `std::io::Error`.
#[derive(Clone, Debug, Error)]
pub enum TemplateError {
    #[error("syntax error in template '{name}' at line {line}, column {column}: expected {expected}")]
    Syntax {
        name: String,
        line: u32,
        column: u32,
        expected: String,
    },
    #[error("execution error in template '{name}' at line {line}, column {column}: {message}")]
    Execution {
        name: String,
        line: u32,
        column: u32,
        message: String,
    },
    #[error("template not found: {0}")]
    NotFound(String),
    #[error("host error in template '{name}' at line {line}, column {column}: {message}")]
    Host {
        name: String,
        line: u32,
        column: u32,
        message: String,
    },
    #[error("I/O error loading '{name}': {message}")]
    Io { name: String, message: String },
    #[error("output sink write failed")]
    Output,
}

impl TemplateError {
    /// Line/column of a syntax error, when this is one.
    pub fn position(&self) -> Option<(u32, u32)> {
        match self {
            TemplateError::Syntax { line, column, .. }
            | TemplateError::Execution { line, column, .. }
            | TemplateError::Host { line, column, .. } => Some((*line, *column)),
            _ => None,
        }
    }
}
